//! Entity module - Contains all SeaORM entity definitions for the database.
//! These entities represent the database tables and their relationships.
//! Each entity has a Model struct for data and an Entity struct for operations.

pub mod checkout_session;
pub mod credit_account;
pub mod credit_transaction;
pub mod processed_event;
pub mod scheduled_task;
pub mod subscription_state;
pub mod task_quota_guard;

// Re-export specific types to avoid conflicts
pub use checkout_session::{
    Column as CheckoutSessionColumn, Entity as CheckoutSession, Model as CheckoutSessionModel,
};
pub use credit_account::{
    Column as CreditAccountColumn, Entity as CreditAccount, Model as CreditAccountModel,
};
pub use credit_transaction::{
    Column as CreditTransactionColumn, Entity as CreditTransaction,
    Model as CreditTransactionModel,
};
pub use processed_event::{
    Column as ProcessedEventColumn, Entity as ProcessedEvent, Model as ProcessedEventModel,
};
pub use scheduled_task::{
    Column as ScheduledTaskColumn, Entity as ScheduledTask, Model as ScheduledTaskModel,
};
pub use subscription_state::{
    Column as SubscriptionStateColumn, Entity as SubscriptionState,
    Model as SubscriptionStateModel,
};
pub use task_quota_guard::{
    Column as TaskQuotaGuardColumn, Entity as TaskQuotaGuard, Model as TaskQuotaGuardModel,
};
