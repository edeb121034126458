//! External collaborators: billing provider, publisher and content provider.
//!
//! The core only talks to these through the traits below; the reqwest-backed
//! adapters live in the submodules. Tests use the `mockall` mocks generated for
//! each trait.

pub mod publisher;
pub mod stripe;

use crate::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A checkout session created at the billing provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckoutLink {
    /// Provider session id, echoed back in `checkout_completed`
    pub session_id: String,
    /// Hosted checkout page
    pub url: Option<String>,
}

/// The parts of a provider subscription the state machine needs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProviderSubscription {
    /// Provider subscription id
    pub id: String,
    /// Provider customer id
    pub customer_id: Option<String>,
    /// Price of the first subscription item
    pub price_id: Option<String>,
    /// End of the current billing period
    pub period_end: Option<DateTime<Utc>>,
    /// Owner id stored in the subscription metadata, when present
    pub owner_id: Option<String>,
}

/// Billing provider API calls made as side effects of owner actions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BillingProvider: Send + Sync {
    /// Creates a customer record and returns its id.
    async fn create_customer(&self, email: &str, owner_id: &str) -> Result<String>;

    /// Starts a hosted checkout for one unit of `price_id`.
    async fn create_checkout_session(
        &self,
        customer_id: &str,
        price_id: &str,
        owner_id: &str,
    ) -> Result<CheckoutLink>;

    /// Cancels a subscription at the end of its current period.
    async fn cancel_subscription(&self, subscription_id: &str) -> Result<()>;

    /// Looks up a subscription, used to resolve webhook events that carry
    /// only its id.
    async fn retrieve_subscription(&self, subscription_id: &str) -> Result<ProviderSubscription>;
}

/// One task handed to the publisher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRequest {
    /// Task being published
    pub task_id: i64,
    /// Platform name
    pub target: String,
    /// Post body
    pub content: String,
    /// Hashtags without the leading `#`
    pub tags: Vec<String>,
    /// Optional attachment reference
    pub media_ref: Option<String>,
}

/// Publishes a claimed task to its target platform.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes once; an error is reported back to the queue as a failed
    /// attempt.
    async fn publish(&self, request: &PublishRequest) -> Result<()>;
}

/// Input for one generated post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentRequest {
    /// What the post should be about
    pub idea: String,
    /// Audience or industry
    pub niche: String,
    /// Platform the text is written for
    pub target: String,
}

/// Opaque output of the content provider.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GeneratedContent {
    /// Post body
    pub text: String,
    /// Suggested hashtags
    pub hashtags: Vec<String>,
    /// Prompt for an accompanying image, when one was suggested
    pub media_prompt: Option<String>,
}

/// Text generation service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContentProvider: Send + Sync {
    /// Produces one post; called only after the credit was charged.
    async fn generate(&self, request: &ContentRequest) -> Result<GeneratedContent>;
}
