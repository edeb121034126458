/// Database configuration and connection management
pub mod database;

/// Secrets and provider settings read from environment variables
pub mod secrets;

/// Application settings loaded from the TOML settings file
pub mod settings;

pub use settings::AppConfig;
