use postmeter::{
    config::{self, database},
    dispatcher,
    errors::{Error, Result},
    providers::publisher::HttpPublisher,
};
use dotenvy::dotenv;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Initialize tracing (as early as possible)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // 2. Load .env file; variables may also be set externally
    dotenv().ok();

    // 3. Load the application settings
    let app_config = config::settings::load_app_configuration()
        .inspect_err(|e| error!("Failed to load configuration: {}", e))?;
    info!("Configuration loaded.");

    // 4. Connect and make sure every table exists
    let db = database::create_connection()
        .await
        .inspect_err(|e| error!("Failed to connect to database: {}", e))?;
    database::create_tables(&db)
        .await
        .inspect(|_| info!("Database initialized successfully."))
        .inspect_err(|e| error!("Failed to create tables: {}", e))?;

    // 5. Build the publisher the dispatcher hands tasks to
    let endpoint = app_config
        .dispatcher
        .publish_endpoint
        .clone()
        .ok_or_else(|| Error::Config {
            message: "dispatcher.publish_endpoint must be set to run the dispatcher".to_string(),
        })?;
    let publisher = HttpPublisher::new(endpoint)?;

    // 6. Poll for due tasks until Ctrl-C
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
        }
    };
    dispatcher::run_dispatcher(&db, &app_config, &publisher, shutdown).await?;

    info!("Dispatcher stopped.");
    Ok(())
}
