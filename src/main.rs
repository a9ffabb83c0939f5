use anyhow::Result;
use tracing_subscriber::EnvFilter;

use user_store::config::Config;
use user_store::driver;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load();

    let repository = match user_store::connect(&config).await {
        Ok(repository) => repository,
        Err(e) => {
            tracing::error!("Failed to create user store client: {}", e);
            std::process::exit(1);
        }
    };

    let summary = driver::run(repository.as_ref()).await;
    tracing::info!(
        succeeded = summary.succeeded.len(),
        failed = summary.failed.len(),
        "Demonstration finished"
    );

    Ok(())
}
