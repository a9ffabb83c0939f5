pub mod codec;
pub mod config;
pub mod driver;
pub mod dynamodb;
pub mod error;
pub mod memory;
pub mod models;
pub mod repository;
pub mod retry;
pub mod transport;

use std::sync::Arc;

use crate::config::{Backend, Config};
use crate::dynamodb::DynamoStore;
use crate::error::Result;
use crate::memory::MemoryStore;
use crate::repository::{StoreUserRepository, UserRepository};
use crate::retry::RetryPolicy;

pub use crate::error::UserStoreError;
pub use crate::models::User;

/// Build the user repository described by `cfg`. The retry policy is created
/// once here and shared by every call made through the returned handle.
pub async fn connect(cfg: &Config) -> Result<Arc<dyn UserRepository>> {
    cfg.validate()?;
    let policy = Arc::new(RetryPolicy::new(cfg.retry.clone())?);

    let repository: Arc<dyn UserRepository> = match cfg.store.backend {
        Backend::Dynamodb => {
            let store = DynamoStore::connect(&cfg.store).await?;
            Arc::new(
                StoreUserRepository::new(store, policy, cfg.store.table_name.clone())
                    .with_scan_page_limit(cfg.store.scan_page_limit),
            )
        }
        Backend::Memory => Arc::new(
            StoreUserRepository::new(
                MemoryStore::new(codec::USER_ID),
                policy,
                cfg.store.table_name.clone(),
            )
            .with_scan_page_limit(cfg.store.scan_page_limit),
        ),
    };

    tracing::info!(
        max_attempts = cfg.retry.max_attempts,
        max_backoff_ms = cfg.retry.max_backoff_ms,
        mode = %cfg.retry.mode,
        table = %cfg.store.table_name,
        "User store client initialized with retry config"
    );

    Ok(repository)
}
