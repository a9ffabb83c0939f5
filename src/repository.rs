use async_trait::async_trait;
use std::sync::Arc;

use crate::codec::{self, AttributeValue, Item};
use crate::error::{Result, UserStoreError};
use crate::models::User;
use crate::retry::{RetryPolicy, RetryingStore};
use crate::transport::{Filter, ItemStore, ScanRequest, UpdateRequest};

/// Maximum put requests in one BatchWriteItem call
pub const BATCH_WRITE_LIMIT: usize = 25;

/// User operations against the remote table
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserRepository: Send + Sync + 'static {
    /// Insert or fully overwrite a user
    async fn put(&self, user: &User) -> Result<()>;

    /// Fetch a user, `NotFound` when absent
    async fn get(&self, user_id: &str) -> Result<User>;

    /// Set email and age, leaving every other attribute alone
    async fn update(&self, user_id: &str, email: &str, age: i64) -> Result<()>;

    /// Remove a user; absent users are not an error
    async fn delete(&self, user_id: &str) -> Result<()>;

    /// All users with `active == true`, across every scan page
    async fn scan_active(&self) -> Result<Vec<User>>;

    /// Write users in chunks of [`BATCH_WRITE_LIMIT`]. Not atomic: chunks
    /// written before a failure stay written.
    async fn batch_put(&self, users: &[User]) -> Result<()>;
}

/// [`UserRepository`] over any [`ItemStore`], with retries
pub struct StoreUserRepository<S> {
    store: RetryingStore<S>,
    table_name: String,
    scan_page_limit: Option<i32>,
}

impl<S: ItemStore> StoreUserRepository<S> {
    pub fn new(store: S, policy: Arc<RetryPolicy>, table_name: impl Into<String>) -> Self {
        Self {
            store: RetryingStore::new(store, policy),
            table_name: table_name.into(),
            scan_page_limit: None,
        }
    }

    pub fn with_scan_page_limit(mut self, limit: Option<i32>) -> Self {
        self.scan_page_limit = limit;
        self
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn store(&self) -> &S {
        self.store.inner()
    }

    /// Write one chunk, resubmitting whatever the service leaves unprocessed
    async fn write_chunk(&self, chunk: &[User]) -> Result<()> {
        const CONTEXT: &str = "failed to batch write items";

        let policy = self.store.policy();
        let mut pending: Vec<Item> = chunk.iter().map(codec::encode).collect();
        let mut round = 0;
        loop {
            round += 1;
            let unprocessed = self
                .store
                .batch_put(&self.table_name, pending)
                .await
                .map_err(|e| UserStoreError::from_retry(CONTEXT, e))?;
            if unprocessed.is_empty() {
                return Ok(());
            }
            if round >= policy.max_attempts() {
                return Err(UserStoreError::UnprocessedItems {
                    context: CONTEXT,
                    remaining: unprocessed.len(),
                });
            }
            let delay = policy.backoff_delay(round);
            tracing::warn!(
                unprocessed = unprocessed.len(),
                round,
                delay_ms = delay.as_millis() as u64,
                "resubmitting unprocessed items"
            );
            tokio::time::sleep(delay).await;
            pending = unprocessed;
        }
    }
}

#[async_trait]
impl<S: ItemStore> UserRepository for StoreUserRepository<S> {
    async fn put(&self, user: &User) -> Result<()> {
        self.store
            .put_item(&self.table_name, codec::encode(user))
            .await
            .map_err(|e| UserStoreError::from_retry("failed to put item", e))
    }

    async fn get(&self, user_id: &str) -> Result<User> {
        let item = self
            .store
            .get_item(&self.table_name, codec::key(user_id))
            .await
            .map_err(|e| UserStoreError::from_retry("failed to get item", e))?;

        match item {
            Some(item) => Ok(codec::decode(&item)?),
            None => Err(UserStoreError::NotFound(user_id.to_string())),
        }
    }

    async fn update(&self, user_id: &str, email: &str, age: i64) -> Result<()> {
        let update = UpdateRequest {
            set: vec![
                (codec::EMAIL.to_string(), AttributeValue::S(email.to_string())),
                (codec::AGE.to_string(), AttributeValue::N(age.to_string())),
            ],
            require_existing: Some(codec::USER_ID.to_string()),
        };
        self.store
            .update_item(&self.table_name, codec::key(user_id), update)
            .await
            .map_err(|e| UserStoreError::from_retry("failed to update item", e))
    }

    async fn delete(&self, user_id: &str) -> Result<()> {
        self.store
            .delete_item(&self.table_name, codec::key(user_id))
            .await
            .map_err(|e| UserStoreError::from_retry("failed to delete item", e))
    }

    async fn scan_active(&self) -> Result<Vec<User>> {
        // Scan with a filter; a GSI on Active would avoid reading the whole table
        let mut request = ScanRequest {
            filter: Some(Filter::equals(codec::ACTIVE, AttributeValue::Bool(true))),
            exclusive_start_key: None,
            limit: self.scan_page_limit,
        };

        let mut users = Vec::new();
        let mut pages = 0usize;
        loop {
            let page = self
                .store
                .scan(&self.table_name, request.clone())
                .await
                .map_err(|e| UserStoreError::from_retry("failed to get page", e))?;
            pages += 1;
            tracing::debug!(page = pages, items = page.items.len(), "fetched scan page");

            for item in &page.items {
                users.push(codec::decode(item)?);
            }

            match page.last_evaluated_key {
                Some(key) => request.exclusive_start_key = Some(key),
                None => break,
            }
        }

        Ok(users)
    }

    async fn batch_put(&self, users: &[User]) -> Result<()> {
        for (index, chunk) in users.chunks(BATCH_WRITE_LIMIT).enumerate() {
            self.write_chunk(chunk).await?;
            tracing::debug!(chunk = index + 1, items = chunk.len(), "batch chunk written");
        }
        Ok(())
    }
}
