//! Demonstration sequence: put, get, update, scan, batch insert, delete.

use crate::models::User;
use crate::repository::UserRepository;

/// Outcome of one demonstration run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DemoSummary {
    pub succeeded: Vec<&'static str>,
    pub failed: Vec<&'static str>,
}

impl DemoSummary {
    fn record<T, E: std::fmt::Display>(
        &mut self,
        step: &'static str,
        outcome: &Result<T, E>,
    ) -> bool {
        match outcome {
            Ok(_) => {
                self.succeeded.push(step);
                true
            }
            Err(e) => {
                tracing::error!(step, "{}", e);
                self.failed.push(step);
                false
            }
        }
    }
}

/// Run every example call in order. A failing step is logged and the
/// sequence continues.
pub async fn run(repository: &dyn UserRepository) -> DemoSummary {
    let mut summary = DemoSummary::default();

    let user = User::new("user123", "John Doe", "john@example.com", 30, true);
    let outcome = repository.put(&user).await;
    if summary.record("put user", &outcome) {
        tracing::info!(user_id = %user.user_id, "User inserted successfully");
    }

    let outcome = repository.get(&user.user_id).await;
    if summary.record("get user", &outcome) {
        if let Ok(found) = &outcome {
            let rendered = serde_json::to_string(found).unwrap_or_else(|_| format!("{found:?}"));
            tracing::info!(user = %rendered, "Retrieved user");
        }
    }

    let outcome = repository
        .update(&user.user_id, "john.doe@example.com", 31)
        .await;
    if summary.record("update user", &outcome) {
        tracing::info!(user_id = %user.user_id, "User updated successfully");
    }

    let outcome = repository.scan_active().await;
    if summary.record("scan active users", &outcome) {
        if let Ok(active) = &outcome {
            tracing::info!(count = active.len(), "Found active users");
        }
    }

    let batch = vec![
        User::new("user001", "Alice", "alice@example.com", 25, true),
        User::new("user002", "Bob", "bob@example.com", 28, true),
        User::new("user003", "Charlie", "charlie@example.com", 35, false),
    ];
    let outcome = repository.batch_put(&batch).await;
    if summary.record("batch insert users", &outcome) {
        tracing::info!(count = batch.len(), "Batch insert successful");
    }

    let outcome = repository.delete(&user.user_id).await;
    if summary.record("delete user", &outcome) {
        tracing::info!(user_id = %user.user_id, "User deleted successfully");
    }

    summary
}
