use chrono::Utc;

use super::DatabaseLogger;
use crate::server::storage_traits::{BoxFuture, PromptRecorder};

/// Keeps flagged prompts in SQLite for a limited time. Old rows are purged
/// on every write.
pub struct SqlitePromptRecorder {
    db: DatabaseLogger,
    retention: chrono::Duration,
}

impl SqlitePromptRecorder {
    pub fn new(db: DatabaseLogger, retention_minutes: i64) -> Self {
        Self {
            db,
            retention: chrono::Duration::minutes(retention_minutes.max(1)),
        }
    }
}

impl PromptRecorder for SqlitePromptRecorder {
    fn record<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, crate::error::Result<()>> {
        Box::pin(async move {
            let now = Utc::now();
            let purged = self.db.purge_flagged_prompts_before(now - self.retention).await?;
            if purged > 0 {
                tracing::debug!(purged, "purged expired flagged prompts");
            }
            let hash = self.db.record_flagged_prompt(prompt, now).await?;
            tracing::info!(prompt_hash = %hash, "recorded flagged prompt");
            Ok(())
        })
    }
}
