mod db;

pub use db::{default_data_dir, Database};

use async_trait::async_trait;

use crate::errors::{AppError, AppResult};
use crate::types::Attachment;

/// Durable attachment storage as seen by the sync pipeline. Every operation is
/// all-or-raise.
#[async_trait]
pub trait AttachmentService: Send + Sync {
    /// Removes the stored attachments of `user_id`. Rows missing from the
    /// in-memory `known` list are removed too, so no stale row survives.
    async fn delete_all(&self, user_id: i64, known: &[Attachment]) -> AppResult<u64>;

    async fn save_all(&self, attachments: &[Attachment]) -> AppResult<()>;

    /// Deletes the user's current set and inserts `attachments` in one transaction.
    async fn replace_all(&self, user_id: i64, attachments: &[Attachment]) -> AppResult<()>;
}

#[async_trait]
impl AttachmentService for Database {
    async fn delete_all(&self, user_id: i64, known: &[Attachment]) -> AppResult<u64> {
        let deleted = self.delete_attachments(user_id).await.map_err(db_error)?;
        tracing::debug!(user = user_id, known = known.len(), deleted, "Deleted attachments");
        Ok(deleted)
    }

    async fn save_all(&self, attachments: &[Attachment]) -> AppResult<()> {
        self.insert_attachments(attachments).await.map_err(db_error)
    }

    async fn replace_all(&self, user_id: i64, attachments: &[Attachment]) -> AppResult<()> {
        self.replace_attachments(user_id, attachments)
            .await
            .map_err(db_error)
    }
}

fn db_error(e: anyhow::Error) -> AppError {
    AppError::Database(format!("{e:#}"))
}
