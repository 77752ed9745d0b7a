pub mod fetcher;
pub mod lister;
pub mod processor;

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::categorize::CategorizationService;
use crate::config::{FailurePolicy, ReplaceStrategy, SyncSettings};
use crate::errors::{AppError, AppResult};
use crate::gmail::{ClientFactory, MailProvider, MessageRef};
use crate::storage::AttachmentService;
use crate::types::{sort_by_recency, Attachment, Category, MailboxUser};

pub use fetcher::{fetch_full_message, retry_async, RetryFailure, RetryPolicy};
pub use lister::{list_messages_with_attachments, ATTACHMENT_QUERY};
pub use processor::{
    extract_body, extract_metadata, file_extension, process_message, MessageMetadata,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Listing,
    Fetching,
    Processing,
    Aggregating,
    Persisting,
    Done,
    Failed,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Listing => "listing",
            Self::Fetching => "fetching",
            Self::Processing => "processing",
            Self::Aggregating => "aggregating",
            Self::Persisting => "persisting",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub struct MessageFailure {
    pub message_id: String,
    pub error: AppError,
}

/// Result of a sync run. `failures` is only populated under
/// [`FailurePolicy::BestEffort`].
#[derive(Debug, Default)]
pub struct SyncOutcome {
    pub attachments: Vec<Attachment>,
    pub failures: Vec<MessageFailure>,
}

/// Per-run state handed to every compute task.
struct ProcessContext {
    user_id: i64,
    vocabulary: Vec<Category>,
    categorizer: Arc<dyn CategorizationService>,
}

pub struct SyncEngine {
    clients: Arc<dyn ClientFactory>,
    store: Arc<dyn AttachmentService>,
    categorizer: Arc<dyn CategorizationService>,
    settings: SyncSettings,
    cpu_pool: Arc<rayon::ThreadPool>,
}

impl SyncEngine {
    pub fn new(
        clients: Arc<dyn ClientFactory>,
        store: Arc<dyn AttachmentService>,
        categorizer: Arc<dyn CategorizationService>,
        settings: SyncSettings,
    ) -> AppResult<Self> {
        let cpu_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(settings.cpu_workers.max(1))
            .thread_name(|i| format!("refile-cpu-{i}"))
            .panic_handler(|_| warn!("Message processing task panicked"))
            .build()
            .map_err(|e| AppError::Unexpected(format!("building compute pool: {e}")))?;

        Ok(Self {
            clients,
            store,
            categorizer,
            settings,
            cpu_pool: Arc::new(cpu_pool),
        })
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Cached attachments of the user, newest first. Syncs only when nothing is cached.
    pub async fn get_attachments(&self, user: &mut MailboxUser) -> AppResult<Vec<Attachment>> {
        if user.attachments.is_empty() {
            info!(user = user.user_id, "No cached attachments; syncing");
            return Ok(self.sync_attachments(user).await?.attachments);
        }
        let mut cached = user.attachments.clone();
        sort_by_recency(&mut cached);
        Ok(cached)
    }

    /// Full resync: the user's attachment set is replaced by what the mailbox
    /// holds now, and returned newest first.
    pub async fn sync_attachments(&self, user: &mut MailboxUser) -> AppResult<SyncOutcome> {
        let started = Instant::now();
        let user_id = user.user_id;
        info!(
            user = user_id,
            phase = %SyncPhase::Idle,
            strategy = ?self.settings.replace_strategy,
            policy = ?self.settings.failure_policy,
            "Starting attachment sync"
        );

        match self.run(user).await {
            Ok(outcome) => {
                info!(
                    user = user_id,
                    phase = %SyncPhase::Done,
                    attachments = outcome.attachments.len(),
                    failures = outcome.failures.len(),
                    elapsed_ms = ?started.elapsed().as_millis(),
                    "Attachment sync completed"
                );
                Ok(outcome)
            }
            Err(e) => {
                warn!(
                    user = user_id,
                    phase = %SyncPhase::Failed,
                    error = %e,
                    elapsed_ms = ?started.elapsed().as_millis(),
                    "Attachment sync failed"
                );
                Err(e)
            }
        }
    }

    async fn run(&self, user: &mut MailboxUser) -> AppResult<SyncOutcome> {
        let user_id = user.user_id;

        if self.settings.replace_strategy == ReplaceStrategy::DeleteFirst {
            let deleted = self.store.delete_all(user_id, &user.attachments).await?;
            user.attachments.clear();
            debug!(user = user_id, deleted, "Cleared previous attachments before sync");
        }

        let client = self.clients.client_for(user_id).await?;

        let list_start = Instant::now();
        debug!(user = user_id, phase = %SyncPhase::Listing, "Listing messages");
        let refs = list_messages_with_attachments(client.as_ref()).await?;
        info!(
            user = user_id,
            messages = refs.len(),
            elapsed_ms = ?list_start.elapsed().as_millis(),
            "Listed messages with attachments"
        );

        let (per_message, failures) = self.fan_out(client, user, refs).await?;

        debug!(user = user_id, phase = %SyncPhase::Aggregating, "Merging message results");
        let attachments = aggregate(per_message);

        let write_start = Instant::now();
        debug!(user = user_id, phase = %SyncPhase::Persisting, count = attachments.len(), "Persisting attachments");
        match self.settings.replace_strategy {
            ReplaceStrategy::Staged => self.store.replace_all(user_id, &attachments).await?,
            ReplaceStrategy::DeleteFirst => self.store.save_all(&attachments).await?,
        }
        debug!(
            user = user_id,
            write_ms = ?write_start.elapsed().as_millis(),
            "Attachments persisted"
        );

        user.attachments = attachments.clone();
        Ok(SyncOutcome {
            attachments,
            failures,
        })
    }

    /// Runs one fetch-then-process chain per message. Fetches share a bounded
    /// number of I/O permits; processing runs on the compute pool.
    async fn fan_out(
        &self,
        client: Arc<dyn MailProvider>,
        user: &MailboxUser,
        refs: Vec<MessageRef>,
    ) -> AppResult<(Vec<Vec<Attachment>>, Vec<MessageFailure>)> {
        let parallel_start = Instant::now();
        let total = refs.len();
        let cancel = CancellationToken::new();
        let io_permits = Arc::new(Semaphore::new(self.settings.io_workers.max(1)));
        let policy = RetryPolicy::from_settings(&self.settings);
        let ctx = Arc::new(ProcessContext {
            user_id: user.user_id,
            vocabulary: user.categories.clone(),
            categorizer: Arc::clone(&self.categorizer),
        });

        debug!(user = user.user_id, phase = %SyncPhase::Fetching, messages = total, "Spawning message pipelines");

        let mut tasks: FuturesUnordered<_> = refs
            .into_iter()
            .map(|message| {
                let pipeline = MessagePipeline {
                    message_id: message.id.clone(),
                    client: Arc::clone(&client),
                    io_permits: Arc::clone(&io_permits),
                    cpu_pool: Arc::clone(&self.cpu_pool),
                    ctx: Arc::clone(&ctx),
                    policy: policy.clone(),
                    cancel: cancel.clone(),
                };
                let handle = tokio::spawn(pipeline.run());
                async move { (message.id, handle.await) }
            })
            .collect();

        let mut results = Vec::with_capacity(total);
        let mut failures = Vec::new();

        while let Some((message_id, joined)) = tasks.next().await {
            let result = joined.unwrap_or_else(|e| {
                Err(AppError::Unexpected(format!("message task failed: {e}")))
            });

            match result {
                Ok(attachments) => results.push(attachments),
                Err(error) => match self.settings.failure_policy {
                    FailurePolicy::AllOrNothing => {
                        cancel.cancel();
                        warn!(
                            user = user.user_id,
                            message = %message_id,
                            error = %error,
                            in_flight = tasks.len(),
                            "Message pipeline failed; cancelling sync"
                        );
                        return Err(error);
                    }
                    FailurePolicy::BestEffort => {
                        warn!(user = user.user_id, message = %message_id, error = %error, "Message pipeline failed; continuing");
                        failures.push(MessageFailure { message_id, error });
                    }
                },
            }
        }

        info!(
            user = user.user_id,
            messages = total,
            ok = results.len(),
            failed = failures.len(),
            parallel_elapsed_ms = ?parallel_start.elapsed().as_millis(),
            "Message pipelines finished"
        );
        Ok((results, failures))
    }
}

struct MessagePipeline {
    message_id: String,
    client: Arc<dyn MailProvider>,
    io_permits: Arc<Semaphore>,
    cpu_pool: Arc<rayon::ThreadPool>,
    ctx: Arc<ProcessContext>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl MessagePipeline {
    async fn run(self) -> AppResult<Vec<Attachment>> {
        // Stage one: network-bound fetch, holding an I/O permit.
        let message = {
            let _permit = tokio::select! {
                _ = self.cancel.cancelled() => return Err(AppError::Cancelled),
                permit = self.io_permits.acquire() => permit.map_err(|_| AppError::Cancelled)?,
            };
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(AppError::Cancelled),
                fetched = fetch_full_message(
                    self.client.as_ref(),
                    &self.message_id,
                    &self.policy,
                    &self.cancel,
                ) => fetched?,
            }
        };

        if self.cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        // Stage two: CPU-bound parse and categorization on the compute pool.
        debug!(message = %self.message_id, phase = %SyncPhase::Processing, "Handing message to compute pool");
        let (tx, rx) = oneshot::channel();
        let ctx = self.ctx;
        self.cpu_pool.spawn(move || {
            let attachments = process_message(
                &message,
                ctx.user_id,
                &ctx.vocabulary,
                ctx.categorizer.as_ref(),
            );
            let _ = tx.send(attachments);
        });

        rx.await.map_err(|_| {
            AppError::Unexpected(format!("processing message {} panicked", self.message_id))
        })
    }
}

/// Merges per-message results into one newest-first list. A non-empty `g_id`
/// seen twice keeps its first occurrence.
fn aggregate(per_message: Vec<Vec<Attachment>>) -> Vec<Attachment> {
    let mut all: Vec<Attachment> = per_message.into_iter().flatten().collect();
    sort_by_recency(&mut all);

    let mut seen = HashSet::new();
    all.retain(|a| a.g_id.is_empty() || seen.insert(a.g_id.clone()));
    all
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeSet;

    fn attachment(g_id: &str, millis: i64) -> Attachment {
        Attachment {
            user_id: 1,
            g_id: g_id.to_string(),
            name: "f.txt".into(),
            extension: "txt".into(),
            sender: String::new(),
            subject: String::new(),
            created_at: Utc.timestamp_millis_opt(millis).unwrap(),
            label_ids: BTreeSet::new(),
            categories: BTreeSet::new(),
        }
    }

    #[test]
    fn aggregate_sorts_newest_first_and_drops_duplicate_ids() {
        let merged = aggregate(vec![
            vec![attachment("a", 1_000), attachment("b", 3_000)],
            vec![attachment("c", 2_000), attachment("b", 3_000)],
            vec![attachment("", 500), attachment("", 500)],
        ]);
        let ids: Vec<&str> = merged.iter().map(|a| a.g_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a", "", ""]);
    }

    #[test]
    fn phases_display_lowercase() {
        assert_eq!(SyncPhase::Persisting.to_string(), "persisting");
        assert_eq!(SyncPhase::Processing.to_string(), "processing");
        assert_eq!(SyncPhase::Failed.to_string(), "failed");
    }
}
