use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{TimeZone, Utc};

use refile::categorize::KeywordCategorizer;
use refile::config::{FailurePolicy, ReplaceStrategy, SyncSettings};
use refile::errors::{AppError, AppResult};
use refile::gmail::{
    ClientFactory, GmailClientFactory, Header, MailProvider, MessageListPage, MessagePart,
    MessageRef, RemoteMessage,
};
use refile::oauth::{Credential, CredentialService};
use refile::storage::Database;
use refile::sync::SyncEngine;
use refile::types::{Attachment, Category, MailboxUser};

const USER: i64 = 42;

struct Scripted {
    failures: u32,
    calls: AtomicU32,
    message: RemoteMessage,
}

/// Serves one page of messages; each message fails its first `failures` fetches.
struct ScriptedMailbox {
    order: Vec<String>,
    messages: HashMap<String, Scripted>,
    list_calls: AtomicU32,
}

impl ScriptedMailbox {
    fn new() -> Self {
        Self {
            order: Vec::new(),
            messages: HashMap::new(),
            list_calls: AtomicU32::new(0),
        }
    }

    fn with(mut self, message: RemoteMessage, failures: u32) -> Self {
        self.order.push(message.id.clone());
        self.messages.insert(
            message.id.clone(),
            Scripted {
                failures,
                calls: AtomicU32::new(0),
                message,
            },
        );
        self
    }

    fn fetches(&self, id: &str) -> u32 {
        self.messages[id].calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailProvider for ScriptedMailbox {
    async fn list_messages(
        &self,
        _query: &str,
        _page_token: Option<&str>,
    ) -> AppResult<MessageListPage> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(MessageListPage {
            messages: self.order.iter().map(MessageRef::new).collect(),
            next_page_token: None,
            result_size_estimate: Some(self.order.len() as u64),
        })
    }

    async fn get_message(&self, message_id: &str) -> AppResult<RemoteMessage> {
        let scripted = self
            .messages
            .get(message_id)
            .ok_or_else(|| AppError::Network(format!("404 for {message_id}")))?;
        let n = scripted.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= scripted.failures {
            return Err(AppError::Network(format!("{message_id} attempt {n} timed out")));
        }
        Ok(scripted.message.clone())
    }
}

struct FixedClients(Arc<ScriptedMailbox>);

#[async_trait]
impl ClientFactory for FixedClients {
    async fn client_for(&self, _user_id: i64) -> AppResult<Arc<dyn MailProvider>> {
        Ok(self.0.clone())
    }
}

/// One message that always fails fast; every other message takes `delay` to fetch.
struct SlowMailbox {
    ids: Vec<String>,
    delay: Duration,
    started: AtomicU32,
    finished: AtomicU32,
}

impl SlowMailbox {
    fn new(good: usize, delay: Duration) -> Self {
        let mut ids = vec!["bad".to_string()];
        ids.extend((0..good).map(|i| format!("good-{i}")));
        Self {
            ids,
            delay,
            started: AtomicU32::new(0),
            finished: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl MailProvider for SlowMailbox {
    async fn list_messages(
        &self,
        _query: &str,
        _page_token: Option<&str>,
    ) -> AppResult<MessageListPage> {
        Ok(MessageListPage {
            messages: self.ids.iter().map(MessageRef::new).collect(),
            ..Default::default()
        })
    }

    async fn get_message(&self, message_id: &str) -> AppResult<RemoteMessage> {
        if message_id == "bad" {
            return Err(AppError::Network("boom".into()));
        }
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(message(message_id, 1_000, "", "", &[("a.txt", message_id)]))
    }
}

struct SlowClients(Arc<SlowMailbox>);

#[async_trait]
impl ClientFactory for SlowClients {
    async fn client_for(&self, _user_id: i64) -> AppResult<Arc<dyn MailProvider>> {
        Ok(self.0.clone())
    }
}

struct NoCredentials;

#[async_trait]
impl CredentialService for NoCredentials {
    async fn resolve_credential(&self, _user_id: i64) -> AppResult<Option<Credential>> {
        Ok(None)
    }
}

fn message(id: &str, millis: i64, subject: &str, body: &str, files: &[(&str, &str)]) -> RemoteMessage {
    let encoded = URL_SAFE_NO_PAD.encode(body);
    let mut parts = vec![MessagePart::leaf(Some(&encoded))];
    parts.extend(files.iter().map(|(name, g_id)| MessagePart::attachment(*name, *g_id)));

    let mut payload = MessagePart::container(parts);
    payload.headers = vec![
        Header::new("From", "billing@example.com"),
        Header::new("Subject", subject),
    ];
    RemoteMessage {
        id: id.to_string(),
        label_ids: vec!["INBOX".into()],
        internal_date: millis,
        payload,
        ..Default::default()
    }
}

fn prior_attachment(g_id: &str) -> Attachment {
    Attachment {
        user_id: USER,
        g_id: g_id.to_string(),
        name: "old.txt".into(),
        extension: "txt".into(),
        sender: "someone@example.com".into(),
        subject: "old".into(),
        created_at: Utc.timestamp_millis_opt(1_000).unwrap(),
        label_ids: BTreeSet::new(),
        categories: BTreeSet::new(),
    }
}

fn settings(policy: FailurePolicy, strategy: ReplaceStrategy) -> SyncSettings {
    SyncSettings {
        io_workers: 4,
        cpu_workers: 2,
        failure_policy: policy,
        replace_strategy: strategy,
        ..SyncSettings::default()
    }
}

async fn seeded_store(prior: &[Attachment]) -> (Arc<Database>, MailboxUser) {
    let db = Arc::new(Database::in_memory().await.unwrap());
    let mut user = MailboxUser::new(
        USER,
        "owner@example.com",
        vec![
            Category::new("Finance", "invoice|receipt"),
            Category::new("Travel", "flight"),
        ],
    );
    db.save_user(&user).await.unwrap();
    db.replace_categories(USER, &user.categories).await.unwrap();
    db.insert_attachments(prior).await.unwrap();
    user.attachments = prior.to_vec();
    (db, user)
}

fn engine(mailbox: Arc<ScriptedMailbox>, db: Arc<Database>, settings: SyncSettings) -> SyncEngine {
    SyncEngine::new(
        Arc::new(FixedClients(mailbox)),
        db,
        Arc::new(KeywordCategorizer::new()),
        settings,
    )
    .unwrap()
}

fn two_message_mailbox(second_failures: u32) -> ScriptedMailbox {
    ScriptedMailbox::new()
        .with(
            message("m1", 2_000_000, "Invoice March", "see attached", &[("march.pdf", "g-1")]),
            2,
        )
        .with(
            message("m2", 3_000_000, "Trip", "your flight receipt", &[("ticket.pdf", "g-2")]),
            second_failures,
        )
}

#[tokio::test]
async fn successful_sync_persists_newest_first() {
    let (db, mut user) = seeded_store(&[prior_attachment("stale")]).await;
    let mailbox = Arc::new(two_message_mailbox(0));
    let engine = engine(
        mailbox.clone(),
        db.clone(),
        settings(FailurePolicy::AllOrNothing, ReplaceStrategy::Staged),
    );

    let outcome = engine.sync_attachments(&mut user).await.unwrap();
    assert!(outcome.failures.is_empty());

    let ids: Vec<&str> = outcome.attachments.iter().map(|a| a.g_id.as_str()).collect();
    assert_eq!(ids, vec!["g-2", "g-1"]);
    assert_eq!(
        outcome.attachments[0].categories,
        BTreeSet::from(["Finance".to_string(), "Travel".to_string()])
    );
    assert_eq!(
        outcome.attachments[1].categories,
        BTreeSet::from(["Finance".to_string()])
    );
    assert_eq!(outcome.attachments[1].extension, "pdf");
    assert_eq!(mailbox.fetches("m1"), 3);

    let stored = db.load_attachments(USER).await.unwrap();
    assert_eq!(stored, outcome.attachments);
    assert_eq!(user.attachments, outcome.attachments);
}

#[tokio::test]
async fn failed_delete_first_sync_leaves_user_empty() {
    let (db, mut user) = seeded_store(&[prior_attachment("old-1"), prior_attachment("old-2")]).await;
    let mailbox = Arc::new(two_message_mailbox(u32::MAX));
    let engine = engine(
        mailbox.clone(),
        db.clone(),
        settings(FailurePolicy::AllOrNothing, ReplaceStrategy::DeleteFirst),
    );

    let err = engine.sync_attachments(&mut user).await.unwrap_err();
    match err {
        AppError::RetriesExhausted {
            message_id,
            attempts,
            ..
        } => {
            assert_eq!(message_id, "m2");
            assert_eq!(attempts, 3);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(mailbox.fetches("m2"), 3);
    assert_eq!(db.count_attachments(USER).await.unwrap(), 0);
    assert!(user.attachments.is_empty());
}

#[tokio::test]
async fn failed_staged_sync_keeps_previous_rows() {
    let prior = vec![prior_attachment("old-1"), prior_attachment("old-2")];
    let (db, mut user) = seeded_store(&prior).await;
    let engine = engine(
        Arc::new(two_message_mailbox(u32::MAX)),
        db.clone(),
        settings(FailurePolicy::AllOrNothing, ReplaceStrategy::Staged),
    );

    assert!(engine.sync_attachments(&mut user).await.is_err());

    let stored: BTreeSet<String> = db
        .load_attachments(USER)
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.g_id)
        .collect();
    assert_eq!(stored, BTreeSet::from(["old-1".to_string(), "old-2".to_string()]));
    assert_eq!(user.attachments.len(), 2);
}

#[tokio::test]
async fn best_effort_commits_what_succeeded() {
    let (db, mut user) = seeded_store(&[]).await;
    let engine = engine(
        Arc::new(two_message_mailbox(u32::MAX)),
        db.clone(),
        settings(FailurePolicy::BestEffort, ReplaceStrategy::Staged),
    );

    let outcome = engine.sync_attachments(&mut user).await.unwrap();
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].message_id, "m2");
    assert_eq!(outcome.attachments.len(), 1);
    assert_eq!(outcome.attachments[0].g_id, "g-1");
    assert_eq!(db.count_attachments(USER).await.unwrap(), 1);
}

#[tokio::test]
async fn resync_is_idempotent() {
    let (db, mut user) = seeded_store(&[]).await;
    let engine = engine(
        Arc::new(two_message_mailbox(0)),
        db.clone(),
        settings(FailurePolicy::AllOrNothing, ReplaceStrategy::Staged),
    );

    let first = engine.sync_attachments(&mut user).await.unwrap().attachments;
    let second = engine.sync_attachments(&mut user).await.unwrap().attachments;
    assert_eq!(first, second);
    assert_eq!(db.count_attachments(USER).await.unwrap(), 2);
}

#[tokio::test]
async fn cached_attachments_skip_the_mailbox() {
    let (db, mut user) = seeded_store(&[]).await;
    let mailbox = Arc::new(two_message_mailbox(0));
    let engine = engine(
        mailbox.clone(),
        db,
        settings(FailurePolicy::AllOrNothing, ReplaceStrategy::Staged),
    );

    let first = engine.get_attachments(&mut user).await.unwrap();
    let second = engine.get_attachments(&mut user).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(mailbox.list_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn empty_mailbox_clears_previous_set() {
    let (db, mut user) = seeded_store(&[prior_attachment("old-1")]).await;
    let engine = engine(
        Arc::new(ScriptedMailbox::new()),
        db.clone(),
        settings(FailurePolicy::AllOrNothing, ReplaceStrategy::Staged),
    );

    let outcome = engine.sync_attachments(&mut user).await.unwrap();
    assert!(outcome.attachments.is_empty());
    assert_eq!(db.count_attachments(USER).await.unwrap(), 0);
}

#[tokio::test]
async fn missing_credential_fails_before_touching_storage() {
    let (db, mut user) = seeded_store(&[prior_attachment("old-1")]).await;
    let base = refile::config::parse_api_base("http://127.0.0.1:9/gmail/v1").unwrap();
    let engine = SyncEngine::new(
        Arc::new(
            GmailClientFactory::new(base, None, Duration::from_secs(5), Arc::new(NoCredentials))
                .unwrap(),
        ),
        db.clone(),
        Arc::new(KeywordCategorizer::new()),
        settings(FailurePolicy::AllOrNothing, ReplaceStrategy::Staged),
    )
    .unwrap();

    let err = engine.sync_attachments(&mut user).await.unwrap_err();
    assert!(matches!(err, AppError::MissingCredential(USER)));
    assert_eq!(db.count_attachments(USER).await.unwrap(), 1);
}

#[tokio::test]
async fn first_failure_cancels_pending_fetches() {
    let (db, mut user) = seeded_store(&[prior_attachment("old-1")]).await;
    let mailbox = Arc::new(SlowMailbox::new(20, Duration::from_millis(50)));
    let engine = SyncEngine::new(
        Arc::new(SlowClients(mailbox.clone())),
        db.clone(),
        Arc::new(KeywordCategorizer::new()),
        SyncSettings {
            io_workers: 1,
            fetch_attempts: 1,
            ..settings(FailurePolicy::AllOrNothing, ReplaceStrategy::Staged)
        },
    )
    .unwrap();

    let err = engine.sync_attachments(&mut user).await.unwrap_err();
    match &err {
        AppError::RetriesExhausted {
            message_id,
            attempts,
            ..
        } => {
            assert_eq!(message_id, "bad");
            assert_eq!(*attempts, 1);
        }
        other => panic!("unexpected error: {other}"),
    }
    let started_at_return = mailbox.started.load(Ordering::SeqCst);
    assert!(started_at_return <= 1, "{started_at_return} fetches started");

    // Pipelines still queued on the I/O permit must not start after the failure.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(mailbox.started.load(Ordering::SeqCst), started_at_return);
    assert!(mailbox.finished.load(Ordering::SeqCst) <= started_at_return);
    assert_eq!(db.count_attachments(USER).await.unwrap(), 1);
}
