use crate::categorize::KeywordCategorizer;
use crate::cli::Cli;
use crate::config::{load_vocabulary, AppDefaults};
use crate::gmail::GmailClientFactory;
use crate::oauth::KeyringCredentialService;
use crate::storage::Database;
use crate::sync::SyncEngine;
use crate::types::{Attachment, MailboxUser};
use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

pub async fn run(cli: Cli) -> Result<()> {
    let defaults = AppDefaults::load()?;
    let db = Arc::new(Database::new_default().await?);
    info!(path = %db.path().display(), "Using SQLite store");

    let mut user = resolve_user(&cli, &db).await?;

    if let Some(path) = &cli.categories {
        let vocabulary = load_vocabulary(path)?;
        db.replace_categories(user.user_id, &vocabulary).await?;
        info!(user = user.user_id, categories = vocabulary.len(), "Category vocabulary replaced");
        user.categories = vocabulary;
    }

    let credentials = Arc::new(KeyringCredentialService::new());
    if let Some(token) = &cli.refresh_token {
        credentials.store_refresh_token(user.user_id, token)?;
        info!(user = user.user_id, "Refresh token stored");
    }

    let clients = Arc::new(GmailClientFactory::new(
        defaults.gmail_api_base.clone(),
        defaults.page_size,
        defaults.http_timeout,
        credentials,
    )?);
    let engine = SyncEngine::new(
        clients,
        db.clone(),
        Arc::new(KeywordCategorizer::new()),
        defaults.sync.clone(),
    )?;

    let attachments = if cli.resync {
        let outcome = engine
            .sync_attachments(&mut user)
            .await
            .context("syncing attachments")?;
        for failure in &outcome.failures {
            warn!(message = %failure.message_id, error = %failure.error, "Message skipped");
        }
        if !outcome.failures.is_empty() {
            eprintln!(
                "{} message(s) could not be synced; see logs for details",
                outcome.failures.len()
            );
        }
        outcome.attachments
    } else {
        engine
            .get_attachments(&mut user)
            .await
            .context("loading attachments")?
    };

    let shown = &attachments[..attachments.len().min(cli.limit)];
    if cli.json {
        println!("{}", serde_json::to_string_pretty(shown)?);
    } else {
        print_attachments(&user, shown, attachments.len());
    }
    Ok(())
}

/// Loads the user, creating it when `--email` is given and no row exists yet.
async fn resolve_user(cli: &Cli, db: &Database) -> Result<MailboxUser> {
    match db.load_user(cli.user).await? {
        Some(mut user) => {
            if let Some(email) = cli.email.as_ref().filter(|e| **e != user.email) {
                user.email = email.clone();
                db.save_user(&user).await?;
                info!(user = user.user_id, "User email updated");
            }
            Ok(user)
        }
        None => {
            let email = cli
                .email
                .clone()
                .ok_or_else(|| anyhow!("user {} not found; pass --email to create it", cli.user))?;
            let user = MailboxUser::new(cli.user, email, Vec::new());
            db.save_user(&user).await?;
            info!(user = user.user_id, "User created");
            Ok(user)
        }
    }
}

fn print_attachments(user: &MailboxUser, shown: &[Attachment], total: usize) {
    println!("\n{}", "=".repeat(80));
    println!("📎 Latest {} of {} attachments for {}", shown.len(), total, user.email);
    println!("{}\n", "=".repeat(80));

    if shown.is_empty() {
        println!("No attachments found for {}\n", user.email);
        return;
    }

    for (i, attachment) in shown.iter().enumerate() {
        let date = attachment.created_at.format("%Y-%m-%d %H:%M");
        let subject = if attachment.subject.is_empty() {
            "(No Subject)"
        } else {
            attachment.subject.as_str()
        };
        let from = if attachment.sender.is_empty() {
            "Unknown"
        } else {
            attachment.sender.as_str()
        };

        println!("{}. [{}] {}", i + 1, date, attachment.name);
        println!("   Subject: {}", subject);
        println!("   From: {}", from);
        if !attachment.categories.is_empty() {
            let categories: Vec<&str> = attachment.categories.iter().map(String::as_str).collect();
            println!("   Categories: {}", categories.join(", "));
        }
        println!();
    }
}
