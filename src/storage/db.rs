use crate::types::{now_ts, Attachment, Category, MailboxUser};
use anyhow::{Context, Result};
use chrono::DateTime;
use dirs::home_dir;

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::BTreeSet;
use std::env;
use std::path::{Path, PathBuf};
use tracing::warn;

const DB_FILE_NAME: &str = "refile.db";

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    path: PathBuf,
}

impl Database {
    pub async fn new_default() -> Result<Self> {
        Self::new_named(DB_FILE_NAME).await
    }

    pub async fn new_named(file_name: &str) -> Result<Self> {
        let base = default_data_dir()?;
        let db_path = base.join(file_name);
        let url = format!("sqlite://{}?mode=rwc", db_path.display());

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating data directory {}", parent.display()))?;
        }

        let pool = SqlitePool::connect(&url)
            .await
            .with_context(|| format!("connecting to sqlite at {}", db_path.display()))?;

        let db = Database {
            pool,
            path: db_path,
        };
        db.migrate().await?;
        Ok(db)
    }

    /// Single-connection in-memory store; every pooled connection would otherwise
    /// see its own empty database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("opening in-memory sqlite")?;
        let db = Database {
            pool,
            path: PathBuf::from(":memory:"),
        };
        db.migrate().await?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&self.pool)
            .await
            .context("enabling foreign keys")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                email TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS categories (
                user_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                pattern TEXT NOT NULL,
                PRIMARY KEY (user_id, name),
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS attachments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                g_id TEXT NOT NULL,
                name TEXT NOT NULL,
                extension TEXT NOT NULL,
                sender TEXT NOT NULL,
                subject TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                label_ids TEXT NOT NULL,
                categories TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_attachments_user_created ON attachments(user_id, created_at DESC);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("running migrations")?;

        Ok(())
    }

    /// Upserts the user row. Categories and attachments are stored separately.
    pub async fn save_user(&self, user: &MailboxUser) -> Result<()> {
        let now = now_ts();
        sqlx::query(
            r#"
            INSERT INTO users (id, email, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?3)
            ON CONFLICT(id) DO UPDATE SET
                email = excluded.email,
                updated_at = excluded.updated_at;
            "#,
        )
        .bind(user.user_id)
        .bind(&user.email)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("upserting user")?;
        Ok(())
    }

    /// Loads a user together with its category vocabulary and stored attachments.
    pub async fn load_user(&self, user_id: i64) -> Result<Option<MailboxUser>> {
        let row = sqlx::query("SELECT id, email FROM users WHERE id = ?1;")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .context("loading user")?;

        let Some(row) = row else {
            return Ok(None);
        };

        let mut user = MailboxUser::new(row.get(0), row.get::<String, _>(1), Vec::new());
        user.categories = self.load_categories(user_id).await?;
        user.attachments = self.load_attachments(user_id).await?;
        Ok(Some(user))
    }

    pub async fn load_categories(&self, user_id: i64) -> Result<Vec<Category>> {
        let rows = sqlx::query(
            "SELECT name, pattern FROM categories WHERE user_id = ?1 ORDER BY name ASC;",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("loading categories")?;

        Ok(rows
            .into_iter()
            .map(|row| Category::new(row.get::<String, _>(0), row.get::<String, _>(1)))
            .collect())
    }

    pub async fn replace_categories(&self, user_id: i64, categories: &[Category]) -> Result<()> {
        let mut tx = self.pool.begin().await.context("beginning transaction")?;

        sqlx::query("DELETE FROM categories WHERE user_id = ?1;")
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .context("clearing categories")?;

        for category in categories {
            sqlx::query(
                r#"
                INSERT INTO categories (user_id, name, pattern)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(user_id, name) DO UPDATE SET pattern = excluded.pattern;
                "#,
            )
            .bind(user_id)
            .bind(&category.name)
            .bind(&category.pattern)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("inserting category {}", category.name))?;
        }

        tx.commit().await.context("committing category tx")?;
        Ok(())
    }

    /// Stored attachments, newest first.
    pub async fn load_attachments(&self, user_id: i64) -> Result<Vec<Attachment>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, g_id, name, extension, sender, subject, created_at, label_ids, categories
            FROM attachments
            WHERE user_id = ?1
            ORDER BY created_at DESC, g_id ASC;
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("loading attachments")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let g_id: String = row.get(1);
            let label_json: String = row.get(7);
            let category_json: String = row.get(8);
            let label_ids = decode_set(&label_json)
                .with_context(|| format!("decoding label_ids of attachment {g_id}"))?;
            let categories = decode_set(&category_json)
                .with_context(|| format!("decoding categories of attachment {g_id}"))?;
            out.push(Attachment {
                user_id: row.get(0),
                g_id,
                name: row.get(2),
                extension: row.get(3),
                sender: row.get(4),
                subject: row.get(5),
                created_at: DateTime::from_timestamp_millis(row.get::<i64, _>(6))
                    .unwrap_or_default(),
                label_ids,
                categories,
            });
        }
        Ok(out)
    }

    pub async fn count_attachments(&self, user_id: i64) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) FROM attachments WHERE user_id = ?1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .context("count attachments")?;
        Ok(row.get::<i64, _>(0))
    }

    pub async fn delete_attachments(&self, user_id: i64) -> Result<u64> {
        let res = sqlx::query("DELETE FROM attachments WHERE user_id = ?1;")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("deleting attachments")?;
        Ok(res.rows_affected())
    }

    pub async fn insert_attachments(&self, attachments: &[Attachment]) -> Result<()> {
        let mut tx = self.pool.begin().await.context("beginning transaction")?;
        insert_rows(&mut tx, attachments).await?;
        tx.commit().await.context("committing attachment insert tx")?;
        Ok(())
    }

    pub async fn replace_attachments(&self, user_id: i64, attachments: &[Attachment]) -> Result<()> {
        let mut tx = self.pool.begin().await.context("beginning replace tx")?;

        sqlx::query("DELETE FROM attachments WHERE user_id = ?1;")
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .context("deleting previous attachments")?;

        insert_rows(&mut tx, attachments).await?;

        tx.commit().await.context("committing replace tx")?;
        Ok(())
    }
}

async fn insert_rows(conn: &mut SqliteConnection, attachments: &[Attachment]) -> Result<()> {
    for attachment in attachments {
        sqlx::query(
            r#"
            INSERT INTO attachments (user_id, g_id, name, extension, sender, subject, created_at, label_ids, categories)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9);
            "#,
        )
        .bind(attachment.user_id)
        .bind(&attachment.g_id)
        .bind(&attachment.name)
        .bind(&attachment.extension)
        .bind(&attachment.sender)
        .bind(&attachment.subject)
        .bind(attachment.created_at.timestamp_millis())
        .bind(encode_set(&attachment.label_ids))
        .bind(encode_set(&attachment.categories))
        .execute(&mut *conn)
        .await
        .with_context(|| format!("inserting attachment {}", attachment.g_id))?;
    }
    Ok(())
}

fn encode_set(set: &BTreeSet<String>) -> String {
    serde_json::to_string(set).unwrap_or_else(|_| "[]".into())
}

fn decode_set(raw: &str) -> Result<BTreeSet<String>> {
    Ok(serde_json::from_str(raw)?)
}

pub fn default_data_dir() -> Result<PathBuf> {
    if let Ok(custom) = env::var("REFILE_DATA_DIR") {
        let path = PathBuf::from(custom);
        std::fs::create_dir_all(&path)
            .with_context(|| format!("creating REFILE_DATA_DIR at {}", path.display()))?;
        return Ok(path);
    }

    if let Some(home) = home_dir() {
        let path = home.join("refile");
        if std::fs::create_dir_all(&path).is_ok() {
            return Ok(path);
        } else {
            warn!(
                "Unable to create {}/refile; falling back to workspace-local storage",
                home.display()
            );
        }
    }

    let cwd = env::current_dir().context("determining current directory")?;
    let path = cwd.join("refile-data");
    std::fs::create_dir_all(&path)
        .with_context(|| format!("creating fallback data directory {}", path.display()))?;
    Ok(path)
}
