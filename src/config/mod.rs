use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::types::Category;

const DEFAULT_GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/";
const DEFAULT_FETCH_ATTEMPTS: u32 = 3;
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// What the orchestrator does when a single message pipeline fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailurePolicy {
    /// First failure cancels the run and nothing is persisted.
    AllOrNothing,
    /// Failed messages are reported and the remaining attachments are committed.
    BestEffort,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "all-or-nothing" | "strict" => Ok(Self::AllOrNothing),
            "best-effort" | "lenient" => Ok(Self::BestEffort),
            _ => Err(format!("unknown failure policy: {s}")),
        }
    }
}

/// How the previous attachment set is replaced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplaceStrategy {
    /// Build the new set first, then swap it in with one transaction.
    Staged,
    /// Delete the old set before listing; a failed run leaves the user empty.
    DeleteFirst,
}

impl FromStr for ReplaceStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "staged" | "atomic" => Ok(Self::Staged),
            "delete-first" => Ok(Self::DeleteFirst),
            _ => Err(format!("unknown replace strategy: {s}")),
        }
    }
}

/// Tuning knobs for one sync run.
#[derive(Clone, Debug)]
pub struct SyncSettings {
    pub io_workers: usize,
    pub cpu_workers: usize,
    pub fetch_attempts: u32,
    pub fetch_backoff: Duration,
    pub failure_policy: FailurePolicy,
    pub replace_strategy: ReplaceStrategy,
}

impl Default for SyncSettings {
    fn default() -> Self {
        let cores = available_cores();
        Self {
            io_workers: (cores * 4).max(8),
            cpu_workers: cores,
            fetch_attempts: DEFAULT_FETCH_ATTEMPTS,
            fetch_backoff: Duration::ZERO,
            failure_policy: FailurePolicy::AllOrNothing,
            replace_strategy: ReplaceStrategy::Staged,
        }
    }
}

/// Application-wide defaults. These can be overridden by env vars but do not
/// require any user-authored config files.
#[derive(Debug, Clone)]
pub struct AppDefaults {
    pub sync: SyncSettings,
    pub gmail_api_base: Url,
    pub page_size: Option<u32>,
    /// Upper bound for one Gmail request, so a hung call surfaces as a retryable error.
    pub http_timeout: Duration,
}

impl AppDefaults {
    pub fn load() -> Result<Self> {
        let mut sync = SyncSettings::default();

        if let Some(n) = parse_env::<usize>("REFILE_IO_WORKERS").filter(|n| *n > 0) {
            sync.io_workers = n;
        }
        if let Some(n) = parse_env::<usize>("REFILE_CPU_WORKERS").filter(|n| *n > 0) {
            sync.cpu_workers = n;
        }
        if let Some(n) = parse_env::<u32>("REFILE_FETCH_ATTEMPTS").filter(|n| *n > 0) {
            sync.fetch_attempts = n;
        }
        if let Some(ms) = parse_env::<u64>("REFILE_FETCH_BACKOFF_MS") {
            sync.fetch_backoff = Duration::from_millis(ms);
        }
        if let Ok(raw) = env::var("REFILE_FAILURE_POLICY") {
            sync.failure_policy = raw.parse().map_err(anyhow::Error::msg)?;
        }
        if let Ok(raw) = env::var("REFILE_REPLACE_STRATEGY") {
            sync.replace_strategy = raw.parse().map_err(anyhow::Error::msg)?;
        }

        let base_raw =
            env::var("REFILE_GMAIL_API_BASE").unwrap_or_else(|_| DEFAULT_GMAIL_API_BASE.into());
        let gmail_api_base = parse_api_base(&base_raw)?;
        let page_size = parse_env::<u32>("REFILE_PAGE_SIZE").filter(|n| *n > 0);
        let http_timeout = parse_env::<u64>("REFILE_HTTP_TIMEOUT_SECS")
            .filter(|n| *n > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_HTTP_TIMEOUT);

        Ok(Self {
            sync,
            gmail_api_base,
            page_size,
            http_timeout,
        })
    }
}

/// Parses an API base URL, forcing a trailing slash so relative joins keep the path.
pub fn parse_api_base(raw: &str) -> Result<Url> {
    let normalized = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    };
    let url = Url::parse(&normalized).with_context(|| format!("invalid API base url {raw}"))?;
    if url.cannot_be_a_base() {
        bail!("API base url {raw} cannot be used as a base");
    }
    Ok(url)
}

#[derive(Debug, Deserialize)]
struct VocabularyFile {
    #[serde(default, rename = "category")]
    categories: Vec<Category>,
}

/// Reads a category vocabulary from a TOML file of `[[category]]` tables.
pub fn load_vocabulary(path: &Path) -> Result<Vec<Category>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading category file {}", path.display()))?;
    parse_vocabulary(&raw).with_context(|| format!("parsing category file {}", path.display()))
}

pub fn parse_vocabulary(raw: &str) -> Result<Vec<Category>> {
    let file: VocabularyFile = toml::from_str(raw)?;
    for category in &file.categories {
        if category.name.trim().is_empty() {
            bail!("category with pattern {:?} has no name", category.pattern);
        }
    }
    Ok(file.categories)
}

fn parse_env<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok())
}

fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
