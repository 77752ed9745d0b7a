use clap::Parser;
use std::path::PathBuf;

/// Command-line options for refile.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Mailbox owner whose attachments are listed or synced
    #[arg(long)]
    pub user: i64,

    /// Create the user (or update its address) with this email
    #[arg(long)]
    pub email: Option<String>,

    /// TOML file with the user's category vocabulary; replaces the stored one.
    #[arg(long)]
    pub categories: Option<PathBuf>,

    /// Store a refresh token obtained elsewhere in the OS keyring for this user.
    #[arg(long)]
    pub refresh_token: Option<String>,

    /// Force a full resync even when attachments are cached.
    #[arg(long)]
    pub resync: bool,

    /// Number of attachments printed.
    #[arg(long, default_value_t = 20)]
    pub limit: usize,

    /// Print attachments as JSON
    #[arg(long)]
    pub json: bool,
}
