//! pr-maildir command line.
//!
//! # Commands
//!
//! - `sync` - deliver new and updated pull requests and comments (default)
//! - `sweep` - remove leftover staging files
//! - `status` - show the index and mailbox state of one delivery key

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pr_maildir::config::{Config, Overrides};
use pr_maildir::format::{MailFormatter, read_watermark};
use pr_maildir::index::StateIndex;
use pr_maildir::maildir::{self, DEFAULT_STAGING_MAX_AGE, Lookup, Maildir, UniqueNameGenerator};
use pr_maildir::reconcile::Reconciler;
use pr_maildir::source::BitbucketClient;
use pr_maildir::types::DeliveryKey;

type BoxError = Box<dyn std::error::Error>;

/// Deliver Bitbucket pull requests and comments into a maildir.
#[derive(Parser)]
#[command(name = "pr-maildir")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (default: first of config.toml, config.json in
    /// $XDG_CONFIG_HOME/pr-maildir)
    #[arg(global = true, short, long)]
    config: Option<PathBuf>,

    /// Mailbox root, overriding the configuration
    #[arg(global = true, short, long)]
    maildir: Option<PathBuf>,

    /// State database, overriding the configuration
    #[arg(global = true, long)]
    state_db: Option<PathBuf>,

    /// Bitbucket REST endpoint, overriding the configuration
    #[arg(global = true, long)]
    endpoint: Option<String>,

    /// API token, overriding the configured token sources
    #[arg(long, env = "PR_MAILDIR_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one reconciliation pass
    Sync,

    /// Remove stray staging files
    Sweep {
        /// Remove staging files older than this many hours
        #[arg(long, default_value_t = 36)]
        max_age_hours: u64,
    },

    /// Show the recorded watermark and mailbox state of a delivery key
    Status {
        /// Delivery key, e.g. PROJ.repo.pr.1
        key: String,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pr_maildir=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "pr-maildir failed");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), BoxError> {
    let config = Config::load(cli.config.as_deref())?;
    let overrides = Overrides {
        maildir: cli.maildir,
        state_db: cli.state_db,
        endpoint: cli.endpoint,
        token: cli.token,
    };

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => sync(config, overrides),
        Commands::Sweep { max_age_hours } => {
            let (root, _) = config.mailbox_paths(&overrides)?;
            let maildir = open_maildir(root)?;
            let max_age = Duration::from_secs(max_age_hours.saturating_mul(60 * 60));
            let removed = maildir.sweep_staging(max_age)?;
            println!("removed {removed} staging file(s)");
            Ok(())
        }
        Commands::Status { key } => {
            let key = DeliveryKey::parse(key)?;
            let (root, state_db) = config.mailbox_paths(&overrides)?;
            status(&key, &open_maildir(root)?, &StateIndex::open(state_db)?)
        }
    }
}

fn sync(config: Config, overrides: Overrides) -> Result<(), BoxError> {
    let settings = config.resolve(overrides)?;

    let maildir = open_maildir(settings.maildir.clone())?;
    let index = StateIndex::open(&settings.state_db)?;
    let client = BitbucketClient::new(&settings.endpoint, &settings.token)?;
    let formatter = MailFormatter::new(&settings.message_id_domain);

    if let Err(e) = maildir.sweep_staging(DEFAULT_STAGING_MAX_AGE) {
        warn!(error = %e, "Failed to sweep staging directory");
    }

    info!(maildir = %maildir.root().display(), endpoint = %settings.endpoint, "Starting sync");
    let report = Reconciler::new(&client, &maildir, &index, &formatter)
        .with_comment_threads(settings.comment_threads)
        .run()?;

    if report.failed > 0 {
        warn!(failed = report.failed, "Some items failed and will be retried next run");
    }
    Ok(())
}

fn status(key: &DeliveryKey, maildir: &Maildir, index: &StateIndex) -> Result<(), BoxError> {
    match index.record(key)? {
        Some(record) => println!(
            "index:   watermark {} (updated at {})",
            record.watermark, record.updated_at
        ),
        None => println!("index:   no record"),
    }

    let comments = index.records_with_prefix(&format!("{key}.comment."))?;
    if !comments.is_empty() {
        println!("index:   {} comment(s) recorded under this key", comments.len());
    }

    match maildir.lookup(key)? {
        Lookup::NotFound => println!("mailbox: not delivered"),
        Lookup::Found(path) => {
            let header = read_watermark(&path)?
                .map_or_else(|| "none".to_string(), |w| w.to_string());
            println!("mailbox: {} (X-Bitbucket-Version {header})", path.display());
        }
        Lookup::Ambiguous(count) => {
            println!("mailbox: {count} messages claim this key, remove all but one");
        }
    }
    Ok(())
}

fn open_maildir(root: PathBuf) -> Result<Maildir, BoxError> {
    let names = UniqueNameGenerator::new(maildir::host::detect());
    Ok(Maildir::open(root, names)?)
}
