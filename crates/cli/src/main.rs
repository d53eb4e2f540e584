use std::io::Write as _;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use sekret_kubehub::KubeClient;
use sekret_persist::SqliteStore;
use sekret_session::{ConfirmationPrompter, NotificationSink, SecretSession};

#[derive(Parser, Debug)]
#[command(name = "sekretctl", version, about = "Edit cluster secrets with backup history and rolling restarts")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: last used)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Answer discard prompts with yes
    #[arg(long = "yes", global = true, action = ArgAction::SetTrue)]
    yes: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List kubeconfig contexts, marking the active one
    Contexts,
    /// Switch the active context (guarded against unsaved edits)
    UseContext { context: String },
    /// List namespaces in the active context
    Namespaces,
    /// List secrets in the selected namespace
    Secrets,
    /// Print the key/value pairs of a secret
    Show { name: String },
    /// Set one or more KEY=VALUE pairs and save
    Set {
        name: String,
        /// KEY=VALUE assignments
        #[arg(required = true)]
        pairs: Vec<String>,
    },
    /// Remove one or more keys and save
    Unset {
        name: String,
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Print the backup history of a secret
    Backups { name: String },
    /// Restore the backup taken at the given time and save it
    Restore { name: String, backup_time: String },
    /// Rolling-restart the deployments consuming a secret
    Restart { name: String },
}

fn init_tracing() {
    let env = std::env::var("SEKRET_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

/// Terminal y/N gate for discarding unsaved edits.
struct TermPrompter;

#[async_trait]
impl ConfirmationPrompter for TermPrompter {
    async fn should_changes_be_discarded(&self) -> bool {
        let answer = tokio::task::spawn_blocking(|| {
            print!("Discard unsaved changes? [y/N] ");
            let _ = std::io::stdout().flush();
            let mut line = String::new();
            if std::io::stdin().read_line(&mut line).is_err() {
                return false;
            }
            matches!(line.trim(), "y" | "Y" | "yes")
        })
        .await;
        answer.unwrap_or(false)
    }
}

/// Non-interactive gate for `--yes`.
struct AutoDiscard;

#[async_trait]
impl ConfirmationPrompter for AutoDiscard {
    async fn should_changes_be_discarded(&self) -> bool {
        true
    }
}

struct TracingSink;

impl NotificationSink for TracingSink {
    fn backup_success(&self) {
        info!("backup restored into the editor");
    }

    fn save_failed(&self) {
        warn!("secret save failed; local edits kept");
    }

    fn service_restart_success(&self) {
        info!("rolling restart requested");
    }

    fn service_restart_failed(&self) {
        warn!("rolling restart failed");
    }
}

/// Session against the real cluster, initialized from the preference store.
/// Namespace selection is only required by the secret-level commands.
async fn bare_session(yes: bool) -> Result<SecretSession> {
    let prompter: Arc<dyn ConfirmationPrompter> = if yes {
        Arc::new(AutoDiscard)
    } else {
        Arc::new(TermPrompter)
    };
    let mut session = SecretSession::new(
        Arc::new(KubeClient::new()),
        prompter,
        Arc::new(TracingSink),
        Arc::new(SqliteStore::open_default()?),
    );
    session.initialize().await?;
    Ok(session)
}

async fn open_session(cli: &Cli) -> Result<SecretSession> {
    let mut session = bare_session(cli.yes).await?;
    if let Some(ns) = &cli.namespace {
        session.select_namespace(ns).await?;
    }
    if session.namespace().is_empty() {
        bail!("no namespace selected; pass --ns");
    }
    Ok(session)
}

/// Select `name` and fail loudly when it cannot be loaded; mutating
/// commands must not run against an empty editor.
async fn open_secret(cli: &Cli, name: &str) -> Result<SecretSession> {
    let mut session = open_session(cli).await?;
    session.select_name(name).await?;
    if !session.secret_loaded() {
        bail!("secret {}/{} could not be loaded", session.namespace(), name);
    }
    Ok(session)
}

fn print_pairs(session: &SecretSession, output: Output) {
    match output {
        Output::Human => {
            for entry in session.secret().pairs() {
                println!("{}={}", entry.key, entry.value);
            }
        }
        Output::Json => {
            let mapping = session.secret().to_mapping();
            println!("{}", serde_json::to_string_pretty(&mapping).unwrap_or_default());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Contexts => {
            let session = bare_session(true).await?;
            match cli.output {
                Output::Human => {
                    for ctx in session.context_list() {
                        let marker = if ctx == session.context() { "*" } else { " " };
                        println!("{} {}", marker, ctx);
                    }
                }
                Output::Json => {
                    let doc = serde_json::json!({
                        "active": session.context(),
                        "contexts": session.context_list(),
                    });
                    println!("{}", serde_json::to_string_pretty(&doc)?);
                }
            }
        }
        Commands::UseContext { context } => {
            let mut session = bare_session(cli.yes).await?;
            if !session.context_list().iter().any(|c| c == context) {
                bail!("unknown context: {}", context);
            }
            session.select_context(context).await?;
            println!("switched to context {}", context);
        }
        Commands::Namespaces => {
            let session = bare_session(true).await?;
            match cli.output {
                Output::Human => {
                    for ns in session.namespace_list() {
                        println!("{}", ns);
                    }
                }
                Output::Json => {
                    println!("{}", serde_json::to_string_pretty(session.namespace_list())?);
                }
            }
        }
        Commands::Secrets => {
            let session = open_session(&cli).await?;
            match cli.output {
                Output::Human => {
                    for name in session.name_list() {
                        println!("{}", name);
                    }
                }
                Output::Json => {
                    println!("{}", serde_json::to_string_pretty(session.name_list())?);
                }
            }
        }
        Commands::Show { name } => {
            let session = open_secret(&cli, name).await?;
            print_pairs(&session, cli.output);
        }
        Commands::Set { name, pairs } => {
            let mut session = open_secret(&cli, name).await?;
            for assignment in pairs {
                let (key, value) = assignment
                    .split_once('=')
                    .ok_or_else(|| anyhow!("expected KEY=VALUE, got {}", assignment))?;
                if key.is_empty() {
                    bail!("empty key in {}", assignment);
                }
                let existing = session
                    .secret()
                    .pairs()
                    .iter()
                    .position(|e| e.key == key);
                match existing {
                    Some(idx) => session.secret_mut().set_value(idx, value),
                    None => {
                        let blank = session.secret().entries().len() - 1;
                        session.secret_mut().set_key(blank, key);
                        session.secret_mut().set_value(blank, value);
                    }
                }
            }
            if !session.is_dirty() {
                println!("no changes");
                return Ok(());
            }
            session.save_secret().await?;
            if session.is_dirty() {
                bail!("save did not go through; edits kept");
            }
            println!("saved {}/{}", session.namespace(), name);
        }
        Commands::Unset { name, keys } => {
            let mut session = open_secret(&cli, name).await?;
            for key in keys {
                let idx = session.secret().pairs().iter().position(|e| &e.key == key);
                match idx {
                    Some(idx) => session.secret_mut().remove(idx),
                    None => warn!(key = %key, "key not present; nothing to remove"),
                }
            }
            if !session.is_dirty() {
                println!("no changes");
                return Ok(());
            }
            session.save_secret().await?;
            if session.is_dirty() {
                bail!("save did not go through; edits kept");
            }
            println!("saved {}/{}", session.namespace(), name);
        }
        Commands::Backups { name } => {
            let session = open_secret(&cli, name).await?;
            match cli.output {
                Output::Human => {
                    if session.backups().is_empty() {
                        println!("no backups");
                    }
                    for backup in session.backups() {
                        let marker = if Some(backup.backup_time.as_str())
                            == session.selected_backup_time()
                        {
                            "*"
                        } else {
                            " "
                        };
                        println!("{} {}  ({} fields)", marker, backup.backup_time, backup.data.len());
                    }
                }
                Output::Json => {
                    println!("{}", serde_json::to_string_pretty(session.backups())?);
                }
            }
        }
        Commands::Restore { name, backup_time } => {
            let mut session = open_secret(&cli, name).await?;
            let backup = session
                .backups()
                .iter()
                .find(|b| &b.backup_time == backup_time)
                .cloned()
                .ok_or_else(|| anyhow!("no backup taken at {}", backup_time))?;
            session.load_selected_backup(&backup).await;
            if !session.is_dirty() {
                println!("backup matches the cluster value; nothing to save");
                return Ok(());
            }
            session.save_secret().await?;
            if session.is_dirty() {
                bail!("save did not go through; edits kept");
            }
            println!("restored {}/{} from {}", session.namespace(), name, backup_time);
        }
        Commands::Restart { name } => {
            let mut session = open_secret(&cli, name).await?;
            session.restart_service().await;
        }
    }
    Ok(())
}
