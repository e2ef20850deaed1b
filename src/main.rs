//! gitswitch CLI - per-repository git identities
//!
//! Run `gitswitch --help` for usage information.

use clap::{Parser, Subcommand};
use gitswitch::activity::{ActivityFeed, ActivityObserver};
use gitswitch::config::{Config, LogFormat, SecretBackendType, DEFAULT_CONFIG};
use gitswitch::coordinator::{Coordinator, CoordinatorEvent};
use gitswitch::helper::{CredentialAction, CredentialInput, Endpoint, HelperInstaller, ProtocolError};
use gitswitch::ipc::{IpcClient, IpcError, IpcServer, WatchEvent};
use gitswitch::secrets::{EncryptedFileSecretStore, MemorySecretStore, SecretStore};
use gitswitch::storage::FileStorage;
use gitswitch::{MatchRule, Secret};
use secrecy::SecretString;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(
    name = "gitswitch",
    about = "Pick the right git identity for every repository",
    version
)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordinator
    Serve,

    /// git credential helper entry point (get, store, erase)
    #[command(name = "credential-helper")]
    CredentialHelper {
        /// Action requested by git
        action: String,
    },

    /// Manage accounts
    Account {
        #[command(subcommand)]
        command: AccountCommands,
    },

    /// Manage remote-to-account mappings
    Mapping {
        #[command(subcommand)]
        command: MappingCommands,
    },

    /// List remotes waiting for an account choice
    Pending {
        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Answer a pending request
    Choose {
        /// Remote waiting for a choice
        remote: String,

        /// Account name or ID
        account: String,

        /// Remember the choice for this remote
        #[arg(short, long)]
        remember: bool,
    },

    /// Fail every request waiting on a remote
    Cancel {
        /// Remote waiting for a choice
        remote: String,
    },

    /// Stream coordinator events and git activity
    Watch,

    /// Register gitswitch as git's credential helper
    Install,

    /// Show helper installation and coordinator state
    Status,

    /// Initialize configuration
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Stop a running coordinator
    Stop,
}

#[derive(Subcommand)]
enum AccountCommands {
    /// Add an account
    Add {
        /// Display name, sent to git as the username
        name: String,

        /// Access token (will prompt if not provided)
        #[arg(long)]
        token: Option<String>,
    },

    /// List accounts
    List {
        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Remove an account and its mappings
    Remove {
        /// Account name or ID
        account: String,
    },
}

#[derive(Subcommand)]
enum MappingCommands {
    /// Map a remote (or a family of remotes) to an account
    Add {
        /// Remote URL, or a pattern with --pattern
        rule: String,

        /// Account name or ID
        account: String,

        /// Treat the rule as a glob or prefix pattern
        #[arg(short, long)]
        pattern: bool,

        /// Replace an existing exact mapping to another account
        #[arg(short, long)]
        force: bool,
    },

    /// List mappings
    List {
        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Remove a mapping
    Remove {
        /// Mapping ID
        id: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("gitswitch: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> CliResult {
    let config = Config::load_or_default(cli.config.as_deref()).await?;
    let helper_mode = matches!(cli.command, Commands::CredentialHelper { .. });
    init_logging(&config, cli.verbose, helper_mode);

    let client = IpcClient::new(&config.coordinator.socket_path);

    match cli.command {
        Commands::Serve => serve(config).await?,
        Commands::CredentialHelper { action } => credential_helper(&config, client, &action).await?,
        Commands::Account { command } => match command {
            AccountCommands::Add { name, token } => add_account(client, name, token).await?,
            AccountCommands::List { format } => list_accounts(client, format).await?,
            AccountCommands::Remove { account } => {
                let (account, mappings) = client.remove_account(&account).await?;
                println!("Account '{}' removed ({} mappings)", account.name, mappings);
            }
        },
        Commands::Mapping { command } => match command {
            MappingCommands::Add {
                rule,
                account,
                pattern,
                force,
            } => {
                let rule = if pattern {
                    MatchRule::Pattern(rule)
                } else {
                    MatchRule::Exact(rule)
                };
                let mapping = client.add_mapping(rule, &account, force).await?;
                println!("Mapping {} added ({} -> {})", mapping.id, mapping.rule, account);
            }
            MappingCommands::List { format } => list_mappings(client, format).await?,
            MappingCommands::Remove { id } => {
                client.remove_mapping(&id).await?;
                println!("Mapping {} removed", id);
            }
        },
        Commands::Pending { format } => list_pending(client, format).await?,
        Commands::Choose {
            remote,
            account,
            remember,
        } => {
            let account = client.choose(&remote, &account, remember).await?;
            if remember {
                println!("Using '{}' for {} from now on", account.name, remote);
            } else {
                println!("Using '{}' for {}", account.name, remote);
            }
        }
        Commands::Cancel { remote } => {
            let released = client.cancel(&remote).await?;
            println!("Cancelled {} waiting request(s) for {}", released, remote);
        }
        Commands::Watch => watch(client).await?,
        Commands::Install => {
            let helper = HelperInstaller::default().install().await?;
            println!("credential.helper set to: {}", helper);
            println!("credential.useHttpPath set to: true");
        }
        Commands::Status => status(client).await?,
        Commands::Init { force } => init_config(force).await?,
        Commands::Stop => {
            client.shutdown().await?;
            println!("Coordinator stopping");
        }
    }

    Ok(())
}

/// Setup logging on stderr
///
/// The credential helper stays silent unless `GITSWITCH_LOG` asks otherwise,
/// so git only ever sees the protocol on stdout and one diagnostic line.
fn init_logging(config: &Config, verbose: u8, helper_mode: bool) {
    let filter = if helper_mode {
        EnvFilter::try_from_env("GITSWITCH_LOG").unwrap_or_else(|_| EnvFilter::new("off"))
    } else {
        let level = match verbose {
            0 => config.logging.level.as_str(),
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::try_from_env("GITSWITCH_LOG").unwrap_or_else(|_| EnvFilter::new(level))
    };

    let registry = tracing_subscriber::registry().with(filter);
    match config.logging.format {
        LogFormat::Json => registry.with(fmt::layer().json().with_writer(io::stderr)).init(),
        LogFormat::Pretty => registry.with(fmt::layer().with_writer(io::stderr)).init(),
    }
}

/// Get the secret store password from environment or prompt
fn get_storage_password() -> Result<SecretString, Box<dyn std::error::Error>> {
    // Check environment variable first
    if let Ok(password) = std::env::var("GITSWITCH_PASSWORD") {
        return Ok(SecretString::from(password));
    }

    // Prompt for password
    eprint!("Enter secret store password: ");
    io::stderr().flush()?;

    let password = rpassword::read_password()?;
    Ok(SecretString::from(password))
}

/// Initialize the secret store backend
async fn init_secrets(config: &Config) -> Result<Arc<dyn SecretStore>, Box<dyn std::error::Error>> {
    match config.secrets.backend {
        SecretBackendType::Memory => {
            warn!("Tokens are kept in memory and will be lost when the coordinator stops");
            Ok(Arc::new(MemorySecretStore::new()))
        }
        SecretBackendType::EncryptedFile => {
            let password = get_storage_password()?;
            let store = EncryptedFileSecretStore::open(&config.secrets.path, &password).await?;
            Ok(Arc::new(store))
        }
    }
}

/// Run the coordinator until stopped
async fn serve(config: Config) -> CliResult {
    let storage = Arc::new(FileStorage::new(&config.storage.path).await?);
    let secrets = init_secrets(&config).await?;
    let coordinator = Arc::new(Coordinator::load(storage, secrets, config.coordinator.settings()).await?);

    let activity = ActivityFeed::default();
    let observer = config
        .logging
        .audit_file
        .as_ref()
        .map(|path| ActivityObserver::start(&activity, path));

    let server = IpcServer::new(coordinator, activity, &config.coordinator.socket_path);
    let listener = server.bind()?;

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        let mut terminate = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                if tokio::signal::ctrl_c().await.is_ok() {
                    shutdown.notify_one();
                }
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
        info!("Shutdown signal received");
        shutdown.notify_one();
    });

    println!(
        "gitswitch coordinator listening on {}",
        config.coordinator.socket_path.display()
    );
    println!("Press Ctrl+C to stop");

    server.serve(listener).await?;

    if let Some(observer) = observer {
        observer.stop().await;
    }
    Ok(())
}

/// Answer one credential request from git
async fn credential_helper(config: &Config, client: IpcClient, action: &str) -> CliResult {
    let action: CredentialAction = match action.parse() {
        Ok(action) => action,
        // git expects helpers to ignore actions they do not know
        Err(ProtocolError::UnknownAction(_)) => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    let input = CredentialInput::parse(io::stdin().lock())?;
    let endpoint = Endpoint::new(client, config.helper.wait_timeout);

    let mut out = Vec::new();
    endpoint.run(action, &input, &mut out).await?;

    let mut stdout = io::stdout().lock();
    stdout.write_all(&out)?;
    stdout.flush()?;
    Ok(())
}

/// Add an account through the coordinator
async fn add_account(client: IpcClient, name: String, token: Option<String>) -> CliResult {
    let token = match token {
        Some(token) => token,
        None => {
            eprint!("Enter token for '{}': ", name);
            io::stderr().flush()?;
            rpassword::read_password()?
        }
    };
    if token.is_empty() {
        return Err("Token must not be empty".into());
    }

    let account = client.add_account(&name, Secret::new(token)).await?;
    println!("Account '{}' added", account.name);
    println!("ID: {}", account.id);
    Ok(())
}

/// List accounts
async fn list_accounts(client: IpcClient, format: String) -> CliResult {
    let accounts = client.list_accounts().await?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&accounts)?);
        return Ok(());
    }

    if accounts.is_empty() {
        println!("No accounts configured");
        return Ok(());
    }

    println!("{:<20} {:<36} {:<17} {}", "NAME", "ID", "CREATED", "LAST USED");
    println!("{}", "-".repeat(90));
    for account in accounts {
        let last_used = account
            .last_used_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "Never".to_string());
        println!(
            "{:<20} {:<36} {:<17} {}",
            account.name,
            account.id,
            account.created_at.format("%Y-%m-%d %H:%M"),
            last_used
        );
    }

    Ok(())
}

/// List mappings with account names
async fn list_mappings(client: IpcClient, format: String) -> CliResult {
    let mappings = client.list_mappings().await?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&mappings)?);
        return Ok(());
    }

    if mappings.is_empty() {
        println!("No mappings configured");
        return Ok(());
    }

    let accounts = client.list_accounts().await?;
    println!("{:<36} {:<40} {:<20} {}", "ID", "RULE", "ACCOUNT", "REMEMBERED");
    println!("{}", "-".repeat(110));
    for mapping in mappings {
        let account = accounts
            .iter()
            .find(|a| a.id == mapping.account_id)
            .map(|a| a.name.as_str())
            .unwrap_or(mapping.account_id.as_str());
        println!(
            "{:<36} {:<40} {:<20} {}",
            mapping.id,
            mapping.rule.to_string(),
            account,
            if mapping.remember { "yes" } else { "no" }
        );
    }

    Ok(())
}

/// List remotes waiting for a choice
async fn list_pending(client: IpcClient, format: String) -> CliResult {
    let entries = client.list_pending().await?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("Nothing is waiting for an account");
        return Ok(());
    }

    for entry in entries {
        println!(
            "{} ({} waiting since {})",
            entry.remote,
            entry.waiting,
            entry.earliest_arrival.format("%H:%M:%S")
        );
        for candidate in entry.candidates {
            let marker = if candidate.suggested { "*" } else { " " };
            println!("  {} {:<20} {}", marker, candidate.name, candidate.account_id);
        }
    }
    println!("\nAnswer with: gitswitch choose <remote> <account> [--remember]");

    Ok(())
}

/// Print events until the coordinator goes away
async fn watch(client: IpcClient) -> CliResult {
    let mut events = client.subscribe().await?;
    eprintln!("Watching {} (Ctrl+C to stop)", client.socket_path().display());

    while let Some(event) = events.next().await? {
        println!("{}", describe(&event));
    }
    Ok(())
}

fn describe(event: &WatchEvent) -> String {
    match event {
        WatchEvent::Activity(activity) => {
            format!("[{}] {}", activity.at.format("%H:%M:%S"), activity.describe())
        }
        WatchEvent::Coordinator(event) => match event {
            CoordinatorEvent::SelectionOpened { remote, .. } => {
                format!("waiting for an account for {} (gitswitch pending)", remote)
            }
            CoordinatorEvent::SelectionResolved {
                remote,
                account_id,
                remembered,
                released,
            } => format!(
                "{} resolved to {}{} for {} request(s)",
                remote,
                account_id,
                if *remembered { " (remembered)" } else { "" },
                released
            ),
            CoordinatorEvent::SelectionTimedOut { remote, released } => {
                format!("{} timed out, {} request(s) failed", remote, released)
            }
            CoordinatorEvent::SelectionCancelled { remote, released } => {
                format!("{} cancelled, {} request(s) failed", remote, released)
            }
            CoordinatorEvent::AccountAdded { name, .. } => format!("account '{}' added", name),
            CoordinatorEvent::AccountRemoved {
                account_id,
                mappings_removed,
            } => format!("account {} removed with {} mapping(s)", account_id, mappings_removed),
            CoordinatorEvent::MappingAdded { mapping } => format!("mapping {} added", mapping.rule),
            CoordinatorEvent::MappingRemoved { mapping_id } => format!("mapping {} removed", mapping_id),
        },
    }
}

/// Show helper installation and coordinator state
async fn status(client: IpcClient) -> CliResult {
    match HelperInstaller::default().status().await {
        Ok(status) => {
            println!("Helper installed:  {}", if status.installed { "yes" } else { "no" });
            println!("useHttpPath:       {}", if status.use_http_path { "yes" } else { "no" });
            for helper in &status.helpers {
                println!("  credential.helper = {}", helper);
            }
        }
        Err(e) => println!("Helper installed:  unknown ({})", e),
    }

    match client.ping().await {
        Ok((version, pending)) => {
            println!("Coordinator:       running (v{}, {} pending)", version, pending);
        }
        Err(IpcError::NotRunning(path)) => {
            println!("Coordinator:       not running ({})", path.display());
        }
        Err(IpcError::Remote(message)) => println!("Coordinator:       unhealthy ({})", message),
        Err(e) => println!("Coordinator:       unreachable ({})", e),
    }

    Ok(())
}

/// Initialize configuration
async fn init_config(force: bool) -> CliResult {
    let config_path = Config::default_path();

    if config_path.exists() && !force {
        return Err(format!(
            "Configuration already exists at {}. Use --force to overwrite.",
            config_path.display()
        )
        .into());
    }

    if let Some(parent) = config_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&config_path, DEFAULT_CONFIG).await?;

    println!("Configuration initialized at {}", config_path.display());
    println!("\nNext steps:");
    println!("1. Start the coordinator: gitswitch serve");
    println!("2. Add accounts: gitswitch account add <name>");
    println!("3. Register the helper with git: gitswitch install");

    Ok(())
}
