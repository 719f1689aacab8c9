use std::io;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use swap_accounts::{Account, AccountStore, Credentials, SwitchCoordinator};
use swap_core::ProxyConfig;
use swap_proxy::{
    default_data_dir, load_config_file, ProxyError, ProxyServerBuilder, ACCOUNTS_DB_FILE_NAME,
    CA_DIR_NAME,
};
use swap_tls::{CaConfig, CertificateAuthority};
use tracing_subscriber::prelude::*;

/// Credential-swapping HTTPS proxy for a single desktop client.
#[derive(Debug, Parser)]
#[command(name = "tokenswap", version, about, long_about = None)]
struct Cli {
    /// JSON configuration file; omitted fields keep their defaults
    #[arg(long, global = true, env = "TOKENSWAP_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding the root CA, the account database and settings
    #[arg(long, global = true, env = "TOKENSWAP_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log as JSON lines instead of human-readable text
    #[arg(long, global = true, env = "TOKENSWAP_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the proxy until interrupted
    Run(RunArgs),

    /// Manage stored accounts and the active selection
    #[command(subcommand)]
    Accounts(AccountsCommand),

    /// Print the root CA certificate (PEM) for installation in a trust store
    CaCert,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long, env = "TOKENSWAP_LISTEN_ADDR")]
    listen_addr: Option<String>,

    #[arg(long, env = "TOKENSWAP_LISTEN_PORT")]
    listen_port: Option<u16>,

    /// Do not refresh access tokens in the background
    #[arg(long)]
    no_token_refresh: bool,
}

#[derive(Debug, Subcommand)]
enum AccountsCommand {
    /// List stored accounts; the active one is marked with `*`
    List {
        #[arg(long)]
        json: bool,
    },
    /// Store an account, replacing one with the same id
    Add(AddArgs),
    /// Make an account the active selection
    Switch { id: String },
    /// Delete an account
    Remove { id: String },
    /// Print the active account id
    Current,
    /// Clear the active selection; requests keep their own credentials
    Clear,
}

#[derive(Debug, Args)]
struct AddArgs {
    /// User record JSON as handed out by the identity provider after sign-in
    #[arg(long, conflicts_with_all = ["id", "label", "token"])]
    file: Option<PathBuf>,

    #[arg(long, required_unless_present = "file")]
    id: Option<String>,

    #[arg(long)]
    label: Option<String>,

    /// Access token
    #[arg(long, required_unless_present = "file")]
    token: Option<String>,

    #[arg(long)]
    refresh_token: Option<String>,

    /// Switch to the account after storing it
    #[arg(long)]
    activate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitClass {
    Ok,
    ConfigInvalid,
    StartupFailed,
    RuntimeFailed,
    CommandFailed,
}

impl ExitClass {
    fn code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::ConfigInvalid => 20,
            Self::StartupFailed => 21,
            Self::RuntimeFailed => 22,
            Self::CommandFailed => 23,
        }
    }
}

#[derive(Debug)]
struct CliFailure {
    class: ExitClass,
    error: ProxyError,
}

impl CliFailure {
    fn new(class: ExitClass, error: impl Into<ProxyError>) -> Self {
        Self {
            class,
            error: error.into(),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let class = match run_cli(cli).await {
        Ok(()) => ExitClass::Ok,
        Err(failure) => {
            tracing::error!(error = %failure.error, "tokenswap failed");
            eprintln!("error: {}", failure.error);
            failure.class
        }
    };
    std::process::exit(class.code());
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_writer(io::stderr),
            )
            .init();
    }
}

async fn run_cli(cli: Cli) -> Result<(), CliFailure> {
    let config = match &cli.config {
        Some(path) => load_config_file(path)
            .map_err(|error| CliFailure::new(ExitClass::ConfigInvalid, error))?,
        None => ProxyConfig::default(),
    };
    let data_dir = cli.data_dir.or_else(default_data_dir).ok_or_else(|| {
        CliFailure::new(
            ExitClass::ConfigInvalid,
            ProxyError::InvalidConfig("no data directory; pass --data-dir".to_string()),
        )
    })?;

    match cli.command {
        Command::Run(args) => run_proxy(config, data_dir, args).await,
        Command::Accounts(command) => run_accounts(&config, &data_dir, command)
            .map_err(|error| CliFailure::new(ExitClass::CommandFailed, error)),
        Command::CaCert => {
            let ca_dir = data_dir.join(CA_DIR_NAME);
            let ca = CertificateAuthority::ensure_root(CaConfig::from_proxy_config(&config, &ca_dir))
                .map_err(|error| CliFailure::new(ExitClass::StartupFailed, error))?;
            print!("{}", ca.ca_certificate_pem());
            Ok(())
        }
    }
}

async fn run_proxy(
    mut config: ProxyConfig,
    data_dir: PathBuf,
    args: RunArgs,
) -> Result<(), CliFailure> {
    if let Some(addr) = args.listen_addr {
        config.listen_addr = addr;
    }
    if let Some(port) = args.listen_port {
        config.listen_port = port;
    }
    if args.no_token_refresh {
        config.token_refresh_enabled = false;
    }
    config
        .validate()
        .map_err(|error| CliFailure::new(ExitClass::ConfigInvalid, error))?;

    let server = ProxyServerBuilder::new(config)
        .with_data_dir(&data_dir)
        .build()
        .map_err(|error| CliFailure::new(ExitClass::StartupFailed, error))?;
    tracing::info!(
        data_dir = %data_dir.display(),
        active_account = server.coordinator().current().as_deref().unwrap_or("-"),
        "starting proxy"
    );

    server
        .run_until(async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %error, "cannot listen for ctrl-c; stopping");
            }
        })
        .await
        .map_err(|error| CliFailure::new(ExitClass::RuntimeFailed, error))
}

#[derive(Debug, Serialize)]
struct AccountRow<'a> {
    id: &'a str,
    label: &'a str,
    status: &'static str,
    active: bool,
    requests_served: u64,
    last_used_at_ms: Option<u64>,
    limit_info: &'a str,
}

fn open_store(config: &ProxyConfig, data_dir: &Path) -> Result<AccountStore, ProxyError> {
    let store = match &config.accounts_db_path {
        Some(path) => AccountStore::open(path)?,
        None => AccountStore::open(data_dir.join(ACCOUNTS_DB_FILE_NAME))?,
    };
    Ok(store)
}

fn run_accounts(
    config: &ProxyConfig,
    data_dir: &Path,
    command: AccountsCommand,
) -> Result<(), ProxyError> {
    let store = open_store(config, data_dir)?;
    let coordinator = SwitchCoordinator::restored(store.clone())?;

    match command {
        AccountsCommand::List { json } => {
            let active = coordinator.current();
            let accounts = store.list()?;
            let rows: Vec<AccountRow<'_>> = accounts
                .iter()
                .map(|account| AccountRow {
                    id: &account.id,
                    label: &account.label,
                    status: account.status.as_str(),
                    active: active.as_deref() == Some(account.id.as_str()),
                    requests_served: account.usage.requests_served,
                    last_used_at_ms: account.usage.last_used_at_ms,
                    limit_info: &account.limit_info,
                })
                .collect();
            if json {
                let rendered = serde_json::to_string_pretty(&rows)
                    .map_err(|error| ProxyError::InvalidConfig(error.to_string()))?;
                println!("{rendered}");
            } else {
                for row in rows {
                    println!(
                        "{} {}\t{}\t{}\trequests={}\t{}",
                        if row.active { "*" } else { " " },
                        row.id,
                        row.label,
                        row.status,
                        row.requests_served,
                        row.limit_info
                    );
                }
            }
        }
        AccountsCommand::Add(args) => {
            let account = match args.file {
                Some(path) => {
                    let raw = std::fs::read_to_string(&path)?;
                    Account::from_identity_record(&raw)?
                }
                None => {
                    let id = args.id.unwrap_or_default();
                    let label = args.label.unwrap_or_else(|| id.clone());
                    let mut credentials = Credentials::bearer(args.token.unwrap_or_default());
                    credentials.refresh_token = args.refresh_token;
                    Account::new(id, label, credentials)
                }
            };
            store.upsert(&account)?;
            println!("stored {}", account.id);
            if args.activate {
                coordinator.switch_to(&account.id)?;
                println!("active: {}", account.id);
            }
        }
        AccountsCommand::Switch { id } => {
            let snapshot = coordinator.switch_to(&id)?;
            println!("active: {}", snapshot.account_id);
        }
        AccountsCommand::Remove { id } => {
            coordinator.remove(&id)?;
            println!("removed {id}");
        }
        AccountsCommand::Current => match coordinator.current() {
            Some(id) => println!("{id}"),
            None => println!("no active account"),
        },
        AccountsCommand::Clear => {
            coordinator.clear()?;
            println!("selection cleared");
        }
    }
    Ok(())
}
