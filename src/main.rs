use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use custody_vault::audit::TracingAuditSink;
use custody_vault::crypto::kdf;
use custody_vault::crypto::sensitive::SensitiveBytes32;
use custody_vault::state::PostgresStore;
use custody_vault::{
    Caller, Custody, CustodyConfig, CustodyError, Grant, KeyId, NewMultisigWallet, NewWallet,
    Principal, Result, Role, Tier,
};

#[derive(Parser)]
#[command(name = "custody-vault")]
#[command(about = "Tiered custody of signing keys with audit trails and backups")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// JSON custody config; defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// Hex-encoded 32-byte master key; takes precedence over the passphrase
    #[arg(long, env = "CUSTODY_MASTER_KEY", hide_env_values = true, global = true)]
    master_key: Option<String>,

    /// Passphrase the master key is derived from
    #[arg(long, env = "CUSTODY_PASSPHRASE", hide_env_values = true, global = true)]
    passphrase: Option<String>,

    /// Hex-encoded Argon2 salt (see `salt`)
    #[arg(long, env = "CUSTODY_SALT", global = true)]
    salt: Option<String>,

    /// Principal recorded in audit entries
    #[arg(long, env = "CUSTODY_PRINCIPAL", default_value = "cli", global = true)]
    principal: String,

    /// Role held by the caller (repeatable)
    #[arg(long = "role", global = true)]
    roles: Vec<Role>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a fresh random salt for CUSTODY_SALT
    Salt,
    /// Apply database migrations
    Migrate,
    /// Create a single-signature wallet
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        tier: Tier,
        #[arg(long)]
        purpose: String,
        /// Principal granted on the key (repeatable); defaults to the caller
        #[arg(long = "grant")]
        grants: Vec<String>,
        /// Role granted on the key (repeatable)
        #[arg(long = "grant-role")]
        grant_roles: Vec<Role>,
    },
    /// Create a cold multi-signature wallet
    CreateMultisig {
        #[arg(long = "owner", required = true)]
        owners: Vec<String>,
        #[arg(long)]
        required: usize,
        #[arg(long)]
        purpose: String,
    },
    /// Decrypt and print a private key
    Reveal {
        key_id: String,
        #[arg(long)]
        purpose: String,
    },
    /// Back up a key
    Backup { key_id: String },
    /// Restore a key from a backup
    Restore { backup_id: Uuid },
    /// List key records
    List,
    /// Print the audit trail of a key
    Audit { key_id: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "custody_vault=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let global = cli.global;
    match cli.command {
        Commands::Salt => {
            println!("{}", hex::encode(kdf::generate_salt()));
            Ok(())
        }
        Commands::Migrate => {
            connect(&global).await?.migrate().await?;
            tracing::info!("Migrations applied");
            Ok(())
        }
        command => {
            let custody = open(&global).await?;
            let caller = global
                .roles
                .iter()
                .cloned()
                .fold(Caller::new(global.principal.as_str()), Caller::with_role);
            execute(&custody, &caller, command).await
        }
    }
}

async fn execute(custody: &Custody, caller: &Caller, command: Commands) -> Result<()> {
    match command {
        Commands::Create {
            name,
            tier,
            purpose,
            grants,
            grant_roles,
        } => {
            let mut permissions: custody_vault::model::PermissionSet = grants
                .into_iter()
                .map(|p| Grant::Principal(Principal::new(p)))
                .chain(grant_roles.into_iter().map(Grant::Role))
                .collect();
            if permissions.is_empty() {
                permissions.insert(Grant::Principal(caller.principal.clone()));
            }
            let request = NewWallet {
                name,
                tier,
                purpose,
                permissions,
            };
            let (_, record) = custody.create_wallet(request, caller).await?;
            print_json(&record)
        }
        Commands::CreateMultisig {
            owners,
            required,
            purpose,
        } => {
            let request = NewMultisigWallet {
                owners: owners.into_iter().map(Principal::new).collect(),
                required_signatures: required,
                purpose,
            };
            let (_, record) = custody.create_multisig_wallet(request, caller).await?;
            print_json(&record)
        }
        Commands::Reveal { key_id, purpose } => {
            let key = custody
                .get_private_key(&KeyId::new(key_id), caller, &purpose)
                .await?;
            println!("{}", key.expose_hex());
            Ok(())
        }
        Commands::Backup { key_id } => {
            let backup_id = custody.backup_wallet(&KeyId::new(key_id), caller).await?;
            println!("{backup_id}");
            Ok(())
        }
        Commands::Restore { backup_id } => {
            let (_, record) = custody.restore_wallet(backup_id, caller).await?;
            print_json(&record)
        }
        Commands::List => print_json(&custody.records()),
        Commands::Audit { key_id } => print_json(&custody.audit_trail(&KeyId::new(key_id))?),
        Commands::Salt | Commands::Migrate => Ok(()),
    }
}

async fn connect(global: &GlobalArgs) -> Result<PostgresStore> {
    let url = global
        .database_url
        .as_deref()
        .ok_or_else(|| CustodyError::InvalidInput("DATABASE_URL is not set".into()))?;
    PostgresStore::connect(url).await
}

async fn open(global: &GlobalArgs) -> Result<Custody> {
    let config = match &global.config {
        Some(path) => CustodyConfig::from_json_file(path)?,
        None => CustodyConfig::default(),
    };

    let master_key = resolve_master_key(global)?;

    let store = connect(global).await?;
    Custody::builder()
        .config(config)
        .master_key(master_key)
        .store(Arc::new(store))
        .audit_sink(Arc::new(TracingAuditSink))
        .open()
        .await
}

fn resolve_master_key(global: &GlobalArgs) -> Result<SensitiveBytes32> {
    if let Some(hex_key) = global.master_key.as_deref() {
        return SensitiveBytes32::from_hex(hex_key).ok_or_else(|| {
            CustodyError::InvalidInput("CUSTODY_MASTER_KEY must be 64 hex characters".into())
        });
    }

    let passphrase = global.passphrase.as_deref().ok_or_else(|| {
        CustodyError::InvalidInput("set CUSTODY_MASTER_KEY or CUSTODY_PASSPHRASE".into())
    })?;
    let salt = global
        .salt
        .as_deref()
        .ok_or_else(|| CustodyError::InvalidInput("CUSTODY_SALT is not set".into()))?;
    let salt = hex::decode(salt)
        .map_err(|e| CustodyError::InvalidInput(format!("CUSTODY_SALT is not hex: {e}")))?;
    kdf::derive_master_key(passphrase.as_bytes(), &salt)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
