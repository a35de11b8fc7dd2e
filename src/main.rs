use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use unique_meal::auth;
use unique_meal::config::Config;
use unique_meal::forms::RegistrationForm;
use unique_meal::logging;
use unique_meal::server::start_server;
use unique_meal::state::AppState;
use unique_meal::storage::{SqliteStorage, Storage};

#[derive(Parser)]
#[command(name = "unique_meal")]
#[command(about = "Unique Meal dining club web application")]
#[command(version)]
struct Cli {
    /// Path to a TOML configuration file (defaults to ./config.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database file, overriding the configuration
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the web server
    Serve {
        /// Address to bind
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,
    },
    /// Create the database schema and exit
    InitDb,
    /// Register a member from the command line
    CreateMember {
        #[arg(long)]
        username: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        /// standard, premium or elite
        #[arg(long, default_value = "standard")]
        tier: String,
    },
    /// Remove expired sessions and exit
    PurgeSessions,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(database) = cli.database {
        config.database.path = database;
    }

    let _log_guard = logging::init_logging(&config.logging);

    let storage = SqliteStorage::open(&config.database.path).with_context(|| {
        format!(
            "Failed to open database at {}",
            config.database.path.display()
        )
    })?;
    storage.init().await?;

    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }

            let state = AppState::new(Arc::new(storage), config);
            start_server(state).await?;
        }
        Commands::InitDb => {
            info!("Database ready at {}", config.database.path.display());
        }
        Commands::CreateMember {
            username,
            email,
            password,
            tier,
        } => {
            let form = RegistrationForm {
                username,
                email,
                confirm_password: password.clone(),
                password,
                membership_tier: tier,
                csrf_token: String::new(),
            };
            let registration = match form.validate() {
                Ok(registration) => registration,
                Err(errors) => {
                    let messages: Vec<String> = errors
                        .iter()
                        .map(|e| format!("{}: {}", e.field, e.message))
                        .collect();
                    bail!("Invalid member details: {}", messages.join("; "));
                }
            };

            let member = auth::register(&storage, registration).await?;
            info!(
                "Created member {} (id {}, {} tier)",
                member.username,
                member.id,
                member.membership_tier.label()
            );
        }
        Commands::PurgeSessions => {
            let purged = storage.purge_expired_sessions(Utc::now()).await?;
            info!("Purged {} expired sessions", purged);
        }
    }

    Ok(())
}
