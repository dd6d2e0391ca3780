use anyhow::{anyhow, Context, Result};
use clap::Parser;
use journaltogether_core::config::Config;
use journaltogether_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use journaltogether_core::metrics::init_metrics;
use journaltogether_core::{InMemoryBackend, JournalClient};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "journaltogether")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON formatted logging
    #[arg(long)]
    json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Parser, Debug)]
enum Command {
    /// Sign in with a magic code, create a group and print the resulting membership
    Demo {
        /// Email address to sign in with
        #[arg(long, default_value = "demo@journaltogether.local")]
        email: String,

        /// Name of the group to create
        #[arg(long, default_value = "Family")]
        group: String,

        /// Invite these addresses to the new group
        #[arg(long = "invite")]
        invites: Vec<String>,
    },
    /// Print the effective configuration as TOML
    Config,
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let config = match path {
        Some(path) => {
            let mut config = Config::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?;
            config.apply_env()?;
            config.validate()?;
            config
        }
        None => Config::from_env()?,
    };
    Ok(config)
}

async fn run_demo(config: &Config, email: &str, group: &str, invites: &[String]) -> Result<()> {
    let backend = InMemoryBackend::from_config(config)?;
    let client = JournalClient::with_backend(&backend, config);

    client.restore().await?;
    client.request_code(email).await?;
    let code = backend
        .server
        .last_code_for(email)
        .ok_or_else(|| anyhow!("no code was issued for {}", email))?;
    let identity = client.exchange_code(&code).await?;
    info!(user = %identity.id, "Signed in");

    let group_id = client.create_group(group).await?;

    let mut invitations = Vec::new();
    for invitee in invites {
        match client.invite_member(&group_id, invitee).await {
            Ok(invitation_id) => invitations.push(invitation_id.to_string()),
            Err(e) => warn!(email = %invitee, error = %e, "Invitation failed"),
        }
    }

    let mut watch = client.subscribe_snapshot();
    let wait = watch.wait_for(|snapshot| snapshot.groups.contains_key(&group_id));
    let snapshot = tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .context("group never appeared in the membership snapshot")??;

    let groups: Vec<_> = snapshot.groups.values().collect();
    let report = json!({
        "user": identity.id.to_string(),
        "email": identity.email,
        "groups": groups,
        "invitations": invitations,
        "pending": snapshot.pending().count(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    client.sign_out().await;
    client.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;

    let mut log_config = LogConfig::from_settings(&config.logging)?;
    if let Some(level) = &args.log_level {
        let fallback = log_config.level;
        log_config.level = level.parse::<LogLevel>().unwrap_or_else(|_| {
            eprintln!("Invalid log level '{}', using '{}'", level, fallback);
            fallback
        });
    }
    if args.json_logs {
        log_config = log_config.json_format(true);
    }
    init_logging_with_config(log_config)?;
    init_metrics();

    info!("journaltogether CLI started");

    match args.command {
        Some(Command::Demo {
            email,
            group,
            invites,
        }) => run_demo(&config, &email, &group, &invites).await?,
        Some(Command::Config) => print!("{}", config.to_toml()?),
        None => {
            info!("No command specified. Use --help for usage information.");
        }
    }

    info!("journaltogether CLI finished");

    Ok(())
}
