//! TabSync - Cross-Instance Session Coordination
//!
//! Command-line front end: runs an in-memory simulation of several
//! instances sharing one broadcast medium, and manages configuration files.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tabsync::config::{LoggingConfig, TabSyncConfig};
use tabsync::error::Result;
use tabsync::identity::{Identity, ScriptedIdentityProvider, SessionResult};
use tabsync::instance::Instance;
use tabsync::telemetry::TracingTelemetry;
use tabsync::transport::MemoryHub;

/// TabSync - Cross-Instance Session Coordination
#[derive(Parser)]
#[command(name = "tabsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "tabsync.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error), overrides the configured level
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate several instances: election, login, session hand-over, logout
    Simulate {
        /// Number of instances
        #[arg(short, long, default_value_t = 3)]
        tabs: usize,

        /// Account id the identity provider signs in
        #[arg(long, default_value = "u1")]
        account: String,

        /// Session id the identity provider signs in
        #[arg(long, default_value = "s1")]
        session: String,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "tabsync.toml")]
        output: PathBuf,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let logging = logging_config(&cli.config);
    init_logging(cli.log_level.as_deref().unwrap_or(&logging.level), &logging.format);

    match cli.command {
        Commands::Simulate { tabs, account, session } => {
            run_simulate(cli.config, tabs, account, session).await
        }
        Commands::Init { output } => {
            run_init(output)
        }
        Commands::Validate => {
            run_validate(cli.config)
        }
    }
}

/// Logging section of the configuration file. Load errors are reported
/// later by the command itself.
fn logging_config(config_path: &Path) -> LoggingConfig {
    TabSyncConfig::from_file(config_path)
        .map(|config| config.logging)
        .unwrap_or_default()
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "compact" {
        registry.with(tracing_subscriber::fmt::layer().compact()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Load the configuration file, or defaults if there is none
fn load_config(config_path: &Path) -> Result<TabSyncConfig> {
    if config_path.exists() {
        TabSyncConfig::from_file(config_path)
    } else {
        tracing::info!("No configuration at {:?}, using defaults", config_path);
        Ok(TabSyncConfig::default())
    }
}

fn provider_for(account: &str, session: &str) -> Result<Arc<ScriptedIdentityProvider>> {
    let identity: Identity = serde_json::from_value(json!({
        "scopes": ["user.read"],
        "idToken": format!("id-token-{}", session),
        "claims": { "sid": session },
        "displayName": account,
    }))?;
    let result = SessionResult {
        account_id: account.to_string(),
        session_id: session.to_string(),
        identity,
    };
    Ok(Arc::new(
        ScriptedIdentityProvider::new()
            .with_login_result(result, &format!("{}@example.com", account))
            .with_token(account, &format!("access-token-{}", account)),
    ))
}

async fn print_tabs(title: &str, tabs: &[Instance]) {
    println!("{}", title);
    for (n, tab) in tabs.iter().enumerate() {
        let session = tab.session().session().await;
        println!(
            "  tab {} [{}] leader={} account={} session={}",
            n + 1,
            tab.instance_id(),
            tab.is_leader().await,
            session.account_id.as_deref().unwrap_or("-"),
            session.session_id.as_deref().unwrap_or("-"),
        );
    }
}

/// Run the in-memory simulation
async fn run_simulate(config_path: PathBuf, count: usize, account: String, session: String) -> Result<()> {
    let config = load_config(&config_path)?;
    let hub = MemoryHub::new();
    let telemetry = Arc::new(TracingTelemetry);

    if count == 0 {
        return Err(tabsync::Error::Config("--tabs must be at least 1".into()));
    }

    tracing::info!("Simulating {} instances", count);
    let mut tabs = Vec::with_capacity(count);

    let first = Instance::start(&config, Arc::new(hub.clone()), provider_for(&account, &session)?, telemetry.clone()).await?;
    first.session().login().await;
    tabs.push(first);

    for _ in 1..count {
        let tab = Instance::start(&config, Arc::new(hub.clone()), provider_for(&account, &session)?, telemetry.clone()).await?;
        tabs.push(tab);
    }
    print_tabs("After startup:", &tabs).await;

    for (n, tab) in tabs.iter().enumerate() {
        println!(
            "  tab {} authenticated={} token={}",
            n + 1,
            tab.session().is_authenticated().await,
            tab.session().get_access_token().await.as_deref().unwrap_or("-"),
        );
    }

    tabs[0].session().logout().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    print_tabs("After logout in tab 1:", &tabs).await;

    let mut leader = None;
    for (n, tab) in tabs.iter().enumerate() {
        if tab.is_leader().await {
            leader = Some(n);
        }
    }
    if let Some(n) = leader {
        if count > 1 {
            let departed = tabs.remove(n);
            departed.shutdown().await;
            tokio::time::sleep(config.fallback_interval() + config.response_time() * 3).await;
            print_tabs(&format!("After closing leader tab {}:", n + 1), &tabs).await;
        }
    }

    for tab in &tabs {
        tab.shutdown().await;
    }
    Ok(())
}

/// Write a default configuration file
fn run_init(output: PathBuf) -> Result<()> {
    let config_content = format!(
        "# TabSync Configuration\n# Generated configuration file\n\n{}",
        TabSyncConfig::default().to_toml()?
    );

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> Result<()> {
    match TabSyncConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Main channel: {}", config.bus.main_channel_name);
            println!("  Leader election: {}", config.bus.enable_leader_election);
            println!("  Election wait: {:?}", config.election_wait());
            println!("  Response time: {:?}", config.response_time());
            println!("  Leader answer timeout: {:?}", config.leader_answer_timeout());
            println!("  API: {}", config.api.base_url);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_logging_section_is_read_from_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[logging]\nlevel = \"debug\"\nformat = \"compact\"\n").unwrap();

        let logging = logging_config(file.path());
        assert_eq!(logging.level, "debug");
        assert_eq!(logging.format, "compact");

        // Missing file falls back to defaults
        let logging = logging_config(Path::new("/nonexistent/tabsync.toml"));
        assert_eq!(logging.level, "info");
        assert_eq!(logging.format, "pretty");
    }
}
