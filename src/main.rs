//! vpn-bypass - route selected applications around a VPN tunnel
//!
//! # Usage
//!
//! ```bash
//! vpn-bypass add firefox        # Select an app (user name or numeric UID) and apply its rules
//! vpn-bypass remove firefox     # Deselect an app and remove its rules
//! vpn-bypass list               # Show the selection with resolved UIDs
//! vpn-bypass apply              # Re-apply every rule from the selection (e.g. at boot)
//! vpn-bypass status             # Show UIDs currently marked / rejected in the kernel
//! vpn-bypass cleanup            # Remove every vpn-bypass chain
//! vpn-bypass config --write     # Create config.json with the effective settings
//! vpn-bypass history -n 5       # Last five audit log entries
//! vpn-bypass -vv apply          # Debug logging of every root shell command
//! ```

use clap::{Parser, Subcommand};
use std::process::ExitCode;
use std::sync::Arc;
use strum::IntoEnumIterator;
use tokio::sync::mpsc;
use tracing::Level;
use vpn_bypass::audit::{self, AuditLog};
use vpn_bypass::config::{self, AppConfig};
use vpn_bypass::core::error::{Error, Family, Severity};
use vpn_bypass::core::orchestrator::StatusReport;
use vpn_bypass::core::shell::ShellChannel;
use vpn_bypass::core::stack::CombinedRuleManager;
use vpn_bypass::selection::{self, SelectionStore, SystemUidResolver, UidResolver};
use vpn_bypass::{Orchestrator, OrchestratorEvent, utils};

shadow_rs::shadow!(build);

#[derive(Parser)]
#[command(name = "vpn-bypass")]
#[command(about = "Route selected applications around a VPN tunnel", long_about = None)]
#[command(version, long_version = build::CLAP_LONG_VERSION)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Write logs to vpn-bypass.log in the state directory instead of stderr
    #[arg(long, global = true)]
    log_file: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Re-apply all rules for the stored selection
    Apply,
    /// Add an app (user name or numeric UID) to the selection
    Add { app: String },
    /// Remove an app from the selection
    Remove { app: String },
    /// Show the selection and the UIDs it resolves to
    List,
    /// Show the UIDs currently marked and rejected in the kernel
    Status,
    /// Remove every vpn-bypass chain
    Cleanup,
    /// Show the effective configuration
    Config {
        /// Write it to config.json, filling in defaults for missing fields
        #[arg(long)]
        write: bool,
    },
    /// Show recent audit log entries
    History {
        /// Number of entries to show
        #[arg(short = 'n', long, default_value_t = 20)]
        count: usize,
    },
}

fn main() -> ExitCode {
    let _ = utils::ensure_dirs();
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_file);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: Failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(handle_cli(cli.command)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8, log_file: bool) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        _ => Level::DEBUG,
    };

    if log_file
        && let Some(mut log_path) = utils::get_state_dir()
    {
        log_path.push("vpn-bypass.log");
        match std::fs::File::create(&log_path) {
            Ok(file) => {
                tracing_subscriber::fmt()
                    .with_max_level(level)
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file))
                    .init();
                return;
            }
            Err(e) => eprintln!("Cannot open {}: {e}; logging to stderr", log_path.display()),
        }
    }

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

/// One root shell plus the orchestrator driving it
struct Session {
    shell: Arc<ShellChannel>,
    orchestrator: Orchestrator<ShellChannel>,
    events: mpsc::UnboundedReceiver<OrchestratorEvent>,
}

impl Session {
    fn open(config: &AppConfig) -> Self {
        let shell = Arc::new(ShellChannel::new().with_timeout(config.timeout_secs()));
        let rules = Arc::new(CombinedRuleManager::new(
            Arc::clone(&shell),
            config.binary(Family::V4),
            config.binary(Family::V6),
        ));
        let (orchestrator, events) = Orchestrator::new(rules);
        Self {
            shell,
            orchestrator,
            events,
        }
    }

    /// Waits for all queued work, printing and returning each failure
    async fn finish(&mut self) -> Vec<Error> {
        let failures = self.orchestrator.wait_idle(&mut self.events).await;
        for failure in &failures {
            print_failure(failure);
        }
        self.shell.shutdown().await;
        failures
    }
}

fn print_failure(error: &Error) {
    let marker = match error.severity() {
        Severity::Error => "✗",
        _ => "!",
    };
    match error.family() {
        Some(family) => eprintln!("{marker} {family}: {}", error.translate()),
        None => eprintln!("{marker} {}", error.translate()),
    }
    if let Some(result) = error.command_result() {
        let stderr = result.stderr.trim();
        if !stderr.is_empty() {
            eprintln!("    {stderr}");
        }
    }
}

fn print_report(report: &StatusReport) -> ExitCode {
    let marker = match report.severity {
        Severity::Success => "✓",
        Severity::Warning => "!",
        Severity::Error => "✗",
    };
    for line in &report.lines {
        println!("{marker} {line}");
    }
    if report.severity == Severity::Error {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn first_error(failures: &[Error]) -> Option<String> {
    failures.first().map(ToString::to_string)
}

async fn handle_cli(command: Commands) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let config = config::load_config().await;
    let resolver = SystemUidResolver;

    match command {
        Commands::Apply => {
            let store = SelectionStore::new()?;
            let resolved = selection::resolve_and_prune(&store, &resolver).await?;
            for app in &resolved.pruned {
                println!("Removed '{app}' from the selection (no matching UID)");
            }
            if resolved.apps.is_empty() {
                println!("No apps selected; nothing to apply.");
                return Ok(ExitCode::SUCCESS);
            }

            let uids = resolved.uids();
            let mut session = Session::open(&config);
            session.orchestrator.cleanup();
            session.orchestrator.clear_and_add_uids(uids.clone());
            session.orchestrator.enable();
            if config.masquerade {
                session.orchestrator.masquerade();
            }
            let failures = session.finish().await;

            let report = session.orchestrator.status().report(uids.len());
            if config.enable_audit_log {
                audit::log_apply(
                    &uids,
                    report.severity != Severity::Error,
                    first_error(&failures),
                )
                .await;
            }
            Ok(print_report(&report))
        }
        Commands::Add { app } => {
            let uid = resolver
                .resolve(&app)
                .ok_or_else(|| format!("'{app}' is neither a UID nor a known user"))?;
            let store = SelectionStore::new()?;
            store.insert(&app).await?;

            let mut session = Session::open(&config);
            session.orchestrator.add_uid(uid);
            session.orchestrator.enable();
            if config.masquerade {
                session.orchestrator.masquerade();
            }
            let failures = session.finish().await;

            let selected = store.get_all().await?.len();
            let report = session.orchestrator.status().report(selected);
            if config.enable_audit_log {
                audit::log_add_app(
                    &app,
                    uid,
                    report.severity != Severity::Error,
                    first_error(&failures),
                )
                .await;
            }
            Ok(print_report(&report))
        }
        Commands::Remove { app } => {
            let store = SelectionStore::new()?;
            if !store.delete(&app).await? {
                println!("'{app}' is not selected");
            }
            let uid = resolver.resolve(&app);
            let Some(uid) = uid else {
                println!("'{app}' has no UID; no rules to remove");
                return Ok(ExitCode::SUCCESS);
            };

            let mut session = Session::open(&config);
            session.orchestrator.remove_uid(uid);
            let failures = session.finish().await;

            if config.enable_audit_log {
                audit::log_remove_app(&app, Some(uid), failures.is_empty(), first_error(&failures))
                    .await;
            }
            if failures.is_empty() {
                println!("✓ Removed '{app}' (UID {uid})");
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
        Commands::List => {
            let store = SelectionStore::new()?;
            let apps = store.get_all().await?;
            if apps.is_empty() {
                println!("No apps selected.");
            }
            for app in apps {
                match resolver.resolve(&app) {
                    Some(uid) => println!("  {app:<24} UID {uid}"),
                    None => println!("  {app:<24} (unresolved)"),
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status => {
            let session = Session::open(&config);
            let rules = session.orchestrator.rules();
            for family in Family::iter() {
                let stack = rules.stack(family);
                let marked = stack.list_uids().await?;
                let rejected = stack.list_rejected_uids().await?;
                println!("{}:", stack.family());
                println!("  bypassing: {}", join_uids(&marked));
                println!("  rejected:  {}", join_uids(&rejected));
            }
            session.shell.shutdown().await;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Cleanup => {
            let mut session = Session::open(&config);
            session.orchestrator.cleanup();
            let failures = session.finish().await;

            if config.enable_audit_log {
                audit::log_cleanup(failures.is_empty(), first_error(&failures)).await;
            }
            if failures.is_empty() {
                println!("✓ All vpn-bypass chains removed");
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
        Commands::Config { write } => {
            let path = config::config_path().ok_or("Data directory not found")?;
            if write {
                config::save_config(&config).await?;
                println!("✓ Saved {}", path.display());
            } else {
                println!("# {}", path.display());
            }
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::History { count } => {
            let log = AuditLog::new()?;
            let events = match log.read_recent(count).await {
                Ok(events) => events,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
                Err(e) => return Err(e.into()),
            };
            if events.is_empty() {
                if !config.enable_audit_log {
                    println!("Audit logging is off; set enable_audit_log in config.json");
                }
                println!("No audit entries.");
            }
            for event in events {
                let marker = if event.success { "✓" } else { "✗" };
                println!(
                    "{} {marker} {:?} {}",
                    event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    event.event_type,
                    event.details
                );
                if let Some(error) = event.error {
                    println!("    {error}");
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn join_uids(uids: &[u32]) -> String {
    if uids.is_empty() {
        return "-".to_string();
    }
    uids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
