use clap::{Parser, Subcommand};
use std::process::ExitCode;

use pbr_sync::init_app_state;
use pbr_sync::sync::{self, SyncEngine};
use pbr_sync::utils::{env::EnvVars, logging};

/// Keeps OpenWrt pbr nftables sets in sync with AdGuard Home answers.
#[derive(Parser, Debug)]
#[command(name = "pbr-sync")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the sync, discovery and restart timers until stopped (default)
    Run,
    /// One discovery and one sync cycle
    Once,
    /// Print the discovered pbr targets
    Discover,
    /// Warm every tracked domain through FlareSolverr, then sync
    Warm,
    /// Print targets with their element counts and check the resolver login
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let env_vars = match EnvVars::from_env() {
        Ok(env_vars) => env_vars,
        Err(e) => {
            let _ = logging::init(None);
            log::error!("Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = logging::init(env_vars.log_file.as_deref()) {
        eprintln!("Cannot open log file, logging to stderr only: {}", e);
        let _ = logging::init(None);
    }

    let state = match init_app_state(env_vars) {
        Ok(state) => state,
        Err(e) => {
            log::error!("Failed to initialize: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match args.command.unwrap_or(Command::Run) {
        Command::Run => {
            log::info!("Starting pbr-sync (resolver: {})", state.adguard.base_url());
            sync::run(state.engine).await;
            ExitCode::SUCCESS
        }
        Command::Once => once(&state.engine).await,
        Command::Discover => exit_code(discover(&state.engine).await),
        Command::Warm => {
            if !state.env_vars.warm_start_enabled {
                log::error!("Warm-start is disabled, set WARM_START_ENABLED=true");
                return ExitCode::FAILURE;
            }
            if state.engine.discover().await.is_err() {
                return ExitCode::FAILURE;
            }
            report_sync(state.engine.warm_and_harvest().await)
        }
        Command::Status => {
            // logs in when credentials are set, then proves the log is readable
            let healthy = match state.adguard.query_log(1).await {
                Ok(_) => {
                    println!("resolver {}: ok", state.adguard.base_url());
                    true
                }
                Err(e) => {
                    println!("resolver {}: {}", state.adguard.base_url(), e);
                    false
                }
            };
            let discovered = discover(&state.engine).await;
            exit_code(healthy && discovered)
        }
    }
}

async fn once(engine: &SyncEngine) -> ExitCode {
    if engine.discover().await.is_err() {
        return ExitCode::FAILURE;
    }
    report_sync(engine.sync_cycle().await)
}

fn report_sync(result: pbr_sync::Result<sync::SyncReport>) -> ExitCode {
    match result {
        Ok(report) => {
            println!("{}", report);
            exit_code(report.is_clean())
        }
        Err(e) => {
            log::error!("Sync failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Discover and print the targets. False when discovery failed.
async fn discover(engine: &SyncEngine) -> bool {
    if engine.discover().await.is_err() {
        return false;
    }

    let status = match engine.status().await {
        Ok(status) => status,
        Err(e) => {
            log::error!("Failed to list sets: {}", e);
            return false;
        }
    };

    if status.is_empty() {
        println!("no pbr domain targets");
    }
    for entry in status {
        let elements = entry
            .elements
            .map(|n| n.to_string())
            .unwrap_or_else(|| "missing".to_string());
        println!(
            "{}\t{} elements\tpolicies: {}",
            entry.target,
            elements,
            entry.target.policies.join(", ")
        );
        for pattern in &entry.target.patterns {
            let prefix = if pattern.include_subdomains { "*." } else { "" };
            println!("\t{}{}", prefix, pattern.domain);
        }
    }
    true
}
