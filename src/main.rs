pub mod models {
    pub mod kohler;
}

pub mod client;
pub mod config;
pub mod session;
pub mod utils;
pub mod services {
    pub mod coordinator;
    pub mod overlay;
    pub mod setup;
    pub mod state;
}

use crate::client::KohlerClient;
use crate::config::Config;
use crate::models::kohler::{DeviceState, Operation};
use crate::services::coordinator::{Coordinator, POLL_INTERVAL, PollState, PollStatus};
use crate::services::overlay::ShowerControl;
use crate::services::setup;
use crate::session::SessionManager;
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(name = "kohler-sync", version, about = "Poll and control Kohler Anthem showers")]
struct Cli {
    /// Read environment variables from this file instead of ./.env
    #[arg(long, value_name = "PATH")]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Command {
    /// Log every device on each poll until Ctrl-C (default)
    Watch,
    /// Start warm-up on every shower
    Warmup,
    /// Stop every shower
    Stop,
    /// Start the default preset on every shower
    Run,
    /// Set the outlet temperature on every shower
    Temperature { celsius: f64 },
    /// Print the account's saved presets
    Presets,
}

impl Command {
    fn operation(self) -> Option<Operation> {
        match self {
            Command::Warmup => Some(Operation::Warmup),
            Command::Stop => Some(Operation::Off),
            Command::Run => Some(Operation::Running),
            _ => None,
        }
    }
}

type Shower = ShowerControl<KohlerClient>;

fn summary(state: &DeviceState, shower: &Shower) -> String {
    let temp = |t: Option<f64>| t.map(|v| format!("{:.1}°C", v)).unwrap_or_else(|| "-".to_string());
    format!(
        "{} [{}]: {} (warm-up {}, preset {}, water {}, target {}, {})",
        state.device.display_name(),
        state.device.device_id,
        shower.current_operation(),
        state.warmup_state(),
        state.active_preset().unwrap_or("-"),
        temp(shower.current_temperature()),
        temp(shower.target_temperature()),
        state.connection_state()
    )
}

fn log_summary(poll: &PollState, showers: &[Shower]) {
    match poll.status() {
        PollStatus::StaleError => warn!(
            "Poll failed, showing data from {}: {}",
            poll.last_success.format("%H:%M:%S"),
            poll.last_error.as_deref().map(ToString::to_string).unwrap_or_default()
        ),
        PollStatus::Fresh => info!("Poll {} at {}", poll.generation, poll.last_success.format("%H:%M:%S")),
    }
    for shower in showers {
        if let Some(state) = poll.data.get(shower.device_id()) {
            info!("  {}", summary(state, shower));
        }
    }
}

async fn watch(coordinator: &Coordinator, showers: &[Shower]) -> Result<(), String> {
    let mut updates = coordinator.subscribe();
    log_summary(&coordinator.state(), showers);
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.map_err(|e| format!("unable to listen for Ctrl-C: {}", e))?;
                info!("Interrupted, shutting down");
                return Ok(());
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    return Err("coordinator stopped unexpectedly".to_string());
                }
                let poll = updates.borrow_and_update().clone();
                log_summary(&poll, showers);
            }
        }
    }
}

async fn apply(command: Command, showers: &[Shower]) -> Result<(), String> {
    let mut failures = 0;
    for shower in showers {
        let result = match (command, command.operation()) {
            (_, Some(operation)) => shower.set_operation(operation).await,
            (Command::Temperature { celsius }, None) => shower.set_temperature(celsius).await,
            _ => Ok(()),
        };
        if let Err(e) = result {
            error!("{}: {}", shower.device_id(), e);
            failures += 1;
        }
    }
    if failures > 0 {
        return Err(format!("{} of {} shower(s) rejected the command", failures, showers.len()));
    }
    Ok(())
}

async fn run(command: Command) -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (user={}, client_cert={}, client_key={})",
        cfg.username,
        cfg.client_cert.display(),
        cfg.client_key.display()
    );

    // 2) Authenticate and validate the device directory
    let manager = SessionManager::new(cfg.certificates());
    let (username, password) = (cfg.username.clone(), cfg.password.clone());
    let client = tokio::task::spawn_blocking(move || setup::connect(&manager, &username, &password))
        .await
        .map_err(|e| format!("setup task failed: {}", e))?
        .map_err(|e| format!("setup failed ({}): {}", e.reason(), e))?;
    let client = Arc::new(client);
    info!("Authenticated to Kohler Konnect as tenant {}", client.session().tenant_id());

    if let Command::Presets = command {
        let api = Arc::clone(&client);
        let presets = tokio::task::spawn_blocking(move || api.list_presets())
            .await
            .map_err(|e| format!("presets task failed: {}", e))?
            .map_err(|e| format!("fetching presets failed: {}", e))?;
        let pretty = serde_json::to_string_pretty(&presets).map_err(|e| format!("presets are not printable: {}", e))?;
        println!("{}", pretty);
        return Ok(());
    }

    // 3) First poll, then the polling task
    let cancel = CancellationToken::new();
    let coordinator = Coordinator::start(Arc::clone(&client), POLL_INTERVAL, cancel.clone())
        .await
        .map_err(|e| format!("first poll failed (cannot_connect): {}", e))?;

    let snapshot = coordinator.state().data;
    if snapshot.is_empty() {
        warn!("No supported showers on this account; nothing to control");
    }
    let showers = snapshot
        .values()
        .map(|state| {
            info!(
                "Managing {} (serial {}, home {})",
                state.device.display_name(),
                state.device.serial_number.as_deref().unwrap_or("-"),
                state.device.home_name.as_deref().unwrap_or("-")
            );
            ShowerControl::new(
                state.device.device_id.clone(),
                coordinator.clone(),
                Arc::clone(&client),
                cancel.clone(),
            )
        })
        .collect::<Vec<_>>();

    // 4) Act
    let result = match command {
        Command::Watch => watch(&coordinator, &showers).await,
        other => {
            let result = apply(other, &showers).await;
            log_summary(&coordinator.state(), &showers);
            result
        }
    };

    cancel.cancel();
    result
}

fn main() {
    let cli = Cli::parse();
    let loaded_env = match config::load_env(cli.env_file.as_deref()) {
        Ok(info) => info,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!("Environment loaded from {} .env file: {}", origin, info.path.display());
    }

    info!(
        "kohler-sync {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!("fatal: unable to start runtime: {}", e);
            std::process::exit(1);
        }
    };
    let command = cli.command.unwrap_or(Command::Watch);
    if let Err(e) = runtime.block_on(run(command)) {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_is_the_default_command() {
        let cli = Cli::try_parse_from(["kohler-sync"]).unwrap();
        assert!(cli.command.is_none());
        assert!(cli.env_file.is_none());
    }

    #[test]
    fn parses_env_file_and_temperature() {
        let cli = Cli::try_parse_from(["kohler-sync", "--env-file", "prod.env", "temperature", "40.5"]).unwrap();
        assert_eq!(cli.env_file, Some(PathBuf::from("prod.env")));
        assert!(matches!(cli.command, Some(Command::Temperature { celsius }) if celsius == 40.5));
    }

    #[test]
    fn operation_commands_map_to_operations() {
        assert_eq!(Command::Warmup.operation(), Some(Operation::Warmup));
        assert_eq!(Command::Stop.operation(), Some(Operation::Off));
        assert_eq!(Command::Run.operation(), Some(Operation::Running));
        assert_eq!(Command::Presets.operation(), None);
        assert_eq!(Command::Temperature { celsius: 40.0 }.operation(), None);
    }
}
