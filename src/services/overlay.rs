//! Optimistic reconciliation for shower commands.
//!
//! A command sets an optimistic operation label at once, before the network
//! call. The label is dropped when the coordinator publishes the next
//! snapshot, whether or not that snapshot shows the expected state. A second
//! refresh a few seconds later picks up the vendor's delayed convergence.
//!
//! States per shower: `Idle` → `Optimistic` (command issued) → `Idle` (newer
//! snapshot seen, or the command failed).

use crate::client::KohlerClientError;
use crate::models::kohler::{DeviceId, DeviceState, Operation, OutletConfig};
use crate::services::coordinator::Coordinator;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Pause between the immediate refresh and the follow-up one.
pub const SETTLE_DELAY: Duration = Duration::from_secs(5);
/// Preset started by the `running` operation.
pub const DEFAULT_PRESET: &str = "1";
pub const MIN_TEMPERATURE_C: f64 = 15.0;
pub const MAX_TEMPERATURE_C: f64 = 45.0;

/// Control commands the overlay can issue. Blocking; run off the async runtime.
pub trait ShowerCommands: Send + Sync + 'static {
    fn start_warmup(&self, device_id: &DeviceId) -> Result<Value, KohlerClientError>;
    fn start_preset(&self, device_id: &DeviceId, preset_id: &str) -> Result<Value, KohlerClientError>;
    fn stop(&self, device_id: &DeviceId) -> Result<Value, KohlerClientError>;
    fn configure_outlet(&self, device_id: &DeviceId, config: &OutletConfig) -> Result<Value, KohlerClientError>;
}

#[derive(Debug)]
pub enum CommandError {
    /// The vendor rejected the command or it never arrived.
    Rejected {
        operation: String,
        source: KohlerClientError,
    },
    TemperatureOutOfRange(f64),
}

impl Display for CommandError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::Rejected { operation, source } => write!(f, "{} command failed: {}", operation, source),
            CommandError::TemperatureOutOfRange(t) => write!(
                f,
                "temperature {} outside {}..={} °C",
                t, MIN_TEMPERATURE_C, MAX_TEMPERATURE_C
            ),
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommandError::Rejected { source, .. } => Some(source),
            CommandError::TemperatureOutOfRange(_) => None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Reconciliation {
    Idle,
    /// Asserted while the coordinator was at `generation`.
    Optimistic { operation: Operation, generation: u64 },
}

/// Per-shower optimistic operation label.
pub struct OptimisticOverlay {
    state: Mutex<Reconciliation>,
    published: watch::Sender<Option<Operation>>,
}

impl Default for OptimisticOverlay {
    fn default() -> Self {
        OptimisticOverlay {
            state: Mutex::new(Reconciliation::Idle),
            published: watch::channel(None).0,
        }
    }
}

impl OptimisticOverlay {
    /// Assert `operation` until a snapshot newer than `generation` arrives.
    pub fn assume(&self, operation: Operation, generation: u64) {
        *self.state.lock() = Reconciliation::Optimistic { operation, generation };
        self.published.send_replace(Some(operation));
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        if *state != Reconciliation::Idle {
            *state = Reconciliation::Idle;
            self.published.send_replace(None);
        }
    }

    /// Called for every published snapshot. Clears on freshness alone.
    pub fn observe(&self, generation: u64) {
        let mut state = self.state.lock();
        if let Reconciliation::Optimistic { generation: since, .. } = *state
            && generation > since
        {
            *state = Reconciliation::Idle;
            self.published.send_replace(None);
        }
    }

    pub fn current(&self) -> Option<Operation> {
        match *self.state.lock() {
            Reconciliation::Idle => None,
            Reconciliation::Optimistic { operation, .. } => Some(operation),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Operation>> {
        self.published.subscribe()
    }
}

/// Controllable view of one shower: real state from the coordinator plus the
/// optimistic overlay.
pub struct ShowerControl<C: ShowerCommands> {
    device_id: DeviceId,
    coordinator: Coordinator,
    commands: Arc<C>,
    overlay: Arc<OptimisticOverlay>,
    cancel: CancellationToken,
}

impl<C: ShowerCommands> Clone for ShowerControl<C> {
    fn clone(&self) -> Self {
        ShowerControl {
            device_id: self.device_id.clone(),
            coordinator: self.coordinator.clone(),
            commands: Arc::clone(&self.commands),
            overlay: Arc::clone(&self.overlay),
            cancel: self.cancel.clone(),
        }
    }
}

impl<C: ShowerCommands> ShowerControl<C> {
    /// Must be called from within a tokio runtime: spawns the snapshot listener.
    pub fn new(device_id: DeviceId, coordinator: Coordinator, commands: Arc<C>, cancel: CancellationToken) -> Self {
        let overlay = Arc::new(OptimisticOverlay::default());
        tokio::spawn(follow_snapshots(
            coordinator.clone(),
            Arc::clone(&overlay),
            cancel.clone(),
        ));
        ShowerControl {
            device_id,
            coordinator,
            commands,
            overlay,
            cancel,
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Optimistic label changes, for observers that render the operation.
    pub fn subscribe_override(&self) -> watch::Receiver<Option<Operation>> {
        self.overlay.subscribe()
    }

    fn real_state(&self) -> Option<DeviceState> {
        self.coordinator.state().data.get(&self.device_id).cloned()
    }

    /// Optimistic label if one is pending, else the operation in the latest snapshot.
    pub fn current_operation(&self) -> Operation {
        let state = self.coordinator.state();
        self.overlay.observe(state.generation);
        self.overlay.current().unwrap_or_else(|| {
            state
                .data
                .get(&self.device_id)
                .map(DeviceState::operation)
                .unwrap_or(Operation::Off)
        })
    }

    /// Temperatures are never overridden.
    pub fn current_temperature(&self) -> Option<f64> {
        self.real_state()?.current_temperature()
    }

    pub fn target_temperature(&self) -> Option<f64> {
        self.real_state().map(|s| s.target_temperature())
    }

    /// Issue the command for `operation`, reconciling with two refreshes.
    pub async fn set_operation(&self, operation: Operation) -> Result<(), CommandError> {
        self.overlay.assume(operation, self.coordinator.state().generation);

        let commands = Arc::clone(&self.commands);
        let device_id = self.device_id.clone();
        let result = run_blocking(move || match operation {
            Operation::Warmup => commands.start_warmup(&device_id),
            Operation::Off => commands.stop(&device_id),
            Operation::Running => commands.start_preset(&device_id, DEFAULT_PRESET),
        })
        .await;

        if let Err(source) = result {
            self.overlay.clear();
            error!("Kohler {} command failed for {}: {}", operation, self.device_id, source);
            return Err(CommandError::Rejected {
                operation: operation.to_string(),
                source,
            });
        }
        info!("Kohler {} command accepted for {}", operation, self.device_id);

        self.refresh("immediate").await;
        tokio::select! {
            () = self.cancel.cancelled() => {
                debug!("Delayed refresh for {} abandoned", self.device_id);
                return Ok(());
            }
            () = tokio::time::sleep(SETTLE_DELAY) => {}
        }
        self.refresh("delayed").await;
        Ok(())
    }

    /// Write the outlet setpoint, then refresh once. No optimistic label.
    pub async fn set_temperature(&self, celsius: f64) -> Result<(), CommandError> {
        if !(MIN_TEMPERATURE_C..=MAX_TEMPERATURE_C).contains(&celsius) {
            return Err(CommandError::TemperatureOutOfRange(celsius));
        }
        let config = OutletConfig {
            temperature: celsius,
            ..OutletConfig::default()
        };
        let commands = Arc::clone(&self.commands);
        let device_id = self.device_id.clone();
        let result = run_blocking(move || commands.configure_outlet(&device_id, &config)).await;
        if let Err(source) = result {
            error!("Kohler temperature command failed for {}: {}", self.device_id, source);
            return Err(CommandError::Rejected {
                operation: "temperature".to_string(),
                source,
            });
        }
        self.refresh("immediate").await;
        Ok(())
    }

    async fn refresh(&self, which: &str) {
        if let Err(e) = self.coordinator.request_refresh().await {
            warn!("{} refresh after command for {} failed: {}", which, self.device_id, e);
        }
    }
}

async fn run_blocking<F>(call: F) -> Result<Value, KohlerClientError>
where
    F: FnOnce() -> Result<Value, KohlerClientError> + Send + 'static,
{
    match tokio::task::spawn_blocking(call).await {
        Ok(result) => result,
        Err(e) => Err(KohlerClientError::Transport(format!("command task failed: {}", e))),
    }
}

async fn follow_snapshots(coordinator: Coordinator, overlay: Arc<OptimisticOverlay>, cancel: CancellationToken) {
    let mut rx = coordinator.subscribe();
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let generation = rx.borrow_and_update().generation;
                overlay.observe(generation);
            }
        }
    }
}
