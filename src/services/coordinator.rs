//! Polling coordinator: one task owns every fetch for an account.
//!
//! Polls run on a fixed interval and on demand. Both paths go through the same
//! task, so at most one fetch is in flight; on-demand requests that arrive in
//! the meantime are queued and answered together by the next poll. Each poll
//! result is published on a `watch` channel as a [`PollState`].

use crate::client::KohlerClientError;
use crate::models::kohler::DeviceStateSnapshot;
use crate::services::state::{DeviceApi, fetch_all_state};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub const POLL_INTERVAL: Duration = Duration::from_secs(10);
const REQUEST_QUEUE_CAPACITY: usize = 16;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PollStatus {
    /// Last poll succeeded; `data` is current.
    Fresh,
    /// Last poll failed; `data` is the previous snapshot.
    StaleError,
}

/// What collaborators see after every poll.
#[derive(Debug, Clone)]
pub struct PollState {
    pub data: Arc<DeviceStateSnapshot>,
    pub last_error: Option<Arc<KohlerClientError>>,
    /// Incremented on every successful poll; failed polls leave it alone.
    pub generation: u64,
    pub last_success: DateTime<Utc>,
}

impl PollState {
    pub fn status(&self) -> PollStatus {
        if self.last_error.is_some() {
            PollStatus::StaleError
        } else {
            PollStatus::Fresh
        }
    }
}

#[derive(Debug, Clone)]
pub enum RefreshError {
    Poll(Arc<KohlerClientError>),
    /// The coordinator was cancelled or dropped.
    Stopped,
}

impl Display for RefreshError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RefreshError::Poll(e) => write!(f, "poll failed: {}", e),
            RefreshError::Stopped => write!(f, "coordinator stopped"),
        }
    }
}

impl std::error::Error for RefreshError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RefreshError::Poll(e) => Some(e.as_ref()),
            RefreshError::Stopped => None,
        }
    }
}

type RefreshReply = oneshot::Sender<Result<u64, RefreshError>>;

/// Cheap, cloneable handle to the polling task.
#[derive(Clone)]
pub struct Coordinator {
    state: watch::Receiver<PollState>,
    requests: mpsc::Sender<RefreshReply>,
}

impl Coordinator {
    /// Run the first poll, then spawn the polling task.
    ///
    /// The first poll must succeed: its error is returned so setup can abort.
    pub async fn start<A>(api: Arc<A>, interval: Duration, cancel: CancellationToken) -> Result<Self, KohlerClientError>
    where
        A: DeviceApi + Send + Sync + 'static,
    {
        let data = fetch_blocking(&api).await?;
        info!("Coordinator ready with {} device(s), polling every {}s", data.len(), interval.as_secs());

        let (state_tx, state_rx) = watch::channel(PollState {
            data: Arc::new(data),
            last_error: None,
            generation: 1,
            last_success: Utc::now(),
        });
        let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        tokio::spawn(run_loop(api, interval, state_tx, request_rx, cancel));

        Ok(Coordinator {
            state: state_rx,
            requests: request_tx,
        })
    }

    /// Latest published state.
    pub fn state(&self) -> PollState {
        self.state.borrow().clone()
    }

    /// Receiver that wakes on every poll published from now on.
    pub fn subscribe(&self) -> watch::Receiver<PollState> {
        let mut rx = self.state.clone();
        rx.borrow_and_update();
        rx
    }

    /// Ask for a poll and wait for its outcome. Returns the snapshot generation.
    pub async fn request_refresh(&self) -> Result<u64, RefreshError> {
        let (reply, outcome) = oneshot::channel();
        self.requests.send(reply).await.map_err(|_| RefreshError::Stopped)?;
        outcome.await.map_err(|_| RefreshError::Stopped)?
    }
}

async fn fetch_blocking<A>(api: &Arc<A>) -> Result<DeviceStateSnapshot, KohlerClientError>
where
    A: DeviceApi + Send + Sync + 'static,
{
    let api = Arc::clone(api);
    match tokio::task::spawn_blocking(move || fetch_all_state(api.as_ref())).await {
        Ok(result) => result,
        Err(e) => Err(KohlerClientError::Transport(format!("poll task failed: {}", e))),
    }
}

async fn run_loop<A>(
    api: Arc<A>,
    interval: Duration,
    state: watch::Sender<PollState>,
    mut requests: mpsc::Receiver<RefreshReply>,
    cancel: CancellationToken,
) where
    A: DeviceApi + Send + Sync + 'static,
{
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let mut waiters = Vec::new();
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => debug!("Scheduled poll"),
            request = requests.recv() => match request {
                Some(reply) => waiters.push(reply),
                None => break,
            },
        }
        // everything queued so far is answered by this poll
        while let Ok(reply) = requests.try_recv() {
            waiters.push(reply);
        }

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = fetch_blocking(&api) => publish(&state, result),
        };
        ticker.reset();
        for reply in waiters {
            let _ = reply.send(outcome.clone());
        }
    }
    debug!("Coordinator stopped");
}

fn publish(state: &watch::Sender<PollState>, result: Result<DeviceStateSnapshot, KohlerClientError>) -> Result<u64, RefreshError> {
    match result {
        Ok(data) => {
            let devices = data.len();
            let recovered = state.borrow().last_error.is_some();
            let mut generation = 0;
            state.send_modify(|s| {
                s.data = Arc::new(data);
                s.last_error = None;
                s.generation += 1;
                s.last_success = Utc::now();
                generation = s.generation;
            });
            if recovered {
                info!("Polling recovered");
            }
            debug!("Poll {} delivered {} device(s)", generation, devices);
            Ok(generation)
        }
        Err(e) => {
            warn!("Error communicating with Kohler API: {}", e);
            let e = Arc::new(e);
            state.send_modify(|s| s.last_error = Some(Arc::clone(&e)));
            Err(RefreshError::Poll(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::state::fake::FakeApi;
    use std::sync::atomic::Ordering;

    async fn started(api: &Arc<FakeApi>) -> (Coordinator, CancellationToken) {
        let cancel = CancellationToken::new();
        let coordinator = Coordinator::start(Arc::clone(api), POLL_INTERVAL, cancel.clone())
            .await
            .expect("first poll succeeds");
        (coordinator, cancel)
    }

    #[tokio::test(start_paused = true)]
    async fn first_poll_failure_aborts_start() {
        let api = Arc::new(FakeApi::with_devices(1, 0));
        api.fail_state.store(true, Ordering::SeqCst);
        let result = Coordinator::start(api, POLL_INTERVAL, CancellationToken::new()).await;
        assert!(matches!(result, Err(KohlerClientError::Http { status: 500, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_poll_keeps_previous_snapshot() {
        let api = Arc::new(FakeApi::with_devices(2, 1));
        let (coordinator, _cancel) = started(&api).await;
        let before = coordinator.state();
        assert_eq!(before.status(), PollStatus::Fresh);
        assert_eq!(before.data.len(), 2);

        api.fail_state.store(true, Ordering::SeqCst);
        let err = coordinator.request_refresh().await.unwrap_err();
        assert!(matches!(err, RefreshError::Poll(_)));

        let after = coordinator.state();
        assert_eq!(after.status(), PollStatus::StaleError);
        assert!(Arc::ptr_eq(&before.data, &after.data));
        assert_eq!(after.generation, before.generation);
        assert!(after.last_error.unwrap().to_string().contains("500"));
    }

    #[tokio::test(start_paused = true)]
    async fn next_tick_heals_a_failed_poll() {
        let api = Arc::new(FakeApi::with_devices(1, 0));
        let (coordinator, _cancel) = started(&api).await;
        api.fail_state.store(true, Ordering::SeqCst);
        assert!(coordinator.request_refresh().await.is_err());

        api.fail_state.store(false, Ordering::SeqCst);
        let mut rx = coordinator.subscribe();
        let healed = rx.wait_for(|s| s.generation == 2).await.unwrap().clone();
        assert_eq!(healed.status(), PollStatus::Fresh);
        assert_eq!(api.fetch_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_drives_polls() {
        let api = Arc::new(FakeApi::with_devices(1, 0));
        let (coordinator, _cancel) = started(&api).await;
        let mut rx = coordinator.subscribe();
        rx.wait_for(|s| s.generation == 3).await.unwrap();
        assert_eq!(api.fetch_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_refreshes_never_overlap() {
        let api = Arc::new(FakeApi::with_devices(1, 0));
        *api.latency.lock() = Some(Duration::from_millis(20));
        let (coordinator, _cancel) = started(&api).await;

        let (a, b, c, d) = tokio::join!(
            coordinator.request_refresh(),
            coordinator.request_refresh(),
            coordinator.request_refresh(),
            coordinator.request_refresh(),
        );
        for outcome in [a, b, c, d] {
            assert!(outcome.unwrap() >= 2);
        }
        assert_eq!(api.max_in_flight.load(Ordering::SeqCst), 1);
        assert!(api.fetch_count() <= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_coordinator_reports_stopped() {
        let api = Arc::new(FakeApi::with_devices(1, 0));
        let (coordinator, cancel) = started(&api).await;
        cancel.cancel();
        assert!(matches!(coordinator.request_refresh().await, Err(RefreshError::Stopped)));
        assert_eq!(api.fetch_count(), 1);
    }
}
