use crate::trial::api::{AuthorityClient, ClientMeta, TrialAuthority};
use crate::trial::clock::{evaluate, Clock, SystemClock, TrialPhase, TrialReading};
use crate::trial::config::TrialConfig;
use crate::trial::fingerprint::{Fingerprint, FingerprintGenerator};
use crate::trial::storage::{LocalTrialStore, TrialStore};
use crate::trial::types::{
    ExpiryReason, RouteContext, TrialError, TrialEvent, TrialInfo, TrialRecord, TrialStatus,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 16;

/// Trial lifecycle state machine.
///
/// Cheap to clone; all clones drive the same lifecycle. Background ticks
/// only hold a weak reference, so dropping the last handle stops them.
#[derive(Clone)]
pub struct TrialController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    config: TrialConfig,
    fingerprint: Fingerprint,
    meta: ClientMeta,
    store: Arc<dyn TrialStore>,
    authority: Arc<dyn TrialAuthority>,
    clock: Arc<dyn Clock>,
    /// Serializes every tier read/write for this fingerprint
    state: tokio::sync::Mutex<Lifecycle>,
    /// Bumped on every teardown; results stamped with an older value are dropped
    generation: AtomicU64,
    disposed: AtomicBool,
    timers: Mutex<Vec<JoinHandle<()>>>,
    status_tx: watch::Sender<TrialStatus>,
    events_tx: broadcast::Sender<TrialEvent>,
}

#[derive(Default, Debug)]
struct Lifecycle {
    status: TrialStatus,
    record: Option<TrialRecord>,
    /// Generation the current status was resolved under
    settled: Option<u64>,
    /// Kept across re-initializations so the warning fires once per trial
    warning_notified: bool,
    /// Once set, no later result can bring the trial back
    expired: Option<ExpiryReason>,
}

impl TrialController {
    pub fn new(
        config: TrialConfig,
        fingerprint: Fingerprint,
        store: Arc<dyn TrialStore>,
        authority: Arc<dyn TrialAuthority>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (status_tx, _) = watch::channel(TrialStatus::Uninitialized);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let meta = ClientMeta::new(&config.user_agent);

        Self {
            inner: Arc::new(ControllerInner {
                config,
                fingerprint,
                meta,
                store,
                authority,
                clock,
                state: tokio::sync::Mutex::new(Lifecycle::default()),
                generation: AtomicU64::new(0),
                disposed: AtomicBool::new(false),
                timers: Mutex::new(Vec::new()),
                status_tx,
                events_tx,
            }),
        }
    }

    /// Wire up the production collaborators for this machine
    pub fn from_config(config: TrialConfig) -> Result<Self, TrialError> {
        let fingerprint = FingerprintGenerator::system().generate();
        let store = Arc::new(LocalTrialStore::from_config(&config));
        let authority = Arc::new(AuthorityClient::new(&config)?);
        Ok(Self::new(config, fingerprint, store, authority, Arc::new(SystemClock)))
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.inner.fingerprint
    }

    /// Last published status
    pub fn status(&self) -> TrialStatus {
        *self.inner.status_tx.borrow()
    }

    pub fn info(&self) -> TrialInfo {
        TrialInfo::new(self.status(), &self.inner.fingerprint)
    }

    /// Status updates, one per tick while the countdown runs
    pub fn subscribe(&self) -> watch::Receiver<TrialStatus> {
        self.inner.status_tx.subscribe()
    }

    /// One-shot warning and expiry notifications
    pub fn events(&self) -> broadcast::Receiver<TrialEvent> {
        self.inner.events_tx.subscribe()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Resolve the trial status for this fingerprint and start the ticks if
    /// the trial is still running.
    ///
    /// Precedence: tier-2 marker, then the tier-1 record, then the authority,
    /// and only then a freshly minted trial. A second call within the same
    /// lifecycle returns the already resolved status.
    pub async fn initialize(&self) -> TrialStatus {
        if self.is_disposed() {
            return self.status();
        }

        let mut state = self.inner.state.lock().await;
        let generation = self.generation();

        if state.settled == Some(generation) {
            debug!(fingerprint = %self.inner.fingerprint, "already initialized");
            return state.status;
        }

        let latched = state.expired;
        let status = match latched {
            Some(reason) => TrialStatus::Expired { reason },
            None => self.resolve(&mut state).await,
        };

        if self.generation() != generation {
            debug!(
                fingerprint = %self.inner.fingerprint,
                "torn down during initialize, dropping result"
            );
            return status;
        }

        state.status = status;
        state.settled = Some(generation);
        self.publish(status);

        match status {
            TrialStatus::Expired { reason } => {
                info!(fingerprint = %self.inner.fingerprint, %reason, "trial unavailable");
                self.notify(TrialEvent::Expired { reason });
            }
            _ => {
                info!(fingerprint = %self.inner.fingerprint, ?status, "trial running");
                self.start_timers(generation);
            }
        }

        status
    }

    async fn resolve(&self, state: &mut Lifecycle) -> TrialStatus {
        let inner = &self.inner;
        let fp = &inner.fingerprint;
        let now = inner.clock.now();

        if inner.store.read_tier2_blocked(fp, now) {
            return Self::latch(state, ExpiryReason::PreviousSession);
        }

        if let Some(record) = inner.store.read_tier1(fp) {
            let reading = self.read(&record, now);
            state.record = Some(record);
            if reading.phase == TrialPhase::Expired {
                inner.store.write_tier2_blocked(fp, now);
                return Self::latch(state, ExpiryReason::TimeExpired);
            }
            return Self::running(reading);
        }

        if inner.authority.check_blocked(fp).await.blocked {
            return Self::latch(state, ExpiryReason::ServerBlocked);
        }

        let record = TrialRecord::new(fp.clone(), now);
        inner.store.write_tier1(&record);
        state.record = Some(record);
        state.warning_notified = false;
        info!(fingerprint = %fp, "started new trial");

        let authority = Arc::clone(&inner.authority);
        let fp = fp.clone();
        let meta = inner.meta.clone();
        tokio::spawn(async move {
            authority.register_start(&fp, now, &meta).await;
        });

        TrialStatus::Active {
            remaining_ms: inner.config.trial_duration_ms,
        }
    }

    /// Foreground tick: re-derive the countdown from the stored start instant.
    pub async fn poll_status(&self) -> TrialStatus {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;

        let live = matches!(
            state.status,
            TrialStatus::Active { .. } | TrialStatus::Warning { .. }
        );
        if state.settled != Some(self.generation()) || !live {
            return state.status;
        }

        let fp = &inner.fingerprint;
        let now = inner.clock.now();

        let record = match inner.store.read_tier1(fp) {
            Some(record) => record,
            None => match state.record.clone() {
                Some(record) => {
                    debug!(fingerprint = %fp, "tier-1 record missing mid-session, restoring");
                    inner.store.write_tier1(&record);
                    record
                }
                None => return state.status,
            },
        };

        let reading = self.read(&record, now);
        state.record = Some(record);

        let status = match reading.phase {
            TrialPhase::Expired => {
                inner.store.write_tier2_blocked(fp, now);
                self.expire(&mut state, ExpiryReason::TimeExpired);
                return state.status;
            }
            TrialPhase::Warning => {
                if !state.warning_notified {
                    state.warning_notified = true;
                    info!(
                        fingerprint = %fp,
                        remaining_ms = reading.remaining_ms,
                        "trial entering warning"
                    );
                    self.notify(TrialEvent::WarningEntered {
                        remaining_ms: reading.remaining_ms,
                    });
                }
                Self::running(reading)
            }
            TrialPhase::Active => Self::running(reading),
        };

        state.status = status;
        self.publish(status);
        status
    }

    /// One authority reconciliation for the current lifecycle
    pub async fn reconcile(&self) -> TrialStatus {
        self.reconcile_for(self.generation()).await
    }

    async fn reconcile_for(&self, generation: u64) -> TrialStatus {
        if self.is_stale(generation) {
            return self.status();
        }

        let response = self.inner.authority.check_blocked(&self.inner.fingerprint).await;

        let mut state = self.inner.state.lock().await;
        if self.is_stale(generation) {
            debug!(fingerprint = %self.inner.fingerprint, "discarding stale reconciliation");
            return state.status;
        }
        if state.status.is_expired() || state.settled != Some(generation) {
            return state.status;
        }

        if response.blocked {
            warn!(fingerprint = %self.inner.fingerprint, "authority blocked running trial");
            self.expire(&mut state, ExpiryReason::ServerBlocked);
        }

        state.status
    }

    /// Navigation into or out of a gated surface. Always starts over from the
    /// tiers, since their contents may have changed out-of-band.
    pub async fn on_route_change(&self, route: RouteContext) -> TrialStatus {
        if self.is_disposed() {
            return self.status();
        }

        self.teardown();

        if !route.needs_trial() {
            let mut state = self.inner.state.lock().await;
            state.status = TrialStatus::NotStarted;
            state.settled = None;
            self.publish(TrialStatus::NotStarted);
            debug!(?route, "trial not required on this route");
            return TrialStatus::NotStarted;
        }

        self.initialize().await
    }

    /// Stop both ticks for good. Late results from in-flight calls are dropped.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.teardown();
        debug!(fingerprint = %self.inner.fingerprint, "trial controller disposed");
    }

    /// Forget the local trial for this fingerprint (debug builds only)
    #[cfg(debug_assertions)]
    pub async fn reset_local_state(&self) {
        self.teardown();
        let mut state = self.inner.state.lock().await;
        self.inner.store.clear_tier1();
        *state = Lifecycle::default();
        self.publish(TrialStatus::Uninitialized);
    }

    fn teardown(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.cancel_timers();
    }

    fn is_stale(&self, generation: u64) -> bool {
        self.is_disposed() || self.generation() != generation
    }

    fn read(&self, record: &TrialRecord, now: chrono::DateTime<chrono::Utc>) -> TrialReading {
        evaluate(
            record.start_time,
            now,
            self.inner.config.trial_duration_ms,
            self.inner.config.warning_threshold_ms,
        )
    }

    fn running(reading: TrialReading) -> TrialStatus {
        match reading.phase {
            TrialPhase::Warning => TrialStatus::Warning {
                remaining_ms: reading.remaining_ms,
            },
            _ => TrialStatus::Active {
                remaining_ms: reading.remaining_ms,
            },
        }
    }

    fn latch(state: &mut Lifecycle, reason: ExpiryReason) -> TrialStatus {
        state.expired = Some(reason);
        TrialStatus::Expired { reason }
    }

    /// Transition a running trial to expired and stop both ticks
    fn expire(&self, state: &mut Lifecycle, reason: ExpiryReason) {
        let status = Self::latch(state, reason);
        state.status = status;
        self.publish(status);
        self.notify(TrialEvent::Expired { reason });
        self.inner.cancel_timers();
        info!(fingerprint = %self.inner.fingerprint, %reason, "trial expired");
    }

    fn publish(&self, status: TrialStatus) {
        self.inner.status_tx.send_replace(status);
    }

    fn notify(&self, event: TrialEvent) {
        // No subscribers is fine
        let _ = self.inner.events_tx.send(event);
    }

    fn start_timers(&self, generation: u64) {
        let tick = Duration::from_millis(self.inner.config.tick_interval_ms.max(1));
        let reconcile = Duration::from_millis(self.inner.config.reconcile_interval_ms.max(1));

        let foreground = spawn_ticker(
            Arc::downgrade(&self.inner),
            tick,
            generation,
            |controller, generation| async move { controller.poll_status_for(generation).await },
        );
        let reconciliation = spawn_ticker(
            Arc::downgrade(&self.inner),
            reconcile,
            generation,
            |controller, generation| async move { controller.reconcile_for(generation).await },
        );

        match self.inner.timers.lock() {
            Ok(mut timers) => {
                timers.push(foreground);
                timers.push(reconciliation);
            }
            Err(e) => {
                warn!(error = %e, "timer registry poisoned, stopping ticks");
                foreground.abort();
                reconciliation.abort();
                return;
            }
        }

        // A teardown that raced the spawn above must still win
        if self.is_stale(generation) {
            self.inner.cancel_timers();
        }
    }

    async fn poll_status_for(&self, generation: u64) -> TrialStatus {
        if self.is_stale(generation) {
            return self.status();
        }
        self.poll_status().await
    }
}

impl ControllerInner {
    fn cancel_timers(&self) {
        match self.timers.lock() {
            Ok(mut timers) => {
                for handle in timers.drain(..) {
                    handle.abort();
                }
            }
            Err(e) => warn!(error = %e, "timer registry poisoned"),
        }
    }
}

impl Drop for ControllerInner {
    fn drop(&mut self) {
        if let Ok(timers) = self.timers.get_mut() {
            for handle in timers.drain(..) {
                handle.abort();
            }
        }
    }
}

/// Periodic task that stops once the controller is gone, the lifecycle it
/// was started for has been torn down, or the trial has expired.
fn spawn_ticker<F, Fut>(
    inner: Weak<ControllerInner>,
    period: Duration,
    generation: u64,
    step: F,
) -> JoinHandle<()>
where
    F: Fn(TrialController, u64) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = TrialStatus> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let controller = TrialController { inner };
            if controller.is_stale(generation) {
                break;
            }
            if step(controller, generation).await.is_expired() {
                break;
            }
        }
    })
}
