//! Scan lifecycle and the event pump
//!
//! ```text
//! Idle -> Starting -> Scanning -> Stopping -> Idle
//!            \            \
//!             +------------+--> Failed(reason)
//! ```
//!
//! `Failed` is absorbing; build a new orchestrator to scan again. A missing scan
//! permission is not a failure: the lifecycle returns to `Idle`. Radio events
//! are handled one at a time by a single pump task, so updates for one address
//! reach the registry in delivery order. Persistence runs on spawned tasks and
//! is aborted when the session stops.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::bluetooth::{RadioEvent, RadioSource, ScanSettings};
use crate::dedup::SessionDeduplicator;
use crate::distance::DistanceModel;
use crate::error::{RadioError, ScanError};
use crate::location::{LocationRequest, LocationSource, LocationTracker, NoLocation};
use crate::logging::log_scan_error;
use crate::registry::SightingRegistry;
use crate::sighting::{display_name, AuthorizationState, MonotonicClock, RawEvent, SessionId, Sighting};
use crate::store::SightingSink;

/// Lifecycle state of the orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Starting,
    Scanning,
    Stopping,
    Failed(String),
}

/// What happened to one raw event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// First sighting of the address this session; queued for the store
    Logged,
    /// Registry updated only
    Deduplicated,
}

struct Pump {
    cancel: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

struct Inner {
    radio: Arc<dyn RadioSource>,
    location: Arc<dyn LocationSource>,
    sink: Arc<dyn SightingSink>,
    registry: Arc<SightingRegistry>,
    dedup: SessionDeduplicator,
    tracker: Arc<LocationTracker>,
    model: DistanceModel,
    scan_settings: ScanSettings,
    location_request: LocationRequest,
    clock: MonotonicClock,
    state: Mutex<ScanState>,
    session: Mutex<Option<SessionId>>,
    authorization: Mutex<AuthorizationState>,
    pending: Mutex<Vec<JoinHandle<()>>>,
    pump: Mutex<Option<Pump>>,
    /// Bumped by every `start` and `stop`; a start attempt owns the lifecycle
    /// only while the counter still holds the value it took
    generation: AtomicU64,
    name_warning_logged: AtomicBool,
    location_warning_logged: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Builder for [`ScanOrchestrator`]
pub struct ScanOrchestratorBuilder {
    radio: Arc<dyn RadioSource>,
    sink: Arc<dyn SightingSink>,
    registry: Arc<SightingRegistry>,
    location: Arc<dyn LocationSource>,
    model: DistanceModel,
    scan_settings: ScanSettings,
    location_request: LocationRequest,
}

impl ScanOrchestratorBuilder {
    pub fn location(mut self, location: Arc<dyn LocationSource>) -> Self {
        self.location = location;
        self
    }

    pub fn distance_model(mut self, model: DistanceModel) -> Self {
        self.model = model;
        self
    }

    pub fn scan_settings(mut self, settings: ScanSettings) -> Self {
        self.scan_settings = settings;
        self
    }

    pub fn location_request(mut self, request: LocationRequest) -> Self {
        self.location_request = request;
        self
    }

    pub fn build(self) -> ScanOrchestrator {
        let tracker = Arc::new(LocationTracker::new(self.location_request.max_fix_age));
        ScanOrchestrator {
            inner: Arc::new(Inner {
                radio: self.radio,
                location: self.location,
                sink: self.sink,
                registry: self.registry,
                dedup: SessionDeduplicator::new(),
                tracker,
                model: self.model,
                scan_settings: self.scan_settings,
                location_request: self.location_request,
                clock: MonotonicClock::new(),
                state: Mutex::new(ScanState::Idle),
                session: Mutex::new(None),
                authorization: Mutex::new(AuthorizationState::default()),
                pending: Mutex::new(Vec::new()),
                pump: Mutex::new(None),
                generation: AtomicU64::new(0),
                name_warning_logged: AtomicBool::new(false),
                location_warning_logged: AtomicBool::new(false),
            }),
        }
    }
}

/// Owns one scan lifecycle at a time
#[derive(Clone)]
pub struct ScanOrchestrator {
    inner: Arc<Inner>,
}

impl ScanOrchestrator {
    /// Start building an orchestrator; location defaults to [`NoLocation`]
    pub fn builder(
        radio: Arc<dyn RadioSource>,
        sink: Arc<dyn SightingSink>,
        registry: Arc<SightingRegistry>,
    ) -> ScanOrchestratorBuilder {
        ScanOrchestratorBuilder {
            radio,
            sink,
            registry,
            location: Arc::new(NoLocation),
            model: DistanceModel::default(),
            scan_settings: ScanSettings::default(),
            location_request: LocationRequest::default(),
        }
    }

    pub fn state(&self) -> ScanState {
        lock(&self.inner.state).clone()
    }

    /// Current session, if scanning
    pub fn session_id(&self) -> Option<SessionId> {
        lock(&self.inner.session).clone()
    }

    pub fn registry(&self) -> &Arc<SightingRegistry> {
        &self.inner.registry
    }

    pub fn authorization(&self) -> AuthorizationState {
        *lock(&self.inner.authorization)
    }

    /// Begin a new session
    ///
    /// A missing scan permission leaves the orchestrator `Idle`, so `start` can
    /// be retried once it is granted.
    pub async fn start(&self, authorization: AuthorizationState) -> Result<SessionId, ScanError> {
        let inner = &self.inner;
        let generation = {
            let mut state = lock(&inner.state);
            if *state != ScanState::Idle {
                return Err(ScanError::InvalidTransition {
                    state: state.clone(),
                    action: "start",
                });
            }
            *state = ScanState::Starting;
            inner.generation.fetch_add(1, Ordering::SeqCst) + 1
        };

        *lock(&inner.authorization) = authorization;
        inner.name_warning_logged.store(false, Ordering::Relaxed);
        inner.location_warning_logged.store(false, Ordering::Relaxed);

        if !authorization.scan_allowed {
            let err = ScanError::AuthorizationMissing("scan permission denied".into());
            log_scan_error(&err, "start");
            if let Err(current) = inner.settle(generation, ScanState::Idle, None) {
                debug!("Denied start superseded while {:?}", current);
            }
            return Err(err);
        }

        let session_id = SessionId::new();
        inner.dedup.reset();

        if authorization.location_allowed {
            match inner.location.start_updates(&inner.location_request).await {
                Ok(fixes) => {
                    if let Some(current) = inner.superseded(generation) {
                        drop(fixes);
                        inner.abandon_start(&current, false).await;
                        return Err(ScanError::InvalidTransition {
                            state: current,
                            action: "start",
                        });
                    }
                    inner.tracker.feed(fixes);
                }
                Err(e) => warn!("Location updates unavailable, sightings will carry no location: {}", e),
            }
        } else {
            inner.warn_location_missing();
        }

        let started = inner
            .radio
            .start_scan(&inner.scan_settings)
            .await
            .map_err(ScanError::from);

        let next = match &started {
            Ok(_) => ScanState::Scanning,
            Err(err) if err.is_recoverable() => ScanState::Idle,
            Err(err) => ScanState::Failed(err.to_string()),
        };
        let session = started.is_ok().then(|| session_id.clone());
        if started.is_err() && inner.superseded(generation).is_none() {
            inner.release_location().await;
        }

        if let Err(current) = inner.settle(generation, next, session) {
            let radio_started = started.is_ok();
            drop(started);
            inner.abandon_start(&current, radio_started).await;
            return Err(ScanError::InvalidTransition {
                state: current,
                action: "start",
            });
        }

        let events = match started {
            Ok(events) => events,
            Err(err) => {
                log_scan_error(&err, "start");
                return Err(err);
            }
        };

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let handle = tokio::spawn(run_pump(Arc::downgrade(inner), events, cancel_rx));
        *lock(&inner.pump) = Some(Pump {
            cancel: cancel_tx,
            handle,
        });

        info!("Scan session {} started", session_id);
        Ok(session_id)
    }

    /// Handle one advertisement; only valid while scanning
    pub fn on_raw_event(&self, raw: RawEvent) -> Result<EventOutcome, ScanError> {
        self.inner.process(raw)
    }

    /// End the session and release the radio and location
    ///
    /// Appends that have not finished yet are aborted.
    pub async fn stop(&self) -> Result<(), ScanError> {
        let inner = &self.inner;
        {
            let mut state = lock(&inner.state);
            if !matches!(*state, ScanState::Scanning | ScanState::Starting) {
                return Err(ScanError::InvalidTransition {
                    state: state.clone(),
                    action: "stop",
                });
            }
            *state = ScanState::Stopping;
            inner.generation.fetch_add(1, Ordering::SeqCst);
        }

        let pump = lock(&inner.pump).take();
        if let Some(pump) = pump {
            let _ = pump.cancel.send(());
            if let Err(e) = pump.handle.await {
                warn!("Event pump ended abnormally: {}", e);
            }
        }

        match inner.radio.stop_scan().await {
            Ok(()) | Err(RadioError::NotScanning) => {}
            Err(e) => warn!("Failed to stop radio cleanly: {}", e),
        }
        inner.release_location().await;

        let aborted = inner.abort_pending();
        if aborted > 0 {
            debug!("Aborted {} unfinished appends", aborted);
        }

        inner.dedup.reset();
        let session = lock(&inner.session).take();
        inner.set_state(ScanState::Idle);

        if let Some(session) = session {
            info!("Scan session {} stopped", session);
        }
        Ok(())
    }

    /// Re-evaluate authorization; stops the session if scanning was revoked
    pub async fn update_authorization(&self, authorization: AuthorizationState) -> Result<(), ScanError> {
        let previous = std::mem::replace(&mut *lock(&self.inner.authorization), authorization);
        if previous == authorization {
            return Ok(());
        }
        info!("Authorization changed: {:?}", authorization);

        if previous.name_resolution_allowed != authorization.name_resolution_allowed {
            self.inner.name_warning_logged.store(false, Ordering::Relaxed);
        }
        if previous.location_allowed != authorization.location_allowed {
            self.inner.location_warning_logged.store(false, Ordering::Relaxed);
        }

        if !authorization.scan_allowed && self.state() == ScanState::Scanning {
            warn!("Scan permission revoked, stopping session");
            return self.stop().await;
        }
        Ok(())
    }

    /// Wait for every queued append to finish
    pub async fn flush(&self) {
        let handles: Vec<_> = lock(&self.inner.pending).drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!("Append task failed: {}", e);
                }
            }
        }
    }
}

impl Inner {
    fn set_state(&self, next: ScanState) {
        let mut state = lock(&self.state);
        debug!("State {:?} -> {:?}", *state, next);
        *state = next;
    }

    /// Compose, register and queue one sighting
    ///
    /// Runs under the state lock so a concurrent `stop` cannot slip in between
    /// the state check and the registry update.
    fn process(&self, raw: RawEvent) -> Result<EventOutcome, ScanError> {
        let state = lock(&self.state);
        if *state != ScanState::Scanning {
            return Err(ScanError::InvalidTransition {
                state: state.clone(),
                action: "handle events",
            });
        }

        if raw.address.trim().is_empty() {
            return Err(ScanError::MalformedEvent("empty device address".into()));
        }

        let authorization = *lock(&self.authorization);
        if !authorization.name_resolution_allowed && raw.raw_name.is_some() {
            self.warn_names_missing();
        }

        let location = if authorization.location_allowed {
            self.tracker.current()
        } else {
            None
        };

        let sighting = Sighting {
            display_name: display_name(raw.raw_name.as_deref(), authorization.name_resolution_allowed),
            estimated_distance: self.model.estimate_default(raw.signal_strength),
            signal_strength: raw.signal_strength,
            observed_at: self.clock.now(),
            location,
            address: raw.address,
        };

        self.registry.upsert(sighting.clone());

        if !self.dedup.admit(&sighting.address) {
            return Ok(EventOutcome::Deduplicated);
        }

        let session = lock(&self.session).clone();
        let Some(session_id) = session else {
            return Err(ScanError::InvalidTransition {
                state: state.clone(),
                action: "persist sightings",
            });
        };

        let sink = Arc::clone(&self.sink);
        let handle = tokio::spawn(async move {
            let address = sighting.address.clone();
            if let Err(e) = sink.append(sighting, session_id).await {
                log_scan_error(&ScanError::Persistence(e), &address);
            }
        });

        let mut pending = lock(&self.pending);
        pending.retain(|task| !task.is_finished());
        pending.push(handle);
        Ok(EventOutcome::Logged)
    }

    /// State of the lifecycle if the start attempt `generation` no longer owns it
    fn superseded(&self, generation: u64) -> Option<ScanState> {
        let state = lock(&self.state);
        if self.generation.load(Ordering::SeqCst) == generation && *state == ScanState::Starting {
            None
        } else {
            Some(state.clone())
        }
    }

    /// Move a start attempt out of `Starting`, unless it has been superseded
    fn settle(&self, generation: u64, next: ScanState, session: Option<SessionId>) -> Result<(), ScanState> {
        let mut state = lock(&self.state);
        if self.generation.load(Ordering::SeqCst) != generation || *state != ScanState::Starting {
            return Err(state.clone());
        }
        *lock(&self.session) = session;
        debug!("State {:?} -> {:?}", *state, next);
        *state = next;
        Ok(())
    }

    /// Undo a superseded start without touching a newer session
    async fn abandon_start(&self, current: &ScanState, radio_started: bool) {
        if matches!(current, ScanState::Starting | ScanState::Scanning) {
            debug!("Start superseded by a newer session; leaving radio and location alone");
            return;
        }
        debug!("Start superseded while {:?}; releasing radio", current);
        if radio_started {
            if let Err(e) = self.radio.stop_scan().await {
                debug!("Radio release after superseded start: {}", e);
            }
        }
        self.release_location().await;
    }

    fn abort_pending(&self) -> usize {
        let handles: Vec<_> = lock(&self.pending).drain(..).collect();
        let mut aborted = 0;
        for handle in handles {
            if !handle.is_finished() {
                handle.abort();
                aborted += 1;
            }
        }
        aborted
    }

    async fn release_location(&self) {
        self.location.stop_updates().await;
        self.tracker.stop();
    }

    /// Called from the pump when the radio can no longer deliver events
    ///
    /// A lost scan permission ends the session in `Idle`; anything else is
    /// terminal.
    async fn fail(&self, err: &ScanError) {
        let next = if err.is_recoverable() {
            ScanState::Idle
        } else {
            ScanState::Failed(err.to_string())
        };
        {
            let mut state = lock(&self.state);
            if *state != ScanState::Scanning {
                return;
            }
            debug!("State {:?} -> {:?}", *state, next);
            *state = next;
        }
        // The pump calls this itself; detach instead of joining
        drop(lock(&self.pump).take());

        if let Err(e) = self.radio.stop_scan().await {
            debug!("Radio release after failure: {}", e);
        }
        self.release_location().await;
        self.abort_pending();
        self.dedup.reset();
        lock(&self.session).take();
        warn!("Scan session ended: {}", err);
    }

    fn warn_names_missing(&self) {
        if !self.name_warning_logged.swap(true, Ordering::Relaxed) {
            warn!("Name resolution not authorized; devices are shown as unknown");
        }
    }

    fn warn_location_missing(&self) {
        if !self.location_warning_logged.swap(true, Ordering::Relaxed) {
            warn!("Location not authorized; sightings will carry no coordinates");
        }
    }
}

async fn run_pump(
    inner: Weak<Inner>,
    mut events: mpsc::Receiver<RadioEvent>,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    loop {
        let event = tokio::select! {
            _ = &mut cancel_rx => break,
            event = events.recv() => event,
        };

        let Some(inner) = inner.upgrade() else {
            break;
        };

        match event {
            Some(RadioEvent::Advertisement(raw)) => {
                if let Err(e) = inner.process(raw) {
                    log_scan_error(&e, "pump");
                }
            }
            Some(RadioEvent::Failure(err)) if err.is_fatal() => {
                let err = ScanError::from(err);
                log_scan_error(&err, "pump");
                inner.fail(&err).await;
                break;
            }
            Some(RadioEvent::Failure(err)) => warn!("Radio reported a recoverable error: {}", err),
            None => {
                let err = ScanError::HardwareUnavailable("radio event channel closed".into());
                inner.fail(&err).await;
                break;
            }
        }
    }
    debug!("Event pump finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::error::StoreError;
    use crate::sighting::RecordId;

    #[derive(Default)]
    struct IdleRadio {
        senders: Mutex<Vec<mpsc::Sender<RadioEvent>>>,
    }

    #[async_trait]
    impl RadioSource for IdleRadio {
        async fn start_scan(&self, _settings: &ScanSettings) -> Result<mpsc::Receiver<RadioEvent>, RadioError> {
            let (tx, rx) = mpsc::channel(1);
            lock(&self.senders).push(tx);
            Ok(rx)
        }

        async fn stop_scan(&self) -> Result<(), RadioError> {
            Ok(())
        }
    }

    struct NullSink;

    #[async_trait]
    impl SightingSink for NullSink {
        async fn append(&self, _sighting: Sighting, _session_id: SessionId) -> Result<RecordId, StoreError> {
            Ok(RecordId::new())
        }
    }

    fn orchestrator() -> ScanOrchestrator {
        ScanOrchestrator::builder(
            Arc::new(IdleRadio::default()),
            Arc::new(NullSink),
            Arc::new(SightingRegistry::new()),
        )
        .build()
    }

    #[tokio::test]
    async fn test_lifecycle_round_trip() {
        let orchestrator = orchestrator();
        assert_eq!(orchestrator.state(), ScanState::Idle);

        let session = orchestrator.start(AuthorizationState::full()).await.unwrap();
        assert_eq!(orchestrator.state(), ScanState::Scanning);
        assert_eq!(orchestrator.session_id(), Some(session));

        orchestrator.stop().await.unwrap();
        assert_eq!(orchestrator.state(), ScanState::Idle);
        assert_eq!(orchestrator.session_id(), None);
    }

    #[tokio::test]
    async fn test_events_rejected_outside_scanning() {
        let orchestrator = orchestrator();
        let err = orchestrator
            .on_raw_event(RawEvent::new("AA:BB", -60, None))
            .unwrap_err();
        assert!(matches!(err, ScanError::InvalidTransition { state: ScanState::Idle, .. }));
    }

    #[tokio::test]
    async fn test_second_event_is_deduplicated() {
        let orchestrator = orchestrator();
        orchestrator.start(AuthorizationState::full()).await.unwrap();

        let first = orchestrator.on_raw_event(RawEvent::new("AA:BB", -50, None)).unwrap();
        let second = orchestrator.on_raw_event(RawEvent::new("AA:BB", -90, None)).unwrap();
        assert_eq!(first, EventOutcome::Logged);
        assert_eq!(second, EventOutcome::Deduplicated);

        orchestrator.flush().await;
        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_scan_denied_returns_to_idle() {
        let orchestrator = orchestrator();
        let denied = AuthorizationState {
            scan_allowed: false,
            ..AuthorizationState::full()
        };
        let err = orchestrator.start(denied).await.unwrap_err();
        assert!(matches!(err, ScanError::AuthorizationMissing(_)));
        assert!(err.is_recoverable());
        assert_eq!(orchestrator.state(), ScanState::Idle);
        assert_eq!(orchestrator.session_id(), None);

        orchestrator.start(AuthorizationState::full()).await.unwrap();
        assert_eq!(orchestrator.state(), ScanState::Scanning);
    }

    #[tokio::test]
    async fn test_events_rejected_once_stopped() {
        let orchestrator = orchestrator();
        orchestrator.start(AuthorizationState::full()).await.unwrap();
        orchestrator.stop().await.unwrap();

        let err = orchestrator
            .on_raw_event(RawEvent::new("AA:BB", -60, None))
            .unwrap_err();
        assert!(matches!(err, ScanError::InvalidTransition { state: ScanState::Idle, .. }));
        assert!(orchestrator.registry().is_empty());
    }

    #[tokio::test]
    async fn test_stale_start_cannot_settle() {
        let orchestrator = orchestrator();
        let inner = &orchestrator.inner;
        *lock(&inner.state) = ScanState::Starting;
        let stale = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        inner.generation.fetch_add(1, Ordering::SeqCst);

        assert_eq!(inner.superseded(stale), Some(ScanState::Starting));
        assert_eq!(
            inner.settle(stale, ScanState::Scanning, Some(SessionId::new())),
            Err(ScanState::Starting)
        );
        assert_eq!(orchestrator.session_id(), None);
    }
}
