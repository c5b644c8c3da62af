//! DeviceMonitor - one connection session at a time
//!
//! Waits for the dial to appear, opens it through a [`DialBackend`], decodes
//! reports into [`SemanticEvent`]s and forwards them to the aggregator until
//! the device goes away. Retry policy lives in the supervisor.

use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use super::discovery::ArrivalWatcher;
use super::{ConnectionState, DeviceError, DeviceSetup, DialBackend};
use crate::protocol::{control, SemanticEvent};

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub setup: DeviceSetup,
    /// Fallback presence poll when arrival notifications are missed
    pub discovery_poll: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            setup: DeviceSetup::default(),
            discovery_poll: Duration::from_secs(2),
        }
    }
}

/// How a session ended
#[derive(Debug)]
pub struct SessionOutcome {
    /// The device opened and reached `Connected`
    pub connected: bool,
    /// `None` when the session stopped for shutdown
    pub error: Option<DeviceError>,
}

pub struct DeviceMonitor<B: DialBackend> {
    backend: B,
    settings: MonitorSettings,
    events: mpsc::Sender<SemanticEvent>,
    state: watch::Sender<ConnectionState>,
}

impl<B: DialBackend> DeviceMonitor<B> {
    pub fn new(backend: B, settings: MonitorSettings, events: mpsc::Sender<SemanticEvent>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Absent);
        Self {
            backend,
            settings,
            events,
            state,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe connection state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!("{}: {:?} -> {:?}", self.backend.name(), previous, next);
        }
    }

    /// Block until the dial is present. Returns `false` if shutdown came first.
    pub async fn wait_for_device(&self, shutdown: &CancellationToken) -> bool {
        if self.backend.is_present().await {
            return true;
        }

        info!("Waiting for dial to connect ({})", self.backend.name());
        let watch_dir = self.backend.watch_dir();
        let mut arrivals = ArrivalWatcher::new(watch_dir.as_deref(), self.settings.discovery_poll);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = arrivals.next() => {
                    if self.backend.is_present().await {
                        debug!("Dial has connected");
                        return true;
                    }
                }
            }
        }
    }

    /// Open the device and pump its reports until it disconnects or shutdown fires
    pub async fn run_session(&self, shutdown: &CancellationToken) -> SessionOutcome {
        self.set_state(ConnectionState::Connecting);

        let session = shutdown.child_token();
        let mut reports = match self.backend.open(&self.settings.setup, session.clone()).await {
            Ok(reports) => reports,
            Err(e) => {
                if e.is_expected() {
                    debug!("Dial not ready: {}", e);
                } else {
                    error!("Opening dial failed: {}", e);
                }
                self.set_state(ConnectionState::Absent);
                return SessionOutcome {
                    connected: false,
                    error: Some(e),
                };
            }
        };

        self.set_state(ConnectionState::Connected);
        info!("Dial connected");

        let layout = self.backend.layout();
        let error = loop {
            let report = tokio::select! {
                _ = shutdown.cancelled() => break None,
                report = reports.next_report() => report,
            };

            match report {
                Ok(bytes) => match layout.decode(&bytes) {
                    Some(event) => {
                        if self.events.send(event).await.is_err() {
                            break Some(DeviceError::Closed);
                        }
                    }
                    None => trace!("ignored report: {}", control::hex_string(&bytes)),
                },
                Err(e) => break Some(e),
            }
        };

        self.set_state(ConnectionState::Disconnecting);
        session.cancel();
        drop(reports);
        self.set_state(ConnectionState::Absent);

        match &error {
            None => info!("Dial session stopped"),
            Some(e) if e.is_expected() => info!("Dial disconnected"),
            Some(e) => error!("Dial session failed: {}", e),
        }

        SessionOutcome {
            connected: true,
            error,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::device::{ReportResult, ReportStream};
    use crate::protocol::{ButtonState, ReportLayout};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// What the next `open()` call on [`MockBackend`] produces
    pub(crate) enum Script {
        Fail(DeviceError),
        Reports(Vec<ReportResult>),
        /// Connect, stay silent for the duration, then end with the error
        Hold(Duration, DeviceError),
    }

    /// Backend replaying scripted sessions
    #[derive(Clone)]
    pub(crate) struct MockBackend {
        pub present: Arc<AtomicBool>,
        pub opens: Arc<AtomicUsize>,
        pub scripts: Arc<Mutex<VecDeque<Script>>>,
        pub open_times: Arc<Mutex<Vec<tokio::time::Instant>>>,
    }

    impl MockBackend {
        pub fn new(scripts: Vec<Script>) -> Self {
            Self {
                present: Arc::new(AtomicBool::new(true)),
                opens: Arc::new(AtomicUsize::new(0)),
                scripts: Arc::new(Mutex::new(scripts.into())),
                open_times: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl DialBackend for MockBackend {
        fn name(&self) -> &'static str {
            "mock"
        }

        fn layout(&self) -> ReportLayout {
            ReportLayout::packetized()
        }

        async fn is_present(&self) -> bool {
            self.present.load(Ordering::SeqCst)
        }

        async fn open(
            &self,
            _setup: &DeviceSetup,
            _cancel: CancellationToken,
        ) -> Result<ReportStream, DeviceError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            self.open_times
                .lock()
                .unwrap()
                .push(tokio::time::Instant::now());

            let script = self.scripts.lock().unwrap().pop_front();
            match script {
                Some(Script::Fail(e)) => Err(e),
                Some(Script::Reports(reports)) => {
                    let (tx, stream) = ReportStream::channel();
                    for report in reports {
                        tx.try_send(report).unwrap();
                    }
                    Ok(stream)
                }
                Some(Script::Hold(duration, error)) => {
                    let (tx, stream) = ReportStream::channel();
                    tokio::spawn(async move {
                        tokio::time::sleep(duration).await;
                        tx.send(Err(error)).await.unwrap();
                    });
                    Ok(stream)
                }
                // Out of script: a device that never speaks
                None => {
                    let (tx, stream) = ReportStream::channel();
                    std::mem::forget(tx);
                    Ok(stream)
                }
            }
        }
    }

    fn rotation_report(delta: i16) -> Vec<u8> {
        let [lo, hi] = delta.to_le_bytes();
        vec![0x01, 0x00, lo, hi, 0x00]
    }

    #[tokio::test]
    async fn test_session_forwards_decoded_events() {
        let backend = MockBackend::new(vec![Script::Reports(vec![
            Ok(vec![0x01, 0x01, 0x00, 0x00]),
            Ok(vec![0x02, 0xFF]),
            Ok(rotation_report(-4)),
            Ok(vec![0x01, 0x00, 0x00, 0x00]),
            Err(DeviceError::Removed),
        ])]);
        let (tx, mut rx) = mpsc::channel(16);
        let monitor = DeviceMonitor::new(backend, MonitorSettings::default(), tx);
        let shutdown = CancellationToken::new();

        let outcome = monitor.run_session(&shutdown).await;
        assert!(outcome.connected);
        assert!(matches!(outcome.error, Some(DeviceError::Removed)));
        assert_eq!(monitor.state(), ConnectionState::Absent);

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(
            events,
            vec![
                SemanticEvent::ButtonEdge {
                    state: ButtonState::Down
                },
                SemanticEvent::Rotation { delta: -4 },
                SemanticEvent::ButtonEdge {
                    state: ButtonState::Up
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_open_failure_is_not_connected() {
        let backend = MockBackend::new(vec![Script::Fail(DeviceError::Hid(
            "permission denied".to_string(),
        ))]);
        let (tx, _rx) = mpsc::channel(16);
        let monitor = DeviceMonitor::new(backend, MonitorSettings::default(), tx);

        let outcome = monitor.run_session(&CancellationToken::new()).await;
        assert!(!outcome.connected);
        assert!(matches!(outcome.error, Some(DeviceError::Hid(_))));
        assert_eq!(monitor.state(), ConnectionState::Absent);
    }

    #[tokio::test]
    async fn test_state_transitions_through_session() {
        let backend = MockBackend::new(vec![]);
        let (tx, _rx) = mpsc::channel(16);
        let monitor = Arc::new(DeviceMonitor::new(backend, MonitorSettings::default(), tx));
        let mut states = monitor.subscribe_state();
        let shutdown = CancellationToken::new();

        let task = tokio::spawn({
            let monitor = Arc::clone(&monitor);
            let shutdown = shutdown.clone();
            async move { monitor.run_session(&shutdown).await }
        });

        states
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();

        shutdown.cancel();
        let outcome = task.await.unwrap();
        assert!(outcome.connected);
        assert!(outcome.error.is_none());
        assert_eq!(monitor.state(), ConnectionState::Absent);
    }

    #[tokio::test]
    async fn test_closed_event_channel_ends_session() {
        let backend = MockBackend::new(vec![Script::Reports(vec![Ok(rotation_report(1))])]);
        let (tx, rx) = mpsc::channel(16);
        drop(rx);
        let monitor = DeviceMonitor::new(backend, MonitorSettings::default(), tx);

        let outcome = monitor.run_session(&CancellationToken::new()).await;
        assert!(matches!(outcome.error, Some(DeviceError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_device_polls_until_present() {
        let backend = MockBackend::new(vec![]);
        backend.present.store(false, Ordering::SeqCst);
        let present = Arc::clone(&backend.present);

        let (tx, _rx) = mpsc::channel(16);
        let settings = MonitorSettings {
            discovery_poll: Duration::from_millis(500),
            ..Default::default()
        };
        let monitor = DeviceMonitor::new(backend, settings, tx);
        let shutdown = CancellationToken::new();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1200)).await;
            present.store(true, Ordering::SeqCst);
        });

        let start = tokio::time::Instant::now();
        assert!(monitor.wait_for_device(&shutdown).await);
        assert!(start.elapsed() >= Duration::from_millis(1200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_device_honours_shutdown() {
        let backend = MockBackend::new(vec![]);
        backend.present.store(false, Ordering::SeqCst);
        let (tx, _rx) = mpsc::channel(16);
        let monitor = DeviceMonitor::new(backend, MonitorSettings::default(), tx);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        assert!(!monitor.wait_for_device(&shutdown).await);
    }
}
