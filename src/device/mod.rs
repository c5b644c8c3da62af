//! Dial device access: discovery, connection lifecycle and reconnection
//!
//! ```text
//! DialBackend ──raw reports──► DeviceMonitor ──SemanticEvent──► aggregator
//!      ▲                            ▲
//!      └──── open / is_present ─────┴── ReconnectSupervisor (backoff loop)
//! ```
//!
//! Backends hide the platform access path (hidraw via hidapi, or evdev
//! character devices). Everything above them is platform-agnostic.

pub mod discovery;
#[cfg(unix)]
pub mod evdev;
#[cfg(feature = "hid")]
pub mod hid;
pub mod monitor;
pub mod supervisor;

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::protocol::ReportLayout;

pub use monitor::{DeviceMonitor, MonitorSettings, SessionOutcome};
pub use supervisor::{Backoff, ReconnectSupervisor, RetryConfig};

/// Microsoft Surface Dial USB/BT identity
pub const SURFACE_DIAL_VENDOR_ID: u16 = 0x045e;
pub const SURFACE_DIAL_PRODUCT_ID: u16 = 0x091b;

/// Input device name the kernel assigns to the dial's rotation/button node
pub const SURFACE_DIAL_INPUT_NAME: &str = "Surface Dial System Multi Axis";

/// Reports buffered between a backend reader and the monitor
const REPORT_QUEUE_DEPTH: usize = 256;

/// Device-level failures
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// The device is not attached (expected while the dial sleeps)
    #[error("device not found")]
    NotFound,

    /// The device went away mid-session (expected)
    #[error("device removed")]
    Removed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HID error: {0}")]
    Hid(String),

    /// The backend reader stopped without reporting why
    #[error("report stream closed")]
    Closed,
}

impl DeviceError {
    /// Absence and removal are part of normal operation, not failures
    pub fn is_expected(&self) -> bool {
        matches!(self, DeviceError::NotFound | DeviceError::Removed)
    }

    /// Map an I/O error, recognising the ways a vanished device node reports itself
    pub fn from_io(error: std::io::Error) -> Self {
        const ENODEV: i32 = 19;
        match error.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::UnexpectedEof => {
                DeviceError::Removed
            }
            _ if error.raw_os_error() == Some(ENODEV) => DeviceError::Removed,
            _ => DeviceError::Io(error),
        }
    }
}

/// Connection lifecycle as seen by consumers of [`DeviceMonitor::subscribe_state`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Absent,
    Connecting,
    Connected,
    Disconnecting,
}

/// One-shot device configuration applied when a session opens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSetup {
    /// Send the resolution/haptics feature report
    pub apply_features: bool,
    pub steps_per_revolution: u16,
    pub haptics: bool,
    /// Haptic pulse repeat count, `None` disables the connect buzz
    pub buzz: Option<u8>,
}

impl Default for DeviceSetup {
    fn default() -> Self {
        Self {
            apply_features: true,
            steps_per_revolution: 3600,
            haptics: true,
            buzz: None,
        }
    }
}

pub type ReportResult = Result<Vec<u8>, DeviceError>;

/// Raw reports produced by an open device.
///
/// The backend's reader delivers `Err` once and stops; dropping the stream
/// (together with cancelling the session token) stops the reader.
pub struct ReportStream {
    rx: mpsc::Receiver<ReportResult>,
}

impl ReportStream {
    /// Create a stream and the sender its reader feeds
    pub fn channel() -> (mpsc::Sender<ReportResult>, Self) {
        let (tx, rx) = mpsc::channel(REPORT_QUEUE_DEPTH);
        (tx, Self { rx })
    }

    /// Wait for the next report. Blocks indefinitely while the dial is idle.
    pub async fn next_report(&mut self) -> ReportResult {
        self.rx.recv().await.unwrap_or(Err(DeviceError::Closed))
    }
}

/// Platform access path for the dial
#[async_trait]
pub trait DialBackend: Send + Sync + 'static {
    /// Short name for logs (e.g., "hid", "evdev")
    fn name(&self) -> &'static str;

    /// Wire layout of the reports this backend produces
    fn layout(&self) -> ReportLayout;

    /// Directory whose new entries signal a possible device arrival.
    /// `None` means discovery relies on polling alone.
    fn watch_dir(&self) -> Option<PathBuf> {
        None
    }

    /// Whether the device is currently attached
    async fn is_present(&self) -> bool;

    /// Open the device, apply `setup`, and start reading.
    /// The reader must stop once `cancel` fires.
    async fn open(
        &self,
        setup: &DeviceSetup,
        cancel: CancellationToken,
    ) -> Result<ReportStream, DeviceError>;
}
