//! evdev backend: reads `struct input_event` records from the dial's input node
//!
//! The node is located by the kernel-assigned device name under
//! `/sys/class/input`, or taken verbatim from configuration. Resolution and
//! haptics go through the HID control interface when the `hid` feature is on.
//!
//! The node is opened non-blocking and driven through the reactor, so closing
//! a session drops the descriptor at once even while the dial sits idle.

use async_trait::async_trait;
use std::fs::File;
use std::io::{self, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::{DeviceError, DeviceSetup, DialBackend, ReportResult, ReportStream};
use crate::protocol::{ReportLayout, StreamProfile};

const INPUT_DIR: &str = "/dev/input";
const SYSFS_INPUT_DIR: &str = "/sys/class/input";

pub struct EvdevBackend {
    device_name: String,
    event_file: Option<String>,
    input_dir: PathBuf,
    sysfs_dir: PathBuf,
    profile: StreamProfile,
    #[cfg(feature = "hid")]
    control: Option<super::hid::HidBackend>,
}

impl EvdevBackend {
    pub fn new(device_name: impl Into<String>, event_file: Option<String>) -> Self {
        Self {
            device_name: device_name.into(),
            event_file,
            input_dir: PathBuf::from(INPUT_DIR),
            sysfs_dir: PathBuf::from(SYSFS_INPUT_DIR),
            profile: StreamProfile::native(),
            #[cfg(feature = "hid")]
            control: None,
        }
    }

    /// Override the device and sysfs roots
    pub fn with_paths(mut self, input_dir: impl Into<PathBuf>, sysfs_dir: impl Into<PathBuf>) -> Self {
        self.input_dir = input_dir.into();
        self.sysfs_dir = sysfs_dir.into();
        self
    }

    /// Apply feature reports and buzz through `control` when a session opens
    #[cfg(feature = "hid")]
    pub fn with_control(mut self, control: super::hid::HidBackend) -> Self {
        self.control = Some(control);
        self
    }

    /// Locate the dial's event node
    pub fn find_event_node(&self) -> Option<PathBuf> {
        if let Some(file) = &self.event_file {
            let path = self.input_dir.join(file);
            return path.exists().then_some(path);
        }

        let mut entries: Vec<_> = std::fs::read_dir(&self.sysfs_dir)
            .ok()?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("event"))
            .collect();
        entries.sort();

        entries
            .into_iter()
            .find(|name| {
                read_device_name(&self.sysfs_dir.join(name))
                    .is_some_and(|found| found == self.device_name)
            })
            .map(|name| self.input_dir.join(name))
    }

    async fn apply_setup(&self, setup: &DeviceSetup) {
        #[cfg(feature = "hid")]
        if let Some(control) = &self.control {
            if let Err(e) = control.configure(setup).await {
                debug!("Device control unavailable: {}", e);
            }
            return;
        }

        if setup.apply_features || setup.buzz.is_some() {
            debug!("No control interface, keeping device defaults");
        }
    }
}

fn read_device_name(sysfs_entry: &Path) -> Option<String> {
    std::fs::read_to_string(sysfs_entry.join("device").join("name"))
        .ok()
        .map(|name| name.trim().to_string())
}

#[async_trait]
impl DialBackend for EvdevBackend {
    fn name(&self) -> &'static str {
        "evdev"
    }

    fn layout(&self) -> ReportLayout {
        ReportLayout::Streamed(self.profile)
    }

    fn watch_dir(&self) -> Option<PathBuf> {
        Some(self.input_dir.clone())
    }

    async fn is_present(&self) -> bool {
        self.find_event_node().is_some()
    }

    async fn open(
        &self,
        setup: &DeviceSetup,
        cancel: CancellationToken,
    ) -> Result<ReportStream, DeviceError> {
        let node = self.find_event_node().ok_or(DeviceError::NotFound)?;
        let file = open_nonblocking(&node).map_err(DeviceError::from_io)?;
        info!("Opened {}", node.display());

        self.apply_setup(setup).await;

        let (tx, stream) = ReportStream::channel();
        tokio::spawn(read_records(file, self.profile.record_len(), tx, cancel));
        Ok(stream)
    }
}

fn open_nonblocking(node: &Path) -> io::Result<AsyncFd<File>> {
    let file = std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(node)?;
    AsyncFd::with_interest(file, Interest::READABLE)
}

/// Fill `buf` with one whole record. Cancel-safe only at record boundaries,
/// which is all a closing session needs.
async fn read_record(fd: &AsyncFd<File>, buf: &mut [u8]) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let mut ready = fd.readable().await?;
        match ready.try_io(|inner| Read::read(&mut inner.get_ref(), &mut buf[filled..])) {
            Ok(Ok(0)) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(Ok(n)) => filled += n,
            Ok(Err(e)) => return Err(e),
            Err(_would_block) => continue,
        }
    }
    Ok(())
}

async fn read_records(
    fd: AsyncFd<File>,
    record_len: usize,
    tx: mpsc::Sender<ReportResult>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; record_len];

    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = read_record(&fd, &mut buf) => result,
        };

        match result {
            Ok(()) => {
                trace!("record: {:02X?}", buf);
                if tx.send(Ok(buf.clone())).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                if tx.send(Err(DeviceError::from_io(e))).await.is_err() {
                    debug!("monitor gone before read error was delivered");
                }
                break;
            }
        }
    }

    // Deregisters and closes the node
    drop(fd);
    debug!("evdev reader stopped");
}
