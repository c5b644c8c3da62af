//! hidapi backend: reads packetized input reports from the dial's HID interface
//!
//! hidapi is blocking, so enumeration and opening run on the blocking pool and
//! each session gets one blocking reader that polls with a short timeout to
//! notice cancellation.

use async_trait::async_trait;
use hidapi::{HidApi, HidDevice, HidError};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{DeviceError, DeviceSetup, DialBackend, ReportResult, ReportStream};
use crate::protocol::{control, ReportLayout, DIAL_REPORT_ID};

/// How long a blocking read waits before re-checking cancellation
const READ_POLL_MS: i32 = 250;

pub struct HidBackend {
    // hidapi allows a single context per process
    api: Arc<Mutex<HidApi>>,
    vendor_id: u16,
    product_id: u16,
}

impl HidBackend {
    pub fn new(vendor_id: u16, product_id: u16) -> Result<Self, DeviceError> {
        let api = HidApi::new().map_err(map_hid_error)?;
        Ok(Self {
            api: Arc::new(Mutex::new(api)),
            vendor_id,
            product_id,
        })
    }

    /// Open the dial briefly to apply `setup` without reading from it.
    /// Used when input arrives through another access path.
    pub async fn configure(&self, setup: &DeviceSetup) -> Result<(), DeviceError> {
        let device = self.open_device().await?;
        let setup = setup.clone();
        tokio::task::spawn_blocking(move || apply_setup(&device, &setup))
            .await
            .map_err(|e| DeviceError::Hid(format!("configure task failed: {}", e)))
    }

    async fn open_device(&self) -> Result<HidDevice, DeviceError> {
        let api = Arc::clone(&self.api);
        let (vid, pid) = (self.vendor_id, self.product_id);

        tokio::task::spawn_blocking(move || {
            let mut api = api.lock().unwrap_or_else(PoisonError::into_inner);
            api.refresh_devices().map_err(map_hid_error)?;
            if !api
                .device_list()
                .any(|d| d.vendor_id() == vid && d.product_id() == pid)
            {
                return Err(DeviceError::NotFound);
            }
            api.open(vid, pid).map_err(map_hid_error)
        })
        .await
        .map_err(|e| DeviceError::Hid(format!("open task failed: {}", e)))?
    }
}

#[async_trait]
impl DialBackend for HidBackend {
    fn name(&self) -> &'static str {
        "hid"
    }

    fn layout(&self) -> ReportLayout {
        ReportLayout::packetized()
    }

    fn watch_dir(&self) -> Option<PathBuf> {
        cfg!(target_os = "linux").then(|| PathBuf::from("/dev"))
    }

    async fn is_present(&self) -> bool {
        let api = Arc::clone(&self.api);
        let (vid, pid) = (self.vendor_id, self.product_id);

        let present = tokio::task::spawn_blocking(move || {
            let mut api = api.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = api.refresh_devices() {
                debug!("HID enumeration failed: {}", e);
                return false;
            }
            api.device_list()
                .any(|d| d.vendor_id() == vid && d.product_id() == pid)
        })
        .await;

        present.unwrap_or(false)
    }

    async fn open(
        &self,
        setup: &DeviceSetup,
        cancel: CancellationToken,
    ) -> Result<ReportStream, DeviceError> {
        let device = self.open_device().await?;
        info!(
            "Opened HID device {:04x}:{:04x}",
            self.vendor_id, self.product_id
        );

        let (tx, stream) = ReportStream::channel();
        let setup = setup.clone();
        let report_len = self.layout().report_len();

        tokio::task::spawn_blocking(move || {
            apply_setup(&device, &setup);
            read_loop(&device, report_len, &tx, &cancel);
            debug!("HID reader stopped");
        });

        Ok(stream)
    }
}

/// Apply resolution/haptics and the optional connect buzz.
/// Failures are logged and the session carries on with device defaults.
fn apply_setup(device: &HidDevice, setup: &DeviceSetup) {
    if setup.apply_features {
        let report = control::resolution_feature_report(setup.steps_per_revolution, setup.haptics);
        trace!("feature report: {}", control::hex_string(&report));
        match device.send_feature_report(&report) {
            Ok(()) => debug!(
                "Resolution set to {} steps, haptics {}",
                setup.steps_per_revolution,
                if setup.haptics { "on" } else { "off" }
            ),
            Err(e) => debug!("Setting resolution failed: {}", e),
        }
    }

    if let Some(repeat) = setup.buzz {
        let report = control::buzz_report(repeat);
        trace!("buzz report: {}", control::hex_string(&report));
        if let Err(e) = device.write(&report) {
            debug!("Haptic buzz failed: {}", e);
        }
    }
}

fn read_loop(
    device: &HidDevice,
    report_len: usize,
    tx: &mpsc::Sender<ReportResult>,
    cancel: &CancellationToken,
) {
    let mut buf = vec![0u8; report_len];

    while !cancel.is_cancelled() {
        match device.read_timeout(&mut buf, READ_POLL_MS) {
            Ok(0) => continue,
            Ok(n) => {
                if buf[0] != DIAL_REPORT_ID {
                    trace!("skipping report id {:#04x}", buf[0]);
                    continue;
                }
                if tx.blocking_send(Ok(buf[..n].to_vec())).is_err() {
                    return;
                }
            }
            Err(e) => {
                let error = map_hid_error(e);
                if !error.is_expected() {
                    warn!("HID read failed: {}", error);
                }
                if tx.blocking_send(Err(error)).is_err() {
                    debug!("monitor gone before read error was delivered");
                }
                return;
            }
        }
    }
}

fn map_hid_error(error: HidError) -> DeviceError {
    let message = error.to_string();
    let lower = message.to_ascii_lowercase();
    if lower.contains("no such device") || lower.contains("disconnected") {
        DeviceError::Removed
    } else {
        DeviceError::Hid(message)
    }
}
