//! HID Transport Adapter (spec.md §4.1).
//!
//! Opens an Abbott FreeStyle meter by vendor id and, optionally, product id
//! or device path, and exchanges fixed-size HID reports. No framing and no
//! retries live here — that is the [`crate::session::Session`]'s job.
//! Modeled on `keepkey_rust::transport::hid::HidTransport`: enumerate with
//! `hidapi`, filter by vendor/product id, open, then blocking
//! `write`/`read`.

use std::path::Path;
use std::time::Duration;

use log::{debug, info};

use crate::error::TransportError;
use crate::frame::FRAME_LEN;

/// Abbott's USB vendor id (spec.md §6).
pub const ABBOTT_VENDOR_ID: u16 = 0x1A61;

/// Default read timeout when the caller doesn't care to tune it.
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// What a session needs from its transport: write a full frame, read the
/// next complete report, nothing more.
pub trait Transport {
    fn write_frame(&mut self, frame: &[u8; FRAME_LEN]) -> Result<(), TransportError>;

    /// Read the next complete HID report, padded to [`FRAME_LEN`] bytes.
    fn read_frame(&mut self) -> Result<[u8; FRAME_LEN], TransportError>;
}

pub struct HidTransport {
    device: hidapi::HidDevice,
}

impl HidTransport {
    /// Open the first FreeStyle meter matching `product_id` (or any
    /// Abbott-vendor device if `None`), optionally pinned to `path`.
    pub fn open(path: Option<&Path>, product_id: Option<u16>) -> Result<Self, TransportError> {
        let api = hidapi::HidApi::new()?;

        if let Some(path) = path {
            let path_str = path
                .to_str()
                .ok_or_else(|| TransportError::Other("device path is not valid UTF-8".into()))?;
            let c_path = std::ffi::CString::new(path_str)
                .map_err(|_| TransportError::Other("device path contains a NUL byte".into()))?;
            debug!("opening HID device at explicit path {:?}", path);
            let device = api.open_path(&c_path)?;
            return Ok(Self { device });
        }

        let candidate = api.device_list().find(|info| {
            info.vendor_id() == ABBOTT_VENDOR_ID
                && product_id.map_or(true, |pid| info.product_id() == pid)
        });

        let info = candidate.ok_or(TransportError::NotFound {
            vendor_id: ABBOTT_VENDOR_ID,
            product_id,
        })?;

        info!(
            "opening FreeStyle meter (vid=0x{:04x}, pid=0x{:04x})",
            info.vendor_id(),
            info.product_id()
        );
        let device = info.open_device(&api)?;
        Ok(Self { device })
    }
}

impl Transport for HidTransport {
    fn write_frame(&mut self, frame: &[u8; FRAME_LEN]) -> Result<(), TransportError> {
        debug!("HID write: {} bytes", frame.len());
        self.device.write(frame)?;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<[u8; FRAME_LEN], TransportError> {
        // Unlike writes, HID input reports from a report-id-0 device carry
        // no leading report-id byte: byte 0 of what we read back is already
        // the message type. See DESIGN.md for how this lines up with the
        // protect/unprotect byte ranges in spec.md §4.4.
        let mut buf = [0u8; FRAME_LEN];
        let timeout_ms = DEFAULT_READ_TIMEOUT.as_millis() as i32;
        let read = self.device.read_timeout(&mut buf[..FRAME_LEN - 1], timeout_ms)?;
        if read == 0 {
            return Err(TransportError::EmptyReport);
        }
        debug!("HID read: {} bytes", read);
        Ok(buf)
    }
}
