//! Error taxonomy for the session layer (spec.md §7).

use thiserror::Error;

/// Errors surfaced while talking to the HID transport itself.
///
/// Wraps `hidapi`'s own error type the way
/// `keepkey_rust::transport::hid::HidError` does.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HID API error: {0}")]
    Hid(#[from] hidapi::HidError),
    #[error("no matching HID device found (vendor 0x{vendor_id:04x}, product {product_id:?})")]
    NotFound {
        vendor_id: u16,
        product_id: Option<u16>,
    },
    #[error("device returned an empty report")]
    EmptyReport,
    #[error("{0}")]
    Other(String),
}

/// Errors raised by the frame codec (spec.md §4.3).
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("payload length {0} exceeds the 62-byte maximum")]
    PayloadTooLong(usize),
}

/// Errors raised by Speck-based record protection (spec.md §4.4).
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("inbound frame failed MAC verification")]
    IntegrityError,
    #[error("session keys have not been installed")]
    KeysNotInstalled,
}

/// The full error taxonomy a [`crate::session::Session`] can raise.
///
/// Each variant corresponds to one entry in spec.md §7; there is no
/// retry policy attached to any of them, by design.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("connection error: unexpected init reply (type=0x{message_type:02x}, payload={payload:02x?})")]
    ConnectionError { message_type: u8, payload: Vec<u8> },

    #[error("handshake error: {0}")]
    HandshakeError(String),

    #[error("integrity error: inbound frame MAC did not verify")]
    IntegrityError,

    #[error("device reported an unknown message")]
    UnknownMessage,

    #[error("device encryption has not been initialized")]
    EncryptionNotInitialized,

    #[error("device encryption setup failed")]
    EncryptionSetupFailed,

    #[error("unexpected message type 0x{message_type:02x} while awaiting a text reply")]
    UnexpectedMessageType { message_type: u8, payload: Vec<u8> },

    #[error("malformed reply: {0:?}")]
    MalformedReply(Vec<u8>),

    #[error("checksum error: expected 0x{expected:08X}, calculated 0x{calculated:08X}")]
    ChecksumError { expected: u32, calculated: u32 },

    #[error("command failed: {0:?}")]
    CommandFailed(Vec<u8>),
}

impl From<CryptoError> for SessionError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::IntegrityError => SessionError::IntegrityError,
            CryptoError::KeysNotInstalled => {
                SessionError::HandshakeError("session keys have not been installed".to_string())
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
