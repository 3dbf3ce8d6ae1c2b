//! Host-side session layer for the HID protocol used by Abbott FreeStyle
//! blood glucose meters: frame codec, Speck-64/128 record protection, the
//! handshake, and the text-reply assembler.

pub mod crypto;
pub mod error;
pub mod frame;
pub mod session;
pub mod speck;
pub mod text;
pub mod transport;

pub use error::{CryptoError, FrameError, Result, SessionError, TransportError};
pub use session::{Session, SessionConfig, ENCRYPTED_PRODUCT_ID};
pub use transport::{HidTransport, Transport, ABBOTT_VENDOR_ID};
