//! Session State Machine (spec.md §4.5) and the handshake (spec.md §4.5.1).
//!
//! Owns the transport exclusively, drives `connect`/handshake, and filters
//! keep-alives and error frames out of the read path the way
//! `keepkey_rust::transport::protocol_adapter`'s `send`/`handle` split
//! does, minus the async machinery that crate's `device_queue` adds for
//! its own, much larger, surface.

use log::{debug, info, warn};
use rand::RngCore;

use crate::crypto::{self, SessionKeys};
use crate::error::{Result, SessionError};
use crate::frame;
use crate::text::{self, Record};
use crate::transport::Transport;

/// Product id of the encrypted-profile device family (spec.md §3).
pub const ENCRYPTED_PRODUCT_ID: u16 = 0x3950;

const INIT_COMMAND: u8 = 0x01;
const INIT_RESPONSE: u8 = 0x71;
const SERIAL_REQUEST: u8 = 0x05;
const SERIAL_RESPONSE: u8 = 0x06;
const CRYPTO_SETUP_COMMAND: u8 = 0x14;
const CRYPTO_SETUP_RESPONSE: u8 = 0x33;
const KEEPALIVE: u8 = 0x22;
const UNKNOWN_MESSAGE_RESPONSE: u8 = 0x30;

/// Message types that never carry ciphertext, in either direction
/// (spec.md §3).
const ALWAYS_UNENCRYPTED: [u8; 13] = [
    0x01, 0x04, 0x05, 0x06, 0x0C, 0x0D, 0x14, 0x15, 0x33, 0x34, 0x35, 0x71, 0x22,
];

// Placeholder sentinel master keys (spec.md §9). Real devices require
// reverse-engineered or out-of-band key material; with these values the
// handshake will always fail verification at step 7/8. That is expected,
// not a bug to paper over.
const AUTH_ENC_MASTER_KEY: u128 = 0xdead_beef;
const AUTH_MAC_MASTER_KEY: u128 = 0xdead_beef;
const SESS_ENC_MASTER_KEY: u128 = 0xdead_beef;
const SESS_MAC_MASTER_KEY: u128 = 0xdead_beef;

/// Configuration needed to construct a [`Session`] (spec.md §3, `Session`
/// attributes fixed at construction time).
pub struct SessionConfig {
    pub product_id: Option<u16>,
    pub text_type_out: u8,
    pub text_type_in: u8,
    pub encoding: String,
}

impl SessionConfig {
    pub fn new(product_id: Option<u16>, text_type_out: u8, text_type_in: u8) -> Self {
        Self {
            product_id,
            text_type_out,
            text_type_in,
            encoding: "ascii".to_string(),
        }
    }

    pub fn with_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.encoding = encoding.into();
        self
    }
}

/// The stateful protocol engine: one per connected meter (spec.md §3).
pub struct Session<T: Transport> {
    transport: T,
    text_type_out: u8,
    text_type_in: u8,
    encoding: String,
    encrypted_profile: bool,
    session_keys: Option<SessionKeys>,
}

fn u56_be(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf[1..8].copy_from_slice(&bytes[..7]);
    u64::from_be_bytes(buf)
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T, config: SessionConfig) -> Self {
        Self {
            transport,
            text_type_out: config.text_type_out,
            text_type_in: config.text_type_in,
            encoding: config.encoding,
            encrypted_profile: config.product_id == Some(ENCRYPTED_PRODUCT_ID),
            session_keys: None,
        }
    }

    pub fn is_encrypted_profile(&self) -> bool {
        self.encrypted_profile
    }

    /// Open the connection: handshake if required, then the init knock
    /// (spec.md §4.5).
    pub fn connect(&mut self) -> Result<()> {
        if self.encrypted_profile {
            self.handshake()?;
        }

        self.send_command(INIT_COMMAND, &[])?;
        let (message_type, payload) = self.read_response()?;
        if message_type != INIT_RESPONSE || payload != [0x01] {
            return Err(SessionError::ConnectionError {
                message_type,
                payload,
            });
        }
        Ok(())
    }

    /// Challenge-response mutual authentication that installs session keys
    /// (spec.md §4.5.1).
    fn handshake(&mut self) -> Result<()> {
        self.send_command(SERIAL_REQUEST, &[])?;
        let (message_type, payload) = self.read_response()?;
        if message_type != SERIAL_RESPONSE {
            return Err(SessionError::HandshakeError(format!(
                "expected serial response (0x{SERIAL_RESPONSE:02x}), got 0x{message_type:02x}"
            )));
        }
        if payload.len() < 13 {
            return Err(SessionError::HandshakeError(
                "serial response payload shorter than 13 bytes".to_string(),
            ));
        }
        let serial = payload[..13].to_vec();

        let auth_enc_key = crate::speck::derive(AUTH_ENC_MASTER_KEY, b"AuthrEnc", &serial);
        let auth_mac_key = crate::speck::derive(AUTH_MAC_MASTER_KEY, b"AuthrMAC", &serial);

        self.send_command(CRYPTO_SETUP_COMMAND, &[0x11])?;
        let (message_type, payload) = self.read_response()?;
        if message_type != CRYPTO_SETUP_RESPONSE || payload.first() != Some(&0x16) {
            return Err(SessionError::HandshakeError(
                "unexpected reply to crypto setup challenge".to_string(),
            ));
        }
        if payload.len() < 16 {
            return Err(SessionError::HandshakeError(
                "crypto setup challenge payload too short".to_string(),
            ));
        }
        let reader_rand = payload[1..9].to_vec();
        let iv = u56_be(&payload[9..16]);

        let mut driver_rand = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut driver_rand);

        let mut challenge_plain = Vec::with_capacity(16);
        challenge_plain.extend_from_slice(&reader_rand);
        challenge_plain.extend_from_slice(&driver_rand);
        let resp_enc = crate::speck::stream_xor(auth_enc_key, iv, &challenge_plain);

        let mut mac_input = vec![0x14, 0x1a, 0x17];
        mac_input.extend_from_slice(&resp_enc);
        mac_input.push(0x01);
        let resp_mac = crate::speck::cmac(auth_mac_key, &mac_input);

        let mut command = vec![0x17];
        command.extend_from_slice(&resp_enc);
        command.push(0x01);
        command.extend_from_slice(&resp_mac.to_le_bytes());
        self.send_command(CRYPTO_SETUP_COMMAND, &command)?;

        let (message_type, payload) = self.read_response()?;
        if message_type != CRYPTO_SETUP_RESPONSE || payload.first() != Some(&0x18) {
            return Err(SessionError::HandshakeError(
                "unexpected reply to crypto setup response".to_string(),
            ));
        }
        if payload.len() < 32 {
            return Err(SessionError::HandshakeError(
                "crypto setup confirmation payload too short".to_string(),
            ));
        }

        let mut verify_input = vec![0x33, 0x22];
        verify_input.extend_from_slice(&payload[0..24]);
        let verify_mac = crate::speck::cmac(auth_mac_key, &verify_input);
        if verify_mac.to_le_bytes() != payload[24..32] {
            return Err(SessionError::HandshakeError(
                "device confirmation MAC did not verify".to_string(),
            ));
        }

        let iv2 = u56_be(&payload[17..24]);
        let decrypted = crate::speck::stream_xor(auth_enc_key, iv2, &payload[1..17]);
        if decrypted[0..8] != driver_rand || decrypted[8..16] != reader_rand[..] {
            return Err(SessionError::HandshakeError(
                "device did not echo back the expected challenge randomness".to_string(),
            ));
        }

        let mut key_context = serial.clone();
        key_context.extend_from_slice(&reader_rand);
        key_context.extend_from_slice(&driver_rand);
        let enc_key = crate::speck::derive(SESS_ENC_MASTER_KEY, b"SessnEnc", &key_context);
        let mac_key = crate::speck::derive(SESS_MAC_MASTER_KEY, b"SessnMAC", &key_context);
        self.session_keys = Some(SessionKeys::new(enc_key, mac_key));
        info!("handshake complete, session keys installed");
        Ok(())
    }

    /// Encode, optionally protect, and write a command. Does not wait for
    /// a reply (spec.md §4.5).
    pub fn send_command(&mut self, message_type: u8, payload: &[u8]) -> Result<()> {
        let mut frame = frame::encode(message_type, payload)?;
        if self.encrypted_profile && !ALWAYS_UNENCRYPTED.contains(&message_type) {
            let keys = self
                .session_keys
                .as_ref()
                .ok_or_else(|| SessionError::HandshakeError("session keys not installed".into()))?;
            crypto::protect(keys, &mut frame);
        }
        self.transport.write_frame(&frame)?;
        Ok(())
    }

    /// Read the next non-keep-alive, non-error frame (spec.md §4.5).
    ///
    /// Unlike outbound frames, an inbound HID report carries no leading
    /// report-id byte, so byte 0 of what `Transport::read_frame` returns is
    /// already the message type (see DESIGN.md).
    pub fn read_response(&mut self) -> Result<(u8, Vec<u8>)> {
        loop {
            let mut raw = self.transport.read_frame()?;
            let message_type = raw[0];

            if self.encrypted_profile && !ALWAYS_UNENCRYPTED.contains(&message_type) {
                let keys = self.session_keys.as_ref().ok_or_else(|| {
                    SessionError::HandshakeError("session keys not installed".into())
                })?;
                crypto::unprotect(keys, &mut raw)?;
            }

            let len = raw[1] as usize;
            let payload = raw[2..2 + len.min(62)].to_vec();

            if message_type == KEEPALIVE {
                debug!("absorbing keep-alive frame");
                continue;
            }
            if message_type == UNKNOWN_MESSAGE_RESPONSE && payload == [0x85] {
                warn!("device reported an unknown message");
                return Err(SessionError::UnknownMessage);
            }
            if message_type == CRYPTO_SETUP_RESPONSE && payload == [0x15] {
                return Err(SessionError::EncryptionNotInitialized);
            }
            if message_type == CRYPTO_SETUP_RESPONSE && payload == [0x14] {
                return Err(SessionError::EncryptionSetupFailed);
            }

            return Ok((message_type, payload));
        }
    }

    /// Send a text command and reassemble the multi-frame reply into a
    /// checksum-verified raw body (spec.md §4.6 steps 1-6).
    fn send_text_command_raw(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        self.send_command(self.text_type_out, command)?;

        let mut buffer = Vec::new();
        loop {
            let (message_type, payload) = self.read_response()?;
            if message_type != self.text_type_in {
                return Err(SessionError::UnexpectedMessageType {
                    message_type,
                    payload,
                });
            }
            buffer.extend_from_slice(&payload);
            if text::is_complete(&buffer) {
                break;
            }
        }

        text::parse_reply(&buffer)
    }

    /// Send a text command and decode the validated body (spec.md §4.6,
    /// `send_text_command`).
    pub fn send_text_command(&mut self, command: &[u8]) -> Result<String> {
        let body = self.send_text_command_raw(command)?;
        Ok(text::decode(&body, &self.encoding))
    }

    /// Send a text command expecting a multirecord reply (spec.md §4.6,
    /// `query_multirecord`).
    pub fn query_multirecord(&mut self, command: &[u8]) -> Result<Vec<Record>> {
        let body = self.send_text_command_raw(command)?;
        text::parse_multirecord(&body, &self.encoding)
    }
}
