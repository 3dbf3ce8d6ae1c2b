//! Record protection for encrypted-profile sessions (spec.md §4.4).
//!
//! Once a handshake installs [`SessionKeys`], every frame other than the
//! always-unencrypted types is wrapped with [`protect`] on the way out and
//! unwrapped with [`unprotect`] on the way in. The two operations are
//! deliberately asymmetric in which frame bytes they touch — that mirrors
//! the device's own framing, not an inconsistency in this crate.

use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::speck;

/// `(enc_key, mac_key)` installed by the handshake (spec.md §4.5.1 step 9).
///
/// Zeroized on drop, the way `nomad_protocol::crypto::aead::SessionKey`
/// zeroizes its XChaCha20 key.
#[derive(Clone)]
pub struct SessionKeys {
    enc_key: u128,
    mac_key: u128,
}

impl SessionKeys {
    pub fn new(enc_key: u128, mac_key: u128) -> Self {
        Self { enc_key, mac_key }
    }

    pub fn enc_key(&self) -> u128 {
        self.enc_key
    }

    pub fn mac_key(&self) -> u128 {
        self.mac_key
    }
}

impl Drop for SessionKeys {
    fn drop(&mut self) {
        self.enc_key.zeroize();
        self.mac_key.zeroize();
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys").finish_non_exhaustive()
    }
}

/// The sentinel IV used for outbound record protection. By device
/// convention this stands in for IV=0 because of a padding quirk — do not
/// "fix" this to `0`, it will not interoperate (spec.md §9).
const OUTBOUND_SENTINEL_IV: u64 = 0xFF;

/// Encrypt and MAC a cleartext 65-byte frame in place (spec.md §4.4, Protect).
///
/// `frame[2..57)` (55 bytes) is encrypted, `frame[57..61)` is zeroed, and the
/// high 4 bytes of the little-endian MAC tag are written to `frame[61..65)`.
pub fn protect(keys: &SessionKeys, frame: &mut [u8; 65]) {
    let ciphertext = speck::stream_xor(keys.enc_key(), OUTBOUND_SENTINEL_IV, &frame[2..57]);
    frame[2..57].copy_from_slice(&ciphertext);
    frame[57..61].copy_from_slice(&[0u8; 4]);

    let tag = speck::cmac(keys.mac_key(), &frame[1..61]);
    let tag_bytes = tag.to_le_bytes();
    frame[61..65].copy_from_slice(&tag_bytes[4..8]);
}

/// Verify and decrypt an inbound 65-byte frame in place (spec.md §4.4, Unprotect).
///
/// Inbound HID reads carry no report-id byte, so `frame[0]` here is the
/// message type, not a report id. The MAC covers `frame[0..60)` (type
/// included), unlike the outbound MAC which starts one byte later, and is
/// checked against the high 4 bytes of the little-endian tag, same as
/// `protect` writes. On success, `frame[1..56)` holds the decrypted payload.
pub fn unprotect(keys: &SessionKeys, frame: &mut [u8; 65]) -> Result<(), CryptoError> {
    let tag = speck::cmac(keys.mac_key(), &frame[0..60]);
    let tag_bytes = tag.to_le_bytes();
    if tag_bytes[4..8] != frame[60..64] {
        return Err(CryptoError::IntegrityError);
    }

    let iv = (u32::from_be_bytes([frame[56], frame[57], frame[58], frame[59]]) as u64) << 8;
    let plaintext = speck::stream_xor(keys.enc_key(), iv, &frame[1..56]);
    frame[1..56].copy_from_slice(&plaintext);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame;

    fn test_keys() -> SessionKeys {
        SessionKeys::new(0x1122_3344_5566_7788_99aa_bbcc_ddee_ff00, 0xdead_beef_cafe_babe)
    }

    /// Build the "inbound" framing an encrypted device would have sent:
    /// protect the cleartext frame the outbound way, then reshape it into
    /// the inbound MAC-coverage-and-IV layout unprotect expects.
    fn make_inbound(keys: &SessionKeys, message_type: u8, payload: &[u8]) -> [u8; 65] {
        let mut frame = frame::encode(message_type, payload).unwrap();
        let plaintext_55 = frame[2..57].to_vec();

        let iv: u64 = 0x0102_0304_05;
        let ciphertext = speck::stream_xor(keys.enc_key(), iv, &plaintext_55[1..56]);

        let mut inbound = [0u8; 65];
        inbound[0] = 0; // report id
        inbound[1..56].copy_from_slice(&ciphertext);
        let iv_field = ((iv >> 8) as u32).to_be_bytes();
        inbound[56..60].copy_from_slice(&iv_field);

        let tag = speck::cmac(keys.mac_key(), &inbound[0..60]);
        inbound[60..64].copy_from_slice(&tag.to_le_bytes()[4..8]);
        inbound
    }

    #[test]
    fn protect_changes_the_ciphertext_region_and_writes_a_tag() {
        let keys = test_keys();
        let mut frame = frame::encode(0x21, b"hello").unwrap();
        let original = frame;
        protect(&keys, &mut frame);
        assert_ne!(frame[2..57], original[2..57]);
        assert_eq!(&frame[57..61], &[0, 0, 0, 0]);
        assert_ne!(&frame[61..65], &[0, 0, 0, 0]);
    }

    #[test]
    fn unprotect_recovers_original_payload() {
        let keys = test_keys();
        let payload = b"A1B2C3";
        let inbound = make_inbound(&keys, 0x21, payload);

        let mut frame = inbound;
        unprotect(&keys, &mut frame).unwrap();
        let (_, decoded_payload) = frame::decode(&frame);
        assert_eq!(decoded_payload, payload);
    }

    #[test]
    fn unprotect_rejects_tampered_mac_coverage() {
        let keys = test_keys();
        let mut inbound = make_inbound(&keys, 0x21, b"A1B2C3");

        for bit in 0..8 {
            let mut tampered = inbound;
            tampered[10] ^= 1 << bit;
            assert!(matches!(
                unprotect(&keys, &mut tampered),
                Err(CryptoError::IntegrityError)
            ));
        }

        // Sanity: the untampered frame still verifies.
        unprotect(&keys, &mut inbound).unwrap();
    }

    #[test]
    fn wrong_mac_key_fails_verification() {
        let keys = test_keys();
        let other = SessionKeys::new(keys.enc_key(), keys.mac_key() ^ 1);
        let mut inbound = make_inbound(&keys, 0x21, b"A1B2C3");
        assert!(matches!(
            unprotect(&other, &mut inbound),
            Err(CryptoError::IntegrityError)
        ));
    }
}
