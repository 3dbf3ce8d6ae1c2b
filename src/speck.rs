//! Speck-64/128 block cipher primitives (spec.md §4.2).
//!
//! Speck-64/128 operates on a 64-bit block split into two 32-bit words and
//! a 128-bit key split into four 32-bit words. This module implements the
//! block cipher, a counter-style stream built on top of it, a CMAC
//! construction, and the counter-mode KDF the handshake uses to derive
//! session keys. None of this exists as a published crate at this block
//! size, so it is written from the algorithm description rather than
//! wired to RustCrypto (contrast `nomad-protocol::crypto::aead`, which
//! reaches for `chacha20poly1305` because that primitive *is* available).

const ROUNDS: usize = 27;
const ALPHA: u32 = 8;
const BETA: u32 = 3;

/// GF(2^64) feedback polynomial x^64 + x^4 + x^3 + x + 1, low-order bits.
const RB: u64 = 0x1B;

fn block_from_bytes(b: &[u8]) -> (u32, u32) {
    let x = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
    let y = u32::from_le_bytes([b[4], b[5], b[6], b[7]]);
    (x, y)
}

fn block_to_bytes(x: u32, y: u32) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[0..4].copy_from_slice(&x.to_le_bytes());
    out[4..8].copy_from_slice(&y.to_le_bytes());
    out
}

fn key_words(key: u128) -> [u32; 4] {
    let bytes = key.to_le_bytes();
    [
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
    ]
}

/// Expand a 128-bit key into the 27 round keys used by encryption/decryption.
fn key_schedule(key: u128) -> [u32; ROUNDS] {
    let words = key_words(key);
    let mut k = [0u32; ROUNDS];
    let mut l = [0u32; ROUNDS + 2];
    k[0] = words[0];
    l[0] = words[1];
    l[1] = words[2];
    l[2] = words[3];

    for i in 0..ROUNDS - 1 {
        l[i + 3] = k[i].wrapping_add(l[i].rotate_right(ALPHA)) ^ (i as u32);
        k[i + 1] = k[i].rotate_left(BETA) ^ l[i + 3];
    }
    k
}

fn round(x: u32, y: u32, rk: u32) -> (u32, u32) {
    let x = x.rotate_right(ALPHA).wrapping_add(y) ^ rk;
    let y = y.rotate_left(BETA) ^ x;
    (x, y)
}

fn inv_round(x: u32, y: u32, rk: u32) -> (u32, u32) {
    let y = (y ^ x).rotate_right(BETA);
    let x = (x ^ rk).wrapping_sub(y).rotate_left(ALPHA);
    (x, y)
}

/// Encrypt a single 64-bit block under `key`.
pub fn block_encrypt(key: u128, block: u64) -> u64 {
    let rks = key_schedule(key);
    let (mut x, mut y) = block_from_bytes(&block.to_le_bytes());
    for rk in rks {
        (x, y) = round(x, y, rk);
    }
    u64::from_le_bytes(block_to_bytes(x, y))
}

/// Decrypt a single 64-bit block under `key`.
pub fn block_decrypt(key: u128, block: u64) -> u64 {
    let rks = key_schedule(key);
    let (mut x, mut y) = block_from_bytes(&block.to_le_bytes());
    for rk in rks.iter().rev() {
        (x, y) = inv_round(x, y, *rk);
    }
    u64::from_le_bytes(block_to_bytes(x, y))
}

/// XOR `data` with the keystream `BlockEncrypt(key, iv + i)` for each 8-byte
/// block at index `i`. Self-inverse: the same function implements both
/// `encrypt` and `decrypt` from spec.md §4.2.
///
/// `data` need not be a multiple of 8 bytes: the last keystream block is
/// truncated to whatever bytes remain (spec.md §9, the 55-byte quirk).
pub fn stream_xor(key: u128, iv: u64, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut counter = iv;
    for chunk in data.chunks(8) {
        let keystream = block_encrypt(key, counter).to_le_bytes();
        for (byte, ks) in chunk.iter().zip(keystream.iter()) {
            out.push(byte ^ ks);
        }
        counter = counter.wrapping_add(1);
    }
    out
}

fn gf_double(block: u64) -> u64 {
    let msb_set = (block >> 63) & 1 == 1;
    let shifted = block << 1;
    if msb_set {
        shifted ^ RB
    } else {
        shifted
    }
}

/// CMAC over `message` under `key`, following the usual two-subkey
/// construction with doubling in GF(2^64).
pub fn cmac(key: u128, message: &[u8]) -> u64 {
    let l = block_encrypt(key, 0);
    let k1 = gf_double(l);
    let k2 = gf_double(k1);

    let block_count = if message.is_empty() {
        1
    } else {
        message.len().div_ceil(8)
    };

    let mut mac = 0u64;
    for i in 0..block_count {
        let start = i * 8;
        let is_last = i == block_count - 1;
        let chunk = &message[start..message.len().min(start + 8)];

        let block = if is_last {
            let mut padded = [0u8; 8];
            if chunk.len() == 8 {
                padded.copy_from_slice(chunk);
                u64::from_le_bytes(padded) ^ k1
            } else {
                padded[..chunk.len()].copy_from_slice(chunk);
                padded[chunk.len()] = 0x80;
                u64::from_le_bytes(padded) ^ k2
            }
        } else {
            let mut full = [0u8; 8];
            full.copy_from_slice(chunk);
            u64::from_le_bytes(full)
        };

        mac = block_encrypt(key, mac ^ block);
    }
    mac
}

/// NIST-SP800-108-style counter-mode KDF built on [`cmac`].
///
/// For counters 1 and 2, computes
/// `CMAC(master, i_be32 ‖ label ‖ 0x00 ‖ context ‖ 0x0080_be16)` and
/// concatenates the two 64-bit tags into a 128-bit key.
pub fn derive(master_key: u128, label: &[u8; 8], context: &[u8]) -> u128 {
    let mut out = [0u8; 16];
    for (slot, counter) in [1u32, 2u32].iter().enumerate() {
        let mut message = Vec::with_capacity(4 + 8 + 1 + context.len() + 2);
        message.extend_from_slice(&counter.to_be_bytes());
        message.extend_from_slice(label);
        message.push(0x00);
        message.extend_from_slice(context);
        message.extend_from_slice(&0x0080u16.to_be_bytes());

        let tag = cmac(master_key, &message);
        out[slot * 8..slot * 8 + 8].copy_from_slice(&tag.to_le_bytes());
    }
    u128::from_le_bytes(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_round_trip() {
        let key = 0x0123_4567_89ab_cdef_fedc_ba98_7654_3210u128;
        for block in [0u64, 1, u64::MAX, 0xdead_beef_cafe_babe] {
            let ct = block_encrypt(key, block);
            assert_eq!(block_decrypt(key, ct), block);
        }
    }

    #[test]
    fn block_encrypt_is_not_identity() {
        let key = 0xdead_beefu128;
        assert_ne!(block_encrypt(key, 0), 0);
    }

    #[test]
    fn stream_xor_round_trips_at_and_off_block_boundary() {
        let key = 0xdead_beefu128;
        for len in [0usize, 1, 7, 8, 9, 55, 56] {
            let plaintext: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let ciphertext = stream_xor(key, 0xFF, &plaintext);
            assert_eq!(ciphertext.len(), plaintext.len());
            let decrypted = stream_xor(key, 0xFF, &ciphertext);
            assert_eq!(decrypted, plaintext);
        }
    }

    #[test]
    fn stream_xor_depends_on_iv() {
        let key = 0xdead_beefu128;
        let plaintext = [0x42u8; 16];
        let a = stream_xor(key, 0, &plaintext);
        let b = stream_xor(key, 1, &plaintext);
        assert_ne!(a, b);
    }

    #[test]
    fn cmac_is_deterministic_and_key_dependent() {
        let message = b"hello freestyle";
        let tag_a = cmac(0xdead_beef, message);
        let tag_b = cmac(0xdead_beef, message);
        let tag_c = cmac(0xdead_beef + 1, message);
        assert_eq!(tag_a, tag_b);
        assert_ne!(tag_a, tag_c);
    }

    #[test]
    fn cmac_empty_message_is_well_defined() {
        let _ = cmac(0xdead_beef, b"");
    }

    #[test]
    fn cmac_single_bit_flip_changes_tag() {
        let mut message = b"0123456789abcdef".to_vec();
        let tag_a = cmac(0xdead_beef, &message);
        message[3] ^= 0x01;
        let tag_b = cmac(0xdead_beef, &message);
        assert_ne!(tag_a, tag_b);
    }

    #[test]
    fn derive_produces_stable_128_bit_key() {
        let key_a = derive(0xdead_beef, b"AuthrEnc", b"serial-no-1");
        let key_b = derive(0xdead_beef, b"AuthrEnc", b"serial-no-1");
        let key_c = derive(0xdead_beef, b"AuthrMAC", b"serial-no-1");
        assert_eq!(key_a, key_b);
        assert_ne!(key_a, key_c);
    }
}
