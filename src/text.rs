//! Text-Reply Assembler (spec.md §4.6).
//!
//! Pure, transport-agnostic parsing: [`crate::session::Session`] owns the
//! read loop and hands the accumulated buffer here once a completion
//! sentinel is seen. Grammar and checksum discipline are grounded directly
//! on the regex patterns spec.md §4.6 gives (which in turn transcribe
//! `_session.py`'s `_TEXT_REPLY_FORMAT`/`_MULTIRECORDS_FORMAT`), compiled
//! once via `once_cell::sync::Lazy` the way `keepkey_rust`'s own
//! `Cargo.toml` already pulls in `once_cell` for.

use once_cell::sync::Lazy;
use regex::bytes::Regex;

use crate::error::SessionError;

static COMPLETION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"CMD (?:OK|Fail!)").unwrap());

static TRAILER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^(?P<body>.*)CKSM:(?P<checksum>[0-9A-F]{8})\r\nCMD (?P<status>OK|Fail!)\r\n$")
        .unwrap()
});

static MULTIRECORD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^(?P<body>.+\r\n)(?P<count>[0-9]+),(?P<checksum>[0-9A-F]{8})\r\n$").unwrap());

const LOG_EMPTY: &[u8] = b"Log Empty\r\n";

/// True once `buffer` contains the `CMD OK`/`CMD Fail!` completion token on
/// its own `\r\n`-terminated line, wherever it occurs in the stream so far.
pub fn is_complete(buffer: &[u8]) -> bool {
    COMPLETION_RE.is_match(buffer)
}

fn verify_checksum(body: &[u8], checksum_hex: &[u8]) -> Result<(), SessionError> {
    let expected = u32::from_str_radix(std::str::from_utf8(checksum_hex).unwrap(), 16)
        .map_err(|_| SessionError::MalformedReply(checksum_hex.to_vec()))?;
    let calculated: u32 = body.iter().fold(0u32, |acc, &b| acc.wrapping_add(b as u32));
    if expected != calculated {
        return Err(SessionError::ChecksumError {
            expected,
            calculated,
        });
    }
    Ok(())
}

/// Parse a completed text-reply buffer against the trailer grammar, verify
/// its checksum, and return the raw body bytes on success (spec.md §4.6
/// steps 3-6).
pub fn parse_reply(buffer: &[u8]) -> Result<Vec<u8>, SessionError> {
    let caps = TRAILER_RE
        .captures(buffer)
        .ok_or_else(|| SessionError::MalformedReply(buffer.to_vec()))?;

    let body = caps.name("body").unwrap().as_bytes();
    let checksum = caps.name("checksum").unwrap().as_bytes();
    let status = caps.name("status").unwrap().as_bytes();

    verify_checksum(body, checksum)?;

    if status != b"OK" {
        return Err(SessionError::CommandFailed(body.to_vec()));
    }

    Ok(body.to_vec())
}

/// Decode validated body bytes using the session's encoding label, with
/// lossy replacement on invalid sequences (spec.md §3, `encoding`).
///
/// `"ascii"` is decoded as strict US-ASCII with `\u{FFFD}` replacement for
/// bytes `>= 0x80`, matching `_session.py`'s `bytes.decode("ascii",
/// "replace")` rather than falling through to a Latin-1-family codec.
pub fn decode(body: &[u8], encoding_label: &str) -> String {
    if encoding_label.eq_ignore_ascii_case("ascii") {
        return body
            .iter()
            .map(|&b| if b < 0x80 { b as char } else { '\u{FFFD}' })
            .collect();
    }

    let encoding =
        encoding_rs::Encoding::for_label(encoding_label.as_bytes()).unwrap_or(encoding_rs::WINDOWS_1252);
    let (decoded, _) = encoding.decode_without_bom_handling(body);
    decoded.into_owned()
}

/// A single CSV-style multirecord row.
pub type Record = Vec<String>;

/// Parse a text-command body as a multirecord reply (spec.md §4.6,
/// `query_multirecord`). Returns `Ok(vec![])` for the `Log Empty` sentinel.
///
/// The declared record count is parsed but never compared against the
/// number of rows actually emitted; that leniency is load-bearing for
/// compatibility (spec.md §9) and not a bug.
pub fn parse_multirecord(body: &[u8], encoding_label: &str) -> Result<Vec<Record>, SessionError> {
    if body == LOG_EMPTY {
        return Ok(Vec::new());
    }

    let caps = MULTIRECORD_RE
        .captures(body)
        .ok_or_else(|| SessionError::MalformedReply(body.to_vec()))?;

    let records_raw = caps.name("body").unwrap().as_bytes();
    let checksum = caps.name("checksum").unwrap().as_bytes();
    // The declared count is intentionally unused beyond parsing.
    let _count = caps.name("count").unwrap().as_bytes();

    verify_checksum(records_raw, checksum)?;

    let records_str = decode(records_raw, encoding_label);
    Ok(records_str
        .split("\r\n")
        .map(|line| line.split(',').map(str::to_owned).collect())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checksum_hex(body: &[u8]) -> String {
        let sum: u32 = body.iter().fold(0u32, |acc, &b| acc.wrapping_add(b as u32));
        format!("{:08X}", sum)
    }

    #[test]
    fn completion_token_detected_anywhere_in_stream() {
        assert!(is_complete(b"partial...CMD OK\r\n"));
        assert!(is_complete(b"partial...CMD Fail!\r\n"));
        assert!(!is_complete(b"still waiting"));
    }

    #[test]
    fn s3_text_ok_round_trip() {
        let body = b"hello\r\n";
        let trailer = format!("CKSM:{}\r\nCMD OK\r\n", checksum_hex(body));
        let mut buffer = body.to_vec();
        buffer.extend_from_slice(trailer.as_bytes());

        let parsed = parse_reply(&buffer).unwrap();
        assert_eq!(parsed, body);
        assert_eq!(decode(&parsed, "ascii"), "hello\r\n");
    }

    #[test]
    fn s4_checksum_mismatch_is_rejected() {
        let body = b"hello\r\n";
        let mut buffer = body.to_vec();
        buffer.extend_from_slice(b"CKSM:00000001\r\nCMD OK\r\n");

        assert!(matches!(
            parse_reply(&buffer),
            Err(SessionError::ChecksumError { .. })
        ));
    }

    #[test]
    fn s5_command_failure_carries_body() {
        let body = b"bad stuff\r\n";
        let trailer = format!("CKSM:{}\r\nCMD Fail!\r\n", checksum_hex(body));
        let mut buffer = body.to_vec();
        buffer.extend_from_slice(trailer.as_bytes());

        match parse_reply(&buffer) {
            Err(SessionError::CommandFailed(b)) => assert_eq!(b, body),
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[test]
    fn malformed_trailer_is_rejected() {
        let buffer = b"no trailer here";
        assert!(matches!(
            parse_reply(buffer),
            Err(SessionError::MalformedReply(_))
        ));
    }

    #[test]
    fn checksum_law_single_byte_mutation_always_fails() {
        let body = b"the quick brown fox jumps";
        let good_hex = checksum_hex(body);
        let mut buffer = body.to_vec();
        buffer.extend_from_slice(format!("CKSM:{}\r\nCMD OK\r\n", good_hex).as_bytes());
        assert!(parse_reply(&buffer).is_ok());

        for i in 0..body.len() {
            let mut mutated = body.to_vec();
            mutated[i] ^= 0xFF;
            let mut tampered = mutated.clone();
            tampered.extend_from_slice(format!("CKSM:{}\r\nCMD OK\r\n", good_hex).as_bytes());
            assert!(matches!(
                parse_reply(&tampered),
                Err(SessionError::ChecksumError { .. })
            ));
        }
    }

    #[test]
    fn s6_multirecord_empty_log() {
        let records = parse_multirecord(LOG_EMPTY, "ascii").unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn s7_multirecord_records() {
        let records_raw = b"a,1\r\nb,2\r\n";
        let trailer = format!("3,{}\r\n", checksum_hex(records_raw));
        let mut body = records_raw.to_vec();
        body.extend_from_slice(trailer.as_bytes());

        let records = parse_multirecord(&body, "ascii").unwrap();
        assert_eq!(
            records,
            vec![
                vec!["a".to_string(), "1".to_string()],
                vec!["b".to_string(), "2".to_string()],
                vec!["".to_string()],
            ]
        );
    }

    #[test]
    fn multirecord_checksum_mismatch_is_rejected() {
        let records_raw = b"a,1\r\n";
        let mut body = records_raw.to_vec();
        body.extend_from_slice(b"1,00000000\r\n");
        assert!(matches!(
            parse_multirecord(&body, "ascii"),
            Err(SessionError::ChecksumError { .. })
        ));
    }
}
