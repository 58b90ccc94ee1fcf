//! Shared protocol logic for the client and server halves
//!
//! Header encoding, payload size validation, text payload codec and the
//! flat-name checks that keep every peer-supplied filename inside its root.

use crate::error::{Result, SyncError};
use crate::protocol::{HEADER_LEN, MAX_FILENAME_LEN};
use std::path::{Path, PathBuf};

/// Build frame header (8 bytes)
/// Format: TYPE (4) | LENGTH (4), network byte order
pub fn build_frame_header(frame_type: u32, payload_len: u32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(&frame_type.to_be_bytes());
    header[4..8].copy_from_slice(&payload_len.to_be_bytes());
    header
}

/// Parse frame header
/// Returns: (frame_type, payload_length)
pub fn parse_frame_header(header: &[u8; HEADER_LEN]) -> (u32, u32) {
    let frame_type = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let payload_len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    (frame_type, payload_len)
}

pub fn validate_frame_size(size: usize, max: usize) -> Result<()> {
    if size > max {
        return Err(SyncError::Protocol(format!(
            "frame payload too large: {} bytes (max: {})",
            size, max
        )));
    }
    Ok(())
}

/// Filenames travel as flat names: no separators, no traversal, no NUL.
pub fn validate_flat_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(SyncError::protocol("empty filename"));
    }
    if name.len() > MAX_FILENAME_LEN {
        return Err(SyncError::Protocol(format!(
            "filename too long: {} bytes (max: {})",
            name.len(),
            MAX_FILENAME_LEN
        )));
    }
    if name == "." || name == ".." {
        return Err(SyncError::Protocol(format!("disallowed filename {:?}", name)));
    }
    if name.contains('\0') {
        return Err(SyncError::protocol("filename contains NUL byte"));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(SyncError::Protocol(format!(
            "filename {:?} contains a path separator",
            name
        )));
    }
    Ok(())
}

pub fn resolve_under_root(root: &Path, name: &str) -> Result<PathBuf> {
    validate_flat_name(name)?;
    Ok(root.join(name))
}

/// Text payloads carry one terminating NUL, as the C peers send `strlen + 1`.
pub fn encode_text(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len() + 1);
    out.extend_from_slice(text.as_bytes());
    out.push(0);
    out
}

/// Accepts the payload with or without its terminating NUL.
pub fn decode_text(payload: &[u8]) -> Result<String> {
    let body = match payload.split_last() {
        Some((0, rest)) => rest,
        _ => payload,
    };
    if body.contains(&0) {
        return Err(SyncError::protocol("text payload contains embedded NUL"));
    }
    String::from_utf8(body.to_vec())
        .map_err(|e| SyncError::Protocol(format!("text payload is not UTF-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MsgType;
    use tempfile::TempDir;

    #[test]
    fn test_frame_header_is_network_order() {
        let header = build_frame_header(MsgType::Pull.code(), 0x0102_0304);
        assert_eq!(header, [0, 0, 0, 3, 1, 2, 3, 4]);
        assert_eq!(parse_frame_header(&header), (3, 0x0102_0304));
    }

    #[test]
    fn test_validate_frame_size_edge_cases() {
        assert!(validate_frame_size(0, 16).is_ok()); // Empty payload is valid
        assert!(validate_frame_size(16, 16).is_ok());
        assert!(matches!(
            validate_frame_size(17, 16),
            Err(SyncError::Protocol(_))
        ));
        assert!(validate_frame_size(usize::MAX, 16).is_err());
    }

    #[test]
    fn test_flat_names_accepted() {
        for name in ["a.txt", "report 2024.pdf", ".hidden", "..dots", "ünïcode"] {
            assert!(validate_flat_name(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn test_unsafe_names_rejected() {
        let long = "x".repeat(MAX_FILENAME_LEN + 1);
        for name in ["", ".", "..", "../etc/passwd", "sub/file", "dir\\file", "nul\0byte", &long] {
            assert!(validate_flat_name(name).is_err(), "{name:?}");
        }
    }

    #[test]
    fn test_resolve_under_root_stays_in_root() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        let p = resolve_under_root(root, "file.txt").unwrap();
        assert_eq!(p, root.join("file.txt"));
        assert!(resolve_under_root(root, "../escape.txt").is_err());
        assert!(resolve_under_root(root, "/etc/passwd").is_err());
    }

    #[test]
    fn test_text_payload_keeps_c_terminator() {
        let encoded = encode_text("b.txt");
        assert_eq!(encoded, b"b.txt\0");
        assert_eq!(decode_text(&encoded).unwrap(), "b.txt");
        // Peers that omit the terminator are accepted too
        assert_eq!(decode_text(b"b.txt").unwrap(), "b.txt");
        assert_eq!(decode_text(b"").unwrap(), "");
    }

    #[test]
    fn test_text_payload_rejects_inner_nul_and_bad_utf8() {
        assert!(decode_text(b"a\0b\0").is_err());
        assert!(decode_text(&[0xff, 0xfe, 0]).is_err());
    }
}
