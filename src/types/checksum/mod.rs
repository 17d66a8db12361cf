#![forbid(unsafe_code)]

//! CRC32 over log frames.

/// Checksum of one log frame, salted with its sequence number so a frame
/// replayed at another position fails verification.
pub fn frame_crc32(lsn: u64, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&lsn.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}
