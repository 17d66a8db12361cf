#![forbid(unsafe_code)]

//! Write-ahead log collaborator.
//!
//! The tree reports every record mutation and transaction outcome through a
//! [`LogSink`]. Frames are encoded with a CRC32 trailer salted by their LSN so a
//! sink can verify them on read back.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::trace;

use crate::types::{frame_crc32, CairnError, LockerId, Lsn, Result, TreeId};

const FRAME_MAGIC: [u8; 2] = *b"CW";
const FRAME_HEADER_LEN: usize = 2 + 1 + 4 + 8 + 4 + 4;
const FRAME_TRAILER_LEN: usize = 4;

/// Kind of a logged event.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LogKind {
    /// New record (or undeleted tombstone).
    Insert = 1,
    /// Data replaced in place.
    Update = 2,
    /// Record marked deleted.
    Delete = 3,
    /// Transaction committed.
    Commit = 4,
    /// Transaction aborted.
    Abort = 5,
}

impl TryFrom<u8> for LogKind {
    type Error = CairnError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(LogKind::Insert),
            2 => Ok(LogKind::Update),
            3 => Ok(LogKind::Delete),
            4 => Ok(LogKind::Commit),
            5 => Ok(LogKind::Abort),
            _ => Err(CairnError::Corruption("unknown log record kind")),
        }
    }
}

/// One logged event.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogRecord {
    /// Event kind.
    pub kind: LogKind,
    /// Tree the record belongs to; zero for transaction events.
    pub tree: TreeId,
    /// Locker that performed the change.
    pub locker: LockerId,
    /// Record key.
    pub key: Vec<u8>,
    /// Record data after the change.
    pub data: Vec<u8>,
}

impl LogRecord {
    /// Record mutation event.
    pub fn mutation(kind: LogKind, tree: TreeId, locker: LockerId, key: &[u8], data: &[u8]) -> Self {
        Self {
            kind,
            tree,
            locker,
            key: key.to_vec(),
            data: data.to_vec(),
        }
    }

    /// Transaction outcome event.
    pub fn outcome(kind: LogKind, locker: LockerId) -> Self {
        Self {
            kind,
            tree: TreeId(0),
            locker,
            key: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Encodes the record as a checksummed frame.
    pub fn encode(&self, lsn: Lsn) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(FRAME_HEADER_LEN + self.key.len() + self.data.len() + FRAME_TRAILER_LEN);
        buf.extend_from_slice(&FRAME_MAGIC);
        buf.push(self.kind as u8);
        buf.extend_from_slice(&self.tree.0.to_be_bytes());
        buf.extend_from_slice(&self.locker.0.to_be_bytes());
        buf.extend_from_slice(&(self.key.len() as u32).to_be_bytes());
        buf.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&self.data);
        let crc = frame_crc32(lsn.0, &buf);
        buf.extend_from_slice(&crc.to_be_bytes());
        buf
    }

    /// Decodes and verifies a frame produced by [`LogRecord::encode`].
    pub fn decode(lsn: Lsn, frame: &[u8]) -> Result<Self> {
        if frame.len() < FRAME_HEADER_LEN + FRAME_TRAILER_LEN {
            return Err(CairnError::Corruption("log frame truncated"));
        }
        let (body, trailer) = frame.split_at(frame.len() - FRAME_TRAILER_LEN);
        let stored = u32::from_be_bytes(read_array(trailer)?);
        if stored != frame_crc32(lsn.0, body) {
            return Err(CairnError::Corruption("log frame checksum mismatch"));
        }
        if body[0..2] != FRAME_MAGIC {
            return Err(CairnError::Corruption("log frame magic mismatch"));
        }
        let kind = LogKind::try_from(body[2])?;
        let tree = TreeId(u32::from_be_bytes(read_array(&body[3..7])?));
        let locker = LockerId(u64::from_be_bytes(read_array(&body[7..15])?));
        let key_len = u32::from_be_bytes(read_array(&body[15..19])?) as usize;
        let data_len = u32::from_be_bytes(read_array(&body[19..23])?) as usize;
        let payload = &body[FRAME_HEADER_LEN..];
        if payload.len() != key_len + data_len {
            return Err(CairnError::Corruption("log frame length mismatch"));
        }
        Ok(Self {
            kind,
            tree,
            locker,
            key: payload[..key_len].to_vec(),
            data: payload[key_len..].to_vec(),
        })
    }
}

fn read_array<const N: usize>(src: &[u8]) -> Result<[u8; N]> {
    src.get(..N)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(CairnError::Corruption("log frame field truncated"))
}

/// Statistics tracking log activity.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WalStats {
    /// Frames appended.
    pub frames_appended: u64,
    /// Bytes appended.
    pub bytes_appended: u64,
    /// Flush calls.
    pub syncs: u64,
}

/// Destination for log frames.
pub trait LogSink: Send + Sync {
    /// Appends a record and returns its LSN.
    fn append(&self, record: &LogRecord) -> Result<Lsn>;
    /// Makes every appended record durable.
    fn flush(&self) -> Result<()>;
    /// Activity counters.
    fn stats(&self) -> WalStats;
}

/// Sink that discards everything.
#[derive(Default, Debug)]
pub struct NoopLog {
    next_lsn: AtomicU64,
}

impl LogSink for NoopLog {
    fn append(&self, _record: &LogRecord) -> Result<Lsn> {
        Ok(Lsn(self.next_lsn.fetch_add(1, Ordering::Relaxed) + 1))
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn stats(&self) -> WalStats {
        WalStats::default()
    }
}

#[derive(Default)]
struct MemoryLogState {
    frames: Vec<(Lsn, Vec<u8>)>,
    next_lsn: u64,
    durable_lsn: Lsn,
    stats: WalStats,
}

/// Sink that keeps encoded frames in memory.
#[derive(Default)]
pub struct MemoryLog {
    state: Mutex<MemoryLogState>,
}

impl MemoryLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes every frame, verifying checksums.
    pub fn records(&self) -> Result<Vec<(Lsn, LogRecord)>> {
        let state = self.state.lock();
        state
            .frames
            .iter()
            .map(|(lsn, frame)| LogRecord::decode(*lsn, frame).map(|record| (*lsn, record)))
            .collect()
    }

    /// Highest LSN covered by a flush.
    pub fn durable_lsn(&self) -> Lsn {
        self.state.lock().durable_lsn
    }
}

impl LogSink for MemoryLog {
    fn append(&self, record: &LogRecord) -> Result<Lsn> {
        let mut state = self.state.lock();
        state.next_lsn += 1;
        let lsn = Lsn(state.next_lsn);
        let frame = record.encode(lsn);
        state.stats.frames_appended += 1;
        state.stats.bytes_appended += frame.len() as u64;
        state.frames.push((lsn, frame));
        trace!(lsn = lsn.0, kind = ?record.kind, "wal.append");
        Ok(lsn)
    }

    fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.durable_lsn = Lsn(state.next_lsn);
        state.stats.syncs += 1;
        Ok(())
    }

    fn stats(&self) -> WalStats {
        self.state.lock().stats.clone()
    }
}
