//! Migration stage tracking.
//!
//! A single atomic integer readable from every background task. Transitions
//! are monotonic over the lifecycle ordering below; the one sanctioned
//! exception is the checksum retry loop, which re-enters `Checksum` from
//! itself after resetting its watermark.

use std::sync::atomic::{AtomicI32, Ordering};

use serde::{Deserialize, Serialize};

/// Lifecycle stage of a migration. Ordinal order is lifecycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(i32)]
pub enum Stage {
    /// Not yet running.
    Init = 0,
    /// Copier is consuming the source key range.
    CopyRows = 1,
    /// Blocked on the operator-controlled sentinel table.
    WaitingOnSentinelTable = 2,
    /// Draining buffered binlog deltas.
    ApplyChangeset = 3,
    /// Refreshing shadow-table statistics before verification.
    AnalyzeTable = 4,
    /// Verifying source/shadow consistency.
    Checksum = 5,
    /// Draining deltas that accumulated during the checksum.
    PostChecksum = 6,
    /// Swapping tables under lock.
    CutOver = 7,
    /// Finished; resources released.
    Close = 8,
    /// Terminal failure state; shadow and checkpoint are left for resume.
    ErrCleanup = 9,
}

impl Stage {
    fn from_i32(v: i32) -> Stage {
        match v {
            0 => Stage::Init,
            1 => Stage::CopyRows,
            2 => Stage::WaitingOnSentinelTable,
            3 => Stage::ApplyChangeset,
            4 => Stage::AnalyzeTable,
            5 => Stage::Checksum,
            6 => Stage::PostChecksum,
            7 => Stage::CutOver,
            8 => Stage::Close,
            _ => Stage::ErrCleanup,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::CopyRows => write!(f, "copyRows"),
            Self::WaitingOnSentinelTable => write!(f, "waitingOnSentinelTable"),
            Self::ApplyChangeset => write!(f, "applyChangeset"),
            Self::AnalyzeTable => write!(f, "analyzeTable"),
            Self::Checksum => write!(f, "checksum"),
            Self::PostChecksum => write!(f, "postChecksum"),
            Self::CutOver => write!(f, "cutOver"),
            Self::Close => write!(f, "close"),
            Self::ErrCleanup => write!(f, "errCleanup"),
        }
    }
}

/// Atomically readable/writable stage register.
#[derive(Debug)]
pub struct StageRegister(AtomicI32);

impl StageRegister {
    /// A register starting at [`Stage::Init`].
    pub fn new() -> Self {
        Self(AtomicI32::new(Stage::Init as i32))
    }

    /// Current stage.
    pub fn get(&self) -> Stage {
        Stage::from_i32(self.0.load(Ordering::Acquire))
    }

    /// Move to `stage`.
    pub fn set(&self, stage: Stage) {
        self.0.store(stage as i32, Ordering::Release);
    }
}

impl Default for StageRegister {
    fn default() -> Self {
        Self::new()
    }
}
