//! # Result Codes
//!
//! Every fallible operation in this crate reports a [`ResultCode`]. The
//! taxonomy mirrors the classic storage-engine convention: the low 8 bits of
//! the integer value carry the *primary* code, and extended codes attach a
//! sub-reason in the bits above. `ErrorSnapshot` is `Error | (3 << 8)`, so
//! masking any extended code with `0xff` recovers its primary code.
//!
//! The integer values are stable: they may be persisted, logged, or compared
//! across versions. The `Display` implementation yields the canonical
//! lower-case name of each code.
//!
//! Codes are plain values, not wrapped exceptions. Constructor-style failures
//! (allocation, open) report `NoMem`/`CantOpen` like everything else.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ResultCode>;

/// Primary and extended result codes with stable integer values.
///
/// The primary code occupies the low 8 bits; extended codes are
/// `primary | (n << 8)`. Use [`ResultCode::primary`] to strip the extension.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
#[non_exhaustive]
pub enum ResultCode {
    /// Successful result. Never returned through `Err`; present so the full
    /// taxonomy round-trips through [`ResultCode::from_code`].
    #[error("ok")]
    Ok = 0,
    #[error("error")]
    Error = 1,
    #[error("internal")]
    Internal = 2,
    #[error("perm")]
    Perm = 3,
    #[error("abort")]
    Abort = 4,
    #[error("busy")]
    Busy = 5,
    #[error("locked")]
    Locked = 6,
    #[error("no_mem")]
    NoMem = 7,
    #[error("read_only")]
    ReadOnly = 8,
    #[error("interrupt")]
    Interrupt = 9,
    #[error("io_error")]
    IoError = 10,
    #[error("corrupt")]
    Corrupt = 11,
    #[error("not_found")]
    NotFound = 12,
    #[error("full")]
    Full = 13,
    #[error("cant_open")]
    CantOpen = 14,
    #[error("protocol")]
    Protocol = 15,
    #[error("empty")]
    Empty = 16,
    #[error("schema")]
    Schema = 17,
    #[error("too_big")]
    TooBig = 18,
    #[error("constraint")]
    Constraint = 19,
    #[error("mismatch")]
    Mismatch = 20,
    #[error("misuse")]
    Misuse = 21,
    #[error("no_lfs")]
    NoLfs = 22,
    #[error("auth")]
    Auth = 23,
    #[error("format")]
    Format = 24,
    #[error("range")]
    Range = 25,
    #[error("not_a_db")]
    NotADb = 26,
    #[error("notice")]
    Notice = 27,
    #[error("warning")]
    Warning = 28,
    #[error("row")]
    Row = 100,
    #[error("done")]
    Done = 101,

    // Extended codes: io_error family.
    #[error("io_error_read")]
    IoErrorRead = 266, // IoError | (1 << 8)
    #[error("io_error_short_read")]
    IoErrorShortRead = 522, // IoError | (2 << 8)
    #[error("io_error_write")]
    IoErrorWrite = 778, // IoError | (3 << 8)
    #[error("io_error_fsync")]
    IoErrorFsync = 1034, // IoError | (4 << 8)
    #[error("io_error_truncate")]
    IoErrorTruncate = 1546, // IoError | (6 << 8)
    #[error("io_error_fstat")]
    IoErrorFstat = 1802, // IoError | (7 << 8)
    #[error("io_error_unlock")]
    IoErrorUnlock = 2058, // IoError | (8 << 8)
    #[error("io_error_rdlock")]
    IoErrorRdlock = 2314, // IoError | (9 << 8)
    #[error("io_error_delete")]
    IoErrorDelete = 2570, // IoError | (10 << 8)
    #[error("io_error_lock")]
    IoErrorLock = 3850, // IoError | (15 << 8)
    #[error("io_error_seek")]
    IoErrorSeek = 5642, // IoError | (22 << 8)

    // Extended codes: busy family.
    #[error("busy_recovery")]
    BusyRecovery = 261, // Busy | (1 << 8)
    #[error("busy_timeout")]
    BusyTimeout = 773, // Busy | (3 << 8)

    // Extended codes: locked family.
    #[error("locked_shared_cache")]
    LockedSharedCache = 262, // Locked | (1 << 8)

    // Extended codes: read_only family.
    #[error("readonly_recovery")]
    ReadOnlyRecovery = 264, // ReadOnly | (1 << 8)
    #[error("readonly_rollback")]
    ReadOnlyRollback = 776, // ReadOnly | (3 << 8)

    // Extended codes: abort family.
    #[error("abort_rollback")]
    AbortRollback = 516, // Abort | (2 << 8)

    // Extended codes: corrupt family.
    #[error("corrupt_sequence")]
    CorruptSequence = 523, // Corrupt | (2 << 8)
}

impl ResultCode {
    /// The stable integer value of this code.
    #[inline]
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Strips the extension bits and returns the primary code.
    pub fn primary(self) -> ResultCode {
        Self::from_code(self.code() & 0xff).unwrap_or(ResultCode::Error)
    }

    /// Canonical lower-case name of the code, e.g. `"io_error_read"`.
    pub fn name(self) -> String {
        self.to_string()
    }

    /// Maps a stable integer value back to its code. Returns `None` for
    /// integers outside the taxonomy.
    pub fn from_code(code: u32) -> Option<ResultCode> {
        use ResultCode::*;
        let rc = match code {
            0 => Ok,
            1 => Error,
            2 => Internal,
            3 => Perm,
            4 => Abort,
            5 => Busy,
            6 => Locked,
            7 => NoMem,
            8 => ReadOnly,
            9 => Interrupt,
            10 => IoError,
            11 => Corrupt,
            12 => NotFound,
            13 => Full,
            14 => CantOpen,
            15 => Protocol,
            16 => Empty,
            17 => Schema,
            18 => TooBig,
            19 => Constraint,
            20 => Mismatch,
            21 => Misuse,
            22 => NoLfs,
            23 => Auth,
            24 => Format,
            25 => Range,
            26 => NotADb,
            27 => Notice,
            28 => Warning,
            100 => Row,
            101 => Done,
            266 => IoErrorRead,
            522 => IoErrorShortRead,
            778 => IoErrorWrite,
            1034 => IoErrorFsync,
            1546 => IoErrorTruncate,
            1802 => IoErrorFstat,
            2058 => IoErrorUnlock,
            2314 => IoErrorRdlock,
            2570 => IoErrorDelete,
            3850 => IoErrorLock,
            5642 => IoErrorSeek,
            261 => BusyRecovery,
            773 => BusyTimeout,
            262 => LockedSharedCache,
            264 => ReadOnlyRecovery,
            776 => ReadOnlyRollback,
            516 => AbortRollback,
            523 => CorruptSequence,
            _ => return None,
        };
        Some(rc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_codes_have_stable_values() {
        assert_eq!(ResultCode::Ok.code(), 0);
        assert_eq!(ResultCode::Error.code(), 1);
        assert_eq!(ResultCode::Busy.code(), 5);
        assert_eq!(ResultCode::Locked.code(), 6);
        assert_eq!(ResultCode::IoError.code(), 10);
        assert_eq!(ResultCode::Corrupt.code(), 11);
        assert_eq!(ResultCode::Full.code(), 13);
        assert_eq!(ResultCode::Row.code(), 100);
        assert_eq!(ResultCode::Done.code(), 101);
    }

    #[test]
    fn extended_codes_embed_their_primary() {
        assert_eq!(ResultCode::IoErrorRead.code(), 10 | (1 << 8));
        assert_eq!(ResultCode::IoErrorShortRead.code(), 10 | (2 << 8));
        assert_eq!(ResultCode::BusyRecovery.code(), 5 | (1 << 8));
        assert_eq!(ResultCode::LockedSharedCache.code(), 6 | (1 << 8));
        assert_eq!(ResultCode::ReadOnlyRollback.code(), 8 | (3 << 8));
    }

    #[test]
    fn primary_strips_extension_bits() {
        assert_eq!(ResultCode::IoErrorFsync.primary(), ResultCode::IoError);
        assert_eq!(ResultCode::BusyRecovery.primary(), ResultCode::Busy);
        assert_eq!(ResultCode::CorruptSequence.primary(), ResultCode::Corrupt);
        assert_eq!(ResultCode::Error.primary(), ResultCode::Error);
        assert_eq!(ResultCode::Ok.primary(), ResultCode::Ok);
    }

    #[test]
    fn names_are_canonical() {
        assert_eq!(ResultCode::Ok.name(), "ok");
        assert_eq!(ResultCode::NoMem.name(), "no_mem");
        assert_eq!(ResultCode::IoErrorRead.name(), "io_error_read");
        assert_eq!(ResultCode::NotADb.name(), "not_a_db");
        assert_eq!(ResultCode::ReadOnlyRollback.name(), "readonly_rollback");
    }

    #[test]
    fn from_code_round_trips() {
        for rc in [
            ResultCode::Ok,
            ResultCode::Corrupt,
            ResultCode::Done,
            ResultCode::IoErrorSeek,
            ResultCode::AbortRollback,
        ] {
            assert_eq!(ResultCode::from_code(rc.code()), Some(rc));
        }
        assert_eq!(ResultCode::from_code(0xdead_beef), None);
    }
}
