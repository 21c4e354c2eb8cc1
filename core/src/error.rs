use thiserror::Error;

/// Error categories surfaced by the NTFS core.
///
/// Each variant corresponds to one of the policy categories in the on-disk
/// contract: callers branch on the variant, not on the message text.
#[derive(Debug, Error)]
pub enum NtfsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Exists(String),

    #[error("no space left on device")]
    NoSpace,

    #[error("MFT record has no room for a {0}-byte attribute")]
    NoRoom(u32),

    #[error("on-disk corruption: {0}")]
    BadFormat(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("value too large: {0}")]
    TooLarge(String),

    #[error("name too long ({0} UTF-16 code units, max 255)")]
    NameTooLong(usize),

    #[error("directory not empty")]
    NotEmpty,

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("$LogFile replay required before this volume can be written")]
    ReplayNeeded,

    #[error("{0}")]
    Other(String),
}

pub type NtfsResult<T> = Result<T, NtfsError>;

impl NtfsError {
    /// True for the categories that mark the volume dirty on a non-forced mount.
    pub fn marks_volume_dirty(&self) -> bool {
        matches!(self, NtfsError::BadFormat(_))
    }
}
