//! Error taxonomy of the engine.
//!
//! Errors carry their propagation class; the [`ErrorContext`] travels down
//! the request path as a side channel for capacity and media flags, so the
//! front-end can map failures to SCSI results without string matching.

use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum DedupError {
    /// Transient condition; the caller may retry with bounded back-off.
    #[error("resource busy: {0}")]
    Busy(String),
    #[error("timeout: {0}")]
    Timeout(String),
    /// The chunk store or log is out of space.
    #[error("storage full: {0}")]
    Full(String),
    /// On-disk state is damaged; the subsystem refuses to continue.
    #[error("integrity error: {0}")]
    Integrity(String),
    /// Precondition violation or impossible state.
    #[error("internal error: {0}")]
    Programming(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("index error: {0}")]
    Index(#[from] bds_index::IndexError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DedupError {
    pub fn busy<S: fmt::Display>(msg: S) -> Self {
        DedupError::Busy(msg.to_string())
    }

    pub fn full<S: fmt::Display>(msg: S) -> Self {
        DedupError::Full(msg.to_string())
    }

    pub fn integrity<S: fmt::Display>(msg: S) -> Self {
        DedupError::Integrity(msg.to_string())
    }

    pub fn programming<S: fmt::Display>(msg: S) -> Self {
        DedupError::Programming(msg.to_string())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, DedupError::Busy(_) | DedupError::Timeout(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, DedupError::Integrity(_))
    }
}

pub type Result<T> = std::result::Result<T, DedupError>;

/// Accumulates error flags across a request. A failed operation that set no
/// flag is a programming error by contract.
#[derive(Debug, Default, Clone)]
pub struct ErrorContext {
    pub full: bool,
    pub read_error: bool,
    pub write_error: bool,
    pub detail: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_full(&mut self) {
        self.full = true;
    }

    pub fn set_read_error(&mut self) {
        self.read_error = true;
    }

    pub fn set_write_error(&mut self) {
        self.write_error = true;
    }

    pub fn set_detail<S: fmt::Display>(&mut self, detail: S) {
        self.detail = Some(detail.to_string());
    }

    pub fn has_flag(&self) -> bool {
        self.full || self.read_error || self.write_error
    }

    /// Fold an error into the context flags.
    pub fn record(&mut self, err: &DedupError) {
        match err {
            DedupError::Full(_) => self.set_full(),
            DedupError::Io(_) | DedupError::Integrity(_) => self.set_read_error(),
            _ => {}
        }
        self.set_detail(err);
    }
}
