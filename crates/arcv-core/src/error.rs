use std::time::Duration;

use thiserror::Error;

pub type ArchiveResult<T> = Result<T, ArchiveError>;

/// Every failure an archive operation can surface.
///
/// Status-code bearing variants keep their code so callers can build a
/// sensible message; see [`ArchiveError::status_code`].
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Transport-level failure (connect, reset, timeout). Retryable.
    #[error("network error: {0}")]
    Network(String),

    /// Expected absence, e.g. no backup has been uploaded yet.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid or expired credential, presentation or signature.
    #[error("authorization failed: {0}")]
    Authorization(String),

    /// A single-use upload form was presented a second time.
    #[error("upload form already consumed or expired")]
    ExpiredForm,

    /// No archive space left. Further writes must stop.
    #[error("storage quota exhausted: {0}")]
    QuotaExceeded(String),

    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Bad arguments, or an anonymous endpoint was called on an identified channel.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Insufficient permissions for the presented credential level.
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("unexpected status {code}: {message}")]
    Status { code: u16, message: String },

    /// Upload gave up; `acknowledged` bytes are durable on the server and a
    /// retry resumes from there. `status` is the code of the response that
    /// ended it, if any.
    #[error("transfer failed at {acknowledged}/{total} bytes: {reason}")]
    Transfer {
        acknowledged: u64,
        total: u64,
        status: Option<u16>,
        reason: String,
    },

    #[error("transfer cancelled at {acknowledged}/{total} bytes")]
    Cancelled { acknowledged: u64, total: u64 },

    /// Some items of a batch failed: `(index, status)` pairs, index-aligned
    /// with the request list.
    #[error("{} of {total} batch items failed", .failed.len())]
    PartialBatchFailure {
        failed: Vec<(usize, u16)>,
        total: usize,
    },

    /// The peer answered with something that violates the wire contract.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ArchiveError {
    /// Map an HTTP-style status code to its error kind.
    pub fn from_status(
        code: u16,
        message: impl Into<String>,
        retry_after: Option<Duration>,
    ) -> Self {
        let message = message.into();
        match code {
            400 => ArchiveError::BadRequest(message),
            401 => ArchiveError::Authorization(message),
            403 => ArchiveError::Forbidden(message),
            404 => ArchiveError::NotFound(message),
            413 => ArchiveError::QuotaExceeded(message),
            429 => ArchiveError::RateLimited { retry_after },
            _ => ArchiveError::Status { code, message },
        }
    }

    /// The status code this error corresponds to, if it came from (or stands
    /// in for) a structured status response.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ArchiveError::BadRequest(_) => Some(400),
            ArchiveError::Authorization(_) => Some(401),
            ArchiveError::Forbidden(_) => Some(403),
            ArchiveError::NotFound(_) => Some(404),
            ArchiveError::QuotaExceeded(_) => Some(413),
            ArchiveError::RateLimited { .. } => Some(429),
            ArchiveError::Status { code, .. } => Some(*code),
            ArchiveError::Transfer { status, .. } => *status,
            _ => None,
        }
    }

    /// True for failures a caller may retry as-is (possibly after a delay).
    pub fn is_retryable(&self) -> bool {
        match self {
            ArchiveError::Network(_) | ArchiveError::RateLimited { .. } => true,
            ArchiveError::Status { code, .. } => *code >= 500,
            ArchiveError::Transfer { status, .. } => {
                status.map_or(true, |code| code >= 500 || code == 429)
            }
            _ => false,
        }
    }

    /// Failures an upload should ride out by re-querying the offset and resuming.
    pub fn is_transient(&self) -> bool {
        match self {
            ArchiveError::Network(_) | ArchiveError::RateLimited { .. } => true,
            ArchiveError::Status { code, .. } => *code >= 500,
            _ => false,
        }
    }

    /// Byte offset a later upload attempt can resume from.
    pub fn resume_offset(&self) -> Option<u64> {
        match self {
            ArchiveError::Transfer { acknowledged, .. }
            | ArchiveError::Cancelled { acknowledged, .. } => Some(*acknowledged),
            _ => None,
        }
    }

    /// True when continuing the same upload session can pick up at
    /// [`ArchiveError::resume_offset`].
    pub fn is_resumable(&self) -> bool {
        match self {
            ArchiveError::Cancelled { .. } => true,
            ArchiveError::Transfer { .. } => self.is_retryable(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ArchiveError::NotFound(_))
    }
}
