//! Resumable upload coordinator
//!
//! The coordinator never trusts its own idea of progress: each attempt starts
//! by asking the transport how many bytes the server holds, reopens the
//! source at that offset and streams fixed-size chunks from there. Transient
//! failures back off and resume; anything else ends the upload.

use std::collections::HashSet;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

use arcv_core::config::UploadConfig;
use arcv_core::types::{UploadForm, UploadProgress};
use arcv_core::{ArchiveError, ArchiveResult};

use crate::api::UploadControl;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Bytes to upload, reopenable at any offset so a resume never re-reads
/// from the start.
#[async_trait]
pub trait UploadSource: Send + Sync {
    async fn open_at(&self, offset: u64) -> io::Result<Box<dyn AsyncRead + Send + Unpin>>;
}

/// A file on disk.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Length of the file right now.
    pub async fn len(&self) -> io::Result<u64> {
        Ok(tokio::fs::metadata(&self.path).await?.len())
    }
}

#[async_trait]
impl UploadSource for FileSource {
    async fn open_at(&self, offset: u64) -> io::Result<Box<dyn AsyncRead + Send + Unpin>> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        Ok(Box::new(file))
    }
}

/// In-memory bytes.
#[derive(Debug, Clone)]
pub struct BytesSource(Bytes);

impl BytesSource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self(data.into())
    }

    pub fn len(&self) -> u64 {
        self.0.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[async_trait]
impl UploadSource for BytesSource {
    async fn open_at(&self, offset: u64) -> io::Result<Box<dyn AsyncRead + Send + Unpin>> {
        let start = usize::try_from(offset)
            .ok()
            .filter(|o| *o <= self.0.len())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("offset {offset} past end of {} bytes", self.0.len()),
                )
            })?;
        Ok(Box::new(io::Cursor::new(self.0.slice(start..))))
    }
}

/// One resumable session on the receiving side.
#[async_trait]
pub trait ResumableTransport: Send + Sync {
    /// Bytes the receiver has durably accepted.
    async fn query_offset(&self, total: u64) -> ArchiveResult<u64>;

    /// Send `chunk` starting at `offset`. Returns the new acknowledged offset.
    async fn put_chunk(&self, offset: u64, chunk: Bytes, total: u64) -> ArchiveResult<u64>;
}

/// Chunking and retry policy.
#[derive(Debug, Clone)]
pub struct UploadPolicy {
    pub chunk_size: usize,
    pub max_resume_attempts: u32,
    pub backoff: Duration,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self::from(&UploadConfig::default())
    }
}

impl From<&UploadConfig> for UploadPolicy {
    fn from(config: &UploadConfig) -> Self {
        Self {
            chunk_size: config.chunk_size.max(1),
            max_resume_attempts: config.max_resume_attempts,
            backoff: Duration::from_millis(config.backoff_ms),
        }
    }
}

/// Drives a [`ResumableTransport`] from an [`UploadSource`] until every byte
/// is acknowledged.
#[derive(Debug, Clone, Default)]
pub struct UploadCoordinator {
    policy: UploadPolicy,
}

impl UploadCoordinator {
    pub fn new(policy: UploadPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &UploadPolicy {
        &self.policy
    }

    /// Upload `total` bytes. Completes only when the receiver acknowledges
    /// all of them.
    ///
    /// Transient failures (transport errors, 5xx, 429) are resumed from the
    /// server's offset. After `max_resume_attempts` consecutive ones (the
    /// counter resets whenever progress is made), or on any other failure,
    /// the upload ends with `Transfer`, which carries the last acknowledged
    /// offset and the status of the response that ended it. Firing
    /// `control.cancel` ends it with `Cancelled`.
    pub async fn upload(
        &self,
        transport: &dyn ResumableTransport,
        source: &dyn UploadSource,
        total: u64,
        control: &UploadControl,
    ) -> ArchiveResult<UploadProgress> {
        let mut progress = UploadProgress::new(total);
        let mut failures = 0u32;
        let mut backoff = self.policy.backoff;
        let mut last_failure_offset = 0u64;

        loop {
            if control.cancel.is_cancelled() {
                return Err(cancelled(&progress));
            }

            let err = match self.attempt(transport, source, &mut progress, control).await {
                Ok(()) => {
                    info!(bytes = total, "upload complete");
                    return Ok(progress);
                }
                Err(e @ (ArchiveError::Transfer { .. } | ArchiveError::Cancelled { .. })) => {
                    return Err(e);
                }
                Err(e) if e.is_transient() => e,
                Err(e) => {
                    warn!(
                        acknowledged = progress.acknowledged,
                        total,
                        "upload failed: {e}"
                    );
                    return Err(transfer_failed(&progress, &e));
                }
            };

            if progress.acknowledged > last_failure_offset {
                failures = 0;
                backoff = self.policy.backoff;
            }
            last_failure_offset = progress.acknowledged;
            failures += 1;

            if failures > self.policy.max_resume_attempts {
                warn!(
                    acknowledged = progress.acknowledged,
                    total,
                    failures,
                    "upload giving up"
                );
                return Err(transfer_failed(&progress, &err));
            }

            let delay = match &err {
                ArchiveError::RateLimited {
                    retry_after: Some(after),
                } => backoff.max(*after).min(MAX_BACKOFF),
                _ => backoff,
            };
            warn!(
                acknowledged = progress.acknowledged,
                total,
                attempt = failures,
                backoff_ms = delay.as_millis() as u64,
                "transient upload failure, resuming: {err}"
            );
            tokio::select! {
                _ = control.cancel.cancelled() => return Err(cancelled(&progress)),
                _ = tokio::time::sleep(delay) => {}
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    async fn attempt(
        &self,
        transport: &dyn ResumableTransport,
        source: &dyn UploadSource,
        progress: &mut UploadProgress,
        control: &UploadControl,
    ) -> ArchiveResult<()> {
        let total = progress.total;
        let acked = transport.query_offset(total).await?;
        progress.acknowledge(acked)?;
        control.report(progress.acknowledged, total);
        debug!(offset = progress.acknowledged, total, "resuming from server offset");

        let mut reader = open_source(source, progress).await?;

        while !progress.is_complete() {
            let want = (self.policy.chunk_size as u64).min(progress.remaining()) as usize;
            let mut buf = vec![0u8; want];
            reader.read_exact(&mut buf).await.map_err(|e| {
                let reason = if e.kind() == io::ErrorKind::UnexpectedEof {
                    "source ended before the declared length".to_string()
                } else {
                    format!("reading source: {e}")
                };
                ArchiveError::Transfer {
                    acknowledged: progress.acknowledged,
                    total,
                    status: None,
                    reason,
                }
            })?;

            let offset = progress.acknowledged;
            let next = tokio::select! {
                biased;
                _ = control.cancel.cancelled() => return Err(cancelled(progress)),
                r = transport.put_chunk(offset, Bytes::from(buf), total) => r?,
            };
            progress.acknowledge(next)?;
            control.report(next, total);

            // The receiver may keep less than it was sent; re-read from what it holds.
            let expected = offset + want as u64;
            if next != expected {
                debug!(offset, expected, acknowledged = next, "partial acknowledgement");
                reader = open_source(source, progress).await?;
            }
        }

        Ok(())
    }
}

async fn open_source(
    source: &dyn UploadSource,
    progress: &UploadProgress,
) -> ArchiveResult<Box<dyn AsyncRead + Send + Unpin>> {
    source
        .open_at(progress.acknowledged)
        .await
        .map_err(|e| ArchiveError::Transfer {
            acknowledged: progress.acknowledged,
            total: progress.total,
            status: None,
            reason: format!("opening source at {}: {e}", progress.acknowledged),
        })
}

fn transfer_failed(progress: &UploadProgress, cause: &ArchiveError) -> ArchiveError {
    ArchiveError::Transfer {
        acknowledged: progress.acknowledged,
        total: progress.total,
        status: cause.status_code(),
        reason: cause.to_string(),
    }
}

fn cancelled(progress: &UploadProgress) -> ArchiveError {
    ArchiveError::Cancelled {
        acknowledged: progress.acknowledged,
        total: progress.total,
    }
}

/// Records which upload forms have been exchanged for a session.
///
/// Forms are single-use; presenting one again yields `ExpiredForm`. A form
/// whose session request never completed can be handed back with `release`.
#[derive(Debug, Default)]
pub struct FormLedger {
    consumed: Mutex<HashSet<String>>,
}

impl FormLedger {
    pub fn consume(&self, form: &UploadForm) -> ArchiveResult<()> {
        let mut consumed = self.consumed.lock().unwrap_or_else(PoisonError::into_inner);
        if consumed.insert(form.signed_upload_location.clone()) {
            Ok(())
        } else {
            Err(ArchiveError::ExpiredForm)
        }
    }

    /// Make `form` usable again after its session request failed.
    pub fn release(&self, form: &UploadForm) {
        let mut consumed = self.consumed.lock().unwrap_or_else(PoisonError::into_inner);
        consumed.remove(&form.signed_upload_location);
    }
}
