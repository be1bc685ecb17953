//! High-level backup flows over an [`ArchiveApi`]
//!
//! The session owns the backup key and a credential cache. Anonymous calls
//! are retried exactly once after an authorization failure, with the
//! rejected credential evicted first. After the service reports the quota
//! exhausted, further copies fail locally until [`ArchiveSession::reset_quota`].

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use arcv_core::types::{
    ArchiveMediaRequest, ArchiveMediaResponse, ArchiveServiceCredential, ArchivedMediaObject,
    BackupInfo, BatchArchiveMediaResponse, CdnReadCredentials, MediaItemsPage, RemoteAttachment,
    UploadForm,
};
use arcv_core::{ArchiveError, ArchiveResult};
use arcv_crypto::BackupKey;

use crate::api::{ArchiveApi, UploadControl};
use crate::credentials::CredentialCache;
use crate::upload::UploadSource;

pub const MARKER_INITIALIZED: &str = "backup.initialized";
pub const MARKER_UPLOADED: &str = "backup.uploaded";

/// Write-only sink for persisted client flags.
pub trait SettingsSink: Send + Sync {
    fn set_flag(&self, name: &str, value: bool);
}

/// Discards every flag.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSettings;

impl SettingsSink for NoopSettings {
    fn set_flag(&self, _name: &str, _value: bool) {}
}

/// A backup upload in progress: the form it came from and its session location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupUpload {
    pub form: UploadForm,
    pub resumable_url: String,
}

/// Failure of [`ArchiveSession::upload_backup`].
///
/// `upload` is the session the bytes went to, once one was opened. Hand it to
/// [`ArchiveSession::continue_backup_upload`] to resume instead of starting over.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct BackupUploadFailure {
    pub upload: Option<BackupUpload>,
    pub error: ArchiveError,
}

impl BackupUploadFailure {
    /// The session to continue, if the failure left it resumable.
    pub fn resumable_upload(&self) -> Option<&BackupUpload> {
        self.upload.as_ref().filter(|_| self.error.is_resumable())
    }
}

impl From<BackupUploadFailure> for ArchiveError {
    fn from(failure: BackupUploadFailure) -> Self {
        failure.error
    }
}

pub struct ArchiveSession {
    api: Arc<dyn ArchiveApi>,
    key: BackupKey,
    credentials: Arc<CredentialCache>,
    settings: Arc<dyn SettingsSink>,
    quota_exhausted: AtomicBool,
}

impl ArchiveSession {
    pub fn new(
        api: Arc<dyn ArchiveApi>,
        key: BackupKey,
        credentials: Arc<CredentialCache>,
    ) -> Self {
        Self {
            api,
            key,
            credentials,
            settings: Arc::new(NoopSettings),
            quota_exhausted: AtomicBool::new(false),
        }
    }

    pub fn with_settings(mut self, settings: Arc<dyn SettingsSink>) -> Self {
        self.settings = settings;
        self
    }

    pub fn api(&self) -> &Arc<dyn ArchiveApi> {
        &self.api
    }

    pub fn credentials(&self) -> &Arc<CredentialCache> {
        &self.credentials
    }

    pub fn quota_exhausted(&self) -> bool {
        self.quota_exhausted.load(Ordering::SeqCst)
    }

    /// Allow copies again, e.g. after the account's storage was upgraded.
    pub fn reset_quota(&self) {
        self.quota_exhausted.store(false, Ordering::SeqCst);
    }

    /// Reserve the backup id and register the public key.
    ///
    /// Both steps are idempotent and always performed; each is repeated once
    /// when its outcome is ambiguous (a transport failure).
    pub async fn initialize(&self) -> ArchiveResult<()> {
        retry_ambiguous("trigger_backup_id_reservation", || {
            self.api.trigger_backup_id_reservation(&self.key)
        })
        .await?;

        self.authorized(|cred| async move {
            retry_ambiguous("set_public_key", || self.api.set_public_key(&self.key, &cred)).await
        })
        .await?;

        self.settings.set_flag(MARKER_INITIALIZED, true);
        info!(backend = self.api.name(), backup_id = %self.key.backup_id(), "backup initialized");
        Ok(())
    }

    /// Obtain a form and open a resumable session for the main backup.
    pub async fn begin_backup_upload(&self) -> ArchiveResult<BackupUpload> {
        let form = self
            .authorized(|cred| async move {
                self.api.get_message_backup_upload_form(&self.key, &cred).await
            })
            .await?;
        let resumable_url = self.api.get_backup_resumable_upload_url(&form).await?;
        Ok(BackupUpload {
            form,
            resumable_url,
        })
    }

    /// Upload (or resume uploading) the main backup through `upload`.
    pub async fn continue_backup_upload(
        &self,
        upload: &BackupUpload,
        source: &dyn UploadSource,
        length: u64,
        control: &UploadControl,
    ) -> ArchiveResult<()> {
        self.api
            .upload_backup_file(&upload.form, &upload.resumable_url, source, length, control)
            .await?;
        self.settings.set_flag(MARKER_UPLOADED, true);
        Ok(())
    }

    /// Upload the main backup through a fresh session. On failure the
    /// session is returned with the error so the caller can resume it.
    pub async fn upload_backup(
        &self,
        source: &dyn UploadSource,
        length: u64,
        control: &UploadControl,
    ) -> Result<BackupUpload, BackupUploadFailure> {
        let upload = self
            .begin_backup_upload()
            .await
            .map_err(|error| BackupUploadFailure {
                upload: None,
                error,
            })?;
        match self
            .continue_backup_upload(&upload, source, length, control)
            .await
        {
            Ok(()) => Ok(upload),
            Err(error) => Err(BackupUploadFailure {
                upload: Some(upload),
                error,
            }),
        }
    }

    pub async fn backup_info(&self) -> ArchiveResult<BackupInfo> {
        self.authorized(|cred| async move { self.api.get_backup_info(&self.key, &cred).await })
            .await
    }

    pub async fn cdn_read_credentials(&self, cdn: i32) -> ArchiveResult<CdnReadCredentials> {
        self.authorized(|cred| async move {
            self.api
                .get_cdn_read_credentials(cdn, &self.key, &cred)
                .await
        })
        .await
    }

    pub async fn media_page(
        &self,
        limit: u32,
        cursor: Option<&str>,
    ) -> ArchiveResult<MediaItemsPage> {
        self.authorized(|cred| async move {
            self.api
                .get_archive_media_items_page(&self.key, &cred, limit, cursor)
                .await
        })
        .await
    }

    /// Every archived media object. Diagnostic only.
    pub async fn all_media(&self) -> ArchiveResult<Vec<arcv_core::types::StoredMediaObject>> {
        self.authorized(|cred| async move {
            self.api
                .debug_get_uploaded_media_item_metadata(&self.key, &cred)
                .await
        })
        .await
    }

    /// Upload an attachment to the transient area.
    pub async fn upload_media(
        &self,
        source: &dyn UploadSource,
        length: u64,
        control: &UploadControl,
    ) -> ArchiveResult<RemoteAttachment> {
        let form = self
            .authorized(|cred| async move {
                self.api.get_media_upload_form(&self.key, &cred).await
            })
            .await?;
        let spec = self.api.get_resumable_upload_spec(&form, None).await?;
        self.api
            .upload_media_file(&spec, source, length, control)
            .await
    }

    pub async fn archive_media(
        &self,
        item: &ArchiveMediaRequest,
    ) -> ArchiveResult<ArchiveMediaResponse> {
        self.check_quota()?;
        let result = self
            .authorized(|cred| async move {
                self.api
                    .archive_attachment_media(&self.key, &cred, item)
                    .await
            })
            .await;
        if let Err(ArchiveError::QuotaExceeded(reason)) = &result {
            self.halt_copies(reason);
        }
        result
    }

    /// Copy a batch. The response holds one entry per item, in order.
    pub async fn archive_media_batch(
        &self,
        items: &[ArchiveMediaRequest],
    ) -> ArchiveResult<BatchArchiveMediaResponse> {
        self.check_quota()?;
        let result = self
            .authorized(|cred| async move {
                self.api
                    .archive_attachment_media_batch(&self.key, &cred, items)
                    .await
            })
            .await;

        let response = match result {
            Ok(response) => response,
            Err(ArchiveError::QuotaExceeded(reason)) => {
                self.halt_copies(&reason);
                return Err(ArchiveError::QuotaExceeded(reason));
            }
            Err(e) => return Err(e),
        };
        if response.len() != items.len() {
            return Err(ArchiveError::Protocol(format!(
                "batch of {} items returned {} results",
                items.len(),
                response.len()
            )));
        }
        if response.quota_exhausted() {
            self.halt_copies("batch item reported 413");
        }
        Ok(response)
    }

    pub async fn delete_media(&self, items: &[ArchivedMediaObject]) -> ArchiveResult<()> {
        self.authorized(|cred| async move {
            self.api.delete_archived_media(&self.key, &cred, items).await
        })
        .await
    }

    fn check_quota(&self) -> ArchiveResult<()> {
        if self.quota_exhausted() {
            return Err(ArchiveError::QuotaExceeded(
                "copies halted after the archive reported its quota exhausted".into(),
            ));
        }
        Ok(())
    }

    fn halt_copies(&self, reason: &str) {
        if !self.quota_exhausted.swap(true, Ordering::SeqCst) {
            warn!(%reason, "archive quota exhausted, halting media copies");
        }
    }

    /// Run `op` with today's credential; on `Authorization`, evict it and
    /// run once more with a fresh one.
    async fn authorized<T, F, Fut>(&self, op: F) -> ArchiveResult<T>
    where
        F: Fn(ArchiveServiceCredential) -> Fut,
        Fut: Future<Output = ArchiveResult<T>>,
    {
        let cred = self.credentials.credential().await?;
        let day = cred.redemption_time;
        match op(cred).await {
            Err(ArchiveError::Authorization(reason)) if self.api.requires_credentials() => {
                warn!(day, %reason, "credential rejected, refreshing once");
                self.credentials.invalidate(day).await;
                let fresh = self.credentials.credential().await?;
                op(fresh).await
            }
            other => other,
        }
    }
}

impl std::fmt::Debug for ArchiveSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveSession")
            .field("backend", &self.api.name())
            .field("key", &self.key)
            .field("quota_exhausted", &self.quota_exhausted())
            .finish()
    }
}

/// Repeat `op` once if it failed with a transport error.
async fn retry_ambiguous<T, F, Fut>(what: &str, op: F) -> ArchiveResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = ArchiveResult<T>>,
{
    match op().await {
        Err(ArchiveError::Network(reason)) => {
            warn!(op = what, %reason, "ambiguous failure, repeating once");
            op().await
        }
        other => other,
    }
}
