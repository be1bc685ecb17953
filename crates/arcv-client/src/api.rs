//! The archive capability: one trait, two interchangeable backends
//!
//! Identified operations (credential fetch, backup-id reservation) run under
//! the account's own auth. Every other operation is anonymous: it carries a
//! fresh presentation derived from a daily service credential and the backup
//! key, so the service can authorize the call without learning who made it.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use arcv_core::types::{
    ArchiveMediaRequest, ArchiveMediaResponse, ArchiveServiceCredential, ArchivedMediaObject,
    BackupInfo, BatchArchiveMediaResponse, CdnReadCredentials, MediaItemsPage, RemoteAttachment,
    ResumableUploadSpec, ServiceCredentials, StoredMediaObject, UploadForm,
};
use arcv_core::ArchiveResult;
use arcv_crypto::{BackupAuthCredential, BackupKey};

use crate::upload::UploadSource;

/// Page size used when draining the media listing for diagnostics.
pub const DEBUG_PAGE_SIZE: u32 = 512;

/// Progress callback (bytes_acknowledged, bytes_total)
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Caller-side control over one upload.
#[derive(Clone, Default)]
pub struct UploadControl {
    /// Cancelling stops the upload and leaves server-side partial state for a resume.
    pub cancel: CancellationToken,
    pub progress: Option<ProgressFn>,
}

impl UploadControl {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub(crate) fn report(&self, acknowledged: u64, total: u64) {
        if let Some(progress) = &self.progress {
            progress(acknowledged, total);
        }
    }
}

impl std::fmt::Debug for UploadControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadControl")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// Every archive operation a client can perform.
///
/// Implemented by [`crate::network::NetworkArchiveApi`] (remote service) and
/// [`crate::local::LocalArchiveApi`] (on-device stand-in). Callers hold an
/// `Arc<dyn ArchiveApi>` chosen once by [`crate::selector::build_api`].
#[async_trait]
pub trait ArchiveApi: Send + Sync {
    /// Short backend name for logs and `status` output.
    fn name(&self) -> &'static str;

    /// Whether anonymous calls need a real service credential. When false,
    /// callers pass a placeholder.
    fn requires_credentials(&self) -> bool {
        true
    }

    /// Fetch daily credentials covering the window starting at `current_time`'s day.
    async fn get_service_credentials(&self, current_time: u64) -> ArchiveResult<ServiceCredentials>;

    /// Headers that grant read access to objects on `cdn`.
    async fn get_cdn_read_credentials(
        &self,
        cdn: i32,
        key: &BackupKey,
        credential: &ArchiveServiceCredential,
    ) -> ArchiveResult<CdnReadCredentials>;

    /// Reserve the backup id derived from `key`. Idempotent.
    async fn trigger_backup_id_reservation(&self, key: &BackupKey) -> ArchiveResult<()>;

    /// Register the key-derived public key that verifies presentations. Idempotent.
    async fn set_public_key(
        &self,
        key: &BackupKey,
        credential: &ArchiveServiceCredential,
    ) -> ArchiveResult<()>;

    async fn get_message_backup_upload_form(
        &self,
        key: &BackupKey,
        credential: &ArchiveServiceCredential,
    ) -> ArchiveResult<UploadForm>;

    /// Metadata of the current main backup. `NotFound` when none was uploaded.
    async fn get_backup_info(
        &self,
        key: &BackupKey,
        credential: &ArchiveServiceCredential,
    ) -> ArchiveResult<BackupInfo>;

    /// One page of the archived media listing. A page may hold fewer than
    /// `limit` items even when more follow; only a missing cursor ends it.
    async fn list_media_objects(
        &self,
        key: &BackupKey,
        credential: &ArchiveServiceCredential,
        limit: u32,
        cursor: Option<&str>,
    ) -> ArchiveResult<MediaItemsPage>;

    /// Exchange a form for a resumable session location. Consumes the form.
    async fn get_backup_resumable_upload_url(&self, form: &UploadForm) -> ArchiveResult<String>;

    /// Upload `length` bytes of `source` to a session created from `form`.
    async fn upload_backup_file(
        &self,
        form: &UploadForm,
        resumable_url: &str,
        source: &dyn UploadSource,
        length: u64,
        control: &UploadControl,
    ) -> ArchiveResult<()>;

    async fn get_media_upload_form(
        &self,
        key: &BackupKey,
        credential: &ArchiveServiceCredential,
    ) -> ArchiveResult<UploadForm>;

    /// Exchange a media form for a resumable upload spec. Generates a fresh
    /// attachment secret when `secret_key` is `None`. Consumes the form.
    async fn get_resumable_upload_spec(
        &self,
        form: &UploadForm,
        secret_key: Option<&[u8]>,
    ) -> ArchiveResult<ResumableUploadSpec>;

    /// Upload an attachment to the transient area; the result feeds
    /// [`ArchiveApi::archive_attachment_media`].
    async fn upload_media_file(
        &self,
        spec: &ResumableUploadSpec,
        source: &dyn UploadSource,
        length: u64,
        control: &UploadControl,
    ) -> ArchiveResult<RemoteAttachment>;

    /// Drain every media page. Diagnostic only.
    async fn debug_get_uploaded_media_item_metadata(
        &self,
        key: &BackupKey,
        credential: &ArchiveServiceCredential,
    ) -> ArchiveResult<Vec<StoredMediaObject>> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .get_archive_media_items_page(key, credential, DEBUG_PAGE_SIZE, cursor.as_deref())
                .await?;
            items.extend(page.stored_media_objects);
            match page.cursor {
                Some(next) if cursor.as_deref() == Some(next.as_str()) => {
                    return Err(arcv_core::ArchiveError::Protocol(
                        "media listing cursor did not advance".into(),
                    ));
                }
                Some(next) => cursor = Some(next),
                None => return Ok(items),
            }
        }
    }

    /// Same semantics as [`ArchiveApi::list_media_objects`].
    async fn get_archive_media_items_page(
        &self,
        key: &BackupKey,
        credential: &ArchiveServiceCredential,
        limit: u32,
        cursor: Option<&str>,
    ) -> ArchiveResult<MediaItemsPage> {
        self.list_media_objects(key, credential, limit, cursor).await
    }

    /// Copy one transient attachment into the media archive.
    async fn archive_attachment_media(
        &self,
        key: &BackupKey,
        credential: &ArchiveServiceCredential,
        item: &ArchiveMediaRequest,
    ) -> ArchiveResult<ArchiveMediaResponse>;

    /// Copy many attachments. Exactly one result per item, in input order.
    /// Not atomic: some items may succeed while others fail.
    async fn archive_attachment_media_batch(
        &self,
        key: &BackupKey,
        credential: &ArchiveServiceCredential,
        items: &[ArchiveMediaRequest],
    ) -> ArchiveResult<BatchArchiveMediaResponse>;

    /// Delete archived media. Absent objects are not an error.
    async fn delete_archived_media(
        &self,
        key: &BackupKey,
        credential: &ArchiveServiceCredential,
        items: &[ArchivedMediaObject],
    ) -> ArchiveResult<()>;

    /// Bind a service credential to `key`. Pure local computation.
    fn get_zk_credential(
        &self,
        key: &BackupKey,
        credential: &ArchiveServiceCredential,
    ) -> ArchiveResult<BackupAuthCredential>;
}
