//! Scriptable in-process backend for unit tests

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use arcv_core::types::{
    ArchiveMediaRequest, ArchiveMediaResponse, ArchiveServiceCredential, ArchivedMediaObject,
    BackupInfo, BatchArchiveMediaItem, BatchArchiveMediaResponse, CdnReadCredentials,
    MediaItemsPage, RemoteAttachment, ResumableUploadSpec, ServiceCredentials, UploadForm,
};
use arcv_core::{start_of_day, ArchiveError, ArchiveResult, BackupLevel, SECONDS_PER_DAY};
use arcv_crypto::{issue_service_credential, BackupAuthCredential, BackupKey};

use crate::api::{ArchiveApi, UploadControl};
use crate::upload::UploadSource;

const ISSUER: [u8; 32] = [0x5a; 32];

pub(crate) struct StubApi {
    needs_credentials: bool,
    fetch_delay: Duration,
    credential_fetches: AtomicU64,
    fail_credentials: AtomicBool,
    network_failures: AtomicU32,
    rejections: AtomicU32,
    quota_full: AtomicBool,
    reservations: AtomicU32,
    key_registrations: AtomicU32,
    archive_calls: AtomicU32,
}

impl Default for StubApi {
    fn default() -> Self {
        Self {
            needs_credentials: true,
            fetch_delay: Duration::ZERO,
            credential_fetches: AtomicU64::new(0),
            fail_credentials: AtomicBool::new(false),
            network_failures: AtomicU32::new(0),
            rejections: AtomicU32::new(0),
            quota_full: AtomicBool::new(false),
            reservations: AtomicU32::new(0),
            key_registrations: AtomicU32::new(0),
            archive_calls: AtomicU32::new(0),
        }
    }
}

impl StubApi {
    pub fn with_fetch_delay(delay: Duration) -> Self {
        Self {
            fetch_delay: delay,
            ..Default::default()
        }
    }

    pub fn without_credentials() -> Self {
        Self {
            needs_credentials: false,
            ..Default::default()
        }
    }

    pub fn credential_fetches(&self) -> u64 {
        self.credential_fetches.load(Ordering::SeqCst)
    }

    pub fn fail_credentials(&self, fail: bool) {
        self.fail_credentials.store(fail, Ordering::SeqCst);
    }

    /// Fail the next `n` reservation / key registration calls with `Network`.
    pub fn fail_next_network(&self, n: u32) {
        self.network_failures.store(n, Ordering::SeqCst);
    }

    /// Reject the next `n` anonymous calls with `Authorization`.
    pub fn reject_next_credentials(&self, n: u32) {
        self.rejections.store(n, Ordering::SeqCst);
    }

    pub fn set_quota_full(&self, full: bool) {
        self.quota_full.store(full, Ordering::SeqCst);
    }

    pub fn reservations(&self) -> u32 {
        self.reservations.load(Ordering::SeqCst)
    }

    pub fn key_registrations(&self) -> u32 {
        self.key_registrations.load(Ordering::SeqCst)
    }

    pub fn archive_calls(&self) -> u32 {
        self.archive_calls.load(Ordering::SeqCst)
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn network(&self) -> ArchiveResult<()> {
        if Self::take(&self.network_failures) {
            return Err(ArchiveError::Network("connection reset".into()));
        }
        Ok(())
    }

    fn authorize(&self, key: &BackupKey, cred: &ArchiveServiceCredential) -> ArchiveResult<()> {
        if Self::take(&self.rejections) {
            return Err(ArchiveError::Authorization("credential rejected".into()));
        }
        self.get_zk_credential(key, cred).map(|_| ())
    }

    fn unsupported<T>(what: &str) -> ArchiveResult<T> {
        Err(ArchiveError::Protocol(format!("{what} is not scripted")))
    }
}

#[async_trait]
impl ArchiveApi for StubApi {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn requires_credentials(&self) -> bool {
        self.needs_credentials
    }

    async fn get_service_credentials(
        &self,
        current_time: u64,
    ) -> ArchiveResult<ServiceCredentials> {
        self.credential_fetches.fetch_add(1, Ordering::SeqCst);
        if !self.fetch_delay.is_zero() {
            tokio::time::sleep(self.fetch_delay).await;
        }
        if self.fail_credentials.load(Ordering::SeqCst) {
            return Err(ArchiveError::Network("credential endpoint unreachable".into()));
        }
        let start = start_of_day(current_time);
        let credentials = (0..7)
            .map(|d| {
                issue_service_credential(&ISSUER, BackupLevel::Media, start + d * SECONDS_PER_DAY)
            })
            .collect();
        Ok(ServiceCredentials { credentials })
    }

    async fn get_cdn_read_credentials(
        &self,
        _cdn: i32,
        key: &BackupKey,
        credential: &ArchiveServiceCredential,
    ) -> ArchiveResult<CdnReadCredentials> {
        self.authorize(key, credential)?;
        Ok(CdnReadCredentials::default())
    }

    async fn trigger_backup_id_reservation(&self, _key: &BackupKey) -> ArchiveResult<()> {
        self.reservations.fetch_add(1, Ordering::SeqCst);
        self.network()
    }

    async fn set_public_key(
        &self,
        key: &BackupKey,
        credential: &ArchiveServiceCredential,
    ) -> ArchiveResult<()> {
        self.authorize(key, credential)?;
        self.key_registrations.fetch_add(1, Ordering::SeqCst);
        self.network()
    }

    async fn get_message_backup_upload_form(
        &self,
        _key: &BackupKey,
        _credential: &ArchiveServiceCredential,
    ) -> ArchiveResult<UploadForm> {
        Self::unsupported("get_message_backup_upload_form")
    }

    async fn get_backup_info(
        &self,
        key: &BackupKey,
        credential: &ArchiveServiceCredential,
    ) -> ArchiveResult<BackupInfo> {
        self.authorize(key, credential)?;
        Ok(BackupInfo {
            cdn: 3,
            backup_dir: "dir".into(),
            media_dir: "media".into(),
            backup_name: "messageBackup".into(),
            object_length: 42,
            used_space: Some(42),
        })
    }

    async fn list_media_objects(
        &self,
        key: &BackupKey,
        credential: &ArchiveServiceCredential,
        _limit: u32,
        _cursor: Option<&str>,
    ) -> ArchiveResult<MediaItemsPage> {
        self.authorize(key, credential)?;
        Ok(MediaItemsPage::default())
    }

    async fn get_backup_resumable_upload_url(&self, _form: &UploadForm) -> ArchiveResult<String> {
        Self::unsupported("get_backup_resumable_upload_url")
    }

    async fn upload_backup_file(
        &self,
        _form: &UploadForm,
        _resumable_url: &str,
        _source: &dyn UploadSource,
        _length: u64,
        _control: &UploadControl,
    ) -> ArchiveResult<()> {
        Self::unsupported("upload_backup_file")
    }

    async fn get_media_upload_form(
        &self,
        _key: &BackupKey,
        _credential: &ArchiveServiceCredential,
    ) -> ArchiveResult<UploadForm> {
        Self::unsupported("get_media_upload_form")
    }

    async fn get_resumable_upload_spec(
        &self,
        _form: &UploadForm,
        _secret_key: Option<&[u8]>,
    ) -> ArchiveResult<ResumableUploadSpec> {
        Self::unsupported("get_resumable_upload_spec")
    }

    async fn upload_media_file(
        &self,
        _spec: &ResumableUploadSpec,
        _source: &dyn UploadSource,
        _length: u64,
        _control: &UploadControl,
    ) -> ArchiveResult<RemoteAttachment> {
        Self::unsupported("upload_media_file")
    }

    async fn archive_attachment_media(
        &self,
        key: &BackupKey,
        credential: &ArchiveServiceCredential,
        _item: &ArchiveMediaRequest,
    ) -> ArchiveResult<ArchiveMediaResponse> {
        self.archive_calls.fetch_add(1, Ordering::SeqCst);
        self.authorize(key, credential)?;
        if self.quota_full.load(Ordering::SeqCst) {
            return Err(ArchiveError::QuotaExceeded("no space left".into()));
        }
        Ok(ArchiveMediaResponse { cdn: 3 })
    }

    async fn archive_attachment_media_batch(
        &self,
        key: &BackupKey,
        credential: &ArchiveServiceCredential,
        items: &[ArchiveMediaRequest],
    ) -> ArchiveResult<BatchArchiveMediaResponse> {
        self.archive_calls.fetch_add(1, Ordering::SeqCst);
        self.authorize(key, credential)?;
        let full = self.quota_full.load(Ordering::SeqCst);
        let responses = items
            .iter()
            .map(|item| {
                if full {
                    BatchArchiveMediaItem::failure(&item.media_id, 413, "no space left")
                } else {
                    BatchArchiveMediaItem::success(&item.media_id, 3)
                }
            })
            .collect();
        Ok(BatchArchiveMediaResponse { responses })
    }

    async fn delete_archived_media(
        &self,
        key: &BackupKey,
        credential: &ArchiveServiceCredential,
        _items: &[ArchivedMediaObject],
    ) -> ArchiveResult<()> {
        self.authorize(key, credential)
    }

    fn get_zk_credential(
        &self,
        key: &BackupKey,
        credential: &ArchiveServiceCredential,
    ) -> ArchiveResult<BackupAuthCredential> {
        if !self.needs_credentials {
            return Ok(BackupAuthCredential::unissued(
                key,
                BackupLevel::Media,
                credential.redemption_time,
            ));
        }
        BackupAuthCredential::receive(key, credential)
            .map_err(|e| ArchiveError::Authorization(e.to_string()))
    }
}
