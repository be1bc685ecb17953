//! On-device archive stand-in over an OpenDAL operator
//!
//! Object layout under the operator root:
//! ```text
//! attachments/{key}                          transient media uploads
//! backups/{backup_id_hex}/messageBackup      main backup object
//! backups/{backup_id_hex}/media/{media_id}   archived media
//! uploads/{session_id}/session.json          staged upload session
//! uploads/{session_id}/part-{offset:020}     staged bytes
//! ```
//!
//! Every object reports `LOCAL_CDN`. Credential calls succeed with empty
//! results; nothing here talks to the archive service.
//!
//! A staged session is removed once its object is assembled. Opening a new
//! session first drops older sessions for the same object and any session
//! older than the resumable-spec lifetime.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use opendal::Operator;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use arcv_core::config::ArchiveConfig;
use arcv_core::types::{
    ArchiveMediaRequest, ArchiveMediaResponse, ArchiveServiceCredential, ArchivedMediaObject,
    BackupInfo, BatchArchiveMediaItem, BatchArchiveMediaResponse, CdnReadCredentials,
    MediaItemsPage, RemoteAttachment, ResumableUploadSpec, ServiceCredentials, StoredMediaObject,
    UploadForm,
};
use arcv_core::{ArchiveError, ArchiveResult, BackupLevel, Clock, SystemClock, LOCAL_CDN};
use arcv_crypto::{generate_attachment_secret, BackupAuthCredential, BackupId, BackupKey};

use crate::api::{ArchiveApi, UploadControl};
use crate::upload::{
    FormLedger, ResumableTransport, UploadCoordinator, UploadPolicy, UploadSource,
};

/// Name of the main backup object inside a backup directory.
pub const BACKUP_NAME: &str = "messageBackup";

/// Scheme of resumable locations handed out by the local store.
pub const SESSION_SCHEME: &str = "local-upload:";

const ATTACHMENTS: &str = "attachments";
const UPLOADS: &str = "uploads/";
const SPEC_LIFETIME_SECS: u64 = 7 * arcv_core::SECONDS_PER_DAY;

fn backup_dir(id: &BackupId) -> String {
    format!("backups/{}", id.to_hex())
}

fn media_dir(id: &BackupId) -> String {
    format!("{}/media", backup_dir(id))
}

fn backup_path(id: &BackupId) -> String {
    format!("{}/{BACKUP_NAME}", backup_dir(id))
}

fn media_path(id: &BackupId, media_id: &str) -> String {
    format!("{}/{media_id}", media_dir(id))
}

fn attachment_path(key: &str) -> String {
    format!("{ATTACHMENTS}/{key}")
}

fn session_dir(session_id: &str) -> String {
    format!("uploads/{session_id}/")
}

fn session_path(session_id: &str) -> String {
    format!("uploads/{session_id}/session.json")
}

fn part_path(session_id: &str, offset: u64) -> String {
    format!("uploads/{session_id}/part-{offset:020}")
}

/// Object names must be a single path segment.
fn validate_name(what: &str, name: &str) -> ArchiveResult<()> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(ArchiveError::BadRequest(format!("invalid {what}: {name:?}")));
    }
    Ok(())
}

fn storage_err(context: &str, e: opendal::Error) -> ArchiveError {
    if e.kind() == opendal::ErrorKind::NotFound {
        ArchiveError::NotFound(format!("{context}: {e}"))
    } else {
        ArchiveError::Storage(format!("{context}: {e}"))
    }
}

async fn stat_len(op: &Operator, path: &str) -> ArchiveResult<Option<u64>> {
    match op.stat(path).await {
        Ok(meta) => Ok(Some(meta.content_length())),
        Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(storage_err(path, e)),
    }
}

/// File names directly under `dir`, sorted. A missing directory is empty.
async fn list_names(op: &Operator, dir: &str) -> ArchiveResult<Vec<String>> {
    let entries = match op.list(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == opendal::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(storage_err(dir, e)),
    };
    let mut names: Vec<String> = entries
        .into_iter()
        .filter(|entry| !entry.path().ends_with('/'))
        .map(|entry| entry.name().to_string())
        .collect();
    names.sort();
    names.dedup();
    Ok(names)
}

/// Subdirectory names directly under `dir`.
async fn list_dirs(op: &Operator, dir: &str) -> ArchiveResult<Vec<String>> {
    let entries = match op.list(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == opendal::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(storage_err(dir, e)),
    };
    let mut names: Vec<String> = entries
        .into_iter()
        .filter(|entry| entry.path() != dir && entry.path().ends_with('/'))
        .map(|entry| entry.name().trim_end_matches('/').to_string())
        .filter(|name| !name.is_empty())
        .collect();
    names.sort();
    names.dedup();
    Ok(names)
}

/// Persisted state of one staged upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StagedSession {
    destination: String,
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    created_at: u64,
}

/// Resumable receiver that stages chunks as part objects and assembles the
/// destination object once every byte is present.
struct StagedTransport {
    op: Operator,
    session_id: String,
}

impl StagedTransport {
    fn new(op: Operator, session_id: impl Into<String>) -> Self {
        Self {
            op,
            session_id: session_id.into(),
        }
    }

    async fn create(op: &Operator, destination: String, now: u64) -> ArchiveResult<String> {
        Self::sweep(op, &destination, now).await;
        let session_id = uuid::Uuid::new_v4().simple().to_string();
        let transport = Self::new(op.clone(), session_id.clone());
        transport
            .save(&StagedSession {
                destination,
                total: None,
                created_at: now,
            })
            .await?;
        Ok(session_id)
    }

    /// Remove sessions superseded by a new one for `destination` and sessions
    /// past their lifetime. Failures are logged; they never block an upload.
    async fn sweep(op: &Operator, destination: &str, now: u64) {
        let ids = match list_dirs(op, UPLOADS).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("cannot list staged uploads: {e}");
                return;
            }
        };
        for id in ids {
            let transport = Self::new(op.clone(), id);
            let stale = match transport.load().await {
                Ok(session) => {
                    session.destination == destination
                        || session.created_at + SPEC_LIFETIME_SECS <= now
                }
                Err(ArchiveError::NotFound(_)) => true,
                Err(e) => {
                    warn!(session = %transport.session_id, "unreadable staged upload: {e}");
                    true
                }
            };
            if stale {
                debug!(session = %transport.session_id, "dropping staged upload");
                transport.remove().await;
            }
        }
    }

    /// Delete every object of this session.
    async fn remove(&self) {
        let mut paths: Vec<String> = match self.parts().await {
            Ok(parts) => parts.into_iter().map(|(_, _, path)| path).collect(),
            Err(e) => {
                warn!(session = %self.session_id, "cannot list staged parts: {e}");
                Vec::new()
            }
        };
        paths.push(session_path(&self.session_id));
        paths.push(session_dir(&self.session_id));
        for path in &paths {
            if let Err(e) = self.op.delete(path).await {
                if e.kind() != opendal::ErrorKind::NotFound {
                    warn!(path = %path, "failed to remove staged upload object: {e}");
                }
            }
        }
    }

    async fn load(&self) -> ArchiveResult<StagedSession> {
        let path = session_path(&self.session_id);
        let data = self.op.read(&path).await.map_err(|e| {
            if e.kind() == opendal::ErrorKind::NotFound {
                ArchiveError::NotFound(format!("upload session {} not found", self.session_id))
            } else {
                storage_err(&path, e)
            }
        })?;
        serde_json::from_slice(&data.to_vec())
            .map_err(|e| ArchiveError::Storage(format!("corrupt upload session {path}: {e}")))
    }

    async fn save(&self, session: &StagedSession) -> ArchiveResult<()> {
        let path = session_path(&self.session_id);
        let json = serde_json::to_vec(session)
            .map_err(|e| ArchiveError::Storage(format!("encoding upload session: {e}")))?;
        self.op
            .write(&path, json)
            .await
            .map_err(|e| storage_err(&path, e))?;
        Ok(())
    }

    /// Staged parts as (offset, length, path), ordered by offset.
    async fn parts(&self) -> ArchiveResult<Vec<(u64, u64, String)>> {
        let dir = session_dir(&self.session_id);
        let mut parts = Vec::new();
        for name in list_names(&self.op, &dir).await? {
            let Some(offset) = name
                .strip_prefix("part-")
                .and_then(|o| o.parse::<u64>().ok())
            else {
                continue;
            };
            let path = part_path(&self.session_id, offset);
            if let Some(len) = stat_len(&self.op, &path).await? {
                parts.push((offset, len, path));
            }
        }
        parts.sort_by_key(|(offset, _, _)| *offset);
        Ok(parts)
    }

    /// Bytes held without a gap from offset zero.
    fn contiguous(parts: &[(u64, u64, String)]) -> u64 {
        let mut held = 0u64;
        for (offset, len, _) in parts {
            if *offset != held {
                break;
            }
            held += len;
        }
        held
    }

    /// Pin the declared length on first use. Returns true when it was just set.
    fn check_total(session: &mut StagedSession, total: u64) -> ArchiveResult<bool> {
        match session.total {
            Some(t) if t != total => Err(ArchiveError::BadRequest(format!(
                "upload session declared {t} bytes, request says {total}"
            ))),
            Some(_) => Ok(false),
            None => {
                session.total = Some(total);
                Ok(true)
            }
        }
    }

    async fn commit(&self, session: StagedSession) -> ArchiveResult<()> {
        let parts = self.parts().await?;
        let dest = session.destination.clone();

        if self.op.info().full_capability().write_can_multi {
            let mut writer = self
                .op
                .writer(&dest)
                .await
                .map_err(|e| storage_err(&dest, e))?;
            for (_, _, path) in &parts {
                let data = self.op.read(path).await.map_err(|e| storage_err(path, e))?;
                writer.write(data).await.map_err(|e| storage_err(&dest, e))?;
            }
            writer.close().await.map_err(|e| storage_err(&dest, e))?;
        } else {
            let mut assembled = Vec::new();
            for (_, _, path) in &parts {
                let data = self.op.read(path).await.map_err(|e| storage_err(path, e))?;
                assembled.extend_from_slice(&data.to_vec());
            }
            self.op
                .write(&dest, assembled)
                .await
                .map_err(|e| storage_err(&dest, e))?;
        }

        self.remove().await;
        info!(destination = %dest, parts = parts.len(), "staged upload committed");
        Ok(())
    }
}

#[async_trait]
impl ResumableTransport for StagedTransport {
    async fn query_offset(&self, total: u64) -> ArchiveResult<u64> {
        let mut session = self.load().await?;
        Self::check_total(&mut session, total)?;
        if total == 0 {
            self.commit(session).await?;
            return Ok(0);
        }
        Ok(Self::contiguous(&self.parts().await?))
    }

    async fn put_chunk(&self, offset: u64, chunk: Bytes, total: u64) -> ArchiveResult<u64> {
        let mut session = self.load().await?;
        let pinned = Self::check_total(&mut session, total)?;

        let held = Self::contiguous(&self.parts().await?);
        if offset != held {
            return Err(ArchiveError::Protocol(format!(
                "chunk starts at {offset} but session holds {held} bytes"
            )));
        }
        let end = offset + chunk.len() as u64;
        if end > total {
            return Err(ArchiveError::BadRequest(format!(
                "chunk ends at {end}, past declared length {total}"
            )));
        }

        let path = part_path(&self.session_id, offset);
        self.op
            .write(&path, chunk)
            .await
            .map_err(|e| storage_err(&path, e))?;
        debug!(session = %self.session_id, offset, end, total, "chunk staged");

        if end == total {
            self.commit(session).await?;
        } else if pinned {
            self.save(&session).await?;
        }
        Ok(end)
    }
}

/// Archive backend that keeps everything in an OpenDAL store.
pub struct LocalArchiveApi {
    op: Operator,
    coordinator: UploadCoordinator,
    forms: FormLedger,
    clock: Arc<dyn Clock>,
    max_media_bytes: Option<u64>,
}

impl LocalArchiveApi {
    pub fn new(op: Operator, coordinator: UploadCoordinator) -> Self {
        Self {
            op,
            coordinator,
            forms: FormLedger::default(),
            clock: Arc::new(SystemClock),
            max_media_bytes: None,
        }
    }

    /// Time source for session ages and spec expiry.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Cap total archived media bytes; copies past it fail with 413.
    pub fn with_media_quota(mut self, max_media_bytes: Option<u64>) -> Self {
        self.max_media_bytes = max_media_bytes;
        self
    }

    /// Build the operator selected by `[local]` and apply its quota.
    pub fn from_config(config: &ArchiveConfig) -> anyhow::Result<Self> {
        let creds = arcv_storage::S3Credentials::from_env();
        let op = arcv_storage::build_from_core_config(&config.local, creds.as_ref())?;
        Ok(Self::new(op, UploadCoordinator::new(UploadPolicy::from(&config.upload)))
            .with_media_quota(config.local.max_media_bytes))
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }

    fn check_local_form(form: &UploadForm) -> ArchiveResult<()> {
        if form.cdn != LOCAL_CDN {
            return Err(ArchiveError::BadRequest(format!(
                "form for cdn {} was not issued by the local store",
                form.cdn
            )));
        }
        Ok(())
    }

    fn session_id(location: &str) -> ArchiveResult<&str> {
        location
            .strip_prefix(SESSION_SCHEME)
            .filter(|id| !id.is_empty() && !id.contains('/'))
            .ok_or_else(|| {
                ArchiveError::BadRequest(format!("not a local upload location: {location}"))
            })
    }

    fn issue_form(key: String) -> UploadForm {
        UploadForm {
            cdn: LOCAL_CDN,
            key,
            headers: BTreeMap::new(),
            signed_upload_location: format!("local:{}", uuid::Uuid::new_v4().simple()),
        }
    }

    /// Sum of archived media lengths for one backup.
    async fn media_usage(&self, id: &BackupId) -> ArchiveResult<u64> {
        let mut used = 0u64;
        for name in list_names(&self.op, &format!("{}/", media_dir(id))).await? {
            used += stat_len(&self.op, &media_path(id, &name))
                .await?
                .unwrap_or(0);
        }
        Ok(used)
    }

    async fn copy_media(
        &self,
        id: &BackupId,
        item: &ArchiveMediaRequest,
        used: &mut u64,
    ) -> ArchiveResult<i32> {
        validate_name("media id", &item.media_id)?;
        validate_name("attachment key", &item.source_attachment.key)?;
        if item.source_attachment.cdn != LOCAL_CDN {
            return Err(ArchiveError::BadRequest(format!(
                "source attachment on cdn {} is not held locally",
                item.source_attachment.cdn
            )));
        }

        let source = attachment_path(&item.source_attachment.key);
        let data = match self.op.read(&source).await {
            Ok(data) => data,
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => {
                return Err(ArchiveError::NotFound(format!(
                    "source attachment {} not found",
                    item.source_attachment.key
                )));
            }
            Err(e) => return Err(storage_err(&source, e)),
        };
        let len = data.len() as u64;
        if len != item.object_length {
            return Err(ArchiveError::BadRequest(format!(
                "declared length {} but attachment holds {len} bytes",
                item.object_length
            )));
        }

        let dest = media_path(id, &item.media_id);
        let replaced = stat_len(&self.op, &dest).await?.unwrap_or(0);
        let projected = used.saturating_sub(replaced) + len;
        if let Some(max) = self.max_media_bytes {
            if projected > max {
                return Err(ArchiveError::QuotaExceeded(format!(
                    "archive would hold {projected} of {max} bytes"
                )));
            }
        }

        self.op
            .write(&dest, data)
            .await
            .map_err(|e| storage_err(&dest, e))?;
        *used = projected;
        debug!(media_id = %item.media_id, bytes = len, "media archived");
        Ok(LOCAL_CDN)
    }

    /// Stage a session for a consumed form. The form stays usable if this fails.
    async fn open_session(&self, form: &UploadForm, destination: String) -> ArchiveResult<String> {
        StagedTransport::create(&self.op, destination, self.clock.now_secs())
            .await
            .inspect_err(|_| self.forms.release(form))
    }

    async fn run_upload(
        &self,
        location: &str,
        expected_destination: &str,
        source: &dyn UploadSource,
        length: u64,
        control: &UploadControl,
    ) -> ArchiveResult<()> {
        let session_id = Self::session_id(location)?;
        let transport = StagedTransport::new(self.op.clone(), session_id);
        let session = transport.load().await?;
        if session.destination != expected_destination {
            return Err(ArchiveError::BadRequest(format!(
                "upload location {location} belongs to a different object"
            )));
        }
        self.coordinator
            .upload(&transport, source, length, control)
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for LocalArchiveApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalArchiveApi")
            .field("scheme", &self.op.info().scheme())
            .field("root", &self.op.info().root())
            .field("max_media_bytes", &self.max_media_bytes)
            .finish()
    }
}

#[async_trait]
impl ArchiveApi for LocalArchiveApi {
    fn name(&self) -> &'static str {
        "local"
    }

    fn requires_credentials(&self) -> bool {
        false
    }

    async fn get_service_credentials(
        &self,
        _current_time: u64,
    ) -> ArchiveResult<ServiceCredentials> {
        Ok(ServiceCredentials::default())
    }

    async fn get_cdn_read_credentials(
        &self,
        _cdn: i32,
        _key: &BackupKey,
        _credential: &ArchiveServiceCredential,
    ) -> ArchiveResult<CdnReadCredentials> {
        Ok(CdnReadCredentials::default())
    }

    async fn trigger_backup_id_reservation(&self, key: &BackupKey) -> ArchiveResult<()> {
        debug!(backup_id = %key.backup_id(), "local store: reservation is implicit");
        Ok(())
    }

    async fn set_public_key(
        &self,
        key: &BackupKey,
        _credential: &ArchiveServiceCredential,
    ) -> ArchiveResult<()> {
        debug!(backup_id = %key.backup_id(), "local store: public key not needed");
        Ok(())
    }

    async fn get_message_backup_upload_form(
        &self,
        key: &BackupKey,
        _credential: &ArchiveServiceCredential,
    ) -> ArchiveResult<UploadForm> {
        Ok(Self::issue_form(backup_path(&key.backup_id())))
    }

    async fn get_backup_info(
        &self,
        key: &BackupKey,
        _credential: &ArchiveServiceCredential,
    ) -> ArchiveResult<BackupInfo> {
        let id = key.backup_id();
        let object_length = stat_len(&self.op, &backup_path(&id))
            .await?
            .ok_or_else(|| ArchiveError::NotFound("no backup has been uploaded".into()))?;
        let media = self.media_usage(&id).await?;
        Ok(BackupInfo {
            cdn: LOCAL_CDN,
            backup_dir: backup_dir(&id),
            media_dir: media_dir(&id),
            backup_name: BACKUP_NAME.into(),
            object_length,
            used_space: Some(object_length + media),
        })
    }

    async fn list_media_objects(
        &self,
        key: &BackupKey,
        _credential: &ArchiveServiceCredential,
        limit: u32,
        cursor: Option<&str>,
    ) -> ArchiveResult<MediaItemsPage> {
        if limit == 0 {
            return Err(ArchiveError::BadRequest("limit must be positive".into()));
        }
        let id = key.backup_id();
        let names = list_names(&self.op, &format!("{}/", media_dir(&id))).await?;

        let mut remaining = names
            .into_iter()
            .filter(|name| cursor.map_or(true, |c| name.as_str() > c));
        let page: Vec<String> = remaining.by_ref().take(limit as usize).collect();
        let more = remaining.next().is_some();

        let mut stored_media_objects = Vec::with_capacity(page.len());
        for media_id in &page {
            // Deleted between list and stat: skip it.
            if let Some(object_length) = stat_len(&self.op, &media_path(&id, media_id)).await? {
                stored_media_objects.push(StoredMediaObject {
                    cdn: LOCAL_CDN,
                    media_id: media_id.clone(),
                    object_length,
                });
            }
        }

        Ok(MediaItemsPage {
            stored_media_objects,
            backup_dir: backup_dir(&id),
            media_dir: media_dir(&id),
            cursor: if more { page.last().cloned() } else { None },
        })
    }

    async fn get_backup_resumable_upload_url(&self, form: &UploadForm) -> ArchiveResult<String> {
        Self::check_local_form(form)?;
        if !form.key.starts_with("backups/") {
            return Err(ArchiveError::BadRequest(format!(
                "form key {} is not a backup object",
                form.key
            )));
        }
        self.forms.consume(form)?;
        let session_id = self.open_session(form, form.key.clone()).await?;
        Ok(format!("{SESSION_SCHEME}{session_id}"))
    }

    async fn upload_backup_file(
        &self,
        form: &UploadForm,
        resumable_url: &str,
        source: &dyn UploadSource,
        length: u64,
        control: &UploadControl,
    ) -> ArchiveResult<()> {
        Self::check_local_form(form)?;
        self.run_upload(resumable_url, &form.key, source, length, control)
            .await?;
        info!(key = %form.key, bytes = length, "backup uploaded");
        Ok(())
    }

    async fn get_media_upload_form(
        &self,
        _key: &BackupKey,
        _credential: &ArchiveServiceCredential,
    ) -> ArchiveResult<UploadForm> {
        Ok(Self::issue_form(uuid::Uuid::new_v4().simple().to_string()))
    }

    async fn get_resumable_upload_spec(
        &self,
        form: &UploadForm,
        secret_key: Option<&[u8]>,
    ) -> ArchiveResult<ResumableUploadSpec> {
        Self::check_local_form(form)?;
        validate_name("attachment key", &form.key)?;
        self.forms.consume(form)?;

        let session_id = self.open_session(form, attachment_path(&form.key)).await?;
        let (generated, iv) = generate_attachment_secret();
        let secret_key = secret_key.map(<[u8]>::to_vec).unwrap_or(generated);

        Ok(ResumableUploadSpec {
            secret_key,
            iv,
            cdn_key: form.key.clone(),
            cdn_number: LOCAL_CDN,
            resume_location: format!("{SESSION_SCHEME}{session_id}"),
            expiration_timestamp: self.clock.now_secs() + SPEC_LIFETIME_SECS,
            headers: form.headers.clone(),
        })
    }

    async fn upload_media_file(
        &self,
        spec: &ResumableUploadSpec,
        source: &dyn UploadSource,
        length: u64,
        control: &UploadControl,
    ) -> ArchiveResult<RemoteAttachment> {
        validate_name("attachment key", &spec.cdn_key)?;
        self.run_upload(
            &spec.resume_location,
            &attachment_path(&spec.cdn_key),
            source,
            length,
            control,
        )
        .await?;
        Ok(RemoteAttachment {
            cdn: LOCAL_CDN,
            key: spec.cdn_key.clone(),
        })
    }

    async fn archive_attachment_media(
        &self,
        key: &BackupKey,
        _credential: &ArchiveServiceCredential,
        item: &ArchiveMediaRequest,
    ) -> ArchiveResult<ArchiveMediaResponse> {
        let id = key.backup_id();
        let mut used = self.media_usage(&id).await?;
        let cdn = self.copy_media(&id, item, &mut used).await?;
        Ok(ArchiveMediaResponse { cdn })
    }

    async fn archive_attachment_media_batch(
        &self,
        key: &BackupKey,
        _credential: &ArchiveServiceCredential,
        items: &[ArchiveMediaRequest],
    ) -> ArchiveResult<BatchArchiveMediaResponse> {
        let id = key.backup_id();
        let mut used = self.media_usage(&id).await?;
        let mut responses = Vec::with_capacity(items.len());
        let mut quota_hit = false;

        for item in items {
            if quota_hit {
                responses.push(BatchArchiveMediaItem::failure(
                    &item.media_id,
                    413,
                    "storage quota exhausted",
                ));
                continue;
            }
            match self.copy_media(&id, item, &mut used).await {
                Ok(cdn) => responses.push(BatchArchiveMediaItem::success(&item.media_id, cdn)),
                Err(e) => {
                    // Store failures carry no status; report them like a server fault.
                    let status = e.status_code().unwrap_or(500);
                    if status == 500 {
                        warn!(media_id = %item.media_id, "batch item failed: {e}");
                    }
                    quota_hit = status == 413;
                    responses.push(BatchArchiveMediaItem::failure(
                        &item.media_id,
                        status,
                        e.to_string(),
                    ));
                }
            }
        }

        let response = BatchArchiveMediaResponse { responses };
        info!(
            items = items.len(),
            failed = response.failures().len(),
            "batch archive finished"
        );
        Ok(response)
    }

    async fn delete_archived_media(
        &self,
        key: &BackupKey,
        _credential: &ArchiveServiceCredential,
        items: &[ArchivedMediaObject],
    ) -> ArchiveResult<()> {
        let id = key.backup_id();
        for item in items {
            validate_name("media id", &item.media_id)?;
            if item.cdn != LOCAL_CDN {
                return Err(ArchiveError::BadRequest(format!(
                    "media {} on cdn {} is not held locally",
                    item.media_id, item.cdn
                )));
            }
        }
        for item in items {
            let path = media_path(&id, &item.media_id);
            self.op
                .delete(&path)
                .await
                .map_err(|e| storage_err(&path, e))?;
        }
        debug!(count = items.len(), "media deleted");
        Ok(())
    }

    fn get_zk_credential(
        &self,
        key: &BackupKey,
        credential: &ArchiveServiceCredential,
    ) -> ArchiveResult<BackupAuthCredential> {
        Ok(BackupAuthCredential::unissued(
            key,
            BackupLevel::Media,
            credential.redemption_time,
        ))
    }
}
