use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::{ArchiveError, ArchiveResult};

/// CDN number marking an object hosted by the local stand-in backend.
/// Remote CDNs are always non-negative.
pub const LOCAL_CDN: i32 = -1;

/// Authorization tier embedded in a backup credential. Ordered: `Media`
/// implies everything `Messages` may do.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum BackupLevel {
    Messages,
    #[default]
    Media,
}

impl BackupLevel {
    pub fn as_byte(self) -> u8 {
        match self {
            BackupLevel::Messages => 1,
            BackupLevel::Media => 2,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(BackupLevel::Messages),
            2 => Some(BackupLevel::Media),
            _ => None,
        }
    }
}

/// One day's anonymous service credential, as issued by the server.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveServiceCredential {
    #[serde(with = "b64")]
    pub credential: Vec<u8>,
    /// Start of the UTC day (Unix seconds) this credential is valid for.
    pub redemption_time: u64,
}

impl std::fmt::Debug for ArchiveServiceCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveServiceCredential")
            .field("credential", &"[REDACTED]")
            .field("redemption_time", &self.redemption_time)
            .finish()
    }
}

/// A batch of credentials, one per day of the requested window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceCredentials {
    #[serde(default)]
    pub credentials: Vec<ArchiveServiceCredential>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CdnReadCredentials {
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// Where to write an upload. Valid for exactly one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadForm {
    pub cdn: i32,
    pub key: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub signed_upload_location: String,
}

/// Resumable-upload handle for media, bound to one destination.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumableUploadSpec {
    #[serde(with = "b64")]
    pub secret_key: Vec<u8>,
    #[serde(with = "b64")]
    pub iv: Vec<u8>,
    pub cdn_key: String,
    pub cdn_number: i32,
    pub resume_location: String,
    pub expiration_timestamp: u64,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl std::fmt::Debug for ResumableUploadSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumableUploadSpec")
            .field("secret_key", &"[REDACTED]")
            .field("cdn_key", &self.cdn_key)
            .field("cdn_number", &self.cdn_number)
            .field("resume_location", &self.resume_location)
            .field("expiration_timestamp", &self.expiration_timestamp)
            .finish()
    }
}

/// Acknowledged-offset state of a resumable upload, carried between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    pub acknowledged: u64,
    pub total: u64,
}

impl UploadProgress {
    pub fn new(total: u64) -> Self {
        Self {
            acknowledged: 0,
            total,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.acknowledged == self.total
    }

    pub fn remaining(&self) -> u64 {
        self.total.saturating_sub(self.acknowledged)
    }

    /// Accept a server acknowledgement. Rejects offsets past the end.
    pub fn acknowledge(&mut self, offset: u64) -> ArchiveResult<()> {
        if offset > self.total {
            return Err(ArchiveError::Transfer {
                acknowledged: self.acknowledged,
                total: self.total,
                status: None,
                reason: format!("server acknowledged {offset} bytes past the end"),
            });
        }
        self.acknowledged = offset;
        Ok(())
    }
}

/// Identifies a stored blob. Two descriptors are the same object iff their
/// keys match.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedObjectDescriptor {
    pub cdn: i32,
    pub key: String,
    pub object_length: u64,
}

impl PartialEq for ArchivedObjectDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for ArchivedObjectDescriptor {}

impl Hash for ArchivedObjectDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl ArchivedObjectDescriptor {
    pub fn is_local(&self) -> bool {
        self.cdn < 0
    }
}

/// Metadata about the main backup object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupInfo {
    pub cdn: i32,
    pub backup_dir: String,
    pub media_dir: String,
    pub backup_name: String,
    pub object_length: u64,
    #[serde(default)]
    pub used_space: Option<u64>,
}

impl BackupInfo {
    pub fn descriptor(&self) -> ArchivedObjectDescriptor {
        ArchivedObjectDescriptor {
            cdn: self.cdn,
            key: format!("{}/{}", self.backup_dir, self.backup_name),
            object_length: self.object_length,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMediaObject {
    pub cdn: i32,
    pub media_id: String,
    pub object_length: u64,
}

impl StoredMediaObject {
    pub fn descriptor(&self, media_dir: &str) -> ArchivedObjectDescriptor {
        ArchivedObjectDescriptor {
            cdn: self.cdn,
            key: format!("{media_dir}/{}", self.media_id),
            object_length: self.object_length,
        }
    }
}

/// One page of a media listing. `cursor == None` means end of listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaItemsPage {
    #[serde(default)]
    pub stored_media_objects: Vec<StoredMediaObject>,
    #[serde(default)]
    pub backup_dir: String,
    #[serde(default)]
    pub media_dir: String,
    #[serde(default)]
    pub cursor: Option<String>,
}

/// An object in the transient attachment upload area.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAttachment {
    pub cdn: i32,
    pub key: String,
}

/// Copy `source_attachment` into the archive as `media_id`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveMediaRequest {
    pub source_attachment: RemoteAttachment,
    pub object_length: u64,
    pub media_id: String,
    #[serde(with = "b64")]
    pub hmac_key: Vec<u8>,
    #[serde(with = "b64")]
    pub encryption_key: Vec<u8>,
}

impl std::fmt::Debug for ArchiveMediaRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveMediaRequest")
            .field("source_attachment", &self.source_attachment)
            .field("object_length", &self.object_length)
            .field("media_id", &self.media_id)
            .field("hmac_key", &"[REDACTED]")
            .field("encryption_key", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveMediaResponse {
    pub cdn: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchArchiveMediaRequest {
    pub items: Vec<ArchiveMediaRequest>,
}

/// Per-item outcome of a batch copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchArchiveMediaItem {
    pub status: u16,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub cdn: Option<i32>,
    pub media_id: String,
}

impl BatchArchiveMediaItem {
    pub fn success(media_id: impl Into<String>, cdn: i32) -> Self {
        Self {
            status: 200,
            failure_reason: None,
            cdn: Some(cdn),
            media_id: media_id.into(),
        }
    }

    pub fn failure(media_id: impl Into<String>, status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            failure_reason: Some(reason.into()),
            cdn: None,
            media_id: media_id.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The archived cdn on success, the typed error otherwise.
    pub fn to_result(&self) -> ArchiveResult<i32> {
        if self.is_success() {
            self.cdn.ok_or_else(|| {
                ArchiveError::Protocol(format!("item {} succeeded without a cdn", self.media_id))
            })
        } else {
            Err(ArchiveError::from_status(
                self.status,
                self.failure_reason.clone().unwrap_or_default(),
                None,
            ))
        }
    }
}

/// Batch copy result, index-aligned with the request list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchArchiveMediaResponse {
    pub responses: Vec<BatchArchiveMediaItem>,
}

impl BatchArchiveMediaResponse {
    pub fn len(&self) -> usize {
        self.responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }

    pub fn outcomes(&self) -> impl Iterator<Item = (usize, ArchiveResult<i32>)> + '_ {
        self.responses
            .iter()
            .enumerate()
            .map(|(i, item)| (i, item.to_result()))
    }

    /// `(index, status)` of every failed item.
    pub fn failures(&self) -> Vec<(usize, u16)> {
        self.responses
            .iter()
            .enumerate()
            .filter(|(_, item)| !item.is_success())
            .map(|(i, item)| (i, item.status))
            .collect()
    }

    pub fn quota_exhausted(&self) -> bool {
        self.responses.iter().any(|item| item.status == 413)
    }

    /// Collapse into `PartialBatchFailure` if any item failed.
    pub fn into_result(self) -> ArchiveResult<Vec<BatchArchiveMediaItem>> {
        let failed = self.failures();
        if failed.is_empty() {
            Ok(self.responses)
        } else {
            Err(ArchiveError::PartialBatchFailure {
                failed,
                total: self.responses.len(),
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedMediaObject {
    pub cdn: i32,
    pub media_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteArchivedMediaRequest {
    pub media_to_delete: Vec<ArchivedMediaObject>,
}

/// Base64 (standard alphabet, padded) serde adapter for byte fields.
pub mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}
