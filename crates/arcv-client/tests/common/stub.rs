//! Minimal archive service + CDN, enough to exercise the network backend's wire contract

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use secrecy::SecretString;
use tokio::net::TcpListener;

use arcv_client::NetworkArchiveApi;
use arcv_core::config::{CredentialConfig, ServiceConfig};
use arcv_core::types::{
    ArchiveMediaRequest, ArchiveMediaResponse, BackupInfo, BatchArchiveMediaItem,
    BatchArchiveMediaRequest, BatchArchiveMediaResponse, CdnReadCredentials,
    DeleteArchivedMediaRequest, MediaItemsPage, ServiceCredentials, StoredMediaObject, UploadForm,
};
use arcv_core::{BackupLevel, SECONDS_PER_DAY};
use arcv_crypto::{issue_service_credential, Presentation};

use super::fast_policy;

pub const ISSUER: [u8; 32] = [0x42; 32];
pub const STUB_CDN: i32 = 3;

pub struct Inner {
    pub base: String,
    pub credential_level: BackupLevel,
    pub credential_fetches: u32,
    pub reservations: u32,
    pub reservation_bodies: Vec<serde_json::Value>,
    pub public_key: Option<[u8; 32]>,
    pub forms: HashMap<String, String>,
    pub sessions: HashMap<String, (String, Vec<u8>)>,
    pub backup: Option<Vec<u8>>,
    pub attachments: HashMap<String, Vec<u8>>,
    pub media: BTreeMap<String, u64>,
    pub media_quota: Option<u64>,
    pub partial_acks: bool,
    pub zk_requests: u32,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            base: String::new(),
            credential_level: BackupLevel::Media,
            credential_fetches: 0,
            reservations: 0,
            reservation_bodies: Vec::new(),
            public_key: None,
            forms: HashMap::new(),
            sessions: HashMap::new(),
            backup: None,
            attachments: HashMap::new(),
            media: BTreeMap::new(),
            media_quota: None,
            partial_acks: false,
            zk_requests: 0,
        }
    }
}

#[derive(Default)]
pub struct StubState {
    pub inner: Mutex<Inner>,
}

impl StubState {
    pub fn with<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        f(&mut self.inner.lock().unwrap())
    }
}

type Shared = Arc<StubState>;

pub struct StubServer {
    pub base: String,
    pub state: Shared,
    handle: tokio::task::JoinHandle<()>,
}

impl StubServer {
    pub async fn spawn() -> Self {
        let state: Shared = Arc::new(StubState::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        state.with(|s| s.base = base.clone());

        let app = Router::new()
            .route("/v1/archives", get(backup_info))
            .route("/v1/archives/auth", get(service_credentials))
            .route("/v1/archives/auth/read", get(cdn_read_credentials))
            .route("/v1/archives/backupid", put(reserve))
            .route("/v1/archives/keys", put(set_public_key))
            .route("/v1/archives/upload/form", get(message_form))
            .route("/v1/archives/media", get(list_media).put(archive_one))
            .route("/v1/archives/media/upload/form", get(media_form))
            .route("/v1/archives/media/batch", put(archive_batch))
            .route("/v1/archives/media/delete", post(delete_media))
            .route("/cdn/create/{id}", post(create_session))
            .route("/cdn/session/{id}", put(session_put))
            .with_state(state.clone());

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            base,
            state,
            handle,
        }
    }

    /// Network backend pointed at this stub.
    pub fn client(&self, chunk_size: usize) -> NetworkArchiveApi {
        let service = ServiceConfig {
            url: self.base.clone(),
            username: Some("alice".into()),
            enforce_tls: false,
            timeout_secs: 5,
            ..Default::default()
        };
        NetworkArchiveApi::new(
            &service,
            &CredentialConfig::default(),
            fast_policy(chunk_size),
            Some(SecretString::from("correct horse".to_string())),
        )
        .unwrap()
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn verify(public_key: &[u8; 32], message: &[u8], signature: &[u8]) -> Result<(), StatusCode> {
    let vk = VerifyingKey::from_bytes(public_key).map_err(|_| StatusCode::UNAUTHORIZED)?;
    let sig: [u8; 64] = signature.try_into().map_err(|_| StatusCode::UNAUTHORIZED)?;
    vk.verify(message, &Signature::from_bytes(&sig))
        .map_err(|_| StatusCode::UNAUTHORIZED)
}

fn zk_bytes(headers: &HeaderMap) -> Result<(Vec<u8>, Vec<u8>), StatusCode> {
    let decode = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| BASE64.decode(v).ok())
            .ok_or(StatusCode::UNAUTHORIZED)
    };
    Ok((
        decode("x-archive-zk-auth")?,
        decode("x-archive-zk-auth-signature")?,
    ))
}

/// Check presentation, signature and level for an anonymous call.
fn zk(inner: &mut Inner, headers: &HeaderMap, needed: BackupLevel) -> Result<(), StatusCode> {
    inner.zk_requests += 1;
    if headers.contains_key(header::AUTHORIZATION) {
        // Anonymous endpoints must not see account identity.
        return Err(StatusCode::BAD_REQUEST);
    }
    let (presentation, signature) = zk_bytes(headers)?;
    let fields = Presentation::inspect(&presentation).map_err(|_| StatusCode::UNAUTHORIZED)?;
    let public_key = inner.public_key.ok_or(StatusCode::UNAUTHORIZED)?;
    verify(&public_key, &presentation, &signature)?;
    if fields.level < needed {
        return Err(StatusCode::FORBIDDEN);
    }
    Ok(())
}

fn basic_auth(headers: &HeaderMap) -> Result<(), StatusCode> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;
    if value.starts_with("Basic ") {
        Ok(())
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}

async fn service_credentials(
    State(state): State<Shared>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if let Err(status) = basic_auth(&headers) {
        return status.into_response();
    }
    let start: u64 = query
        .get("redemptionStartSeconds")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let end: u64 = query
        .get("redemptionEndSeconds")
        .and_then(|v| v.parse().ok())
        .unwrap_or(start);
    let level = state.with(|s| {
        s.credential_fetches += 1;
        s.credential_level
    });
    let credentials = (start..end)
        .step_by(SECONDS_PER_DAY as usize)
        .map(|day| issue_service_credential(&ISSUER, level, day))
        .collect();
    Json(ServiceCredentials { credentials }).into_response()
}

async fn cdn_read_credentials(State(state): State<Shared>, headers: HeaderMap) -> Response {
    if let Err(status) = state.with(|s| zk(s, &headers, BackupLevel::Messages)) {
        return status.into_response();
    }
    let mut creds = CdnReadCredentials::default();
    creds
        .headers
        .insert("authorization".into(), "Bearer cdn-read".into());
    Json(creds).into_response()
}

async fn reserve(
    State(state): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Response {
    if let Err(status) = basic_auth(&headers) {
        return status.into_response();
    }
    state.with(|s| {
        s.reservations += 1;
        s.reservation_bodies.push(body);
    });
    StatusCode::NO_CONTENT.into_response()
}

async fn set_public_key(
    State(state): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let Some(key) = body
        .get("backupIdPublicKey")
        .and_then(|v| v.as_str())
        .and_then(|v| BASE64.decode(v).ok())
        .and_then(|v| <[u8; 32]>::try_from(v.as_slice()).ok())
    else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let (presentation, signature) = match zk_bytes(&headers) {
        Ok(v) => v,
        Err(status) => return status.into_response(),
    };
    if let Err(status) = verify(&key, &presentation, &signature) {
        return status.into_response();
    }
    state.with(|s| s.public_key = Some(key));
    StatusCode::NO_CONTENT.into_response()
}

fn issue_form(s: &mut Inner, destination: impl FnOnce(&str) -> String) -> UploadForm {
    let id = uuid::Uuid::new_v4().simple().to_string();
    s.forms.insert(id.clone(), destination(&id));
    let mut headers = BTreeMap::new();
    headers.insert("x-stub-form".to_string(), id.clone());
    UploadForm {
        cdn: STUB_CDN,
        key: id.clone(),
        headers,
        signed_upload_location: format!("{}/cdn/create/{id}", s.base),
    }
}

async fn message_form(State(state): State<Shared>, headers: HeaderMap) -> Response {
    state.with(|s| match zk(s, &headers, BackupLevel::Messages) {
        Ok(()) => Json(issue_form(s, |_| "backup".into())).into_response(),
        Err(status) => status.into_response(),
    })
}

async fn media_form(State(state): State<Shared>, headers: HeaderMap) -> Response {
    state.with(|s| match zk(s, &headers, BackupLevel::Media) {
        Ok(()) => Json(issue_form(s, |id| format!("attachment:{id}"))).into_response(),
        Err(status) => status.into_response(),
    })
}

async fn create_session(
    State(state): State<Shared>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if headers.get("x-stub-form").and_then(|v| v.to_str().ok()) != Some(id.as_str()) {
        return StatusCode::BAD_REQUEST.into_response();
    }
    state.with(|s| {
        let Some(destination) = s.forms.remove(&id) else {
            return StatusCode::GONE.into_response();
        };
        let session = uuid::Uuid::new_v4().simple().to_string();
        s.sessions.insert(session.clone(), (destination, Vec::new()));
        (
            StatusCode::CREATED,
            [(header::LOCATION, format!("/cdn/session/{session}"))],
        )
            .into_response()
    })
}

fn parse_content_range(headers: &HeaderMap) -> Option<(Option<u64>, u64)> {
    let value = headers.get(header::CONTENT_RANGE)?.to_str().ok()?;
    let (span, total) = value.strip_prefix("bytes ")?.split_once('/')?;
    let total = total.parse().ok()?;
    if span == "*" {
        return Some((None, total));
    }
    let (start, _) = span.split_once('-')?;
    Some((Some(start.parse().ok()?), total))
}

async fn session_put(
    State(state): State<Shared>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some((start, total)) = parse_content_range(&headers) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    state.with(|s| {
        let partial = s.partial_acks;
        let Some((destination, data)) = s.sessions.get_mut(&id) else {
            return StatusCode::NOT_FOUND.into_response();
        };
        if let Some(start) = start {
            if start != data.len() as u64 {
                return StatusCode::BAD_REQUEST.into_response();
            }
            let keep = if partial && body.len() > 1 {
                body.len() / 2
            } else {
                body.len()
            };
            data.extend_from_slice(&body[..keep]);
        }

        let held = data.len() as u64;
        if held == total {
            let (destination, data) = (destination.clone(), data.clone());
            match destination.strip_prefix("attachment:") {
                Some(key) => {
                    s.attachments.insert(key.to_string(), data);
                }
                None => s.backup = Some(data),
            }
            return StatusCode::CREATED.into_response();
        }
        if held == 0 {
            return StatusCode::PERMANENT_REDIRECT.into_response();
        }
        (
            StatusCode::PERMANENT_REDIRECT,
            [(header::RANGE, format!("bytes=0-{}", held - 1))],
        )
            .into_response()
    })
}

async fn backup_info(State(state): State<Shared>, headers: HeaderMap) -> Response {
    state.with(|s| {
        if let Err(status) = zk(s, &headers, BackupLevel::Messages) {
            return status.into_response();
        }
        let Some(backup) = &s.backup else {
            return (StatusCode::NOT_FOUND, "no backup").into_response();
        };
        let object_length = backup.len() as u64;
        let media: u64 = s.media.values().sum();
        Json(BackupInfo {
            cdn: STUB_CDN,
            backup_dir: "stub-backup".into(),
            media_dir: "stub-media".into(),
            backup_name: "messageBackup".into(),
            object_length,
            used_space: Some(object_length + media),
        })
        .into_response()
    })
}

async fn list_media(
    State(state): State<Shared>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    state.with(|s| {
        if let Err(status) = zk(s, &headers, BackupLevel::Media) {
            return status.into_response();
        }
        let limit: usize = query
            .get("limit")
            .and_then(|v| v.parse().ok())
            .unwrap_or(100);
        let cursor = query.get("cursor").cloned();
        let mut remaining = s
            .media
            .iter()
            .filter(|(id, _)| cursor.as_deref().map_or(true, |c| id.as_str() > c));
        let page: Vec<StoredMediaObject> = remaining
            .by_ref()
            .take(limit)
            .map(|(id, len)| StoredMediaObject {
                cdn: STUB_CDN,
                media_id: id.clone(),
                object_length: *len,
            })
            .collect();
        let more = remaining.next().is_some();
        Json(MediaItemsPage {
            cursor: if more {
                page.last().map(|m| m.media_id.clone())
            } else {
                None
            },
            stored_media_objects: page,
            backup_dir: "stub-backup".into(),
            media_dir: "stub-media".into(),
        })
        .into_response()
    })
}

fn copy_item(s: &mut Inner, item: &ArchiveMediaRequest) -> Result<(), (u16, String)> {
    let Some(source) = s.attachments.get(&item.source_attachment.key) else {
        return Err((400, "unknown source attachment".into()));
    };
    if source.len() as u64 != item.object_length {
        return Err((400, "length mismatch".into()));
    }
    let used: u64 = s.media.values().sum();
    if let Some(quota) = s.media_quota {
        if used + item.object_length > quota {
            return Err((413, "quota exceeded".into()));
        }
    }
    s.media.insert(item.media_id.clone(), item.object_length);
    Ok(())
}

async fn archive_one(
    State(state): State<Shared>,
    headers: HeaderMap,
    Json(item): Json<ArchiveMediaRequest>,
) -> Response {
    state.with(|s| {
        if let Err(status) = zk(s, &headers, BackupLevel::Media) {
            return status.into_response();
        }
        match copy_item(s, &item) {
            Ok(()) => Json(ArchiveMediaResponse { cdn: STUB_CDN }).into_response(),
            Err((code, reason)) => (
                StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                reason,
            )
                .into_response(),
        }
    })
}

async fn archive_batch(
    State(state): State<Shared>,
    headers: HeaderMap,
    Json(batch): Json<BatchArchiveMediaRequest>,
) -> Response {
    state.with(|s| {
        if let Err(status) = zk(s, &headers, BackupLevel::Media) {
            return status.into_response();
        }
        let mut responses: Vec<BatchArchiveMediaItem> = batch
            .items
            .iter()
            .map(|item| match copy_item(s, item) {
                Ok(()) => BatchArchiveMediaItem::success(&item.media_id, STUB_CDN),
                Err((code, reason)) => BatchArchiveMediaItem::failure(&item.media_id, code, reason),
            })
            .collect();
        // Servers do not promise request order.
        responses.reverse();
        Json(BatchArchiveMediaResponse { responses }).into_response()
    })
}

async fn delete_media(
    State(state): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<DeleteArchivedMediaRequest>,
) -> Response {
    state.with(|s| {
        if let Err(status) = zk(s, &headers, BackupLevel::Media) {
            return status.into_response();
        }
        for item in &body.media_to_delete {
            s.media.remove(&item.media_id);
        }
        StatusCode::NO_CONTENT.into_response()
    })
}
