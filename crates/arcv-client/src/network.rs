//! Archive backend that talks to the remote archive service over HTTPS
//!
//! Identified calls use basic auth. Anonymous calls carry a fresh
//! presentation (`X-Archive-ZK-Auth`) and its signature by the key-derived
//! signing key (`X-Archive-ZK-Auth-Signature`), both base64. Uploads use the
//! CDN's resumable protocol against the form's signed location.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, CONTENT_RANGE, LOCATION, RANGE, RETRY_AFTER,
};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use arcv_core::config::{ArchiveConfig, CredentialConfig, ServiceConfig};
use arcv_core::types::{
    b64, ArchiveMediaRequest, ArchiveMediaResponse, ArchiveServiceCredential, ArchivedMediaObject,
    BackupInfo, BatchArchiveMediaItem, BatchArchiveMediaRequest, BatchArchiveMediaResponse,
    CdnReadCredentials, DeleteArchivedMediaRequest, MediaItemsPage, RemoteAttachment,
    ResumableUploadSpec, ServiceCredentials, UploadForm,
};
use arcv_core::{
    start_of_day, ArchiveError, ArchiveResult, BackupLevel, Clock, SystemClock, SECONDS_PER_DAY,
};
use arcv_crypto::{generate_attachment_secret, BackupAuthCredential, BackupKey};

use crate::api::{ArchiveApi, UploadControl};
use crate::upload::{
    FormLedger, ResumableTransport, UploadCoordinator, UploadPolicy, UploadSource,
};

pub const ZK_AUTH_HEADER: &str = "X-Archive-ZK-Auth";
pub const ZK_SIGNATURE_HEADER: &str = "X-Archive-ZK-Auth-Signature";

/// Environment variable holding the account password for identified calls.
pub const PASSWORD_ENV: &str = "ARCV_SERVICE_PASSWORD";

const PERMANENT_REDIRECT_RESUME: u16 = 308;
const SPEC_LIFETIME_SECS: u64 = 7 * SECONDS_PER_DAY;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReserveBackupIdRequest {
    #[serde(with = "b64")]
    messages_backup_auth_credential_request: Vec<u8>,
    #[serde(with = "b64")]
    media_backup_auth_credential_request: Vec<u8>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SetPublicKeyRequest {
    #[serde(with = "b64")]
    backup_id_public_key: Vec<u8>,
}

fn transport_err(e: reqwest::Error) -> ArchiveError {
    if e.is_decode() {
        ArchiveError::Protocol(format!("malformed response: {e}"))
    } else {
        ArchiveError::Network(e.to_string())
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Turn a non-success response into its error kind, keeping the status code.
async fn status_error(resp: Response) -> ArchiveError {
    let status = resp.status().as_u16();
    let retry = retry_after(resp.headers());
    let body = resp.text().await.unwrap_or_default();
    let message = if body.is_empty() {
        format!("status {status}")
    } else {
        body
    };
    ArchiveError::from_status(status, message, retry)
}

async fn expect_success(resp: Response) -> ArchiveResult<Response> {
    if resp.status().is_success() {
        Ok(resp)
    } else {
        Err(status_error(resp).await)
    }
}

async fn expect_json<T: DeserializeOwned>(resp: Response) -> ArchiveResult<T> {
    expect_success(resp)
        .await?
        .json::<T>()
        .await
        .map_err(|e| ArchiveError::Protocol(format!("decoding response: {e}")))
}

/// Acknowledged length from a `Range: bytes=0-{last}` header.
fn acknowledged_from_range(headers: &HeaderMap) -> ArchiveResult<u64> {
    let Some(value) = headers.get(RANGE) else {
        return Ok(0);
    };
    let value = value
        .to_str()
        .map_err(|_| ArchiveError::Protocol("non-ascii Range header".into()))?;
    let last = value
        .strip_prefix("bytes=0-")
        .and_then(|n| n.trim().parse::<u64>().ok())
        .ok_or_else(|| ArchiveError::Protocol(format!("unexpected Range header {value:?}")))?;
    Ok(last + 1)
}

fn header_map(headers: &BTreeMap<String, String>) -> ArchiveResult<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ArchiveError::Protocol(format!("invalid header name {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ArchiveError::Protocol(format!("invalid header value for {name}: {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Re-align per-item results to request order by media id.
fn align_batch(
    items: &[ArchiveMediaRequest],
    response: BatchArchiveMediaResponse,
) -> ArchiveResult<BatchArchiveMediaResponse> {
    let mut by_id: HashMap<String, BatchArchiveMediaItem> = response
        .responses
        .into_iter()
        .map(|item| (item.media_id.clone(), item))
        .collect();
    let mut responses = Vec::with_capacity(items.len());
    for item in items {
        let result = by_id.remove(&item.media_id).ok_or_else(|| {
            ArchiveError::Protocol(format!("batch response has no result for {}", item.media_id))
        })?;
        responses.push(result);
    }
    Ok(BatchArchiveMediaResponse { responses })
}

/// CDN side of one resumable session.
pub struct HttpResumableTransport {
    client: Client,
    location: String,
    headers: HeaderMap,
    timeout: Duration,
}

impl HttpResumableTransport {
    pub fn new(
        client: Client,
        location: impl Into<String>,
        headers: HeaderMap,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            location: location.into(),
            headers,
            timeout,
        }
    }

    fn acknowledged(&self, resp: &Response, total: u64) -> ArchiveResult<Option<u64>> {
        match resp.status().as_u16() {
            200 | 201 => Ok(Some(total)),
            PERMANENT_REDIRECT_RESUME => acknowledged_from_range(resp.headers()).map(Some),
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl ResumableTransport for HttpResumableTransport {
    async fn query_offset(&self, total: u64) -> ArchiveResult<u64> {
        let resp = self
            .client
            .put(&self.location)
            .headers(self.headers.clone())
            .header(CONTENT_RANGE, format!("bytes */{total}"))
            .body(Vec::new())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(transport_err)?;
        match self.acknowledged(&resp, total)? {
            Some(offset) => Ok(offset),
            None => Err(status_error(resp).await),
        }
    }

    async fn put_chunk(&self, offset: u64, chunk: Bytes, total: u64) -> ArchiveResult<u64> {
        let end = offset + chunk.len() as u64;
        let resp = self
            .client
            .put(&self.location)
            .headers(self.headers.clone())
            .header(CONTENT_RANGE, format!("bytes {offset}-{}/{total}", end.saturating_sub(1)))
            .body(chunk)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(transport_err)?;
        match self.acknowledged(&resp, total)? {
            Some(acked) => Ok(acked),
            None => Err(status_error(resp).await),
        }
    }
}

pub struct NetworkArchiveApi {
    client: Client,
    base_url: String,
    username: Option<String>,
    password: Option<SecretString>,
    timeout: Duration,
    window_days: u64,
    coordinator: UploadCoordinator,
    forms: FormLedger,
}

impl NetworkArchiveApi {
    pub fn new(
        service: &ServiceConfig,
        credentials: &CredentialConfig,
        policy: UploadPolicy,
        password: Option<SecretString>,
    ) -> anyhow::Result<Self> {
        if service.url.starts_with("http://") {
            if service.enforce_tls {
                anyhow::bail!(
                    "service URL uses plaintext HTTP ({}), but enforce_tls is enabled. \
                     Use an HTTPS URL or set service.enforce_tls = false for local testing.",
                    service.url
                );
            }
            tracing::warn!(url = %service.url, "archive service URL uses plaintext HTTP");
        }

        let default_headers =
            header_map(&service.extra_headers).context("building service.extra_headers")?;
        let client = Client::builder()
            .default_headers(default_headers)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            client,
            base_url: service.url.trim_end_matches('/').to_string(),
            username: service.username.clone(),
            password,
            timeout: Duration::from_secs(service.timeout_secs.max(1)),
            window_days: credentials.window_days.max(1),
            coordinator: UploadCoordinator::new(policy),
            forms: FormLedger::default(),
        })
    }

    /// Build from config; the password comes from `ARCV_SERVICE_PASSWORD`.
    pub fn from_config(config: &ArchiveConfig) -> anyhow::Result<Self> {
        let password = std::env::var(PASSWORD_ENV).ok().map(SecretString::from);
        Self::new(
            &config.service,
            &config.credentials,
            UploadPolicy::from(&config.upload),
            password,
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn identified(&self, rb: RequestBuilder) -> ArchiveResult<RequestBuilder> {
        let username = self
            .username
            .as_deref()
            .ok_or_else(|| ArchiveError::Config("service.username is not set".into()))?;
        let password = self
            .password
            .as_ref()
            .ok_or_else(|| ArchiveError::Config(format!("{PASSWORD_ENV} is not set")))?;
        Ok(rb.basic_auth(username, Some(password.expose_secret())))
    }

    fn anonymous(
        &self,
        rb: RequestBuilder,
        key: &BackupKey,
        credential: &ArchiveServiceCredential,
        needed: BackupLevel,
    ) -> ArchiveResult<RequestBuilder> {
        let auth = self.get_zk_credential(key, credential)?;
        auth.require(needed)
            .map_err(|e| ArchiveError::Authorization(e.to_string()))?;
        let presentation = auth.present(key);
        let signature = presentation.sign(key);
        Ok(rb
            .header(ZK_AUTH_HEADER, BASE64.encode(presentation.as_bytes()))
            .header(ZK_SIGNATURE_HEADER, BASE64.encode(signature)))
    }

    async fn send(&self, what: &str, rb: RequestBuilder) -> ArchiveResult<Response> {
        let resp = rb
            .timeout(self.timeout)
            .send()
            .await
            .map_err(transport_err)?;
        debug!(op = what, status = resp.status().as_u16(), "archive service responded");
        Ok(resp)
    }

    /// Exchange a form for a session location on its CDN. The form stays
    /// usable when the CDN could not be reached or answered with a transient error.
    async fn create_session(&self, form: &UploadForm) -> ArchiveResult<String> {
        self.forms.consume(form)?;
        self.request_session(form).await.inspect_err(|e| {
            if e.is_transient() {
                self.forms.release(form);
            }
        })
    }

    async fn request_session(&self, form: &UploadForm) -> ArchiveResult<String> {
        let resp = self
            .send(
                "create_upload_session",
                self.client
                    .post(&form.signed_upload_location)
                    .headers(header_map(&form.headers)?)
                    .body(Vec::new()),
            )
            .await?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(ArchiveError::ExpiredForm);
        }
        let resp = expect_success(resp).await?;
        let location = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                ArchiveError::Protocol("upload session has no Location header".into())
            })?;

        let base = reqwest::Url::parse(&form.signed_upload_location).map_err(|e| {
            ArchiveError::Protocol(format!("invalid signed upload location: {e}"))
        })?;
        let resolved = base.join(location).map_err(|e| {
            ArchiveError::Protocol(format!("invalid session location {location:?}: {e}"))
        })?;
        Ok(resolved.to_string())
    }

    async fn run_upload(
        &self,
        location: &str,
        headers: &BTreeMap<String, String>,
        source: &dyn UploadSource,
        length: u64,
        control: &UploadControl,
    ) -> ArchiveResult<()> {
        let transport = HttpResumableTransport::new(
            self.client.clone(),
            location,
            header_map(headers)?,
            self.timeout,
        );
        self.coordinator
            .upload(&transport, source, length, control)
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for NetworkArchiveApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkArchiveApi")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[async_trait]
impl ArchiveApi for NetworkArchiveApi {
    fn name(&self) -> &'static str {
        "network"
    }

    async fn get_service_credentials(
        &self,
        current_time: u64,
    ) -> ArchiveResult<ServiceCredentials> {
        let start = start_of_day(current_time);
        let end = start + self.window_days * SECONDS_PER_DAY;
        let rb = self.identified(self.client.get(self.url("/v1/archives/auth")).query(&[
            ("redemptionStartSeconds", start),
            ("redemptionEndSeconds", end),
        ]))?;
        let creds: ServiceCredentials =
            expect_json(self.send("get_service_credentials", rb).await?).await?;
        info!(count = creds.credentials.len(), start, end, "received service credentials");
        Ok(creds)
    }

    async fn get_cdn_read_credentials(
        &self,
        cdn: i32,
        key: &BackupKey,
        credential: &ArchiveServiceCredential,
    ) -> ArchiveResult<CdnReadCredentials> {
        let rb = self.anonymous(
            self.client
                .get(self.url("/v1/archives/auth/read"))
                .query(&[("cdn", cdn)]),
            key,
            credential,
            BackupLevel::Messages,
        )?;
        expect_json(self.send("get_cdn_read_credentials", rb).await?).await
    }

    async fn trigger_backup_id_reservation(&self, key: &BackupKey) -> ArchiveResult<()> {
        let body = ReserveBackupIdRequest {
            messages_backup_auth_credential_request: key.credential_request(BackupLevel::Messages),
            media_backup_auth_credential_request: key.credential_request(BackupLevel::Media),
        };
        let rb = self.identified(self.client.put(self.url("/v1/archives/backupid")).json(&body))?;
        expect_success(self.send("trigger_backup_id_reservation", rb).await?).await?;
        info!("backup id reserved");
        Ok(())
    }

    async fn set_public_key(
        &self,
        key: &BackupKey,
        credential: &ArchiveServiceCredential,
    ) -> ArchiveResult<()> {
        let body = SetPublicKeyRequest {
            backup_id_public_key: key.public_key().to_vec(),
        };
        let rb = self.anonymous(
            self.client.put(self.url("/v1/archives/keys")).json(&body),
            key,
            credential,
            BackupLevel::Messages,
        )?;
        expect_success(self.send("set_public_key", rb).await?).await?;
        info!("backup public key registered");
        Ok(())
    }

    async fn get_message_backup_upload_form(
        &self,
        key: &BackupKey,
        credential: &ArchiveServiceCredential,
    ) -> ArchiveResult<UploadForm> {
        let rb = self.anonymous(
            self.client.get(self.url("/v1/archives/upload/form")),
            key,
            credential,
            BackupLevel::Messages,
        )?;
        expect_json(self.send("get_message_backup_upload_form", rb).await?).await
    }

    async fn get_backup_info(
        &self,
        key: &BackupKey,
        credential: &ArchiveServiceCredential,
    ) -> ArchiveResult<BackupInfo> {
        let rb = self.anonymous(
            self.client.get(self.url("/v1/archives")),
            key,
            credential,
            BackupLevel::Messages,
        )?;
        expect_json(self.send("get_backup_info", rb).await?).await
    }

    async fn list_media_objects(
        &self,
        key: &BackupKey,
        credential: &ArchiveServiceCredential,
        limit: u32,
        cursor: Option<&str>,
    ) -> ArchiveResult<MediaItemsPage> {
        if limit == 0 {
            return Err(ArchiveError::BadRequest("limit must be positive".into()));
        }
        let mut query = vec![("limit", limit.to_string())];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }
        let rb = self.anonymous(
            self.client.get(self.url("/v1/archives/media")).query(&query),
            key,
            credential,
            BackupLevel::Media,
        )?;
        expect_json(self.send("list_media_objects", rb).await?).await
    }

    async fn get_backup_resumable_upload_url(&self, form: &UploadForm) -> ArchiveResult<String> {
        self.create_session(form).await
    }

    async fn upload_backup_file(
        &self,
        form: &UploadForm,
        resumable_url: &str,
        source: &dyn UploadSource,
        length: u64,
        control: &UploadControl,
    ) -> ArchiveResult<()> {
        self.run_upload(resumable_url, &form.headers, source, length, control)
            .await?;
        info!(cdn = form.cdn, bytes = length, "backup uploaded");
        Ok(())
    }

    async fn get_media_upload_form(
        &self,
        key: &BackupKey,
        credential: &ArchiveServiceCredential,
    ) -> ArchiveResult<UploadForm> {
        let rb = self.anonymous(
            self.client.get(self.url("/v1/archives/media/upload/form")),
            key,
            credential,
            BackupLevel::Media,
        )?;
        expect_json(self.send("get_media_upload_form", rb).await?).await
    }

    async fn get_resumable_upload_spec(
        &self,
        form: &UploadForm,
        secret_key: Option<&[u8]>,
    ) -> ArchiveResult<ResumableUploadSpec> {
        let resume_location = self.create_session(form).await?;
        let (generated, iv) = generate_attachment_secret();
        Ok(ResumableUploadSpec {
            secret_key: secret_key.map(<[u8]>::to_vec).unwrap_or(generated),
            iv,
            cdn_key: form.key.clone(),
            cdn_number: form.cdn,
            resume_location,
            expiration_timestamp: SystemClock.now_secs() + SPEC_LIFETIME_SECS,
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
        self.run_upload(&spec.resume_location, &spec.headers, source, length, control)
            .await?;
        Ok(RemoteAttachment {
            cdn: spec.cdn_number,
            key: spec.cdn_key.clone(),
        })
    }

    async fn archive_attachment_media(
        &self,
        key: &BackupKey,
        credential: &ArchiveServiceCredential,
        item: &ArchiveMediaRequest,
    ) -> ArchiveResult<ArchiveMediaResponse> {
        let rb = self.anonymous(
            self.client.put(self.url("/v1/archives/media")).json(item),
            key,
            credential,
            BackupLevel::Media,
        )?;
        expect_json(self.send("archive_attachment_media", rb).await?).await
    }

    async fn archive_attachment_media_batch(
        &self,
        key: &BackupKey,
        credential: &ArchiveServiceCredential,
        items: &[ArchiveMediaRequest],
    ) -> ArchiveResult<BatchArchiveMediaResponse> {
        if items.is_empty() {
            return Ok(BatchArchiveMediaResponse { responses: Vec::new() });
        }
        let mut seen = HashSet::with_capacity(items.len());
        if let Some(dup) = items.iter().find(|item| !seen.insert(item.media_id.as_str())) {
            return Err(ArchiveError::BadRequest(format!(
                "media id {} appears twice in one batch",
                dup.media_id
            )));
        }

        let body = BatchArchiveMediaRequest {
            items: items.to_vec(),
        };
        let rb = self.anonymous(
            self.client.put(self.url("/v1/archives/media/batch")).json(&body),
            key,
            credential,
            BackupLevel::Media,
        )?;
        let response: BatchArchiveMediaResponse =
            expect_json(self.send("archive_attachment_media_batch", rb).await?).await?;
        let aligned = align_batch(items, response)?;
        info!(
            items = items.len(),
            failed = aligned.failures().len(),
            "batch archive finished"
        );
        Ok(aligned)
    }

    async fn delete_archived_media(
        &self,
        key: &BackupKey,
        credential: &ArchiveServiceCredential,
        items: &[ArchivedMediaObject],
    ) -> ArchiveResult<()> {
        if items.is_empty() {
            return Ok(());
        }
        let body = DeleteArchivedMediaRequest {
            media_to_delete: items.to_vec(),
        };
        let rb = self.anonymous(
            self.client
                .post(self.url("/v1/archives/media/delete"))
                .json(&body),
            key,
            credential,
            BackupLevel::Media,
        )?;
        match expect_success(self.send("delete_archived_media", rb).await?).await {
            Ok(_) | Err(ArchiveError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn get_zk_credential(
        &self,
        key: &BackupKey,
        credential: &ArchiveServiceCredential,
    ) -> ArchiveResult<BackupAuthCredential> {
        BackupAuthCredential::receive(key, credential)
            .map_err(|e| ArchiveError::Authorization(e.to_string()))
    }
}
