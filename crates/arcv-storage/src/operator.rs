//! OpenDAL Operator factory for the local archive store

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use opendal::Operator;

use arcv_core::config::{LocalStoreConfig, LocalStoreKind};

/// Access keys for a self-hosted S3 store
#[derive(Clone)]
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl S3Credentials {
    /// Read AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY (or the ARCV_ variants).
    pub fn from_env() -> Option<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .or_else(|_| std::env::var("ARCV_ACCESS_KEY_ID"))
            .ok()?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .or_else(|_| std::env::var("ARCV_SECRET_ACCESS_KEY"))
            .ok()?;
        Some(Self {
            access_key_id,
            secret_access_key,
        })
    }
}

impl std::fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .finish()
    }
}

/// Build an operator rooted at an on-device directory.
pub fn build_fs_operator(root: &Path) -> Result<Operator> {
    let root = expand_tilde(root);
    let builder = opendal::services::Fs::default().root(&root.to_string_lossy());

    let op = Operator::new(builder)
        .with_context(|| format!("creating OpenDAL fs operator at {}", root.display()))?
        .layer(opendal::layers::LoggingLayer::default())
        .finish();

    Ok(op)
}

/// Build an operator for a self-hosted S3-compatible endpoint.
///
/// Uses path-style addressing (default in opendal 0.55), which SeaweedFS and
/// MinIO require.
pub fn build_s3_operator(store: &LocalStoreConfig, creds: &S3Credentials) -> Result<Operator> {
    let builder = opendal::services::S3::default()
        .endpoint(&store.endpoint)
        .region(&store.region)
        .bucket(&store.bucket)
        .access_key_id(&creds.access_key_id)
        .secret_access_key(&creds.secret_access_key);

    let op = Operator::new(builder)
        .context("creating OpenDAL S3 operator")?
        .layer(opendal::layers::LoggingLayer::default())
        .layer(
            opendal::layers::RetryLayer::new()
                .with_max_times(5)
                .with_jitter(),
        )
        .finish();

    Ok(op)
}

/// Build the operator selected by `[local]` config.
///
/// For the s3 kind, a plaintext endpoint is an error when `enforce_tls` is
/// set and a warning otherwise.
pub fn build_from_core_config(
    store: &LocalStoreConfig,
    creds: Option<&S3Credentials>,
) -> Result<Operator> {
    match store.kind {
        LocalStoreKind::Fs => build_fs_operator(&store.root),
        LocalStoreKind::S3 => {
            if store.endpoint.starts_with("http://") {
                if store.enforce_tls {
                    anyhow::bail!(
                        "S3 endpoint uses plaintext HTTP ({}), but enforce_tls is enabled. \
                         Use an HTTPS endpoint or set local.enforce_tls = false \
                         for local development.",
                        store.endpoint
                    );
                }
                tracing::warn!(
                    endpoint = %store.endpoint,
                    "S3 endpoint uses plaintext HTTP; archive objects are already encrypted \
                     but access keys are transmitted unencrypted"
                );
            }
            let creds = creds.context(
                "S3 credentials not set\n\
                 Set AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY environment variables.",
            )?;
            build_s3_operator(store, creds)
        }
    }
}

/// Expand `~` in path to the user's home directory
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        let home = std::env::var("HOME").unwrap_or_default();
        PathBuf::from(home).join(rest)
    } else {
        path.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> S3Credentials {
        S3Credentials {
            access_key_id: "key".into(),
            secret_access_key: "secret".into(),
        }
    }

    #[test]
    fn test_build_fs_operator() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStoreConfig {
            kind: LocalStoreKind::Fs,
            root: dir.path().to_path_buf(),
            ..Default::default()
        };
        assert!(build_from_core_config(&store, None).is_ok());
    }

    #[test]
    fn test_s3_http_warning() {
        // HTTP endpoint with enforce_tls=false should succeed (but log warning)
        let store = LocalStoreConfig {
            kind: LocalStoreKind::S3,
            endpoint: "http://localhost:8333".into(),
            enforce_tls: false,
            ..Default::default()
        };
        assert!(build_from_core_config(&store, Some(&creds())).is_ok());
    }

    #[test]
    fn test_s3_http_enforce_tls() {
        let store = LocalStoreConfig {
            kind: LocalStoreKind::S3,
            endpoint: "http://insecure:8333".into(),
            enforce_tls: true,
            ..Default::default()
        };
        let result = build_from_core_config(&store, Some(&creds()));
        assert!(result.is_err(), "HTTP + enforce_tls must fail");
        assert!(result.unwrap_err().to_string().contains("enforce_tls"));
    }

    #[test]
    fn test_s3_requires_credentials() {
        let store = LocalStoreConfig {
            kind: LocalStoreKind::S3,
            endpoint: "https://s3.example.com".into(),
            ..Default::default()
        };
        assert!(build_from_core_config(&store, None).is_err());
    }

    #[test]
    fn test_expand_tilde() {
        std::env::set_var("HOME", "/home/tester");
        assert_eq!(
            expand_tilde(Path::new("~/archive")),
            PathBuf::from("/home/tester/archive")
        );
        assert_eq!(expand_tilde(Path::new("/abs")), PathBuf::from("/abs"));
    }
}
