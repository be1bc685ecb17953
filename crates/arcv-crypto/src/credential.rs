//! Backup auth credentials and their per-request presentations
//!
//! Service credential format (binary, issued by the server):
//! ```text
//! [1 byte: version][1 byte: level][8 bytes: redemption_time BE][32 bytes: issuer MAC]
//! ```
//!
//! Presentation format (sent in `X-Archive-ZK-Auth`):
//! ```text
//! [1 byte: version][1 byte: level][8 bytes: redemption_time BE]
//! [16 bytes: backup_id][32 bytes: random nonce][32 bytes: keyed BLAKE3 tag]
//! ```
//! The tag binds nonce, issuer MAC, level, redemption time and backup id
//! under a key derived from the backup key. A fresh nonce per presentation
//! makes every request's authorization bytes distinct.

use rand::RngCore;
use zeroize::Zeroize;

use arcv_core::types::ArchiveServiceCredential;
use arcv_core::BackupLevel;

use crate::key::{BackupId, BackupKey};
use crate::{BACKUP_ID_SIZE, NONCE_SIZE};

const CREDENTIAL_VERSION: u8 = 0;
const MAC_SIZE: usize = 32;
const CREDENTIAL_LEN: usize = 1 + 1 + 8 + MAC_SIZE;
const PRESENTATION_LEN: usize = 1 + 1 + 8 + BACKUP_ID_SIZE + NONCE_SIZE + MAC_SIZE;

/// A service credential received and bound to a backup key.
#[derive(Clone)]
pub struct BackupAuthCredential {
    level: BackupLevel,
    redemption_time: u64,
    backup_id: BackupId,
    mac: [u8; MAC_SIZE],
}

impl BackupAuthCredential {
    /// Validate a server-issued credential and bind it to `key`.
    ///
    /// Fails if the credential is malformed, has an unknown level, or its
    /// embedded redemption time disagrees with the envelope.
    pub fn receive(key: &BackupKey, credential: &ArchiveServiceCredential) -> anyhow::Result<Self> {
        let bytes = &credential.credential;
        if bytes.len() != CREDENTIAL_LEN {
            anyhow::bail!(
                "credential has wrong size: {} bytes (expected {CREDENTIAL_LEN})",
                bytes.len()
            );
        }
        if bytes[0] != CREDENTIAL_VERSION {
            anyhow::bail!("unsupported credential version {}", bytes[0]);
        }
        let level = BackupLevel::from_byte(bytes[1])
            .ok_or_else(|| anyhow::anyhow!("unknown backup level {}", bytes[1]))?;

        let mut time_bytes = [0u8; 8];
        time_bytes.copy_from_slice(&bytes[2..10]);
        let redemption_time = u64::from_be_bytes(time_bytes);
        if redemption_time != credential.redemption_time {
            anyhow::bail!(
                "credential redemption time {redemption_time} does not match envelope {}",
                credential.redemption_time
            );
        }

        let mut mac = [0u8; MAC_SIZE];
        mac.copy_from_slice(&bytes[10..]);

        Ok(Self {
            level,
            redemption_time,
            backup_id: key.backup_id(),
            mac,
        })
    }

    /// A credential that was never issued by a server, for backends where
    /// remote authorization is meaningless.
    pub fn unissued(key: &BackupKey, level: BackupLevel, redemption_time: u64) -> Self {
        Self {
            level,
            redemption_time,
            backup_id: key.backup_id(),
            mac: [0u8; MAC_SIZE],
        }
    }

    pub fn level(&self) -> BackupLevel {
        self.level
    }

    pub fn redemption_time(&self) -> u64 {
        self.redemption_time
    }

    pub fn backup_id(&self) -> BackupId {
        self.backup_id
    }

    /// Fail unless this credential grants at least `needed`.
    pub fn require(&self, needed: BackupLevel) -> anyhow::Result<()> {
        if self.level < needed {
            anyhow::bail!(
                "credential grants {:?} access but {:?} is required",
                self.level,
                needed
            );
        }
        Ok(())
    }

    /// Produce a fresh single-use presentation.
    pub fn present(&self, key: &BackupKey) -> Presentation {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);

        let mut pkey = key.presentation_key();
        let mut hasher = blake3::Hasher::new_keyed(&pkey);
        hasher.update(&nonce);
        hasher.update(&self.mac);
        hasher.update(&[self.level.as_byte()]);
        hasher.update(&self.redemption_time.to_be_bytes());
        hasher.update(&self.backup_id.0);
        let tag = hasher.finalize();
        pkey.zeroize();

        let mut bytes = Vec::with_capacity(PRESENTATION_LEN);
        bytes.push(CREDENTIAL_VERSION);
        bytes.push(self.level.as_byte());
        bytes.extend_from_slice(&self.redemption_time.to_be_bytes());
        bytes.extend_from_slice(&self.backup_id.0);
        bytes.extend_from_slice(&nonce);
        bytes.extend_from_slice(tag.as_bytes());
        Presentation { bytes }
    }
}

impl Drop for BackupAuthCredential {
    fn drop(&mut self) {
        self.mac.zeroize();
    }
}

impl std::fmt::Debug for BackupAuthCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupAuthCredential")
            .field("level", &self.level)
            .field("redemption_time", &self.redemption_time)
            .field("mac", &"[REDACTED]")
            .finish()
    }
}

/// Serialized single-use presentation.
#[derive(Clone)]
pub struct Presentation {
    bytes: Vec<u8>,
}

/// Public fields a verifier can read from a presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentationFields {
    pub level: BackupLevel,
    pub redemption_time: u64,
    pub backup_id: BackupId,
}

impl Presentation {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Signature over the presentation by the backup's signing key.
    pub fn sign(&self, key: &BackupKey) -> [u8; 64] {
        key.sign(&self.bytes)
    }

    /// Parse the public header of a presentation.
    pub fn inspect(bytes: &[u8]) -> anyhow::Result<PresentationFields> {
        if bytes.len() != PRESENTATION_LEN {
            anyhow::bail!(
                "presentation has wrong size: {} bytes (expected {PRESENTATION_LEN})",
                bytes.len()
            );
        }
        if bytes[0] != CREDENTIAL_VERSION {
            anyhow::bail!("unsupported presentation version {}", bytes[0]);
        }
        let level = BackupLevel::from_byte(bytes[1])
            .ok_or_else(|| anyhow::anyhow!("unknown backup level {}", bytes[1]))?;
        let mut time_bytes = [0u8; 8];
        time_bytes.copy_from_slice(&bytes[2..10]);
        let mut id = [0u8; BACKUP_ID_SIZE];
        id.copy_from_slice(&bytes[10..10 + BACKUP_ID_SIZE]);
        Ok(PresentationFields {
            level,
            redemption_time: u64::from_be_bytes(time_bytes),
            backup_id: BackupId(id),
        })
    }
}

impl std::fmt::Debug for Presentation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Presentation")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Issuer side: mint a service credential for one day.
///
/// Used by archive servers and test stubs; clients only receive credentials.
pub fn issue_service_credential(
    issuer_secret: &[u8; 32],
    level: BackupLevel,
    redemption_time: u64,
) -> ArchiveServiceCredential {
    let mut hasher = blake3::Hasher::new_keyed(issuer_secret);
    hasher.update(&[level.as_byte()]);
    hasher.update(&redemption_time.to_be_bytes());
    let mac = hasher.finalize();

    let mut credential = Vec::with_capacity(CREDENTIAL_LEN);
    credential.push(CREDENTIAL_VERSION);
    credential.push(level.as_byte());
    credential.extend_from_slice(&redemption_time.to_be_bytes());
    credential.extend_from_slice(mac.as_bytes());

    ArchiveServiceCredential {
        credential,
        redemption_time,
    }
}
