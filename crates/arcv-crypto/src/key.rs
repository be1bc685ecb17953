//! Backup key and everything derived from it

use ed25519_dalek::{Signer, SigningKey};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroize;

use arcv_core::BackupLevel;

use crate::{ATTACHMENT_IV_SIZE, ATTACHMENT_SECRET_SIZE, BACKUP_ID_SIZE, KEY_SIZE};

/// The account's 256-bit backup seed. Zeroized on drop, never transmitted.
#[derive(Clone)]
pub struct BackupKey {
    bytes: [u8; KEY_SIZE],
}

impl BackupKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// Generate a fresh random backup key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::from_bytes(bytes)
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(s: &str) -> anyhow::Result<Self> {
        let mut decoded = hex::decode(s.trim())
            .map_err(|e| anyhow::anyhow!("backup key is not valid hex: {e}"))?;
        if decoded.len() != KEY_SIZE {
            let len = decoded.len();
            decoded.zeroize();
            anyhow::bail!("backup key has wrong size: {len} bytes (expected {KEY_SIZE})");
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&decoded);
        decoded.zeroize();
        Ok(Self::from_bytes(bytes))
    }

    /// The backup identity reserved on the service.
    pub fn backup_id(&self) -> BackupId {
        let mut id = [0u8; BACKUP_ID_SIZE];
        hkdf_expand(&self.bytes, b"arcv-backup-id", &mut id);
        BackupId(id)
    }

    /// Ed25519 key whose public half is registered with `set_public_key`.
    pub fn signing_key(&self) -> SigningKey {
        let mut seed = [0u8; KEY_SIZE];
        hkdf_expand(&self.bytes, b"arcv-backup-signing-key", &mut seed);
        let key = SigningKey::from_bytes(&seed);
        seed.zeroize();
        key
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key().verifying_key().to_bytes()
    }

    /// Sign `message` with the derived signing key.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key().sign(message).to_bytes()
    }

    /// Deterministic credential request for `level`. Identical across calls,
    /// so repeating a reservation sends the same payload.
    pub fn credential_request(&self, level: BackupLevel) -> Vec<u8> {
        let mut info = b"arcv-credential-request".to_vec();
        info.push(level.as_byte());
        let mut body = [0u8; KEY_SIZE];
        hkdf_expand(&self.bytes, &info, &mut body);

        let mut request = Vec::with_capacity(1 + KEY_SIZE);
        request.push(level.as_byte());
        request.extend_from_slice(&body);
        request
    }

    pub(crate) fn presentation_key(&self) -> [u8; KEY_SIZE] {
        let mut key = [0u8; KEY_SIZE];
        hkdf_expand(&self.bytes, b"arcv-presentation", &mut key);
        key
    }
}

impl Drop for BackupKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for BackupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// 128-bit backup identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackupId(pub [u8; BACKUP_ID_SIZE]);

impl BackupId {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for BackupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Random attachment secret (AES key || HMAC key) and IV for a media upload.
pub fn generate_attachment_secret() -> (Vec<u8>, Vec<u8>) {
    let mut secret = vec![0u8; ATTACHMENT_SECRET_SIZE];
    let mut iv = vec![0u8; ATTACHMENT_IV_SIZE];
    let mut rng = rand::thread_rng();
    rng.fill_bytes(&mut secret);
    rng.fill_bytes(&mut iv);
    (secret, iv)
}

/// HKDF-SHA256 expansion with a domain-specific info string.
///
/// Output lengths used here are far below the 255 * 32 byte HKDF limit.
fn hkdf_expand(ikm: &[u8; KEY_SIZE], info: &[u8], okm: &mut [u8]) {
    let hkdf = Hkdf::<Sha256>::new(None, ikm);
    if hkdf.expand(info, okm).is_err() {
        unreachable!("HKDF output length {} within limit", okm.len());
    }
}
