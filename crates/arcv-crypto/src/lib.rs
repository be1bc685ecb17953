//! arcv-crypto: key material for the encrypted-backup archive
//!
//! Everything is derived from a single 256-bit backup key:
//! ```text
//! BackupKey (256-bit, owned by the account)
//!   ├── Backup ID          (HKDF, domain="arcv-backup-id", 128-bit)
//!   ├── Signing key        (HKDF, domain="arcv-backup-signing-key", Ed25519)
//!   ├── Credential request (HKDF, domain="arcv-credential-request" || level)
//!   └── Presentation key   (HKDF, domain="arcv-presentation", keyed BLAKE3 tag)
//! ```
//!
//! Service credentials are received per day and turned into single-use
//! presentations carrying a fresh nonce, so two requests made with the same
//! credential cannot be linked by their authorization bytes.

pub mod credential;
pub mod key;

pub use credential::{
    issue_service_credential, BackupAuthCredential, Presentation, PresentationFields,
};
pub use key::{generate_attachment_secret, BackupId, BackupKey};

/// Size of a backup key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of a backup id in bytes (128-bit)
pub const BACKUP_ID_SIZE: usize = 16;

/// Size of the per-presentation nonce
pub const NONCE_SIZE: usize = 32;

/// Size of an attachment secret (AES-256 key || HMAC-SHA256 key)
pub const ATTACHMENT_SECRET_SIZE: usize = 64;

/// Size of an attachment IV
pub const ATTACHMENT_IV_SIZE: usize = 16;
