//! Shared fixtures: in-memory local backend and an in-process archive service stub
#![allow(dead_code)]

pub mod stub;

use std::time::Duration;

use opendal::Operator;

use arcv_client::{LocalArchiveApi, UploadCoordinator, UploadPolicy};
use arcv_core::types::ArchiveServiceCredential;
use arcv_crypto::BackupKey;

pub fn memory_operator() -> Operator {
    Operator::new(opendal::services::Memory::default())
        .expect("memory operator")
        .finish()
}

pub fn fast_policy(chunk_size: usize) -> UploadPolicy {
    UploadPolicy {
        chunk_size,
        max_resume_attempts: 3,
        backoff: Duration::from_millis(1),
    }
}

pub fn local_api(op: Operator) -> LocalArchiveApi {
    LocalArchiveApi::new(op, UploadCoordinator::new(fast_policy(1024 * 1024)))
}

pub fn test_key(seed: u8) -> BackupKey {
    BackupKey::from_bytes([seed; 32])
}

/// What sessions hand the local backend in place of a real credential.
pub fn placeholder_credential() -> ArchiveServiceCredential {
    ArchiveServiceCredential {
        credential: Vec::new(),
        redemption_time: 0,
    }
}

/// Deterministic payload of `len` bytes.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(31) % 256) as u8).collect()
}
