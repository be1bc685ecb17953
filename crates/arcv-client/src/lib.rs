//! arcv-client: archive protocol client
//!
//! - [`api::ArchiveApi`]: the capability trait
//! - [`network::NetworkArchiveApi`]: remote archive service over HTTPS
//! - [`local::LocalArchiveApi`]: on-device stand-in over OpenDAL
//! - [`upload::UploadCoordinator`]: resumable chunked uploads
//! - [`credentials::CredentialCache`]: day-keyed credential cache
//! - [`session::ArchiveSession`]: initialize / upload / copy / delete flows

pub mod api;
pub mod catalog;
pub mod credentials;
pub mod local;
pub mod network;
pub mod selector;
pub mod session;
pub mod upload;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{ArchiveApi, ProgressFn, UploadControl, DEBUG_PAGE_SIZE};
pub use catalog::{collect_all, MediaPager};
pub use credentials::CredentialCache;
pub use local::LocalArchiveApi;
pub use network::NetworkArchiveApi;
pub use selector::build_api;
pub use session::{
    ArchiveSession, BackupUpload, BackupUploadFailure, NoopSettings, SettingsSink,
};
pub use upload::{
    BytesSource, FileSource, FormLedger, ResumableTransport, UploadCoordinator, UploadPolicy,
    UploadSource,
};
