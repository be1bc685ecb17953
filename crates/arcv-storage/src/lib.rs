//! arcv-storage: OpenDAL operators backing the local archive variant
//! (on-device filesystem, or a self-hosted S3-compatible endpoint)

pub mod health;
pub mod operator;

pub use health::check_health;
pub use operator::{build_from_core_config, build_fs_operator, build_s3_operator, S3Credentials};
