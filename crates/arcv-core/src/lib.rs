//! arcv-core: data model, error taxonomy, configuration schema and clock
//! shared by every arcv crate.

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use clock::{start_of_day, Clock, ManualClock, SystemClock, SECONDS_PER_DAY};
pub use error::{ArchiveError, ArchiveResult};
pub use types::{BackupLevel, LOCAL_CDN};
