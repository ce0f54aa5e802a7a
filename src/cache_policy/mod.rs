//! Cache-lifetime policy for legacy content.
//!
//! - [`page_path`]: maps legacy URL shapes onto one canonical page path
//! - [`release_time`]: looks up the scheduled release of a canonical path
//! - [`max_age`]: turns both into a TTL

pub mod max_age;
pub mod page_path;
pub mod release_time;

pub use max_age::{MaxAge, MaxAgeCalculator};
pub use page_path::resolve_page_path;
pub use release_time::{ReleaseTimeClient, ReleaseTimeLookup, ReleaseTimeSource, cache_time_id};
