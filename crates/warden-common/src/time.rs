//! ---
//! warden_section: "01-core-functionality"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Shared primitives and utilities for the controller runtime."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Wall-clock time used for persisted timestamps.
pub fn wall_now() -> DateTime<Utc> {
    Utc::now()
}

/// Time elapsed between `earlier` and `now`, saturating at zero when the clock went backwards.
pub fn elapsed_since(now: DateTime<Utc>, earlier: DateTime<Utc>) -> Duration {
    (now - earlier).to_std().unwrap_or(Duration::ZERO)
}

/// Whether `last_update` is older than `term` as observed at `now`.
pub fn is_expired(now: DateTime<Utc>, last_update: DateTime<Utc>, term: Duration) -> bool {
    elapsed_since(now, last_update) > term
}
