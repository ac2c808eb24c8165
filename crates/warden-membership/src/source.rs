//! ---
//! warden_section: "04-health-signals"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Membership feeds and per-tag health event collection."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
use std::fmt::Debug;

use tokio::sync::mpsc;

use crate::{MemberStatus, MembershipError};

/// External feed reporting which members are alive.
///
/// Each call to [`MembershipSource::start`] requests one snapshot. The returned
/// channel yields it once and then closes; a feed that fails simply closes the
/// channel without sending.
pub trait MembershipSource: Send + Sync + Debug {
    fn start(&self) -> Result<mpsc::Receiver<Vec<MemberStatus>>, MembershipError>;
}
