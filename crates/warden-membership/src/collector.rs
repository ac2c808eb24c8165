//! ---
//! warden_section: "04-health-signals"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Membership feeds and per-tag health event collection."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{debug, warn};
use warden_common::config::{MonitorConfig, MonitorKind};

use crate::{MemberStatus, MembershipError, MembershipEvent, MembershipSource, SerfSource};

/// Feed backing a configured monitor.
pub fn source_for(config: &MonitorConfig) -> Arc<dyn MembershipSource> {
    match config.kind {
        MonitorKind::Serf => Arc::new(SerfSource::from_config(config)),
    }
}

/// Polls one membership feed on behalf of a health-signal tag.
#[derive(Debug)]
pub struct EventCollector {
    tag: String,
    source: Arc<dyn MembershipSource>,
    pending: Option<mpsc::Receiver<Vec<MemberStatus>>>,
}

impl EventCollector {
    pub fn new(tag: impl Into<String>, source: Arc<dyn MembershipSource>) -> Self {
        Self {
            tag: tag.into(),
            source,
            pending: None,
        }
    }

    /// Collector for a configured monitor.
    pub fn from_config(tag: &str, config: &MonitorConfig) -> Self {
        Self::new(tag, source_for(config))
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Request a snapshot unless one is already outstanding.
    pub fn start(&mut self) -> Result<(), MembershipError> {
        if self.pending.is_some() {
            debug!(tag = %self.tag, "snapshot request already pending");
            return Ok(());
        }
        self.pending = Some(self.source.start()?);
        Ok(())
    }

    /// Take the snapshot if it has arrived. Never blocks.
    ///
    /// Returns `None` when nothing is pending, when the feed has not answered
    /// yet, or when it gave up without answering.
    pub fn drain_events(&mut self) -> Option<Vec<MembershipEvent>> {
        let rx = self.pending.as_mut()?;
        match rx.try_recv() {
            Ok(members) => {
                self.pending = None;
                let tag = self.tag.as_str();
                Some(
                    members
                        .into_iter()
                        .map(|member| MembershipEvent::from_member(tag, member))
                        .collect(),
                )
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                warn!(tag = %self.tag, "membership feed closed without a snapshot");
                self.pending = None;
                None
            }
        }
    }
}
