//! ---
//! warden_section: "04-health-signals"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Membership feeds and per-tag health event collection."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
//! Scripted membership feed, compiled for tests and the `test-util` feature.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{MemberStatus, MembershipError, MembershipSource};

/// Scripted feed.
///
/// Snapshots are handed out in order; once the script is exhausted the
/// fallback snapshot (if any) is repeated. While held, requests stay pending
/// until [`StaticSource::release`] is called.
#[derive(Debug, Default)]
pub struct StaticSource {
    script: Mutex<VecDeque<Vec<MemberStatus>>>,
    fallback: Option<Vec<MemberStatus>>,
    held: Mutex<Option<Vec<mpsc::Sender<Vec<MemberStatus>>>>>,
    starts: AtomicUsize,
}

impl StaticSource {
    pub fn new(script: impl IntoIterator<Item = Vec<MemberStatus>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Answer every request with the same snapshot.
    pub fn repeating(snapshot: Vec<MemberStatus>) -> Self {
        Self {
            fallback: Some(snapshot),
            ..Self::default()
        }
    }

    /// Keep requests pending until [`StaticSource::release`].
    pub fn held(self) -> Self {
        *self.held.lock() = Some(Vec::new());
        self
    }

    pub fn push(&self, snapshot: Vec<MemberStatus>) {
        self.script.lock().push_back(snapshot);
    }

    /// Number of snapshot requests received so far.
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Answer every pending request and stop holding new ones.
    pub fn release(&self) {
        let pending = self.held.lock().take().unwrap_or_default();
        for tx in pending {
            self.answer(tx);
        }
    }

    fn next_snapshot(&self) -> Option<Vec<MemberStatus>> {
        self.script
            .lock()
            .pop_front()
            .or_else(|| self.fallback.clone())
    }

    fn answer(&self, tx: mpsc::Sender<Vec<MemberStatus>>) {
        if let Some(snapshot) = self.next_snapshot() {
            // Capacity one and a fresh channel: cannot be full.
            let _ = tx.try_send(snapshot);
        }
    }
}

impl MembershipSource for StaticSource {
    fn start(&self) -> Result<mpsc::Receiver<Vec<MemberStatus>>, MembershipError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(1);
        {
            let mut held = self.held.lock();
            if let Some(pending) = held.as_mut() {
                pending.push(tx);
                return Ok(rx);
            }
        }
        self.answer(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_then_fallback() {
        let source = StaticSource::new(vec![vec![MemberStatus::failed("h1")]]);
        let mut first = source.start().unwrap();
        assert_eq!(first.try_recv().unwrap(), vec![MemberStatus::failed("h1")]);
        let mut second = source.start().unwrap();
        // No fallback: the channel closes without a snapshot.
        assert!(matches!(
            second.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert_eq!(source.starts(), 2);
    }

    #[test]
    fn held_requests_wait_for_release() {
        let source = StaticSource::repeating(vec![MemberStatus::active("h1")]).held();
        let mut rx = source.start().unwrap();
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Empty)
        ));
        source.release();
        assert_eq!(rx.try_recv().unwrap(), vec![MemberStatus::active("h1")]);
    }
}
