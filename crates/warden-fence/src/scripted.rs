//! ---
//! warden_section: "05-fencing"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Out-of-band power control for failed hosts."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
//! In-process BMC, compiled for tests and the `test-util` feature.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{BmcConnector, BmcEndpoint, BmcSession, FenceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BmcStep {
    Open,
    PowerOff,
    Close,
}

/// One recorded interaction with the scripted controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BmcCall {
    pub address: String,
    pub step: BmcStep,
}

impl BmcCall {
    pub fn new(address: impl Into<String>, step: BmcStep) -> Self {
        Self {
            address: address.into(),
            step,
        }
    }
}

#[derive(Debug, Default)]
struct Script {
    failures: HashSet<(String, BmcStep)>,
    calls: Vec<BmcCall>,
}

/// Records every step and fails the ones it was told to.
#[derive(Debug, Clone, Default)]
pub struct ScriptedBmc {
    script: Arc<Mutex<Script>>,
}

impl ScriptedBmc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `step` fail for the controller at `address`.
    pub fn fail(&self, address: &str, step: BmcStep) {
        self.script
            .lock()
            .failures
            .insert((address.to_owned(), step));
    }

    pub fn calls(&self) -> Vec<BmcCall> {
        self.script.lock().calls.clone()
    }

    /// Addresses that were successfully powered off.
    pub fn powered_off(&self) -> Vec<String> {
        let script = self.script.lock();
        script
            .calls
            .iter()
            .filter(|call| {
                call.step == BmcStep::PowerOff
                    && !script
                        .failures
                        .contains(&(call.address.clone(), BmcStep::PowerOff))
            })
            .map(|call| call.address.clone())
            .collect()
    }

    fn record(&self, address: &str, step: BmcStep) -> Result<(), String> {
        let mut script = self.script.lock();
        script.calls.push(BmcCall::new(address, step));
        if script.failures.contains(&(address.to_owned(), step)) {
            Err(format!("scripted {step:?} failure"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BmcConnector for ScriptedBmc {
    async fn open(&self, endpoint: &BmcEndpoint) -> Result<Box<dyn BmcSession>, FenceError> {
        self.record(&endpoint.address, BmcStep::Open)
            .map_err(|reason| FenceError::Connect {
                address: endpoint.address.clone(),
                reason,
            })?;
        Ok(Box::new(ScriptedSession {
            bmc: self.clone(),
            address: endpoint.address.clone(),
        }))
    }
}

struct ScriptedSession {
    bmc: ScriptedBmc,
    address: String,
}

#[async_trait]
impl BmcSession for ScriptedSession {
    async fn power_off(&mut self) -> Result<(), FenceError> {
        self.bmc
            .record(&self.address, BmcStep::PowerOff)
            .map_err(|reason| FenceError::Command {
                address: self.address.clone(),
                action: "power off",
                reason,
            })
    }

    async fn close(self: Box<Self>) -> Result<(), FenceError> {
        self.bmc
            .record(&self.address, BmcStep::Close)
            .map_err(|reason| FenceError::Close {
                address: self.address.clone(),
                reason,
            })
    }
}
