//! ---
//! warden_section: "05-fencing"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Out-of-band power control for failed hosts."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
use std::fmt;

use async_trait::async_trait;
use warden_persistence::FencerConfig;

use crate::FenceError;

/// Address and credentials of a management controller.
#[derive(Clone, PartialEq, Eq)]
pub struct BmcEndpoint {
    pub address: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl BmcEndpoint {
    pub fn from_config(config: &FencerConfig) -> Self {
        Self {
            address: config.address.clone(),
            port: config.port,
            username: config.username.clone(),
            password: config.password.clone(),
        }
    }
}

impl fmt::Debug for BmcEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BmcEndpoint")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl fmt::Display for BmcEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Opens authenticated sessions to management controllers.
#[async_trait]
pub trait BmcConnector: Send + Sync + fmt::Debug {
    async fn open(&self, endpoint: &BmcEndpoint) -> Result<Box<dyn BmcSession>, FenceError>;
}

/// An open management session.
#[async_trait]
pub trait BmcSession: Send {
    /// Cut chassis power immediately.
    async fn power_off(&mut self) -> Result<(), FenceError>;

    async fn close(self: Box<Self>) -> Result<(), FenceError>;
}
