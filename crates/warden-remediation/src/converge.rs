//! ---
//! warden_section: "06-remediation"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Workload evacuation from fenced hosts."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Serialize;
use tracing::info;
use url::Url;
use warden_common::config::ConvergeConfig;

use crate::{RemediationError, Result};

const EVACUATE_PATH: &str = "catkeeper/v1/servers/evacuate";

#[derive(Debug, Serialize)]
struct EvacuateRequest<'a> {
    hostname: &'a str,
    user: &'a str,
}

/// Hands fenced hosts to a Converge controller, which evacuates them itself.
#[derive(Debug, Clone)]
pub struct ConvergeClient {
    client: Client,
    endpoint: Url,
    username: String,
}

impl ConvergeClient {
    pub fn new(config: &ConvergeConfig) -> Result<Self> {
        let mut base = config.url.trim_end_matches('/').to_owned();
        base.push('/');
        let endpoint = Url::parse(&base)?.join(EVACUATE_PATH)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|source| RemediationError::Http {
                url: endpoint.to_string(),
                source,
            })?;
        Ok(Self {
            client,
            endpoint,
            username: config.username.clone(),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Request evacuation of every instance on `host`. Only `202 Accepted` counts.
    pub async fn evacuate_host(&self, host: &str) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&EvacuateRequest {
                hostname: host,
                user: &self.username,
            })
            .send()
            .await
            .map_err(|source| RemediationError::Http {
                url: self.endpoint.to_string(),
                source,
            })?;
        let status = response.status();
        if status != StatusCode::ACCEPTED {
            let body = response.text().await.unwrap_or_default();
            return Err(RemediationError::Status {
                url: self.endpoint.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        info!(host, "evacuation accepted by converge");
        Ok(())
    }
}
