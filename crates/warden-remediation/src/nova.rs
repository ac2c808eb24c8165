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

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;
use warden_common::config::OpenstackConfig;

use crate::{ComputeApi, ComputeService, RemediationError, Result, Server};

const FORCE_DOWN_MICROVERSION: &str = "2.37";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct Session {
    token: String,
    compute_url: Url,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: TokenBody,
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    endpoints: Vec<CatalogEndpoint>,
}

#[derive(Debug, Deserialize)]
struct CatalogEndpoint {
    interface: String,
    #[serde(default)]
    region: Option<String>,
    url: String,
}

#[derive(Debug, Deserialize)]
struct ServiceList {
    services: Vec<ComputeService>,
}

#[derive(Debug, Deserialize)]
struct ServerList {
    servers: Vec<Server>,
    #[serde(default)]
    servers_links: Vec<Link>,
}

#[derive(Debug, Deserialize)]
struct Link {
    rel: String,
    href: String,
}

/// OpenStack compute client authenticated against Keystone v3.
///
/// The token and the compute endpoint are fetched lazily and dropped when the
/// API answers 401, so the next call authenticates again.
#[derive(Debug)]
pub struct NovaClient {
    client: Client,
    config: OpenstackConfig,
    session: Mutex<Option<Session>>,
}

impl NovaClient {
    pub fn new(config: OpenstackConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|source| RemediationError::Http {
                url: config.auth_url.clone(),
                source,
            })?;
        Ok(Self {
            client,
            config,
            session: Mutex::new(None),
        })
    }

    fn tokens_url(&self) -> Result<Url> {
        let trimmed = self.config.auth_url.trim_end_matches('/');
        let base = if trimmed.ends_with("/v3") {
            format!("{trimmed}/auth/tokens")
        } else {
            format!("{trimmed}/v3/auth/tokens")
        };
        Ok(Url::parse(&base)?)
    }

    async fn authenticate(&self) -> Result<Session> {
        let url = self.tokens_url()?;
        let body = json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": self.config.username,
                            "domain": { "name": self.config.domain_name },
                            "password": self.config.password,
                        }
                    }
                },
                "scope": {
                    "project": {
                        "name": self.config.project_name,
                        "domain": { "name": self.config.domain_name },
                    }
                }
            }
        });
        let response = send(self.client.post(url.clone()).json(&body), &url).await?;
        let token = response
            .headers()
            .get("x-subject-token")
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
            .ok_or(RemediationError::MissingToken)?;
        let decoded: TokenResponse = response.json().await.map_err(|source| {
            RemediationError::Http {
                url: url.to_string(),
                source,
            }
        })?;
        let compute_url = self.compute_endpoint(&decoded.token.catalog)?;
        info!(compute = %compute_url, "authenticated against identity service");
        Ok(Session { token, compute_url })
    }

    fn compute_endpoint(&self, catalog: &[CatalogEntry]) -> Result<Url> {
        let region = self
            .config
            .region_name
            .as_deref()
            .filter(|region| !region.is_empty());
        let endpoint = catalog
            .iter()
            .filter(|entry| entry.kind == "compute")
            .flat_map(|entry| entry.endpoints.iter())
            .filter(|endpoint| endpoint.interface == "public")
            .find(|endpoint| region.is_none() || endpoint.region.as_deref() == region)
            .ok_or_else(|| RemediationError::MissingEndpoint {
                region: region.map(str::to_owned),
            })?;
        // Joining relative paths needs a trailing slash on the base.
        let mut url = endpoint.url.trim_end_matches('/').to_owned();
        url.push('/');
        Ok(Url::parse(&url)?)
    }

    async fn session(&self) -> Result<Session> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            return Ok(session.clone());
        }
        let session = self.authenticate().await?;
        *guard = Some(session.clone());
        Ok(session)
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        build: impl FnOnce(RequestBuilder) -> RequestBuilder,
    ) -> Result<Response> {
        let session = self.session().await?;
        let url = session.compute_url.join(path)?;
        let builder = self
            .client
            .request(method, url.clone())
            .header("x-auth-token", &session.token);
        let result = send(build(builder), &url).await;
        if let Err(RemediationError::Status { status: 401, .. }) = &result {
            debug!("compute token rejected, dropping session");
            *self.session.lock().await = None;
        }
        result
    }
}

async fn send(builder: RequestBuilder, url: &Url) -> Result<Response> {
    let response = builder
        .send()
        .await
        .map_err(|source| RemediationError::Http {
            url: url.to_string(),
            source,
        })?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RemediationError::Status {
        url: url.to_string(),
        status: status.as_u16(),
        body,
    })
}

async fn decode<T: serde::de::DeserializeOwned>(response: Response) -> Result<T> {
    let url = response.url().to_string();
    response
        .json()
        .await
        .map_err(|source| RemediationError::Http { url, source })
}

#[async_trait]
impl ComputeApi for NovaClient {
    async fn list_services(&self) -> Result<Vec<ComputeService>> {
        let response = self.request(Method::GET, "os-services", |b| b).await?;
        Ok(decode::<ServiceList>(response).await?.services)
    }

    async fn force_down_service(&self, service: &ComputeService) -> Result<()> {
        let body = json!({
            "host": service.host,
            "binary": service.binary,
            "forced_down": true,
        });
        self.request(Method::PUT, "os-services/force-down", |b| {
            b.header("x-openstack-nova-api-version", FORCE_DOWN_MICROVERSION)
                .json(&body)
        })
        .await?;
        Ok(())
    }

    async fn disable_service(&self, service: &ComputeService, reason: &str) -> Result<()> {
        let (path, body) = if reason.is_empty() {
            (
                "os-services/disable",
                json!({ "host": service.host, "binary": service.binary }),
            )
        } else {
            (
                "os-services/disable-log-reason",
                json!({
                    "host": service.host,
                    "binary": service.binary,
                    "disabled_reason": reason,
                }),
            )
        };
        self.request(Method::PUT, path, |b| b.json(&body)).await?;
        Ok(())
    }

    async fn list_servers(&self, host: &str) -> Result<Vec<Server>> {
        let mut servers = Vec::new();
        let mut response = self
            .request(Method::GET, "servers/detail", |b| {
                b.query(&[("host", host), ("all_tenants", "1")])
            })
            .await?;
        loop {
            let page: ServerList = decode(response).await?;
            servers.extend(page.servers);
            let Some(next) = page.servers_links.into_iter().find(|link| link.rel == "next") else {
                break;
            };
            response = self.request(Method::GET, &next.href, |b| b).await?;
        }
        Ok(servers)
    }

    async fn evacuate(&self, server_id: &str) -> Result<()> {
        let path = format!("servers/{server_id}/action");
        let body = json!({ "evacuate": { "onSharedStorage": true } });
        self.request(Method::POST, &path, |b| b.json(&body)).await?;
        Ok(())
    }
}

