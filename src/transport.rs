//! Network I/O and credential seams for the executor.
//!
//! [`Transport`] is the only place a network call happens, which lets tests
//! substitute an instrumented fake. [`AuthProvider`] stands in for the
//! credential collaborator: it may be slow (token refresh) and its failures
//! count as request failures.

use anyhow::{bail, Result};
use async_trait::async_trait;
use base64::Engine;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::AuthConfig;
use crate::error::TransportError;
use crate::models::{RequestSpec, Response};

#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue one network attempt. HTTP error statuses are returned as
    /// `Ok(Response)`; only connection-level failures are `Err`.
    async fn send(&self, request: &RequestSpec, timeout: Duration)
        -> Result<Response, TransportError>;
}

/// [`Transport`] backed by a shared `reqwest::Client` (connection pooled,
/// safe for concurrent use).
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("connector-runtime/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(
        &self,
        request: &RequestSpec,
        timeout: Duration,
    ) -> Result<Response, TransportError> {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .timeout(timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| classify_reqwest_error(e, timeout))?;

        let status = resp.status().as_u16();
        let mut headers = BTreeMap::new();
        for (name, value) in resp.headers() {
            if let Ok(v) = value.to_str() {
                headers.insert(name.as_str().to_ascii_lowercase(), v.to_string());
            }
        }
        let body = resp
            .bytes()
            .await
            .map_err(|e| classify_reqwest_error(e, timeout))?
            .to_vec();

        Ok(Response {
            status,
            headers,
            body,
        })
    }
}

fn classify_reqwest_error(err: reqwest::Error, timeout: Duration) -> TransportError {
    if err.is_timeout() {
        TransportError::TimedOut(timeout)
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}

/// Produces auth headers for an outbound request.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn auth_headers(&self) -> Result<BTreeMap<String, String>>;
}

/// Static credential schemes read from the environment at startup.
///
/// - `CRT_AUTH_TOKEN`: bearer token or API key
/// - `CRT_AUTH_USER` / `CRT_AUTH_PASSWORD`: basic auth
#[derive(Debug, Clone)]
pub enum StaticAuth {
    None,
    Bearer(String),
    Basic { user: String, password: String },
    ApiKey { header: String, key: String },
}

impl StaticAuth {
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let env = |name: &str| {
            std::env::var(name).map_err(|_| anyhow::anyhow!("{} environment variable not set", name))
        };
        match config.kind.as_str() {
            "none" => Ok(StaticAuth::None),
            "bearer" => Ok(StaticAuth::Bearer(env("CRT_AUTH_TOKEN")?)),
            "basic" => Ok(StaticAuth::Basic {
                user: env("CRT_AUTH_USER")?,
                password: env("CRT_AUTH_PASSWORD")?,
            }),
            "api_key" => Ok(StaticAuth::ApiKey {
                header: config.header.clone(),
                key: env("CRT_AUTH_TOKEN")?,
            }),
            other => bail!("Unknown auth kind: {}", other),
        }
    }
}

#[async_trait]
impl AuthProvider for StaticAuth {
    async fn auth_headers(&self) -> Result<BTreeMap<String, String>> {
        let mut headers = BTreeMap::new();
        match self {
            StaticAuth::None => {}
            StaticAuth::Bearer(token) => {
                headers.insert("Authorization".to_string(), format!("Bearer {}", token));
            }
            StaticAuth::Basic { user, password } => {
                let encoded = base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", user, password));
                headers.insert("Authorization".to_string(), format!("Basic {}", encoded));
            }
            StaticAuth::ApiKey { header, key } => {
                headers.insert(header.clone(), key.clone());
            }
        }
        Ok(headers)
    }
}
