//! HTTP implementation of [`ApiCaller`].

use std::time::Duration;

use async_trait::async_trait;
use imprimatur_policy::policy::Method;
use reqwest::Client;
use tracing::debug;

use crate::capability::{ApiCaller, ApiRequest, CapabilityError};

/// Executes API calls over HTTP(S) with `reqwest`.
///
/// Requests carrying a CA bundle get a dedicated client trusting those
/// certificates in addition to the built-in roots.
pub struct HttpApiCaller {
    client: Client,
    timeout: Duration,
}

impl HttpApiCaller {
    /// Create a caller whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, CapabilityError> {
        Ok(Self {
            client: build_client(timeout, None)?,
            timeout,
        })
    }
}

fn build_client(timeout: Duration, ca_bundle: Option<&str>) -> Result<Client, CapabilityError> {
    let mut builder = Client::builder().timeout(timeout);
    if let Some(bundle) = ca_bundle {
        let certs = reqwest::Certificate::from_pem_bundle(bundle.as_bytes())
            .map_err(|e| CapabilityError::Operational(format!("invalid CA bundle: {e}")))?;
        if certs.is_empty() {
            return Err(CapabilityError::Operational(
                "CA bundle contains no certificates".to_owned(),
            ));
        }
        for cert in certs {
            builder = builder.add_root_certificate(cert);
        }
    }
    builder
        .build()
        .map_err(|e| CapabilityError::Operational(format!("failed to create HTTP client: {e}")))
}

#[async_trait]
impl ApiCaller for HttpApiCaller {
    async fn call(&self, request: &ApiRequest) -> Result<Vec<u8>, CapabilityError> {
        let custom;
        let client = match request.ca_bundle.as_deref() {
            Some(bundle) => {
                custom = build_client(self.timeout, Some(bundle))?;
                &custom
            }
            None => &self.client,
        };

        let mut builder = match request.method {
            Method::Get => client.get(&request.url),
            Method::Post => client.post(&request.url),
        };
        for header in &request.headers {
            builder = builder.header(&header.key, &header.value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        debug!(url = %request.url, method = ?request.method, "executing api call");
        let response = builder.send().await.map_err(|e| {
            CapabilityError::Operational(format!("failed to call {}: {e}", request.url))
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(CapabilityError::Operational(format!(
                "{} returned HTTP {status}",
                request.url
            )));
        }

        response.bytes().await.map(|b| b.to_vec()).map_err(|e| {
            CapabilityError::Operational(format!(
                "failed to read response from {}: {e}",
                request.url
            ))
        })
    }
}
