//! Client for an instance served by another process.

use std::time::Duration;

use tracing::info;

use super::InstanceStatus;
use crate::config::{EngineConfig, RetryPolicy};
use crate::server::RPC_PATH;
use crate::service::{Request, Response};
use crate::storage::distributed::{decode_response, normalize_endpoint, transport_error};
use crate::storage::retry;
use crate::{Error, Result};

#[derive(Debug)]
pub struct RemoteInstance {
    address: String,
    client: reqwest::Client,
    timeout: Duration,
    retry: RetryPolicy,
}

impl RemoteInstance {
    /// Attach to a running instance. The status handshake must answer within
    /// the remote deadline.
    pub async fn connect(address: &str, engine: &EngineConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Config(format!("http client: {e}")))?;
        let remote = Self {
            address: normalize_endpoint(address),
            client,
            timeout: engine.remote_timeout(),
            retry: engine.unavailable_retry,
        };
        let status = remote.status().await?;
        info!(address = %remote.address, instance = %status.id, state = ?status.state, "connected to remote instance");
        Ok(remote)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Send one request. Only transport failures are retried with backoff;
    /// an error the instance itself answered with (a degraded instance
    /// rejecting a write included) comes back at once with its original kind.
    pub async fn call(&self, request: &Request) -> Result<Response> {
        let resp = retry::on_unavailable(&self.retry, request.name(), || self.send(request)).await?;
        decode_response(&self.address, resp).await
    }

    async fn send(&self, request: &Request) -> Result<reqwest::Response> {
        let url = format!("{}{RPC_PATH}", self.address);
        self.client
            .post(url)
            .timeout(self.timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| transport_error(&self.address, &e))
    }

    pub async fn status(&self) -> Result<InstanceStatus> {
        let resp = self.send(&Request::Status).await?;
        match decode_response(&self.address, resp).await? {
            Response::Status { status } => Ok(status),
            other => Err(Error::Storage(format!("{}: unexpected status response {other:?}", self.address))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_unreachable() {
        let engine = EngineConfig { remote_timeout_ms: 500, ..EngineConfig::default() };
        let res = RemoteInstance::connect("127.0.0.1:9", &engine).await;
        assert!(matches!(res, Err(Error::Unavailable(_)) | Err(Error::Timeout(_))));
    }
}
