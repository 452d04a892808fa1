use log::{info, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::{DhtError, DhtResult};

/// Address/port pair as the rendezvous service speaks it. The port travels
/// as a string on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEndpoint {
    pub address: String,
    pub port: String,
}

impl PeerEndpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port: port.to_string(),
        }
    }

    pub fn to_authority(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Client for the bootstrap rendezvous service: a peer registers its own
/// endpoint, periodically refreshes it, asks for the endpoints of everybody
/// else, and deregisters on the way out.
pub struct BootstrapClient {
    base_url: String,
    http: Client,
}

impl BootstrapClient {
    pub fn new(base_url: impl Into<String>) -> DhtResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| DhtError::Internal(format!("failed to create http client: {}", e)))?;
        Ok(Self {
            base_url: base_url.into(),
            http,
        })
    }

    pub async fn get_ips(&self) -> DhtResult<Vec<PeerEndpoint>> {
        let url = format!("{}/ips", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| DhtError::Network(format!("GET {} failed: {}", url, e)))?;
        response
            .json::<Vec<PeerEndpoint>>()
            .await
            .map_err(|e| DhtError::Decode(format!("invalid ip list from rendezvous: {}", e)))
    }

    pub async fn register(&self, endpoint: &PeerEndpoint) -> DhtResult<()> {
        self.post("register", endpoint).await
    }

    pub async fn keep_alive(&self, endpoint: &PeerEndpoint) -> DhtResult<()> {
        self.post("keepalive", endpoint).await
    }

    pub async fn deregister(&self, endpoint: &PeerEndpoint) -> DhtResult<()> {
        self.post("deregister", endpoint).await
    }

    async fn post(&self, action: &str, endpoint: &PeerEndpoint) -> DhtResult<()> {
        let url = format!("{}/{}", self.base_url, action);
        let response = self
            .http
            .post(&url)
            .json(endpoint)
            .send()
            .await
            .map_err(|e| DhtError::Network(format!("POST {} failed: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(DhtError::Network(format!(
                "POST {} returned {}",
                url,
                response.status()
            )));
        }
        Ok(())
    }

    /// Refresh the registration of `endpoint` every `interval`. Failures are
    /// logged and retried on the next tick; the rendezvous being down must
    /// not take the peer with it.
    pub fn spawn_keep_alive(
        self: std::sync::Arc<Self>,
        endpoint: PeerEndpoint,
        interval: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(
                "keep-alive loop started for {} every {:?}",
                endpoint.to_authority(),
                interval
            );
            loop {
                ticker.tick().await;
                if let Err(e) = self.keep_alive(&endpoint).await {
                    warn!("keep-alive refresh failed: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_wire_format() {
        let parsed: Vec<PeerEndpoint> =
            serde_json::from_str(r#"[{"address": "192.168.1.10", "port": "7700"}]"#).unwrap();
        assert_eq!(parsed, vec![PeerEndpoint::new("192.168.1.10", 7700)]);
        assert_eq!(parsed[0].to_authority(), "192.168.1.10:7700");
    }

    #[test]
    fn test_endpoint_roundtrips_through_json() {
        let endpoint = PeerEndpoint::new("10.1.2.3", 9000);
        let json = serde_json::to_string(&endpoint).unwrap();
        let back: PeerEndpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, endpoint);
    }
}
