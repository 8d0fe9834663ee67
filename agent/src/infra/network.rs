//! Network infrastructure: implements `AddressResolver`.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;

use crate::application::ports::AddressResolver;

/// Default external-address service.
pub const DEFAULT_IP_SERVICE_URL: &str = "https://api.ipify.org";

/// Timeout for the external-address lookup.
pub const IP_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolves the local address from the routing table and the public one
/// through an HTTP service that echoes the caller's address.
pub struct NetworkResolver {
    client: reqwest::Client,
    ip_service_url: String,
}

impl NetworkResolver {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(ip_service_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(IP_LOOKUP_TIMEOUT)
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            client,
            ip_service_url: ip_service_url.into(),
        })
    }
}

#[async_trait]
impl AddressResolver for NetworkResolver {
    async fn local_address(&self) -> String {
        tokio::task::spawn_blocking(route_source_address)
            .await
            .ok()
            .flatten()
            .map(|ip| ip.to_string())
            .unwrap_or_default()
    }

    async fn public_address(&self) -> Result<String> {
        let response = self
            .client
            .get(&self.ip_service_url)
            .send()
            .await
            .with_context(|| format!("requesting {}", self.ip_service_url))?
            .error_for_status()
            .with_context(|| format!("requesting {}", self.ip_service_url))?;
        let body = response.text().await.context("reading address response")?;
        let address = body.trim();
        if address.parse::<IpAddr>().is_err() {
            bail!("{} returned {address:?}, not an address", self.ip_service_url);
        }
        Ok(address.to_string())
    }
}

/// Source address the kernel would pick for an outbound route. A connected
/// UDP socket sends nothing, so this works offline as long as a default
/// route exists.
fn route_source_address() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(10, 255, 255, 255), 1)).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}
