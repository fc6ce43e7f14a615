//! Name resolution through the system resolver.

use std::net::IpAddr;

use async_trait::async_trait;
use tracing::debug;

use super::NameResolver;
use crate::error::ProbeError;

/// [`NameResolver`] using the libc resolver via `tokio::net::lookup_host`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl NameResolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ProbeError> {
        match tokio::net::lookup_host((host, 0)).await {
            Ok(addrs) => {
                let mut ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
                ips.sort();
                ips.dedup();
                Ok(ips)
            }
            // getaddrinfo doesn't tell NXDOMAIN apart from other failures
            Err(e) => {
                debug!(host, error = %e, "Name did not resolve");
                Ok(Vec::new())
            }
        }
    }
}
