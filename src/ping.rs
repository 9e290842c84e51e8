//! ICMP reachability collaborator interface.

use std::time::Duration;

use async_trait::async_trait;

#[async_trait]
pub trait Pinger: Send + Sync {
    /// Ping one address (possibly scoped with a `%ifindex` suffix).
    ///
    /// Returns true as soon as any of the `attempts` probes gets a reply
    /// within `timeout`.
    async fn ping(&self, ip_address: &str, timeout: Duration, attempts: u32) -> bool;
}
