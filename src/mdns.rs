//! mDNS browser collaborator interface.
//!
//! The raw zeroconf implementation lives outside the crate; the controller
//! only consumes service state changes and on-demand info queries.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Service type advertised by operational (commissioned) Matter nodes.
pub const MDNS_TYPE_OPERATIONAL_NODE: &str = "_matter._tcp.local.";
/// Service type advertised by commissionable Matter nodes.
pub const MDNS_TYPE_COMMISSIONABLE_NODE: &str = "_matterc._udp.local.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStateChange {
    Added,
    Updated,
    Removed,
}

/// A raw browser notification for one service instance.
#[derive(Debug, Clone)]
pub struct ServiceEvent {
    pub service_type: String,
    pub name: String,
    pub state_change: ServiceStateChange,
}

/// Resolved service details.
#[derive(Debug, Clone, Default)]
pub struct ServiceInfo {
    pub name: String,
    /// Scoped addresses; IPv6 link-locals may carry a `%ifindex` suffix.
    pub addresses: Vec<String>,
    pub port: u16,
    pub txt: BTreeMap<String, String>,
}

#[async_trait]
pub trait MdnsBrowser: Send + Sync {
    /// Start browsing the given service types, delivering state changes into
    /// `events` until [`MdnsBrowser::shutdown`] is called.
    async fn browse(&self, service_types: &[String], events: mpsc::Sender<ServiceEvent>);

    /// Resolve full info for one service instance, waiting up to `timeout`.
    /// Returns None when nothing answered in time.
    async fn query_service_info(
        &self,
        service_type: &str,
        name: &str,
        timeout: Duration,
    ) -> Option<ServiceInfo>;

    async fn shutdown(&self);
}
