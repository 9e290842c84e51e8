//! Per-node subscription supervision.
//!
//! The stack delivers subscription updates from its own worker thread; they
//! arrive here as messages on the controller's bounded channel and are
//! drained by a single task, which owns every mutation they cause. Per-node
//! lifecycle is tracked as an explicit state machine; `NodeRecord.available`
//! is a projection of it (Live | Degraded).

use std::collections::BTreeSet;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;

use crate::catalog::{
    DESCRIPTOR_PARTS_LIST_ATTRIBUTE_PATH, ROUTING_ROLE_ATTRIBUTE_PATH, RoutingRole,
    SOFTWARE_VERSION_ATTRIBUTE_PATH,
};
use crate::error::{ControllerError, Result};
use crate::events::ServerEvent;
use crate::stack::{SubscribeOptions, SubscriptionMessage, SubscriptionUpdate};
use crate::value::AttributeValue;

use super::{EVENT_HISTORY_LEN, MatterController};

/// Report-interval ceiling for WiFi nodes (no Thread diagnostics cluster).
const NODE_SUBSCRIPTION_CEILING_WIFI: u16 = 60;
/// Report-interval ceiling for Thread routers and full Thread devices.
const NODE_SUBSCRIPTION_CEILING_THREAD: u16 = 60;
/// Report-interval ceiling for battery-powered (sleepy) devices.
const NODE_SUBSCRIPTION_CEILING_BATTERY_POWERED: u16 = 600;

/// Resubscription attempts tolerated before an available node is flipped to
/// unavailable.
const NODE_RESUBSCRIBE_ATTEMPTS_UNAVAILABLE: u32 = 3;
/// Resubscription backoff beyond which the subscription is torn down (the
/// mDNS TTL); rediscovery brings the node back.
const NODE_RESUBSCRIBE_TIMEOUT_OFFLINE_MS: u64 = 30 * 60 * 1000;

/// Lifecycle of one node subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubscriptionState {
    Absent,
    Subscribing,
    Live { resubscribe_attempts: u32 },
    Degraded { resubscribe_attempts: u32 },
    Offline,
}

impl SubscriptionState {
    fn resubscribe_attempts(&self) -> u32 {
        match self {
            SubscriptionState::Live {
                resubscribe_attempts,
            }
            | SubscriptionState::Degraded {
                resubscribe_attempts,
            } => *resubscribe_attempts,
            _ => 0,
        }
    }
}

impl MatterController {
    /// Establish the wildcard attribute/event subscription for one node,
    /// replacing any previous one.
    pub(crate) async fn subscribe_node(&self, node_id: u64) -> Result<()> {
        let node = self
            .store
            .get(node_id)
            .ok_or(ControllerError::NodeNotExists(node_id))?;

        // at most one active subscription per node
        self.stack.shutdown_subscription(node_id).await?;
        self.subscription_states
            .lock()
            .insert(node_id, SubscriptionState::Subscribing);

        info!("Node {node_id}: setting up attributes and events subscription");
        // battery-powered devices get a long ceiling so they are not kept
        // awake just for reporting
        let routing_role =
            RoutingRole::from_attribute(node.attributes.get(ROUTING_ROLE_ATTRIBUTE_PATH));
        let interval_ceiling = match routing_role {
            None => NODE_SUBSCRIPTION_CEILING_WIFI,
            Some(RoutingRole::SleepyEndDevice) => NODE_SUBSCRIPTION_CEILING_BATTERY_POWERED,
            Some(_) => NODE_SUBSCRIPTION_CEILING_THREAD,
        };
        let options = SubscribeOptions {
            report_interval: (0, interval_ceiling),
            auto_resubscribe: true,
            event_urgency: 1,
            fabric_filtered: false,
        };

        let snapshot = match self
            .stack
            .subscribe_attributes(node_id, options, self.subscription_tx())
            .await
        {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.subscription_states
                    .lock()
                    .insert(node_id, SubscriptionState::Absent);
                return Err(err.into());
            }
        };

        let (floor, ceiling) = snapshot.report_interval;
        let node = self
            .store
            .update(node_id, |node| {
                node.available = true;
                node.attributes.extend(snapshot.attributes.clone());
                node.clone()
            })
            .ok_or(ControllerError::NodeNotExists(node_id))?;
        self.subscription_states.lock().insert(
            node_id,
            SubscriptionState::Live {
                resubscribe_attempts: 0,
            },
        );
        self.touch_last_seen(node_id);
        info!("Node {node_id}: subscription succeeded with report interval [{floor}, {ceiling}]");
        self.events.emit(ServerEvent::NodeUpdated(node));
        Ok(())
    }

    /// Drain loop for subscription messages; the only place subscription
    /// updates mutate controller state.
    pub(crate) async fn run_subscription_loop(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<SubscriptionMessage>,
    ) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                message = rx.recv() => {
                    let Some(message) = message else { break };
                    self.handle_subscription_message(message).await;
                }
            }
        }
    }

    async fn handle_subscription_message(&self, message: SubscriptionMessage) {
        let node_id = message.node_id;
        match message.update {
            SubscriptionUpdate::AttributeReport { path, value } => {
                self.touch_last_seen(node_id);
                // failsafe: the stack flags values it failed to decode,
                // never let those poison the cache
                if value.is_decode_failure() {
                    return;
                }
                let old_value = self.store.attribute(node_id, &path);
                if old_value.as_ref() == Some(&value) {
                    return;
                }
                self.attribute_updated(node_id, path, old_value, value).await;
            }
            SubscriptionUpdate::Event(mut event) => {
                self.touch_last_seen(node_id);
                event.node_id = node_id;
                debug!("Node {node_id}: received event {event:?}");
                {
                    let mut history = self.event_history.lock();
                    if history.len() == EVENT_HISTORY_LEN {
                        history.pop_front();
                    }
                    history.push_back(event.clone());
                }
                self.events.emit(ServerEvent::NodeEvent(event));
            }
            SubscriptionUpdate::Error { code } => {
                error!("Node {node_id}: got error from node: {code}");
            }
            SubscriptionUpdate::ResubscriptionAttempted {
                termination_error,
                next_resubscribe_ms,
            } => {
                self.handle_resubscription_attempted(node_id, termination_error, next_resubscribe_ms)
                    .await;
            }
            SubscriptionUpdate::ResubscriptionSucceeded => {
                self.handle_resubscription_succeeded(node_id);
            }
        }
    }

    async fn attribute_updated(
        &self,
        node_id: u64,
        path: String,
        old_value: Option<AttributeValue>,
        new_value: AttributeValue,
    ) {
        debug!("Node {node_id}: attribute updated: {path} - old: {old_value:?} - new: {new_value:?}");

        let Some(node) = self.store.get(node_id) else {
            return;
        };

        // work out added/removed endpoints on bridges
        if node.is_bridge && path == DESCRIPTOR_PARTS_LIST_ATTRIBUTE_PATH {
            let old_endpoints = endpoint_set(old_value.as_ref());
            let new_endpoints = endpoint_set(Some(&new_value));
            let removed: BTreeSet<u64> = old_endpoints.difference(&new_endpoints).copied().collect();
            let added: BTreeSet<u64> = new_endpoints.difference(&old_endpoints).copied().collect();
            if !removed.is_empty() {
                self.handle_endpoints_removed(node_id, &removed).await;
            }
            if !added.is_empty()
                && let Some(controller) = self.strong()
            {
                tokio::spawn(async move {
                    controller.handle_endpoints_added(node_id, added).await;
                });
            }
            return;
        }

        // a software update changes the whole data model, re-interview
        if path == SOFTWARE_VERSION_ATTRIBUTE_PATH
            && let Some(controller) = self.strong()
        {
            tokio::spawn(async move {
                if let Err(err) = controller.interview_node(node_id).await {
                    warn!("Re-interview of node {node_id} after software update failed: {err}");
                }
            });
        }

        self.store.update(node_id, |node| {
            node.attributes.insert(path.clone(), new_value.clone());
        });
        self.store.schedule_write(node_id, false).await;
        self.events.emit(ServerEvent::AttributeUpdated {
            node_id,
            path,
            value: new_value,
        });
    }

    async fn handle_endpoints_removed(&self, node_id: u64, endpoints: &BTreeSet<u64>) {
        for endpoint in endpoints {
            let prefix = format!("{endpoint}/");
            self.store.update(node_id, |node| {
                node.attributes.retain(|key, _| !key.starts_with(&prefix));
            });
            if let Ok(endpoint_id) = u16::try_from(*endpoint) {
                self.events.emit(ServerEvent::EndpointRemoved {
                    node_id,
                    endpoint_id,
                });
            }
        }
        self.store.schedule_write(node_id, false).await;
    }

    async fn handle_endpoints_added(&self, node_id: u64, endpoints: BTreeSet<u64>) {
        // a full re-interview picks up the new endpoint's data model
        if let Err(err) = self.interview_node(node_id).await {
            warn!("Re-interview of node {node_id} after endpoint addition failed: {err}");
            return;
        }
        for endpoint in endpoints {
            if let Ok(endpoint_id) = u16::try_from(endpoint) {
                self.events.emit(ServerEvent::EndpointAdded {
                    node_id,
                    endpoint_id,
                });
            }
        }
    }

    async fn handle_resubscription_attempted(
        &self,
        node_id: u64,
        termination_error: u32,
        next_resubscribe_ms: u64,
    ) {
        info!(
            "Node {node_id}: previous subscription failed with error {termination_error}, \
             re-subscribing in {next_resubscribe_ms} ms..."
        );
        let Some(node) = self.store.get(node_id) else {
            return;
        };

        let attempts = {
            let mut states = self.subscription_states.lock();
            let state = states
                .get(&node_id)
                .copied()
                .unwrap_or(SubscriptionState::Absent);
            let attempts = state.resubscribe_attempts() + 1;
            let next_state = if node.available && attempts < NODE_RESUBSCRIBE_ATTEMPTS_UNAVAILABLE {
                SubscriptionState::Live {
                    resubscribe_attempts: attempts,
                }
            } else {
                SubscriptionState::Degraded {
                    resubscribe_attempts: attempts,
                }
            };
            states.insert(node_id, next_state);
            attempts
        };

        // flip to unavailable only after a few failed attempts so flaky
        // networks do not cause flapping
        if node.available && attempts >= NODE_RESUBSCRIBE_ATTEMPTS_UNAVAILABLE {
            let updated = self.store.update(node_id, |node| {
                node.available = false;
                node.clone()
            });
            if let Some(node) = updated {
                self.events.emit(ServerEvent::NodeUpdated(node));
            }
            info!("Marked node {node_id} as unavailable");
        }

        let available = self
            .store
            .get(node_id)
            .map(|node| node.available)
            .unwrap_or(false);
        if !available && next_resubscribe_ms > NODE_RESUBSCRIBE_TIMEOUT_OFFLINE_MS {
            self.node_offline(node_id).await;
        }
    }

    fn handle_resubscription_succeeded(&self, node_id: u64) {
        self.touch_last_seen(node_id);
        info!("Node {node_id}: re-subscription succeeded");
        self.subscription_states.lock().insert(
            node_id,
            SubscriptionState::Live {
                resubscribe_attempts: 0,
            },
        );
        let updated = self.store.update(node_id, |node| {
            if node.available {
                None
            } else {
                node.available = true;
                Some(node.clone())
            }
        });
        if let Some(Some(node)) = updated {
            self.events.emit(ServerEvent::NodeUpdated(node));
        }
    }

    /// Tear the subscription down after the resubscription backoff exceeded
    /// the mDNS TTL; rediscovery (or the fallback scanner) re-promotes the
    /// node.
    pub(crate) async fn node_offline(&self, node_id: u64) {
        if let Err(err) = self.stack.shutdown_subscription(node_id).await {
            debug!("Shutting down subscription for node {node_id} failed: {err}");
        }
        self.subscription_states
            .lock()
            .insert(node_id, SubscriptionState::Offline);
        let flipped = self
            .store
            .update(node_id, |node| {
                if node.available {
                    node.available = false;
                    Some(node.clone())
                } else {
                    None
                }
            })
            .flatten();
        if let Some(node) = flipped {
            self.events.emit(ServerEvent::NodeUpdated(node));
            info!("Marked node {node_id} as offline");
        }
    }

    pub(crate) fn subscription_tx(&self) -> mpsc::Sender<SubscriptionMessage> {
        self.subscription_tx.clone()
    }
}

/// Decode a Descriptor PartsList value into a set of endpoint ids.
fn endpoint_set(value: Option<&AttributeValue>) -> BTreeSet<u64> {
    let mut endpoints = BTreeSet::new();
    if let Some(AttributeValue::List(items)) = value {
        for item in items {
            if let Some(endpoint) = item.as_u64() {
                endpoints.insert(endpoint);
            }
        }
    }
    endpoints
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_set_ignores_non_integers() {
        let value = AttributeValue::List(vec![
            AttributeValue::UInt(1),
            AttributeValue::Str("x".into()),
            AttributeValue::UInt(2),
        ]);
        assert_eq!(endpoint_set(Some(&value)), BTreeSet::from([1, 2]));
        assert!(endpoint_set(None).is_empty());
    }

    #[test]
    fn test_state_attempt_counter() {
        assert_eq!(SubscriptionState::Absent.resubscribe_attempts(), 0);
        assert_eq!(
            SubscriptionState::Live {
                resubscribe_attempts: 2
            }
            .resubscribe_attempts(),
            2
        );
        assert_eq!(
            SubscriptionState::Degraded {
                resubscribe_attempts: 4
            }
            .resubscribe_attempts(),
            4
        );
    }
}
