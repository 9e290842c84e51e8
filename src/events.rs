//! Typed event fan-out to API consumers.

use log::debug;
use serde::Serialize;
use strum::Display;
use tokio::sync::broadcast;

use crate::model::{NodeEvent, NodeRecord};
use crate::value::AttributeValue;

/// Discriminant of a [`ServerEvent`], matching the wire event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum EventType {
    NodeAdded,
    NodeUpdated,
    NodeRemoved,
    NodeEvent,
    AttributeUpdated,
    EndpointAdded,
    EndpointRemoved,
}

/// Asynchronous event pushed from the controller to all API consumers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    NodeAdded(NodeRecord),
    NodeUpdated(NodeRecord),
    NodeRemoved { node_id: u64 },
    NodeEvent(NodeEvent),
    AttributeUpdated {
        node_id: u64,
        path: String,
        value: AttributeValue,
    },
    EndpointAdded { node_id: u64, endpoint_id: u16 },
    EndpointRemoved { node_id: u64, endpoint_id: u16 },
}

impl ServerEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            ServerEvent::NodeAdded(_) => EventType::NodeAdded,
            ServerEvent::NodeUpdated(_) => EventType::NodeUpdated,
            ServerEvent::NodeRemoved { .. } => EventType::NodeRemoved,
            ServerEvent::NodeEvent(_) => EventType::NodeEvent,
            ServerEvent::AttributeUpdated { .. } => EventType::AttributeUpdated,
            ServerEvent::EndpointAdded { .. } => EventType::EndpointAdded,
            ServerEvent::EndpointRemoved { .. } => EventType::EndpointRemoved,
        }
    }
}

/// Broadcast bus distributing [`ServerEvent`]s to any number of subscribers.
///
/// Emitting never blocks; events are dropped when no subscriber is attached,
/// and slow subscribers observe `Lagged` on their receiver.
pub struct EventBus {
    tx: broadcast::Sender<ServerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ServerEvent) {
        debug!("Signaling event: {}", event.event_type());
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_to_multiple_subscribers() {
        let bus = EventBus::new(8);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.emit(ServerEvent::NodeRemoved { node_id: 42 });

        for rx in [&mut first, &mut second] {
            let event = rx.recv().await.expect("event");
            assert_eq!(event.event_type(), EventType::NodeRemoved);
        }
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new(8);
        bus.emit(ServerEvent::NodeRemoved { node_id: 1 });
    }

    #[test]
    fn test_event_wire_format() {
        let event = ServerEvent::AttributeUpdated {
            node_id: 7,
            path: "1/6/0".to_string(),
            value: AttributeValue::Bool(true),
        };
        let encoded = serde_json::to_value(&event).expect("serialize");
        assert_eq!(encoded["event"], "attribute_updated");
        assert_eq!(encoded["data"]["node_id"], 7);
        assert_eq!(event.event_type().to_string(), "attribute_updated");
    }
}
