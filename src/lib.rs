//! Matter fabric device controller.
//!
//! A long-lived control plane for Matter nodes commissioned onto a single
//! fabric: persistent node registry, commissioning and interview flows,
//! attribute/event subscriptions with graceful degradation, mDNS-driven
//! rediscovery and a fallback reachability scanner, all exposed through a
//! transport-agnostic command API.
//!
//! The Matter SDK, mDNS browser, ICMP ping and storage backend are injected
//! collaborators behind traits ([`stack::MatterStack`], [`mdns::MdnsBrowser`],
//! [`ping::Pinger`], [`storage::Storage`]) so embedders and tests supply
//! their own implementations.

pub mod catalog;
pub mod commands;
pub mod config;
pub mod controller;
pub mod debounce;
pub mod error;
pub mod events;
pub mod mdns;
pub mod model;
pub mod path;
pub mod ping;
pub mod stack;
pub mod storage;
pub mod value;

pub use commands::{CommandMessage, CommandResponse};
pub use config::Config;
pub use controller::MatterController;
pub use error::{ControllerError, Result};
pub use events::{EventBus, EventType, ServerEvent};
pub use model::{CommissionableNodeData, CommissioningParameters, NodeEvent, NodeRecord};
pub use value::AttributeValue;
