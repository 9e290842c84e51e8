//! Transport-agnostic command API.
//!
//! One request/response per command; asynchronous [`ServerEvent`]s flow
//! separately through the event bus. The WebSocket (or any other) transport
//! lives outside the crate and shuttles these envelopes as JSON.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use strum::EnumString;

use crate::controller::MatterController;
use crate::error::ControllerError;

/// Incoming command envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandMessage {
    pub message_id: String,
    pub command: String,
    #[serde(default)]
    pub args: JsonValue,
}

/// Outgoing result envelope.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum CommandResponse {
    Success {
        message_id: String,
        result: JsonValue,
    },
    Error {
        message_id: String,
        error_code: u16,
        details: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "snake_case")]
enum ApiCommand {
    GetNodes,
    GetNode,
    CommissionWithCode,
    CommissionOnNetwork,
    SetWifiCredentials,
    SetThreadDataset,
    OpenCommissioningWindow,
    Discover,
    InterviewNode,
    DeviceCommand,
    ReadAttribute,
    WriteAttribute,
    RemoveNode,
    PingNode,
    GetNodeIpAddresses,
    ImportTestNode,
}

#[derive(Deserialize)]
struct NodeIdArgs {
    node_id: u64,
}

#[derive(Deserialize)]
struct GetNodesArgs {
    #[serde(default)]
    only_available: bool,
}

#[derive(Deserialize)]
struct CommissionWithCodeArgs {
    code: String,
    #[serde(default)]
    network_only: bool,
}

#[derive(Deserialize)]
struct CommissionOnNetworkArgs {
    setup_pin_code: u32,
    #[serde(default)]
    filter_type: u32,
    #[serde(default)]
    filter: Option<JsonValue>,
    #[serde(default)]
    ip_addr: Option<String>,
}

#[derive(Deserialize)]
struct SetWifiCredentialsArgs {
    ssid: String,
    credentials: String,
}

#[derive(Deserialize)]
struct SetThreadDatasetArgs {
    dataset: String,
}

#[derive(Deserialize)]
struct OpenCommissioningWindowArgs {
    node_id: u64,
    #[serde(default = "default_window_timeout")]
    timeout: u32,
    #[serde(default = "default_window_iteration")]
    iteration: u32,
    #[serde(default = "default_window_option")]
    option: u8,
    #[serde(default)]
    discriminator: Option<u16>,
}

fn default_window_timeout() -> u32 {
    300
}

fn default_window_iteration() -> u32 {
    1000
}

fn default_window_option() -> u8 {
    1
}

#[derive(Deserialize)]
struct DeviceCommandArgs {
    node_id: u64,
    endpoint_id: u16,
    cluster_id: u32,
    command_name: String,
    #[serde(default)]
    payload: JsonValue,
    #[serde(default)]
    timed_request_timeout_ms: Option<u32>,
    #[serde(default)]
    interaction_timeout_ms: Option<u32>,
}

#[derive(Deserialize)]
struct ReadAttributeArgs {
    node_id: u64,
    attribute_path: PathOrPaths,
    #[serde(default)]
    fabric_filtered: bool,
}

/// A single path or a list of paths.
#[derive(Deserialize)]
#[serde(untagged)]
enum PathOrPaths {
    One(String),
    Many(Vec<String>),
}

impl PathOrPaths {
    fn into_vec(self) -> Vec<String> {
        match self {
            PathOrPaths::One(path) => vec![path],
            PathOrPaths::Many(paths) => paths,
        }
    }
}

#[derive(Deserialize)]
struct WriteAttributeArgs {
    node_id: u64,
    attribute_path: String,
    value: JsonValue,
}

#[derive(Deserialize)]
struct PingNodeArgs {
    node_id: u64,
    #[serde(default = "default_ping_attempts")]
    attempts: u32,
}

fn default_ping_attempts() -> u32 {
    1
}

#[derive(Deserialize)]
struct GetNodeIpAddressesArgs {
    node_id: u64,
    #[serde(default)]
    prefer_cache: bool,
    #[serde(default)]
    scoped: bool,
}

#[derive(Deserialize)]
struct ImportTestNodeArgs {
    dump: String,
}

impl MatterController {
    /// Dispatch one API command and build its response envelope.
    pub async fn handle_command(&self, message: CommandMessage) -> CommandResponse {
        let message_id = message.message_id.clone();
        match self.dispatch(message).await {
            Ok(result) => CommandResponse::Success { message_id, result },
            Err(err) => CommandResponse::Error {
                message_id,
                error_code: err.error_code(),
                details: err.to_string(),
            },
        }
    }

    async fn dispatch(
        &self,
        message: CommandMessage,
    ) -> Result<JsonValue, ControllerError> {
        let command = ApiCommand::from_str(&message.command).map_err(|_| {
            ControllerError::InvalidArguments(format!("Unknown command: {}", message.command))
        })?;
        let args = message.args;

        match command {
            ApiCommand::GetNodes => {
                let args: GetNodesArgs = parse_args(args)?;
                to_result(&self.get_nodes(args.only_available))
            }
            ApiCommand::GetNode => {
                let args: NodeIdArgs = parse_args(args)?;
                to_result(&self.get_node(args.node_id)?)
            }
            ApiCommand::CommissionWithCode => {
                let args: CommissionWithCodeArgs = parse_args(args)?;
                to_result(
                    &self
                        .commission_with_code(&args.code, args.network_only)
                        .await?,
                )
            }
            ApiCommand::CommissionOnNetwork => {
                let args: CommissionOnNetworkArgs = parse_args(args)?;
                to_result(
                    &self
                        .commission_on_network(
                            args.setup_pin_code,
                            args.filter_type,
                            args.filter,
                            args.ip_addr.as_deref(),
                        )
                        .await?,
                )
            }
            ApiCommand::SetWifiCredentials => {
                let args: SetWifiCredentialsArgs = parse_args(args)?;
                self.set_wifi_credentials(&args.ssid, &args.credentials)
                    .await?;
                Ok(JsonValue::Null)
            }
            ApiCommand::SetThreadDataset => {
                let args: SetThreadDatasetArgs = parse_args(args)?;
                self.set_thread_operational_dataset(&args.dataset).await?;
                Ok(JsonValue::Null)
            }
            ApiCommand::OpenCommissioningWindow => {
                let args: OpenCommissioningWindowArgs = parse_args(args)?;
                to_result(
                    &self
                        .open_commissioning_window(
                            args.node_id,
                            args.timeout,
                            args.iteration,
                            args.option,
                            args.discriminator,
                        )
                        .await?,
                )
            }
            ApiCommand::Discover => to_result(&self.discover_commissionable_nodes().await?),
            ApiCommand::InterviewNode => {
                let args: NodeIdArgs = parse_args(args)?;
                self.interview_node(args.node_id).await?;
                Ok(JsonValue::Null)
            }
            ApiCommand::DeviceCommand => {
                let args: DeviceCommandArgs = parse_args(args)?;
                to_result(
                    &self
                        .send_device_command(
                            args.node_id,
                            args.endpoint_id,
                            args.cluster_id,
                            &args.command_name,
                            args.payload,
                            args.timed_request_timeout_ms,
                            args.interaction_timeout_ms,
                        )
                        .await?,
                )
            }
            ApiCommand::ReadAttribute => {
                let args: ReadAttributeArgs = parse_args(args)?;
                let paths = args.attribute_path.into_vec();
                to_result(
                    &self
                        .read_attribute(args.node_id, &paths, args.fabric_filtered)
                        .await?,
                )
            }
            ApiCommand::WriteAttribute => {
                let args: WriteAttributeArgs = parse_args(args)?;
                to_result(
                    &self
                        .write_attribute(args.node_id, &args.attribute_path, &args.value)
                        .await?,
                )
            }
            ApiCommand::RemoveNode => {
                let args: NodeIdArgs = parse_args(args)?;
                self.remove_node(args.node_id).await?;
                Ok(JsonValue::Null)
            }
            ApiCommand::PingNode => {
                let args: PingNodeArgs = parse_args(args)?;
                to_result(&self.ping_node(args.node_id, args.attempts).await?)
            }
            ApiCommand::GetNodeIpAddresses => {
                let args: GetNodeIpAddressesArgs = parse_args(args)?;
                to_result(
                    &self
                        .get_node_ip_addresses(args.node_id, args.prefer_cache, args.scoped)
                        .await?,
                )
            }
            ApiCommand::ImportTestNode => {
                let args: ImportTestNodeArgs = parse_args(args)?;
                self.import_test_node(&args.dump)?;
                Ok(JsonValue::Null)
            }
        }
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(args: JsonValue) -> Result<T, ControllerError> {
    let args = if args.is_null() { json!({}) } else { args };
    serde_json::from_value(args)
        .map_err(|err| ControllerError::InvalidArguments(format!("Invalid arguments: {err}")))
}

fn to_result<T: Serialize>(value: &T) -> Result<JsonValue, ControllerError> {
    serde_json::to_value(value)
        .map_err(|err| ControllerError::InvalidArguments(format!("Unserializable result: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::{make_node, new_controller};
    use crate::value::AttributeValue;

    fn command(message_id: &str, command: &str, args: JsonValue) -> CommandMessage {
        CommandMessage {
            message_id: message_id.to_string(),
            command: command.to_string(),
            args,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_nodes_roundtrip() {
        let ctx = new_controller().await;
        ctx.controller
            .store
            .upsert(make_node(5, &[("1/6/0", AttributeValue::Bool(true))]));

        let response = ctx
            .controller
            .handle_command(command("1", "get_nodes", JsonValue::Null))
            .await;
        let CommandResponse::Success { message_id, result } = response else {
            panic!("expected success");
        };
        assert_eq!(message_id, "1");
        assert_eq!(result[0]["node_id"], 5);
        assert_eq!(result[0]["attributes"]["1/6/0"], true);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_command_is_invalid_arguments() {
        let ctx = new_controller().await;
        let response = ctx
            .controller
            .handle_command(command("2", "reboot_flux_capacitor", JsonValue::Null))
            .await;
        let CommandResponse::Error { error_code, .. } = response else {
            panic!("expected error");
        };
        assert_eq!(error_code, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_node_error_code() {
        let ctx = new_controller().await;
        let response = ctx
            .controller
            .handle_command(command("3", "get_node", json!({"node_id": 99})))
            .await;
        let CommandResponse::Error {
            message_id,
            error_code,
            details,
        } = response
        else {
            panic!("expected error");
        };
        assert_eq!(message_id, "3");
        assert_eq!(error_code, 4);
        assert!(details.contains("99"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_attribute_accepts_single_path_and_list() {
        let ctx = new_controller().await;
        let mut node = make_node(5, &[("1/6/0", AttributeValue::Bool(true))]);
        node.available = true;
        ctx.controller.store.upsert(node);
        ctx.stack.node_data.lock().insert(
            5,
            [("1/6/0".to_string(), AttributeValue::Bool(true))]
                .into_iter()
                .collect(),
        );

        for args in [
            json!({"node_id": 5, "attribute_path": "1/6/0"}),
            json!({"node_id": 5, "attribute_path": ["1/6/0"]}),
        ] {
            let response = ctx
                .controller
                .handle_command(command("4", "read_attribute", args))
                .await;
            let CommandResponse::Success { result, .. } = response else {
                panic!("expected success");
            };
            assert_eq!(result["1/6/0"], true);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_args_are_rejected() {
        let ctx = new_controller().await;
        let response = ctx
            .controller
            .handle_command(command("5", "write_attribute", json!({"node_id": 5})))
            .await;
        let CommandResponse::Error { error_code, .. } = response else {
            panic!("expected error");
        };
        assert_eq!(error_code, 6);
    }
}
