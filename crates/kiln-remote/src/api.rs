//! Collaborator contracts for the remote compute and network control planes.
//!
//! Wire types are decoded into explicit structures here so nothing past this
//! module inspects loosely-typed JSON.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use kiln_core::InstanceTemplate;

use crate::error::RemoteResult;

// ── Instances ─────────────────────────────────────────────────────

/// Power state of an instance as reported by the compute API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PowerState {
    Initial,
    Preflight,
    Creating,
    /// Booted and running (`created` on the wire).
    Running,
    Deleted,
    Error,
    Other(String),
}

impl From<String> for PowerState {
    fn from(s: String) -> Self {
        match s.as_str() {
            "initial" => PowerState::Initial,
            "preflight" => PowerState::Preflight,
            "creating" => PowerState::Creating,
            "created" | "running" => PowerState::Running,
            "deleted" => PowerState::Deleted,
            "error" => PowerState::Error,
            _ => PowerState::Other(s),
        }
    }
}

impl From<PowerState> for String {
    fn from(s: PowerState) -> Self {
        match s {
            PowerState::Initial => "initial".to_string(),
            PowerState::Preflight => "preflight".to_string(),
            PowerState::Creating => "creating".to_string(),
            PowerState::Running => "created".to_string(),
            PowerState::Deleted => "deleted".to_string(),
            PowerState::Error => "error".to_string(),
            PowerState::Other(s) => s,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub uuid: String,
    pub name: String,
    pub state: PowerState,
    #[serde(default)]
    pub agent_state: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
}

impl Instance {
    /// Running with a ready agent side channel.
    pub fn is_ready(&self) -> bool {
        self.state == PowerState::Running && self.agent_state.as_deref() == Some("ready")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkAttachment {
    pub network_uuid: String,
    pub macaddress: Option<String>,
    pub model: String,
    pub float: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskSpec {
    /// Size in GiB.
    pub size: u64,
    pub base: String,
    pub bus: Option<String>,
    #[serde(rename = "type")]
    pub disk_type: String,
}

/// Request body for creating an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub name: String,
    pub cpus: u32,
    /// Memory in MiB.
    pub memory: u64,
    pub network: Vec<NetworkAttachment>,
    pub disk: Vec<DiskSpec>,
    pub ssh_key: Option<String>,
    pub user_data: Option<String>,
    pub side_channels: Vec<String>,
    pub namespace: String,
}

impl InstanceSpec {
    /// One floating NIC on `network`, one disk from the template's base image.
    pub fn from_template(
        template: &InstanceTemplate,
        name: &str,
        network: &str,
        ssh_key: Option<&str>,
        namespace: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            cpus: template.cpus,
            memory: template.memory_mb,
            network: vec![NetworkAttachment {
                network_uuid: network.to_string(),
                macaddress: None,
                model: template.nic_model.clone(),
                float: true,
            }],
            disk: vec![DiskSpec {
                size: template.disk_gb,
                base: template.base_image.clone(),
                bus: None,
                disk_type: "disk".to_string(),
            }],
            ssh_key: ssh_key.map(str::to_string),
            user_data: None,
            side_channels: template.side_channels.clone(),
            namespace: namespace.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkInterface {
    #[serde(default)]
    pub ipv4: Option<String>,
    #[serde(default)]
    pub floating: Option<String>,
}

// ── Agent operations ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OperationState {
    /// Any state that is not yet terminal (queued, preflight, executing...).
    Pending,
    Complete,
    Error,
}

impl OperationState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, OperationState::Pending)
    }
}

impl From<String> for OperationState {
    fn from(s: String) -> Self {
        match s.as_str() {
            "complete" => OperationState::Complete,
            "error" => OperationState::Error,
            _ => OperationState::Pending,
        }
    }
}

impl From<OperationState> for String {
    fn from(s: OperationState) -> Self {
        match s {
            OperationState::Pending => "pending",
            OperationState::Complete => "complete",
            OperationState::Error => "error",
        }
        .to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCommand {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commandline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Captured output of an executed command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    #[serde(rename = "return-code")]
    pub return_code: i64,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

/// Outcome of a file fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchOutput {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub content_blob: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OperationResult {
    Command(CommandOutput),
    Fetch(FetchOutput),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOperation {
    pub uuid: String,
    pub instance_uuid: String,
    pub state: OperationState,
    #[serde(default)]
    pub commands: Vec<AgentCommand>,
    /// Results keyed by command index (`"0"`, `"1"`, ...).
    #[serde(default)]
    pub results: BTreeMap<String, OperationResult>,
}

impl AgentOperation {
    pub fn first_result(&self) -> Option<&OperationResult> {
        self.results
            .get("0")
            .or_else(|| self.results.values().next())
    }

    pub fn command_output(&self) -> Option<&CommandOutput> {
        match self.first_result()? {
            OperationResult::Command(out) => Some(out),
            OperationResult::Fetch(_) => None,
        }
    }

    pub fn fetch_output(&self) -> Option<&FetchOutput> {
        match self.first_result()? {
            OperationResult::Fetch(out) => Some(out),
            OperationResult::Command(_) => None,
        }
    }

    /// Human-readable description of what the operation runs.
    pub fn describe(&self) -> String {
        self.commands
            .first()
            .map(|c| {
                c.commandline
                    .clone()
                    .or_else(|| c.path.clone())
                    .unwrap_or_else(|| c.command.clone())
            })
            .unwrap_or_default()
    }
}

// ── Networks ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Network {
    pub uuid: String,
    pub name: String,
    pub state: String,
}

impl Network {
    pub fn is_ready(&self) -> bool {
        self.state == "created"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub netblock: String,
    pub provide_dhcp: bool,
    pub provide_nat: bool,
    pub name: String,
    pub namespace: String,
}

// ── Traits ────────────────────────────────────────────────────────

/// Compute control plane: instances, their agents, and content blobs.
#[async_trait]
pub trait ComputeApi: Send + Sync {
    async fn create_instance(&self, spec: &InstanceSpec) -> RemoteResult<Instance>;

    /// Fails with `NotFound` once the instance is gone.
    async fn get_instance(&self, uuid: &str) -> RemoteResult<Instance>;

    async fn delete_instance(&self, uuid: &str) -> RemoteResult<()>;

    async fn get_interfaces(&self, uuid: &str) -> RemoteResult<Vec<NetworkInterface>>;

    /// Every agent operation ever submitted for the instance.
    async fn list_agent_operations(&self, uuid: &str) -> RemoteResult<Vec<AgentOperation>>;

    async fn get_agent_operation(&self, uuid: &str) -> RemoteResult<AgentOperation>;

    /// Queue a shell command on the instance's agent.
    async fn execute(&self, instance: &str, commandline: &str) -> RemoteResult<AgentOperation>;

    /// Queue a file fetch from the instance's agent.
    async fn fetch_file(&self, instance: &str, path: &str) -> RemoteResult<AgentOperation>;

    /// Content of a blob, in the chunks it was transferred in.
    async fn blob_chunks(&self, blob_uuid: &str) -> RemoteResult<Vec<Bytes>>;

    async fn namespace_exists(&self, namespace: &str) -> RemoteResult<bool>;

    async fn create_namespace(&self, namespace: &str) -> RemoteResult<()>;
}

/// Network control plane: private networks and routed floating addresses.
#[async_trait]
pub trait NetworkApi: Send + Sync {
    async fn allocate_network(&self, spec: &NetworkSpec) -> RemoteResult<Network>;

    async fn get_network(&self, uuid: &str) -> RemoteResult<Network>;

    async fn delete_network(&self, uuid: &str) -> RemoteResult<()>;

    /// Route a new floating address into the network. `None` when the
    /// address pool is exhausted.
    async fn route_address(&self, network: &str) -> RemoteResult<Option<String>>;

    /// Fails with `Unauthorized` when the address is not routed to `network`.
    async fn unroute_address(&self, network: &str, address: &str) -> RemoteResult<()>;
}
