//! SimCloud — a deterministic in-process compute and network API.
//!
//! Instances take a configurable number of polls to boot, agent operations
//! take a configurable number of polls to finish, and command outcomes are
//! scripted by substring match. Nothing sleeps; progress is driven entirely
//! by the caller's polling.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use crate::api::*;
use crate::error::{RemoteError, RemoteResult};

/// Bytes per chunk when serving blobs.
const BLOB_CHUNK: usize = 7;

struct FailRule {
    pattern: String,
    exit_code: i64,
    stdout: String,
    stderr: String,
}

struct SimInstance {
    instance: Instance,
    boot_polls_left: u32,
    delete_polls_left: Option<u32>,
    interfaces: Vec<NetworkInterface>,
}

struct SimOperation {
    op: AgentOperation,
    /// Observations left before the operation reaches `final_state`.
    polls_left: u32,
    final_state: OperationState,
}

struct SimNetwork {
    network: Network,
    polls_left: u32,
}

#[derive(Default)]
struct SimState {
    next_id: u64,
    next_address: u32,
    boot_polls: u32,
    op_polls: u32,
    stall: bool,
    address_limit: Option<usize>,
    create_failure_after: Option<usize>,
    route_failure_after: Option<usize>,
    routes_handed_out: usize,
    fail_network_deletes: bool,
    instances: BTreeMap<String, SimInstance>,
    created: Vec<InstanceSpec>,
    operations: BTreeMap<String, SimOperation>,
    executed: Vec<(String, String)>,
    failures: Vec<FailRule>,
    files: BTreeMap<String, String>,
    blobs: BTreeMap<String, String>,
    networks: BTreeMap<String, SimNetwork>,
    deleted_networks: Vec<String>,
    routes: BTreeMap<String, Vec<String>>,
    namespaces: BTreeSet<String>,
}

impl SimState {
    fn id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{:04}", self.next_id)
    }

    fn observe_op(&mut self, uuid: &str) -> Option<AgentOperation> {
        let sim_op = self.operations.get_mut(uuid)?;
        if sim_op.polls_left > 0 {
            sim_op.polls_left -= 1;
        }
        if sim_op.polls_left == 0 {
            sim_op.op.state = sim_op.final_state;
        }
        Some(sim_op.op.clone())
    }

    fn submit(
        &mut self,
        instance: &str,
        command: AgentCommand,
        result: OperationResult,
        final_state: OperationState,
    ) -> RemoteResult<AgentOperation> {
        if !self.instances.contains_key(instance) {
            return Err(RemoteError::NotFound(format!("instance {instance}")));
        }
        let uuid = self.id("op");
        let op = AgentOperation {
            uuid: uuid.clone(),
            instance_uuid: instance.to_string(),
            state: OperationState::Pending,
            commands: vec![command],
            results: BTreeMap::from([("0".to_string(), result)]),
        };
        let mut sim_op = SimOperation {
            op,
            polls_left: self.op_polls,
            final_state,
        };
        if sim_op.polls_left == 0 {
            sim_op.op.state = final_state;
        }
        let returned = sim_op.op.clone();
        self.operations.insert(uuid, sim_op);
        Ok(returned)
    }

    fn fetch(&mut self, instance: &str, path: &str) -> RemoteResult<AgentOperation> {
        let command = AgentCommand {
            command: "get-file".to_string(),
            commandline: None,
            path: Some(path.to_string()),
        };
        match self.files.get(path).cloned() {
            Some(content) => {
                let blob = self.id("blob");
                self.blobs.insert(blob.clone(), content);
                let result = OperationResult::Fetch(FetchOutput {
                    path: path.to_string(),
                    content_blob: Some(blob),
                    message: None,
                });
                self.submit(instance, command, result, OperationState::Complete)
            }
            None => {
                let result = OperationResult::Fetch(FetchOutput {
                    path: path.to_string(),
                    content_blob: None,
                    message: Some(format!("No such file or directory: {path}")),
                });
                self.submit(instance, command, result, OperationState::Error)
            }
        }
    }

    fn spawn(&mut self, name: &str, ready: bool) -> String {
        let uuid = self.id("inst");
        self.next_address += 1;
        let host = self.next_address + 10;
        let instance = Instance {
            uuid: uuid.clone(),
            name: name.to_string(),
            state: if ready {
                PowerState::Running
            } else {
                PowerState::Creating
            },
            agent_state: Some(if ready { "ready" } else { "not ready" }.to_string()),
            namespace: None,
        };
        let interfaces = vec![NetworkInterface {
            ipv4: Some(format!("10.0.0.{host}")),
            floating: Some(format!("203.0.113.{host}")),
        }];
        self.instances.insert(
            uuid.clone(),
            SimInstance {
                instance,
                boot_polls_left: if ready { 0 } else { self.boot_polls },
                delete_polls_left: None,
                interfaces,
            },
        );
        uuid
    }
}

/// In-process stand-in for the remote compute and network APIs.
pub struct SimCloud {
    state: Mutex<SimState>,
}

impl Default for SimCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl SimCloud {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                boot_polls: 1,
                op_polls: 1,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Scripting ──────────────────────────────────────────────────

    /// Number of `get_instance` polls before a new instance is ready.
    pub fn set_boot_polls(&self, polls: u32) {
        self.lock().boot_polls = polls;
    }

    /// Number of observations before an agent operation is terminal.
    pub fn set_operation_polls(&self, polls: u32) {
        self.lock().op_polls = polls;
    }

    /// When set, instances never become ready.
    pub fn stall_boots(&self, stall: bool) {
        self.lock().stall = stall;
    }

    /// Commands containing `pattern` exit with the given code and output.
    pub fn fail_command(&self, pattern: &str, exit_code: i64, stdout: &str, stderr: &str) {
        self.lock().failures.push(FailRule {
            pattern: pattern.to_string(),
            exit_code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        });
    }

    /// Make `path` fetchable from every instance.
    pub fn put_file(&self, path: &str, content: &str) {
        self.lock()
            .files
            .insert(path.to_string(), content.to_string());
    }

    /// Cap the number of addresses `route_address` hands out.
    pub fn limit_addresses(&self, limit: usize) {
        self.lock().address_limit = Some(limit);
    }

    /// Instance creation fails once `n` instances have been created.
    pub fn fail_creates_after(&self, n: usize) {
        self.lock().create_failure_after = Some(n);
    }

    /// Address routing fails once `n` addresses have been routed.
    pub fn fail_routes_after(&self, n: usize) {
        self.lock().route_failure_after = Some(n);
    }

    /// When set, network deletion fails with a server error.
    pub fn fail_network_deletes(&self, fail: bool) {
        self.lock().fail_network_deletes = fail;
    }

    /// Create an instance directly, still booting.
    pub fn spawn_instance(&self, name: &str) -> String {
        self.lock().spawn(name, false)
    }

    /// Create an instance directly, already running with a ready agent.
    pub fn spawn_ready_instance(&self, name: &str) -> String {
        self.lock().spawn(name, true)
    }

    /// Delete an instance behind the caller's back.
    pub fn remove_instance(&self, uuid: &str) {
        self.lock().instances.remove(uuid);
    }

    /// Submit a file fetch without going through the async trait.
    pub fn fetch_file_now(&self, instance: &str, path: &str) -> AgentOperation {
        self.lock()
            .fetch(instance, path)
            .unwrap_or_else(|e| panic!("fetch on unknown instance: {e}"))
    }

    // ── Inspection ─────────────────────────────────────────────────

    pub fn instance(&self, uuid: &str) -> Option<Instance> {
        self.lock().instances.get(uuid).map(|i| i.instance.clone())
    }

    /// Instances that exist and are not deleted.
    pub fn live_instances(&self) -> Vec<Instance> {
        self.lock()
            .instances
            .values()
            .filter(|i| i.instance.state != PowerState::Deleted)
            .map(|i| i.instance.clone())
            .collect()
    }

    /// Every create request received, in order.
    pub fn created_specs(&self) -> Vec<InstanceSpec> {
        self.lock().created.clone()
    }

    /// `(instance, commandline)` for every executed command, in order.
    pub fn executed_commands(&self) -> Vec<(String, String)> {
        self.lock().executed.clone()
    }

    pub fn networks(&self) -> Vec<Network> {
        self.lock()
            .networks
            .values()
            .map(|n| n.network.clone())
            .collect()
    }

    pub fn deleted_networks(&self) -> Vec<String> {
        self.lock().deleted_networks.clone()
    }

    pub fn routed(&self, network: &str) -> Vec<String> {
        self.lock()
            .routes
            .get(network)
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_namespace(&self, namespace: &str) -> bool {
        self.lock().namespaces.contains(namespace)
    }
}

#[async_trait]
impl ComputeApi for SimCloud {
    async fn create_instance(&self, spec: &InstanceSpec) -> RemoteResult<Instance> {
        let mut state = self.lock();
        let network = spec.network.first().map(|n| n.network_uuid.clone());
        if let Some(net) = &network {
            if !state.networks.contains_key(net) {
                return Err(RemoteError::NotFound(format!("network {net}")));
            }
        }
        if state
            .create_failure_after
            .is_some_and(|n| state.created.len() >= n)
        {
            return Err(RemoteError::Api {
                status: 503,
                body: "no capacity for new instances".to_string(),
            });
        }
        state.created.push(spec.clone());
        let uuid = state.spawn(&spec.name, false);
        let inst = state
            .instances
            .get_mut(&uuid)
            .map(|i| {
                i.instance.namespace = Some(spec.namespace.clone());
                i.instance.clone()
            })
            .ok_or_else(|| RemoteError::NotFound(uuid.clone()))?;
        Ok(inst)
    }

    async fn get_instance(&self, uuid: &str) -> RemoteResult<Instance> {
        let mut state = self.lock();
        let stall = state.stall;
        let sim = state
            .instances
            .get_mut(uuid)
            .ok_or_else(|| RemoteError::NotFound(format!("instance {uuid}")))?;

        if let Some(left) = sim.delete_polls_left.as_mut() {
            if *left > 0 {
                *left -= 1;
            }
            if *left == 0 {
                sim.instance.state = PowerState::Deleted;
            }
        } else if !stall && sim.instance.state != PowerState::Running {
            if sim.boot_polls_left > 0 {
                sim.boot_polls_left -= 1;
            }
            if sim.boot_polls_left == 0 {
                sim.instance.state = PowerState::Running;
                sim.instance.agent_state = Some("ready".to_string());
            }
        }
        Ok(sim.instance.clone())
    }

    async fn delete_instance(&self, uuid: &str) -> RemoteResult<()> {
        let mut state = self.lock();
        let sim = state
            .instances
            .get_mut(uuid)
            .ok_or_else(|| RemoteError::NotFound(format!("instance {uuid}")))?;
        if sim.delete_polls_left.is_none() {
            sim.delete_polls_left = Some(1);
        }
        Ok(())
    }

    async fn get_interfaces(&self, uuid: &str) -> RemoteResult<Vec<NetworkInterface>> {
        self.lock()
            .instances
            .get(uuid)
            .map(|i| i.interfaces.clone())
            .ok_or_else(|| RemoteError::NotFound(format!("instance {uuid}")))
    }

    async fn list_agent_operations(&self, uuid: &str) -> RemoteResult<Vec<AgentOperation>> {
        let mut state = self.lock();
        if !state.instances.contains_key(uuid) {
            return Err(RemoteError::NotFound(format!("instance {uuid}")));
        }
        let ids: Vec<String> = state
            .operations
            .values()
            .filter(|o| o.op.instance_uuid == uuid)
            .map(|o| o.op.uuid.clone())
            .collect();
        Ok(ids.iter().filter_map(|id| state.observe_op(id)).collect())
    }

    async fn get_agent_operation(&self, uuid: &str) -> RemoteResult<AgentOperation> {
        self.lock()
            .observe_op(uuid)
            .ok_or_else(|| RemoteError::NotFound(format!("agent operation {uuid}")))
    }

    async fn execute(&self, instance: &str, commandline: &str) -> RemoteResult<AgentOperation> {
        let mut state = self.lock();
        let rule = state
            .failures
            .iter()
            .find(|r| commandline.contains(&r.pattern))
            .map(|r| CommandOutput {
                return_code: r.exit_code,
                stdout: r.stdout.clone(),
                stderr: r.stderr.clone(),
            });
        let output = rule.unwrap_or(CommandOutput {
            return_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        });
        let command = AgentCommand {
            command: "execute".to_string(),
            commandline: Some(commandline.to_string()),
            path: None,
        };
        let op = state.submit(
            instance,
            command,
            OperationResult::Command(output),
            OperationState::Complete,
        )?;
        state
            .executed
            .push((instance.to_string(), commandline.to_string()));
        Ok(op)
    }

    async fn fetch_file(&self, instance: &str, path: &str) -> RemoteResult<AgentOperation> {
        self.lock().fetch(instance, path)
    }

    async fn blob_chunks(&self, blob_uuid: &str) -> RemoteResult<Vec<Bytes>> {
        let state = self.lock();
        let content = state
            .blobs
            .get(blob_uuid)
            .ok_or_else(|| RemoteError::NotFound(format!("blob {blob_uuid}")))?;
        Ok(content
            .as_bytes()
            .chunks(BLOB_CHUNK)
            .map(Bytes::copy_from_slice)
            .collect())
    }

    async fn namespace_exists(&self, namespace: &str) -> RemoteResult<bool> {
        Ok(self.lock().namespaces.contains(namespace))
    }

    async fn create_namespace(&self, namespace: &str) -> RemoteResult<()> {
        self.lock().namespaces.insert(namespace.to_string());
        Ok(())
    }
}

#[async_trait]
impl NetworkApi for SimCloud {
    async fn allocate_network(&self, spec: &NetworkSpec) -> RemoteResult<Network> {
        let mut state = self.lock();
        let uuid = state.id("net");
        let network = Network {
            uuid: uuid.clone(),
            name: spec.name.clone(),
            state: "initial".to_string(),
        };
        state.networks.insert(
            uuid,
            SimNetwork {
                network: network.clone(),
                polls_left: 1,
            },
        );
        Ok(network)
    }

    async fn get_network(&self, uuid: &str) -> RemoteResult<Network> {
        let mut state = self.lock();
        let sim = state
            .networks
            .get_mut(uuid)
            .ok_or_else(|| RemoteError::NotFound(format!("network {uuid}")))?;
        if sim.polls_left > 0 {
            sim.polls_left -= 1;
        }
        if sim.polls_left == 0 {
            sim.network.state = "created".to_string();
        }
        Ok(sim.network.clone())
    }

    async fn delete_network(&self, uuid: &str) -> RemoteResult<()> {
        let mut state = self.lock();
        if state.fail_network_deletes {
            return Err(RemoteError::Api {
                status: 500,
                body: format!("network {uuid} is busy"),
            });
        }
        if state.networks.remove(uuid).is_none() {
            return Err(RemoteError::NotFound(format!("network {uuid}")));
        }
        state.deleted_networks.push(uuid.to_string());
        Ok(())
    }

    async fn route_address(&self, network: &str) -> RemoteResult<Option<String>> {
        let mut state = self.lock();
        if !state.networks.contains_key(network) {
            return Err(RemoteError::NotFound(format!("network {network}")));
        }
        let handed_out: usize = state.routes.values().map(Vec::len).sum();
        if state.address_limit.is_some_and(|limit| handed_out >= limit) {
            return Ok(None);
        }
        if state
            .route_failure_after
            .is_some_and(|n| state.routes_handed_out >= n)
        {
            return Err(RemoteError::Api {
                status: 500,
                body: "floating address allocation failed".to_string(),
            });
        }
        state.routes_handed_out += 1;
        state.next_address += 1;
        let address = format!("192.0.2.{}", state.next_address);
        state
            .routes
            .entry(network.to_string())
            .or_default()
            .push(address.clone());
        Ok(Some(address))
    }

    async fn unroute_address(&self, network: &str, address: &str) -> RemoteResult<()> {
        let mut state = self.lock();
        let routed = state.routes.entry(network.to_string()).or_default();
        match routed.iter().position(|a| a == address) {
            Some(idx) => {
                routed.remove(idx);
                Ok(())
            }
            None => Err(RemoteError::Unauthorized(format!(
                "address {address} is not routed to network {network}"
            ))),
        }
    }
}
