//! Operation tracker — synchronous waits over asynchronous remote operations.
//!
//! Every remote action is asynchronous-only. The tracker polls at a fixed
//! interval (no backoff) until the watched set reaches a terminal state, and
//! converts failures into [`RemoteError`]s carrying full diagnostics. Waits
//! are unbounded unless the [`PollPolicy`] sets a deadline.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use kiln_core::config::PollingConfig;

use crate::api::{AgentOperation, ComputeApi, OperationState};
use crate::error::{RemoteError, RemoteResult};

/// Commands run on every instance as soon as it has booted.
pub const OS_UPDATE_COMMANDS: &[&str] = &["apt-get update", "apt-get dist-upgrade -y"];

/// Poll intervals and the optional ceiling on any single wait.
#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    pub boot_interval: Duration,
    pub operation_interval: Duration,
    pub deletion_interval: Duration,
    pub network_interval: Duration,
    pub deadline: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::from(&PollingConfig::default())
    }
}

impl From<&PollingConfig> for PollPolicy {
    fn from(cfg: &PollingConfig) -> Self {
        Self {
            boot_interval: Duration::from_secs(cfg.boot_interval_secs),
            operation_interval: Duration::from_secs(cfg.operation_interval_secs),
            deletion_interval: Duration::from_secs(cfg.deletion_interval_secs),
            network_interval: Duration::from_secs(cfg.network_interval_secs),
            deadline: cfg.deadline(),
        }
    }
}

impl PollPolicy {
    /// Zero intervals, no deadline (for tests).
    pub fn immediate() -> Self {
        Self {
            boot_interval: Duration::ZERO,
            operation_interval: Duration::ZERO,
            deletion_interval: Duration::ZERO,
            network_interval: Duration::ZERO,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn start(&self, what: impl Into<String>) -> Deadline {
        Deadline {
            started: Instant::now(),
            limit: self.deadline,
            what: what.into(),
        }
    }
}

/// Tracks elapsed time for one wait.
#[derive(Debug)]
pub struct Deadline {
    started: Instant,
    limit: Option<Duration>,
    what: String,
}

impl Deadline {
    pub fn check(&self) -> RemoteResult<()> {
        match self.limit {
            Some(limit) if self.started.elapsed() >= limit => Err(RemoteError::Timeout {
                what: self.what.clone(),
                waited_secs: self.started.elapsed().as_secs(),
            }),
            _ => Ok(()),
        }
    }
}

/// Polling primitives over the compute API.
#[derive(Clone)]
pub struct OperationTracker {
    api: Arc<dyn ComputeApi>,
    policy: PollPolicy,
}

impl OperationTracker {
    pub fn new(api: Arc<dyn ComputeApi>, policy: PollPolicy) -> Self {
        Self { api, policy }
    }

    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// Wait until every instance is running with a ready agent, then apply
    /// OS updates to the whole set.
    pub async fn await_boot(&self, instances: &[String]) -> RemoteResult<()> {
        let deadline = self.policy.start(format!("{} instances to boot", instances.len()));
        let mut waiting = instances.to_vec();

        while !waiting.is_empty() {
            info!(count = waiting.len(), "waiting for instances to boot");
            let mut still_waiting = Vec::with_capacity(waiting.len());
            for uuid in waiting {
                let inst = self.api.get_instance(&uuid).await?;
                debug!(
                    instance = %inst.name,
                    state = ?inst.state,
                    agent_state = inst.agent_state.as_deref().unwrap_or("unknown"),
                    "instance boot state"
                );
                if !inst.is_ready() {
                    still_waiting.push(uuid);
                }
            }
            waiting = still_waiting;

            if !waiting.is_empty() {
                deadline.check()?;
                tokio::time::sleep(self.policy.boot_interval).await;
            }
        }

        self.os_update(instances).await
    }

    /// Wait until no instance has a non-terminal agent operation.
    pub async fn await_idle(&self, instances: &[String]) -> RemoteResult<()> {
        let deadline = self.policy.start(format!("{} instances to be idle", instances.len()));
        let mut waiting = instances.to_vec();

        while !waiting.is_empty() {
            debug!(count = waiting.len(), "waiting for instances to be idle");
            let mut still_waiting = Vec::with_capacity(waiting.len());
            for uuid in waiting {
                let ops = self.api.list_agent_operations(&uuid).await?;
                let incomplete = ops.iter().filter(|op| !op.state.is_terminal()).count();
                debug!(instance = %uuid, incomplete, "agent operations outstanding");
                if incomplete > 0 {
                    still_waiting.push(uuid);
                }
            }
            waiting = still_waiting;

            if !waiting.is_empty() {
                deadline.check()?;
                tokio::time::sleep(self.policy.operation_interval).await;
            }
        }
        Ok(())
    }

    /// Wait for a file fetch and return the fetched content as text.
    pub async fn await_fetch(&self, op: AgentOperation) -> RemoteResult<String> {
        let op = self.await_terminal(op).await?;

        if op.state == OperationState::Error {
            let (path, message) = op
                .fetch_output()
                .map(|f| (f.path.clone(), f.message.clone().unwrap_or_default()))
                .unwrap_or_else(|| (op.describe(), String::new()));
            warn!(%path, %message, "file fetch failed");
            return Err(RemoteError::FetchFailed { path, message });
        }

        let blob = op
            .fetch_output()
            .and_then(|f| f.content_blob.clone())
            .ok_or_else(|| {
                RemoteError::Decode(format!("fetch operation {} has no content blob", op.uuid))
            })?;

        let mut data = Vec::new();
        for chunk in self.api.blob_chunks(&blob).await? {
            data.extend_from_slice(&chunk);
        }
        String::from_utf8(data)
            .map_err(|e| RemoteError::Decode(format!("blob {blob} is not UTF-8: {e}")))
    }

    /// Wait for a command to finish; a non-zero exit code is fatal.
    pub async fn reap_execute(&self, op: AgentOperation) -> RemoteResult<()> {
        let op = self.await_terminal(op).await?;

        let Some(output) = op.command_output() else {
            if op.state == OperationState::Error {
                return Err(RemoteError::OperationFailed {
                    operation: op.uuid.clone(),
                    instance: op.instance_uuid.clone(),
                });
            }
            return Err(RemoteError::Decode(format!(
                "operation {} has no command result",
                op.uuid
            )));
        };

        if output.return_code != 0 || op.state == OperationState::Error {
            let instance_name = match self.api.get_instance(&op.instance_uuid).await {
                Ok(inst) => inst.name,
                Err(_) => op.instance_uuid.clone(),
            };
            return Err(RemoteError::CommandFailed {
                instance: op.instance_uuid.clone(),
                instance_name,
                command: op.describe(),
                exit_code: output.return_code,
                stdout: output.stdout.clone(),
                stderr: output.stderr.clone(),
            });
        }
        Ok(())
    }

    /// Run every command on every instance, wait for the fleet to go idle,
    /// then check every result. The first failure aborts the batch.
    pub async fn execute_and_await<S: AsRef<str>>(
        &self,
        instances: &[String],
        commands: &[S],
    ) -> RemoteResult<()> {
        let mut ops = Vec::with_capacity(commands.len() * instances.len());
        for cmd in commands {
            for uuid in instances {
                ops.push(self.api.execute(uuid, cmd.as_ref()).await?);
            }
        }
        debug!(
            operations = ops.len(),
            instances = instances.len(),
            "commands submitted"
        );

        self.await_idle(instances).await?;
        for op in ops {
            self.reap_execute(op).await?;
        }
        Ok(())
    }

    pub async fn os_update(&self, instances: &[String]) -> RemoteResult<()> {
        info!(count = instances.len(), "updating operating system");
        self.execute_and_await(instances, OS_UPDATE_COMMANDS).await
    }

    async fn await_terminal(&self, mut op: AgentOperation) -> RemoteResult<AgentOperation> {
        let deadline = self.policy.start(format!("agent operation {}", op.uuid));
        while !op.state.is_terminal() {
            debug!(operation = %op.uuid, state = ?op.state, "operation pending");
            deadline.check()?;
            tokio::time::sleep(self.policy.operation_interval).await;
            op = self.api.get_agent_operation(&op.uuid).await?;
        }
        Ok(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimCloud;

    fn tracker(sim: &Arc<SimCloud>) -> OperationTracker {
        OperationTracker::new(sim.clone(), PollPolicy::immediate())
    }

    #[tokio::test]
    async fn await_boot_waits_for_every_instance_then_updates() {
        let sim = Arc::new(SimCloud::new());
        sim.set_boot_polls(3);
        let a = sim.spawn_instance("a");
        let b = sim.spawn_instance("b");

        tracker(&sim).await_boot(&[a.clone(), b.clone()]).await.unwrap();

        assert!(sim.instance(&a).unwrap().is_ready());
        assert!(sim.instance(&b).unwrap().is_ready());
        let executed = sim.executed_commands();
        for id in [&a, &b] {
            let cmds: Vec<_> = executed
                .iter()
                .filter(|(i, _)| i == id)
                .map(|(_, c)| c.as_str())
                .collect();
            assert_eq!(cmds, OS_UPDATE_COMMANDS);
        }
    }

    #[tokio::test]
    async fn await_boot_never_returns_for_stalled_instance() {
        let sim = Arc::new(SimCloud::new());
        sim.stall_boots(true);
        let a = sim.spawn_instance("a");

        let tracker = OperationTracker::new(
            sim.clone(),
            PollPolicy::immediate().with_deadline(Duration::from_millis(50)),
        );
        let err = tracker.await_boot(&[a]).await.unwrap_err();
        assert!(matches!(err, RemoteError::Timeout { .. }));
        assert!(sim.executed_commands().is_empty());
    }

    #[tokio::test]
    async fn await_boot_without_deadline_blocks() {
        let sim = Arc::new(SimCloud::new());
        sim.stall_boots(true);
        let a = sim.spawn_instance("a");

        let mut policy = PollPolicy::immediate();
        policy.boot_interval = Duration::from_millis(1);
        let tracker = OperationTracker::new(sim.clone(), policy);
        let outcome =
            tokio::time::timeout(Duration::from_millis(100), tracker.await_boot(&[a])).await;
        assert!(outcome.is_err(), "await_boot returned for a stalled instance");
    }

    #[tokio::test]
    async fn execute_failure_surfaces_exit_code_and_output() {
        let sim = Arc::new(SimCloud::new());
        sim.fail_command("false-step", 3, "partial output", "it broke");
        let a = sim.spawn_ready_instance("a");

        let err = tracker(&sim)
            .execute_and_await(&[a.clone()], &["echo ok", "false-step", "echo after"])
            .await
            .unwrap_err();

        match err {
            RemoteError::CommandFailed {
                instance,
                instance_name,
                command,
                exit_code,
                stdout,
                stderr,
            } => {
                assert_eq!(instance, a);
                assert_eq!(instance_name, "a");
                assert_eq!(command, "false-step");
                assert_eq!(exit_code, 3);
                assert_eq!(stdout, "partial output");
                assert_eq!(stderr, "it broke");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn failed_batch_stops_later_batches() {
        let sim = Arc::new(SimCloud::new());
        sim.fail_command("broken", 1, "", "");
        let a = sim.spawn_ready_instance("a");
        let t = tracker(&sim);

        let script = async {
            t.execute_and_await(&[a.clone()], &["broken"]).await?;
            t.execute_and_await(&[a.clone()], &["second batch"]).await
        };
        assert!(script.await.is_err());
        assert!(
            !sim.executed_commands()
                .iter()
                .any(|(_, c)| c == "second batch")
        );
    }

    #[tokio::test]
    async fn commands_run_cartesian_in_listed_order() {
        let sim = Arc::new(SimCloud::new());
        let a = sim.spawn_ready_instance("a");
        let b = sim.spawn_ready_instance("b");

        tracker(&sim)
            .execute_and_await(&[a.clone(), b.clone()], &["one", "two"])
            .await
            .unwrap();

        let executed = sim.executed_commands();
        assert_eq!(executed.len(), 4);
        for id in [&a, &b] {
            let cmds: Vec<_> = executed
                .iter()
                .filter(|(i, _)| i == id)
                .map(|(_, c)| c.clone())
                .collect();
            assert_eq!(cmds, vec!["one", "two"]);
        }
    }

    #[tokio::test]
    async fn await_fetch_concatenates_blob_chunks() {
        let sim = Arc::new(SimCloud::new());
        sim.put_file("/etc/motd", "hello from the node\nsecond line\n");
        let a = sim.spawn_ready_instance("a");

        let op = sim.fetch_file_now(&a, "/etc/motd");
        let text = tracker(&sim).await_fetch(op).await.unwrap();
        assert_eq!(text, "hello from the node\nsecond line\n");
    }

    #[tokio::test]
    async fn await_fetch_reports_missing_path() {
        let sim = Arc::new(SimCloud::new());
        let a = sim.spawn_ready_instance("a");

        let op = sim.fetch_file_now(&a, "/nope");
        let err = tracker(&sim).await_fetch(op).await.unwrap_err();
        match err {
            RemoteError::FetchFailed { path, message } => {
                assert_eq!(path, "/nope");
                assert!(message.contains("No such file"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn await_idle_ignores_errored_operations() {
        let sim = Arc::new(SimCloud::new());
        let a = sim.spawn_ready_instance("a");
        let _ = sim.fetch_file_now(&a, "/missing");

        tracker(&sim).await_idle(&[a]).await.unwrap();
    }
}
