//! Fleet manager — groups of identically templated instances.
//!
//! Instance identifiers are appended to the cluster record and persisted
//! one creation at a time, so an interrupted fleet creation loses at most
//! the reference to the instance being created.

use std::sync::Arc;

use tracing::{debug, info, warn};

use kiln_core::{node_name, InstanceTemplate, NodeRole};
use kiln_state::{ClusterRecord, ClusterStore, InstanceId};

use crate::api::{ComputeApi, InstanceSpec, PowerState};
use crate::error::{RemoteError, RemoteResult};
use crate::tracker::OperationTracker;

#[derive(Clone)]
pub struct FleetManager {
    api: Arc<dyn ComputeApi>,
    tracker: OperationTracker,
    store: ClusterStore,
    template: InstanceTemplate,
}

impl FleetManager {
    pub fn new(
        api: Arc<dyn ComputeApi>,
        tracker: OperationTracker,
        store: ClusterStore,
        template: InstanceTemplate,
    ) -> Self {
        Self {
            api,
            tracker,
            store,
            template,
        }
    }

    pub fn tracker(&self) -> &OperationTracker {
        &self.tracker
    }

    /// Create one instance named from the record's next serial.
    ///
    /// Bumps `node_serial` on the in-memory record; the caller persists.
    pub async fn create_instance(&self, record: &mut ClusterRecord) -> RemoteResult<InstanceId> {
        let network = record
            .node_network
            .clone()
            .ok_or_else(|| RemoteError::MissingField {
                cluster: record.name.clone(),
                field: "node network",
            })?;

        let name = node_name(&record.name, record.node_serial);
        let spec = InstanceSpec::from_template(
            &self.template,
            &name,
            &network,
            record.ssh_key.as_deref(),
            &record.namespace,
        );
        let instance = self.api.create_instance(&spec).await?;
        record.node_serial += 1;

        info!(cluster = %record.name, instance = %instance.uuid, %name, "instance created");
        Ok(instance.uuid)
    }

    /// Create `count` instances for `role`, persisting after each one.
    pub async fn create_fleet(
        &self,
        record: &mut ClusterRecord,
        count: usize,
        role: NodeRole,
    ) -> RemoteResult<Vec<InstanceId>> {
        let mut created = Vec::with_capacity(count);
        for _ in 0..count {
            let uuid = self.create_instance(record).await?;
            match role {
                NodeRole::ControlPlane => record.control_plane_nodes.push(uuid.clone()),
                NodeRole::Worker => record.worker_nodes.push(uuid.clone()),
            }
            self.store.put(record).await?;
            created.push(uuid);
        }
        debug!(cluster = %record.name, %role, count, "fleet created");
        Ok(created)
    }

    /// Create a fleet and wait for exactly those instances to boot.
    pub async fn create_and_await_fleet(
        &self,
        record: &mut ClusterRecord,
        count: usize,
        role: NodeRole,
    ) -> RemoteResult<Vec<InstanceId>> {
        let created = self.create_fleet(record, count, role).await?;
        self.tracker.await_boot(&created).await?;
        Ok(created)
    }

    /// Delete every instance and wait until each is deleted or gone.
    ///
    /// Instances that no longer exist count as already deleted.
    pub async fn delete_fleet(&self, instances: &[InstanceId]) -> RemoteResult<()> {
        let mut waiting: Vec<InstanceId> = Vec::with_capacity(instances.len());
        for uuid in instances {
            if waiting.contains(uuid) {
                continue;
            }
            match self.api.delete_instance(uuid).await {
                Ok(()) => {
                    info!(instance = %uuid, "instance deletion requested");
                    waiting.push(uuid.clone());
                }
                Err(e) if e.is_not_found() => {
                    warn!(instance = %uuid, "instance already gone");
                }
                Err(e) => return Err(e),
            }
        }

        let deadline = self
            .tracker
            .policy()
            .start(format!("{} instances to delete", waiting.len()));
        while !waiting.is_empty() {
            info!(count = waiting.len(), "waiting for instances to delete");
            let mut still_waiting = Vec::with_capacity(waiting.len());
            for uuid in waiting {
                match self.api.get_instance(&uuid).await {
                    Ok(inst) if inst.state == PowerState::Deleted => {
                        debug!(instance = %uuid, "instance deleted");
                    }
                    Ok(_) => still_waiting.push(uuid),
                    Err(e) if e.is_not_found() => {
                        debug!(instance = %uuid, "instance disappeared");
                    }
                    Err(e) => return Err(e),
                }
            }
            waiting = still_waiting;

            if !waiting.is_empty() {
                deadline.check()?;
                tokio::time::sleep(self.tracker.policy().deletion_interval).await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimCloud;
    use crate::tracker::PollPolicy;
    use kiln_state::RedbMetadataStore;

    struct Harness {
        sim: Arc<SimCloud>,
        store: ClusterStore,
        fleet: FleetManager,
    }

    fn harness() -> Harness {
        let sim = Arc::new(SimCloud::new());
        let store = ClusterStore::new(Arc::new(RedbMetadataStore::open_in_memory().unwrap()));
        let tracker = OperationTracker::new(sim.clone(), PollPolicy::immediate());
        let fleet = FleetManager::new(
            sim.clone(),
            tracker,
            store.clone(),
            InstanceTemplate::default(),
        );
        Harness { sim, store, fleet }
    }

    async fn record_with_network(h: &Harness) -> ClusterRecord {
        use crate::api::{NetworkApi, NetworkSpec};
        let net = h
            .sim
            .allocate_network(&NetworkSpec {
                netblock: "10.0.0.0/16".into(),
                provide_dhcp: true,
                provide_nat: true,
                name: "k3s-alpha-node".into(),
                namespace: "team1".into(),
            })
            .await
            .unwrap();
        ClusterRecord::new("alpha", "team1", "v1.30.4+k3s1", 1, &net.uuid)
    }

    #[tokio::test]
    async fn create_instance_names_from_serial_and_bumps_it() {
        let h = harness();
        let mut record = record_with_network(&h).await;
        record.ssh_key = Some("ssh-ed25519 AAAA op@host".into());

        h.fleet.create_instance(&mut record).await.unwrap();
        h.fleet.create_instance(&mut record).await.unwrap();

        assert_eq!(record.node_serial, 3);
        let specs = h.sim.created_specs();
        assert_eq!(specs[0].name, "k3s-alpha-node-001");
        assert_eq!(specs[1].name, "k3s-alpha-node-002");
        assert_eq!(specs[0].ssh_key.as_deref(), Some("ssh-ed25519 AAAA op@host"));
        assert_eq!(specs[0].namespace, "team1");
    }

    #[tokio::test]
    async fn create_instance_requires_a_network() {
        let h = harness();
        let mut record = record_with_network(&h).await;
        record.node_network = None;

        let err = h.fleet.create_instance(&mut record).await.unwrap_err();
        assert!(matches!(err, RemoteError::MissingField { .. }));
        assert_eq!(record.node_serial, 1);
    }

    #[tokio::test]
    async fn fleet_creation_persists_each_instance() {
        let h = harness();
        let mut record = record_with_network(&h).await;
        h.store.put(&record).await.unwrap();

        let workers = h
            .fleet
            .create_and_await_fleet(&mut record, 2, NodeRole::Worker)
            .await
            .unwrap();

        let stored = h.store.require("team1", "alpha").await.unwrap();
        assert_eq!(stored.worker_nodes, workers);
        assert!(stored.control_plane_nodes.is_empty());
        assert_eq!(stored.node_serial, 3);
        for id in &workers {
            assert!(h.sim.instance(id).unwrap().is_ready());
        }
    }

    #[tokio::test]
    async fn interrupted_fleet_keeps_instances_created_so_far() {
        let h = harness();
        let mut record = record_with_network(&h).await;
        h.store.put(&record).await.unwrap();
        h.sim.fail_creates_after(1);

        let err = h
            .fleet
            .create_fleet(&mut record, 3, NodeRole::Worker)
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Api { status: 503, .. }));

        let live: Vec<String> = h.sim.live_instances().into_iter().map(|i| i.uuid).collect();
        let stored = h.store.require("team1", "alpha").await.unwrap();
        assert_eq!(stored.worker_nodes, live);
        assert_eq!(stored.worker_nodes.len(), 1);
        assert_eq!(stored.node_serial, 2);
    }

    #[tokio::test]
    async fn delete_fleet_tolerates_missing_and_duplicate_ids() {
        let h = harness();
        let a = h.sim.spawn_ready_instance("a");
        let b = h.sim.spawn_ready_instance("b");
        h.sim.remove_instance(&b);

        h.fleet
            .delete_fleet(&[a.clone(), b.clone(), a.clone()])
            .await
            .unwrap();

        assert_eq!(h.sim.instance(&a).unwrap().state, PowerState::Deleted);
        assert!(h.sim.live_instances().is_empty());
    }
}
