//! Cluster creation — the forward provisioning sequence.
//!
//! ```text
//! resolve version ─▶ reserve name ─▶ network ─▶ record ─▶ fleets + boot
//!   ─▶ API addresses ─▶ control plane + tokens ─▶ join workers ─▶ kubeconfig
//!   ─▶ load balancer ─▶ (storage) ─▶ local kubeconfig ─▶ created
//! ```
//!
//! Nothing is rolled back on failure: the persisted record shows how far
//! provisioning got.

use std::path::Path;

use tracing::info;

use kiln_core::NodeRole;
use kiln_release::ReleaseFamily;
use kiln_state::{ClusterRecord, ClusterState};

use crate::context::WorkflowContext;
use crate::error::{ProvisionError, ProvisionResult};
use crate::steps;

#[derive(Debug, Clone, PartialEq)]
pub struct CreateRequest {
    pub name: String,
    pub namespace: String,
    /// Create the namespace first if it does not exist.
    pub ensure_namespace: bool,
    pub control_plane_count: usize,
    pub worker_count: usize,
    /// Floating addresses handed to the load balancer.
    pub address_count: usize,
    /// Pre-existing network to place nodes on.
    pub network: Option<String>,
    pub release_channel: String,
    pub refresh_version_cache: bool,
    /// Public key content placed on every node.
    pub ssh_key: Option<String>,
    /// Storage layer channel or version; `None` skips the storage layer.
    pub storage_channel: Option<String>,
}

impl CreateRequest {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ensure_namespace: false,
            control_plane_count: 1,
            worker_count: 2,
            address_count: 5,
            network: None,
            release_channel: "stable".to_string(),
            refresh_version_cache: false,
            ssh_key: None,
            storage_channel: None,
        }
    }

    fn validate(&self) -> ProvisionResult<()> {
        if self.name.is_empty() {
            return Err(ProvisionError::InvalidRequest("cluster name is empty".into()));
        }
        if self.control_plane_count == 0 {
            return Err(ProvisionError::InvalidRequest(
                "at least one control plane node is required".into(),
            ));
        }
        Ok(())
    }
}

/// Read an SSH public key file.
pub fn read_ssh_key(path: &Path) -> ProvisionResult<String> {
    std::fs::read_to_string(path).map_err(|source| ProvisionError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Provision a new cluster end to end.
pub async fn create_cluster(
    ctx: &WorkflowContext,
    req: &CreateRequest,
) -> ProvisionResult<ClusterRecord> {
    req.validate()?;
    let (name, namespace) = (req.name.as_str(), req.namespace.as_str());

    if req.ensure_namespace && !ctx.compute.namespace_exists(namespace).await? {
        ctx.compute.create_namespace(namespace).await?;
        info!(%namespace, "namespace created");
    }

    let version = ctx
        .releases
        .resolve(
            namespace,
            ReleaseFamily::K3s,
            &req.release_channel,
            req.refresh_version_cache,
        )
        .await?;

    ctx.store.register_name(namespace, name).await?;

    let network = steps::acquire_network(ctx, name, namespace, req.network.as_deref()).await?;

    let serial = ctx.store.next_serial(namespace, name).await?;
    let mut record = ClusterRecord::new(name, namespace, &version, serial, &network);
    record.ssh_key = req.ssh_key.clone();
    ctx.store.put(&record).await?;
    info!(cluster = %name, %namespace, %version, "cluster record initialised");

    info!(
        cluster = %name,
        control_plane = req.control_plane_count,
        workers = req.worker_count,
        "creating nodes"
    );
    let mut booting = ctx
        .fleet
        .create_fleet(&mut record, req.control_plane_count, NodeRole::ControlPlane)
        .await?;
    let workers = ctx
        .fleet
        .create_fleet(&mut record, req.worker_count, NodeRole::Worker)
        .await?;
    booting.extend(workers.iter().cloned());
    ctx.tracker.await_boot(&booting).await?;

    steps::capture_api_addresses(ctx, &mut record).await?;

    info!(cluster = %name, "configuring and installing control plane");
    steps::install_control_plane(ctx, &mut record).await?;

    info!(cluster = %name, "installing workers");
    steps::join_nodes(ctx, &record, &workers, NodeRole::Worker).await?;

    steps::extract_kubeconfig(ctx, &mut record).await?;

    steps::setup_load_balancer(ctx, &mut record, req.address_count).await?;

    if let Some(channel) = &req.storage_channel {
        steps::setup_storage(ctx, &mut record, channel, req.refresh_version_cache).await?;
    }

    if let (Some(file), Some(kubeconfig)) = (&ctx.kubeconfig, &record.kubeconfig) {
        file.merge(kubeconfig)?;
    }

    record.state = ClusterState::Created;
    ctx.store.put(&record).await?;
    info!(cluster = %name, %namespace, "cluster created");
    Ok(record)
}
