//! Cluster teardown.
//!
//! Tolerates resources that already disappeared, so a teardown interrupted
//! part way can simply be run again.

use tracing::{debug, info};

use kiln_core::qualified_name;
use kiln_remote::RemoteError;
use kiln_state::ClusterState;

use crate::context::WorkflowContext;
use crate::error::ProvisionResult;

/// Destroy a cluster's infrastructure and forget it.
pub async fn delete_cluster(ctx: &WorkflowContext, namespace: &str, name: &str) -> ProvisionResult<()> {
    let mut record = ctx.load_cluster(namespace, name).await?;
    debug!(cluster = %name, phase = ?record.phase(), "deleting cluster");

    let nodes = record.all_nodes();
    info!(cluster = %name, count = nodes.len(), "deleting instances");
    ctx.fleet.delete_fleet(&nodes).await?;

    record.clear_topology();
    ctx.store.put(&record).await?;

    if let Some(network) = record.node_network.clone() {
        for address in std::mem::take(&mut record.routed_addresses) {
            match ctx.network.unroute_address(&network, &address).await {
                Ok(()) => debug!(%address, %network, "address unrouted"),
                Err(RemoteError::Unauthorized(_) | RemoteError::NotFound(_)) => {
                    debug!(%address, %network, "address was not routed to this network");
                }
                Err(e) => return Err(e.into()),
            }
        }

        match ctx.network.delete_network(&network).await {
            Ok(()) => info!(cluster = %name, %network, "node network deleted"),
            Err(e) if e.is_not_found() => debug!(%network, "node network already gone"),
            Err(e) => return Err(e.into()),
        }
        record.node_network = None;
    }

    record.state = ClusterState::Deleted;
    ctx.store.put(&record).await?;

    ctx.store
        .retire_serial(namespace, name, record.node_serial)
        .await?;
    ctx.store.delete(namespace, name).await?;
    ctx.store.unregister_name(namespace, name).await?;

    if let Some(file) = &ctx.kubeconfig {
        file.remove(&qualified_name(name, namespace))?;
    }
    info!(cluster = %name, %namespace, "cluster deleted");
    Ok(())
}
