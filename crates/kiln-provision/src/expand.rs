//! Operations on an existing cluster: growing it and patching its nodes.

use tracing::info;

use kiln_core::NodeRole;
use kiln_state::InstanceId;

use crate::context::WorkflowContext;
use crate::error::ProvisionResult;
use crate::steps;

/// Create, boot and join `count` more workers. Returns the new instances.
pub async fn expand_workers(
    ctx: &WorkflowContext,
    namespace: &str,
    name: &str,
    count: usize,
) -> ProvisionResult<Vec<InstanceId>> {
    let mut record = ctx.load_cluster(namespace, name).await?;

    let created = ctx
        .fleet
        .create_and_await_fleet(&mut record, count, NodeRole::Worker)
        .await?;
    steps::join_nodes(ctx, &record, &created, NodeRole::Worker).await?;

    info!(cluster = %name, added = created.len(), "workers added");
    Ok(created)
}

/// Route `count` more addresses and reapply the load-balancer pool.
/// Returns how many were allocated.
pub async fn expand_addresses(
    ctx: &WorkflowContext,
    namespace: &str,
    name: &str,
    count: usize,
) -> ProvisionResult<usize> {
    let mut record = ctx.load_cluster(namespace, name).await?;

    let allocated = steps::allocate_addresses(ctx, &mut record, count).await?;
    steps::configure_addresses(ctx, &record).await?;
    Ok(allocated)
}

/// Apply OS updates to every node of the cluster.
pub async fn update_os(ctx: &WorkflowContext, namespace: &str, name: &str) -> ProvisionResult<()> {
    let record = ctx.load_cluster(namespace, name).await?;
    let nodes = record.all_nodes();
    ctx.tracker.os_update(&nodes).await?;
    info!(cluster = %name, count = nodes.len(), "operating system updated");
    Ok(())
}
