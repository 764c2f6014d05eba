//! Read-only queries.

use kiln_release::ReleaseFamily;
use kiln_state::ClusterRecord;

use crate::context::WorkflowContext;
use crate::error::{ProvisionError, ProvisionResult};

pub async fn list_clusters(ctx: &WorkflowContext, namespace: &str) -> ProvisionResult<Vec<String>> {
    Ok(ctx.store.list_names(namespace).await?)
}

pub async fn show_cluster(
    ctx: &WorkflowContext,
    namespace: &str,
    name: &str,
) -> ProvisionResult<ClusterRecord> {
    ctx.load_cluster(namespace, name).await
}

/// The stored kubeconfig; absent until provisioning extracted it.
pub async fn get_kubeconfig(ctx: &WorkflowContext, namespace: &str, name: &str) -> ProvisionResult<String> {
    let record = ctx.load_cluster(namespace, name).await?;
    record
        .kubeconfig
        .ok_or_else(|| ProvisionError::missing(name, "kubeconfig"))
}

/// Current version of a cluster software release channel.
pub async fn query_version(
    ctx: &WorkflowContext,
    namespace: &str,
    channel: &str,
    force_refresh: bool,
) -> ProvisionResult<String> {
    Ok(ctx
        .releases
        .resolve(namespace, ReleaseFamily::K3s, channel, force_refresh)
        .await?)
}
