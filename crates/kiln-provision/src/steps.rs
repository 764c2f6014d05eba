//! Individual workflow steps shared by create and the expansion commands.
//!
//! Every step that changes what a later step depends on persists the
//! record before returning.

use tracing::{debug, info, warn};

use kiln_core::{network_name, qualified_name, NodeRole};
use kiln_release::ReleaseFamily;
use kiln_remote::NetworkSpec;
use kiln_state::{ClusterRecord, InstanceId};

use crate::context::WorkflowContext;
use crate::error::{ProvisionError, ProvisionResult};
use crate::kubeconfig::rewrite_kubeconfig;
use crate::scripts;

/// Netblock of networks allocated for a cluster.
pub const NODE_NETBLOCK: &str = "10.0.0.0/16";

fn required<'a>(record: &'a ClusterRecord, value: &'a Option<String>, field: &'static str) -> ProvisionResult<&'a str> {
    value
        .as_deref()
        .ok_or_else(|| ProvisionError::missing(&record.name, field))
}

fn primary(record: &ClusterRecord) -> ProvisionResult<String> {
    record
        .primary_control_plane()
        .map(str::to_string)
        .ok_or_else(|| ProvisionError::missing(&record.name, "control plane node"))
}

/// Use `existing` if given, otherwise allocate a network for the cluster
/// and wait until it is ready.
pub async fn acquire_network(
    ctx: &WorkflowContext,
    name: &str,
    namespace: &str,
    existing: Option<&str>,
) -> ProvisionResult<String> {
    if let Some(uuid) = existing {
        return match ctx.network.get_network(uuid).await {
            Ok(net) => {
                info!(network = %net.uuid, name = %net.name, "using existing node network");
                Ok(net.uuid)
            }
            Err(e) if e.is_not_found() => Err(ProvisionError::NetworkNotFound(uuid.to_string())),
            Err(e) => Err(e.into()),
        };
    }

    let spec = NetworkSpec {
        netblock: NODE_NETBLOCK.to_string(),
        provide_dhcp: true,
        provide_nat: true,
        name: network_name(name),
        namespace: namespace.to_string(),
    };
    let mut net = ctx.network.allocate_network(&spec).await?;
    info!(network = %net.uuid, name = %net.name, "node network created");

    let policy = ctx.tracker.policy();
    let deadline = policy.start(format!("network {} to be ready", net.uuid));
    loop {
        net = ctx.network.get_network(&net.uuid).await?;
        if net.is_ready() {
            break;
        }
        debug!(network = %net.uuid, state = %net.state, "network not ready");
        deadline.check()?;
        tokio::time::sleep(policy.network_interval).await;
    }
    info!(network = %net.uuid, "node network ready");
    Ok(net.uuid)
}

/// Record the primary node's first interface as the cluster API address.
pub async fn capture_api_addresses(
    ctx: &WorkflowContext,
    record: &mut ClusterRecord,
) -> ProvisionResult<()> {
    let primary = primary(record)?;
    let interfaces = ctx.compute.get_interfaces(&primary).await?;
    let first = interfaces
        .into_iter()
        .next()
        .ok_or_else(|| ProvisionError::missing(&record.name, "network interface"))?;

    record.api_address_inner = first.ipv4;
    record.api_address_floating = first.floating;
    ctx.store.put(record).await?;
    info!(
        cluster = %record.name,
        inner = record.api_address_inner.as_deref().unwrap_or("-"),
        floating = record.api_address_floating.as_deref().unwrap_or("-"),
        "API addresses captured"
    );
    Ok(())
}

/// Install the founding control-plane node and collect the join tokens,
/// then join any further control-plane nodes.
pub async fn install_control_plane(
    ctx: &WorkflowContext,
    record: &mut ClusterRecord,
) -> ProvisionResult<()> {
    let primary = primary(record)?;
    let floating = required(record, &record.api_address_floating, "floating API address")?;
    let version = required(record, &record.software_version, "software version")?;

    info!(cluster = %record.name, instance = %primary, "setting up first control plane node");
    let commands = scripts::control_plane_install(floating, version);
    ctx.tracker
        .execute_and_await(std::slice::from_ref(&primary), &commands)
        .await?;

    info!(cluster = %record.name, "fetching control plane registration token");
    let op = ctx
        .compute
        .fetch_file(&primary, scripts::SERVER_TOKEN_PATH)
        .await?;
    let token = ctx.tracker.await_fetch(op).await?;
    record.server_token = Some(token.trim_end().to_string());
    ctx.store.put(record).await?;

    info!(cluster = %record.name, "fetching node registration token");
    let op = ctx.compute.fetch_file(&primary, scripts::NODE_TOKEN_PATH).await?;
    let token = ctx.tracker.await_fetch(op).await?;
    record.node_token = Some(token.trim_end().to_string());
    ctx.store.put(record).await?;

    let extra: Vec<InstanceId> = record.control_plane_nodes.iter().skip(1).cloned().collect();
    if !extra.is_empty() {
        info!(cluster = %record.name, count = extra.len(), "setting up other control plane nodes");
        join_nodes(ctx, record, &extra, NodeRole::ControlPlane).await?;
    }
    Ok(())
}

/// Join `nodes` in `role`, using the token that role requires.
pub async fn join_nodes(
    ctx: &WorkflowContext,
    record: &ClusterRecord,
    nodes: &[InstanceId],
    role: NodeRole,
) -> ProvisionResult<()> {
    if nodes.is_empty() {
        return Ok(());
    }
    let token = match role {
        NodeRole::ControlPlane => required(record, &record.server_token, "server token")?,
        NodeRole::Worker => required(record, &record.node_token, "node token")?,
    };
    let version = required(record, &record.software_version, "software version")?;
    let inner = required(record, &record.api_address_inner, "inner API address")?;

    info!(cluster = %record.name, %role, count = nodes.len(), "joining nodes");
    let commands = scripts::join(version, inner, token, role);
    ctx.tracker.execute_and_await(nodes, &commands).await?;
    Ok(())
}

/// Pull the admin kubeconfig from the primary node and make it usable from
/// outside the cluster.
pub async fn extract_kubeconfig(
    ctx: &WorkflowContext,
    record: &mut ClusterRecord,
) -> ProvisionResult<()> {
    let primary = primary(record)?;
    let floating = required(record, &record.api_address_floating, "floating API address")?;

    info!(cluster = %record.name, "fetching kubeconfig");
    let op = ctx.compute.fetch_file(&primary, scripts::KUBECONFIG_PATH).await?;
    let raw = ctx.tracker.await_fetch(op).await?;
    let fqcn = qualified_name(&record.name, &record.namespace);
    let kubeconfig = rewrite_kubeconfig(&raw, floating, &fqcn)?;

    record.kubeconfig = Some(kubeconfig);
    ctx.store.put(record).await?;
    Ok(())
}

/// Route up to `count` floating addresses into the node network, persisting
/// after each one. Returns how many were allocated.
pub async fn allocate_addresses(
    ctx: &WorkflowContext,
    record: &mut ClusterRecord,
    count: usize,
) -> ProvisionResult<usize> {
    let network = required(record, &record.node_network, "node network")?.to_string();
    ctx.network.get_network(&network).await?;

    let mut allocated = 0;
    for _ in 0..count {
        match ctx.network.route_address(&network).await? {
            Some(address) => {
                info!(cluster = %record.name, %address, "routed address allocated");
                record.routed_addresses.push(address);
                ctx.store.put(record).await?;
                allocated += 1;
            }
            None => warn!(cluster = %record.name, %network, "no floating address available"),
        }
    }
    info!(
        cluster = %record.name,
        allocated,
        total = record.routed_addresses.len(),
        "routed addresses allocated"
    );
    Ok(allocated)
}

/// Write and apply the load-balancer pool covering every routed address.
pub async fn configure_addresses(ctx: &WorkflowContext, record: &ClusterRecord) -> ProvisionResult<()> {
    let primary = primary(record)?;
    let commands = scripts::metallb_configure(&record.routed_addresses);
    ctx.tracker
        .execute_and_await(std::slice::from_ref(&primary), &commands)
        .await?;
    Ok(())
}

/// Allocate addresses, install the load balancer, let it start, configure it.
pub async fn setup_load_balancer(
    ctx: &WorkflowContext,
    record: &mut ClusterRecord,
    address_count: usize,
) -> ProvisionResult<()> {
    info!(cluster = %record.name, "setting up metallb");
    allocate_addresses(ctx, record, address_count).await?;

    let primary = primary(record)?;
    ctx.tracker
        .execute_and_await(std::slice::from_ref(&primary), &scripts::metallb_install())
        .await?;

    if !ctx.settle.is_zero() {
        debug!(secs = ctx.settle.as_secs(), "letting metallb pods start");
        tokio::time::sleep(ctx.settle).await;
    }
    configure_addresses(ctx, record).await
}

/// Resolve and install the storage layer.
pub async fn setup_storage(
    ctx: &WorkflowContext,
    record: &mut ClusterRecord,
    channel: &str,
    force_refresh: bool,
) -> ProvisionResult<()> {
    let version = ctx
        .releases
        .resolve(&record.namespace, ReleaseFamily::Longhorn, channel, force_refresh)
        .await?;
    info!(cluster = %record.name, %version, "setting up longhorn");

    let primary = primary(record)?;
    ctx.tracker
        .execute_and_await(
            std::slice::from_ref(&primary),
            &scripts::longhorn_install(&version),
        )
        .await?;

    record.storage_version = Some(version);
    ctx.store.put(record).await?;
    Ok(())
}
