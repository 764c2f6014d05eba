use kiln_provision::WorkflowContext;

use crate::output;

pub async fn list(ctx: &WorkflowContext, namespace: &str) -> anyhow::Result<()> {
    let names = kiln_provision::list_clusters(ctx, namespace).await?;
    if names.is_empty() {
        println!("No clusters in namespace {namespace}");
    }
    for name in names {
        println!("{name}");
    }
    Ok(())
}

pub async fn show(ctx: &WorkflowContext, namespace: &str, name: &str) -> anyhow::Result<()> {
    let record = kiln_provision::show_cluster(ctx, namespace, name).await?;
    print!("{}", output::cluster_details(&record));
    Ok(())
}

pub async fn getconfig(ctx: &WorkflowContext, namespace: &str, name: &str) -> anyhow::Result<()> {
    let kubeconfig = kiln_provision::get_kubeconfig(ctx, namespace, name).await?;
    print!("{kubeconfig}");
    if !kubeconfig.ends_with('\n') {
        println!();
    }
    Ok(())
}

pub async fn query_version(
    ctx: &WorkflowContext,
    namespace: &str,
    channel: &str,
    refresh: bool,
) -> anyhow::Result<()> {
    let version = kiln_provision::query_version(ctx, namespace, channel, refresh).await?;
    println!("Release channel {channel} has {version} as its latest version.");
    Ok(())
}
