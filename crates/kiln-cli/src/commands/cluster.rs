use kiln_provision::{CreateRequest, WorkflowContext};

pub async fn create(ctx: &WorkflowContext, req: &CreateRequest) -> anyhow::Result<()> {
    let record = kiln_provision::create_cluster(ctx, req).await?;
    println!("✓ Cluster {} created", record.name);
    println!("  Namespace: {}", record.namespace);
    if let Some(version) = &record.software_version {
        println!("  Version:   {version}");
    }
    if let Some(api) = &record.api_address_floating {
        println!("  API:       https://{api}:{}", kiln_provision::scripts::API_PORT);
    }
    if let Some(kubeconfig) = &ctx.kubeconfig {
        println!("  Kubeconfig merged into {}", kubeconfig.path().display());
    }
    Ok(())
}

pub async fn delete(ctx: &WorkflowContext, namespace: &str, name: &str) -> anyhow::Result<()> {
    kiln_provision::delete_cluster(ctx, namespace, name).await?;
    println!("✓ Cluster {name} deleted");
    Ok(())
}

pub async fn expand_workers(
    ctx: &WorkflowContext,
    namespace: &str,
    name: &str,
    count: usize,
) -> anyhow::Result<()> {
    let added = kiln_provision::expand_workers(ctx, namespace, name, count).await?;
    println!("✓ Added {} worker(s) to {name}", added.len());
    for id in added {
        println!("  {id}");
    }
    Ok(())
}

pub async fn expand_addresses(
    ctx: &WorkflowContext,
    namespace: &str,
    name: &str,
    count: usize,
) -> anyhow::Result<()> {
    let allocated = kiln_provision::expand_addresses(ctx, namespace, name, count).await?;
    if allocated < count {
        println!("Only {allocated} of {count} address(es) could be allocated for {name}");
    } else {
        println!("✓ Added {allocated} address(es) to {name}");
    }
    Ok(())
}

pub async fn update_os(ctx: &WorkflowContext, namespace: &str, name: &str) -> anyhow::Result<()> {
    kiln_provision::update_os(ctx, namespace, name).await?;
    println!("✓ Operating system updated on all nodes of {name}");
    Ok(())
}
