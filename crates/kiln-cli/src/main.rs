use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

mod commands;
mod output;
mod setup;

#[derive(Parser)]
#[command(
    name = "kiln",
    about = "kiln — k3s clusters on an agent-driven compute API",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Config file (default: $KILN_CONFIG or ~/.kiln/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging for kiln components
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List managed clusters
    List {
        #[arg(long)]
        namespace: Option<String>,
    },
    /// Create a new cluster
    Create {
        name: String,
        /// The number of control plane nodes
        #[arg(long, default_value_t = 1)]
        control_plane_count: usize,
        /// The number of workers
        #[arg(long, default_value_t = 2)]
        worker_count: usize,
        /// Floating addresses routed into the node network for metallb
        #[arg(long, default_value_t = 5)]
        metal_address_count: usize,
        /// Create the cluster in this namespace, creating it if needed
        #[arg(long)]
        namespace: Option<String>,
        /// Place nodes on a pre-existing network instead of creating one
        #[arg(long)]
        network: Option<String>,
        /// Force a refresh of the release version cache
        #[arg(long)]
        refresh_version_cache: bool,
        /// Release channel: stable, latest, or a version such as "v1.29"
        #[arg(long, default_value = "stable")]
        release_channel: String,
        /// SSH public key file to place onto every node
        #[arg(long)]
        sshkey: Option<PathBuf>,
        /// Install longhorn storage; optionally pin a version
        #[arg(long, num_args = 0..=1, default_missing_value = "latest", value_name = "VERSION")]
        storage: Option<String>,
    },
    /// Destroy a cluster
    Delete {
        name: String,
        #[arg(long)]
        namespace: Option<String>,
    },
    /// Show details of a cluster
    Show {
        name: String,
        #[arg(long)]
        namespace: Option<String>,
    },
    /// Print the kubeconfig of a cluster
    Getconfig {
        name: String,
        #[arg(long)]
        namespace: Option<String>,
    },
    /// Add workers to a cluster
    ExpandWorkers {
        name: String,
        #[arg(long, default_value_t = 2)]
        worker_count: usize,
        #[arg(long)]
        namespace: Option<String>,
    },
    /// Route more load balancer addresses into a cluster
    ExpandAddresses {
        name: String,
        #[arg(long, default_value_t = 2)]
        address_count: usize,
        #[arg(long)]
        namespace: Option<String>,
    },
    /// Update the OS on all nodes
    UpdateOs {
        name: String,
        #[arg(long)]
        namespace: Option<String>,
    },
    /// Look up the current version for a release channel
    QueryVersion {
        release_channel: String,
        #[arg(long)]
        namespace: Option<String>,
        /// Force a refresh of the release version cache
        #[arg(long)]
        refresh_version_cache: bool,
    },
}

fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose { "info,kiln=debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprint!("{}", output::report(&err));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = kiln_core::KilnConfig::load(cli.config.as_deref())?;
    let ctx = setup::connect(&config)?;
    let ns = |namespace: Option<String>| namespace.unwrap_or_else(|| config.api.namespace.clone());

    match cli.command {
        Commands::List { namespace } => commands::query::list(&ctx, &ns(namespace)).await,
        Commands::Create {
            name,
            control_plane_count,
            worker_count,
            metal_address_count,
            namespace,
            network,
            refresh_version_cache,
            release_channel,
            sshkey,
            storage,
        } => {
            let mut req = kiln_provision::CreateRequest::new(name, ns(namespace.clone()));
            req.ensure_namespace = namespace.is_some();
            req.control_plane_count = control_plane_count;
            req.worker_count = worker_count;
            req.address_count = metal_address_count;
            req.network = network;
            req.refresh_version_cache = refresh_version_cache;
            req.release_channel = release_channel;
            req.storage_channel = storage;
            if let Some(path) = sshkey {
                req.ssh_key = Some(kiln_provision::read_ssh_key(&path)?);
            }
            commands::cluster::create(&ctx, &req).await
        }
        Commands::Delete { name, namespace } => {
            commands::cluster::delete(&ctx, &ns(namespace), &name).await
        }
        Commands::Show { name, namespace } => {
            commands::query::show(&ctx, &ns(namespace), &name).await
        }
        Commands::Getconfig { name, namespace } => {
            commands::query::getconfig(&ctx, &ns(namespace), &name).await
        }
        Commands::ExpandWorkers {
            name,
            worker_count,
            namespace,
        } => commands::cluster::expand_workers(&ctx, &ns(namespace), &name, worker_count).await,
        Commands::ExpandAddresses {
            name,
            address_count,
            namespace,
        } => {
            commands::cluster::expand_addresses(&ctx, &ns(namespace), &name, address_count).await
        }
        Commands::UpdateOs { name, namespace } => {
            commands::cluster::update_os(&ctx, &ns(namespace), &name).await
        }
        Commands::QueryVersion {
            release_channel,
            namespace,
            refresh_version_cache,
        } => {
            commands::query::query_version(
                &ctx,
                &ns(namespace),
                &release_channel,
                refresh_version_cache,
            )
            .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_defaults_match_documented_values() {
        let cli = Cli::try_parse_from(["kiln", "create", "alpha"]).unwrap();
        match cli.command {
            Commands::Create {
                name,
                control_plane_count,
                worker_count,
                metal_address_count,
                release_channel,
                storage,
                namespace,
                ..
            } => {
                assert_eq!(name, "alpha");
                assert_eq!(control_plane_count, 1);
                assert_eq!(worker_count, 2);
                assert_eq!(metal_address_count, 5);
                assert_eq!(release_channel, "stable");
                assert!(storage.is_none());
                assert!(namespace.is_none());
            }
            _ => panic!("expected create"),
        }
    }

    #[test]
    fn storage_flag_without_value_means_latest() {
        let cli = Cli::try_parse_from(["kiln", "create", "alpha", "--storage"]).unwrap();
        let Commands::Create { storage, .. } = cli.command else {
            panic!("expected create");
        };
        assert_eq!(storage.as_deref(), Some("latest"));

        let cli =
            Cli::try_parse_from(["kiln", "create", "alpha", "--storage", "1.6.2"]).unwrap();
        let Commands::Create { storage, .. } = cli.command else {
            panic!("expected create");
        };
        assert_eq!(storage.as_deref(), Some("1.6.2"));
    }

    #[test]
    fn subcommands_use_kebab_case() {
        for args in [
            vec!["kiln", "expand-workers", "alpha", "--worker-count", "3"],
            vec!["kiln", "expand-addresses", "alpha"],
            vec!["kiln", "update-os", "alpha"],
            vec!["kiln", "query-version", "stable", "--refresh-version-cache"],
            vec!["kiln", "getconfig", "alpha", "--namespace", "team1"],
            vec!["kiln", "-v", "--log-json", "list"],
        ] {
            Cli::try_parse_from(&args).unwrap_or_else(|e| panic!("{args:?}: {e}"));
        }
    }
}
