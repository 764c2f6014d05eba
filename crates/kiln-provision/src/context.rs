//! WorkflowContext — every collaborator a workflow step needs, built once
//! per invocation and passed by reference.

use std::sync::Arc;
use std::time::Duration;

use kiln_core::{Clock, InstanceTemplate, KilnConfig};
use kiln_release::{ReleaseFeed, ReleaseResolver};
use kiln_remote::{ComputeApi, FleetManager, NetworkApi, OperationTracker, PollPolicy};
use kiln_state::{ClusterRecord, ClusterStore, MetadataStore};

use crate::error::{ProvisionError, ProvisionResult};
use crate::kubeconfig::KubeconfigFile;

pub struct WorkflowContext {
    pub compute: Arc<dyn ComputeApi>,
    pub network: Arc<dyn NetworkApi>,
    pub store: ClusterStore,
    pub tracker: OperationTracker,
    pub fleet: FleetManager,
    pub releases: ReleaseResolver,
    /// Local kubeconfig to merge into; `None` leaves it untouched.
    pub kubeconfig: Option<KubeconfigFile>,
    /// Pause between installing the load balancer and configuring it.
    pub settle: Duration,
    template: InstanceTemplate,
}

impl WorkflowContext {
    /// Wire the context from one API handle serving both control planes.
    pub fn new<A>(
        api: Arc<A>,
        metadata: Arc<dyn MetadataStore>,
        feed: Arc<dyn ReleaseFeed>,
        clock: Arc<dyn Clock>,
        config: &KilnConfig,
    ) -> Self
    where
        A: ComputeApi + NetworkApi + 'static,
    {
        let compute: Arc<dyn ComputeApi> = api.clone();
        let network: Arc<dyn NetworkApi> = api;
        let store = ClusterStore::new(metadata);
        let releases = ReleaseResolver::new(
            store.clone(),
            feed,
            clock,
            config.releases.cache_ttl_secs,
        );
        let policy = PollPolicy::from(&config.polling);
        let tracker = OperationTracker::new(compute.clone(), policy);
        let fleet = FleetManager::new(
            compute.clone(),
            tracker.clone(),
            store.clone(),
            config.template.clone(),
        );

        Self {
            compute,
            network,
            store,
            tracker,
            fleet,
            releases,
            kubeconfig: KubeconfigFile::locate(config.kubeconfig.path.as_deref()),
            settle: Duration::from_secs(config.polling.settle_secs),
            template: config.template.clone(),
        }
    }

    /// Replace the poll policy of every waiting component.
    pub fn with_policy(mut self, policy: PollPolicy) -> Self {
        self.tracker = OperationTracker::new(self.compute.clone(), policy);
        self.fleet = FleetManager::new(
            self.compute.clone(),
            self.tracker.clone(),
            self.store.clone(),
            self.template.clone(),
        );
        self
    }

    pub fn with_kubeconfig(mut self, kubeconfig: Option<KubeconfigFile>) -> Self {
        self.kubeconfig = kubeconfig;
        self
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Load a record, failing when it does not exist.
    pub async fn load_cluster(&self, namespace: &str, name: &str) -> ProvisionResult<ClusterRecord> {
        self.store
            .get(namespace, name)
            .await?
            .ok_or_else(|| ProvisionError::ClusterNotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }
}
