//! Wiring of the production collaborators from configuration.

use std::sync::Arc;

use kiln_core::config::StateBackend;
use kiln_core::{KilnConfig, SystemClock};
use kiln_provision::WorkflowContext;
use kiln_release::HttpReleaseFeed;
use kiln_remote::RestClient;
use kiln_state::{MetadataStore, RedbMetadataStore};
use tracing::debug;

pub fn connect(config: &KilnConfig) -> anyhow::Result<WorkflowContext> {
    let api = Arc::new(RestClient::new(&config.api)?);

    let metadata: Arc<dyn MetadataStore> = match config.state.backend {
        StateBackend::Api => api.clone(),
        StateBackend::Local => {
            let path = config.state_path()?;
            debug!(path = %path.display(), "using local state store");
            Arc::new(RedbMetadataStore::open(&path)?)
        }
    };
    let feed = Arc::new(HttpReleaseFeed::new(config.releases.clone())?);

    Ok(WorkflowContext::new(
        api,
        metadata,
        feed,
        Arc::new(SystemClock),
        config,
    ))
}
