//! Backend selection at construction time

use std::sync::Arc;

use arcv_core::config::{ArchiveConfig, BackendKind};

use crate::api::ArchiveApi;
use crate::local::LocalArchiveApi;
use crate::network::NetworkArchiveApi;

/// Build the backend named by `[client] backend`.
pub fn build_api(config: &ArchiveConfig) -> anyhow::Result<Arc<dyn ArchiveApi>> {
    let api: Arc<dyn ArchiveApi> = match config.client.backend {
        BackendKind::Network => Arc::new(NetworkArchiveApi::from_config(config)?),
        BackendKind::Local => Arc::new(LocalArchiveApi::from_config(config)?),
    };
    tracing::info!(backend = api.name(), "archive backend selected");
    Ok(api)
}
