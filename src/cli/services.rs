use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

use crate::core::config::ForgeConfig;
use crate::core::forge::history::StoreHistoryReader;
use crate::core::forge::{ForgeRunner, ForgeScheduler};
use crate::core::llm::GenerationProvider;
use crate::core::llm::providers::OpenAiProvider;
use crate::core::store::ForgeStore;
use crate::core::vault::PayloadVault;

/// Everything a command needs, wired from one loaded config.
pub(crate) struct ForgeServices {
    pub config: ForgeConfig,
    pub store: ForgeStore,
    pub runner: ForgeRunner,
    pub scheduler: ForgeScheduler,
}

fn snapshot_vault(config: &ForgeConfig) -> PayloadVault {
    match config.snapshots.encryption_secret.as_deref() {
        Some(secret) if !secret.trim().is_empty() => PayloadVault::from_secret(secret),
        _ => {
            warn!("No snapshot encryption secret configured; using a machine-bound key.");
            PayloadVault::machine_bound()
        }
    }
}

fn generation_provider(config: &ForgeConfig) -> Result<Option<Arc<dyn GenerationProvider>>> {
    let Some(api_key) = config.generation.api_key.clone() else {
        info!("No generation API key set; every generation step uses its fallback.");
        return Ok(None);
    };
    let provider = OpenAiProvider::new(
        api_key,
        config.generation.base_url.clone(),
        config.request_timeout(),
    )?;
    Ok(Some(Arc::new(provider)))
}

pub(crate) async fn build_services(config: ForgeConfig) -> Result<ForgeServices> {
    let store = ForgeStore::open(&config.data_dir, snapshot_vault(&config))
        .await?
        .with_lock_ttl(config.lock_ttl());
    let history = Arc::new(StoreHistoryReader::new(store.clone()));
    let runner = ForgeRunner::new(
        store.clone(),
        history,
        generation_provider(&config)?,
        config.runner_settings(),
    );
    let scheduler = ForgeScheduler::new(runner.clone(), config.scheduler_settings()?);
    Ok(ForgeServices {
        config,
        store,
        runner,
        scheduler,
    })
}
