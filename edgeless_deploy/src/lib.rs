// SPDX-FileCopyrightText: © 2024 Technical University of Munich, Chair of Connected Mobility
// SPDX-License-Identifier: MIT

pub mod authz;
pub mod builder;
pub mod compute;
pub mod cron;
pub mod deployer;
pub mod error;
pub mod identity;
pub mod listing;
pub mod orchestrator;
pub mod specification;
pub mod store;
pub mod teardown;

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct EdgelessDeploySettings {
    /// Base URL prepended to the location of the deployed functions.
    pub function_endpoint: String,
    /// Maximum number of items returned in a single listing page.
    pub list_max_results: usize,
    pub store: StoreSettings,
    pub retry: RetrySettings,
    pub build: BuildSettings,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub enum StoreKind {
    /// Artifacts are lost when the process terminates.
    Memory,
    /// Artifacts are kept in a Redis server, which must be reachable.
    Redis,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct StoreSettings {
    pub kind: StoreKind,
    /// Only used with the Redis store.
    pub redis_url: String,
    /// Prepended to all the Redis keys.
    #[serde(default)]
    pub namespace: String,
}

/// Capped exponential backoff applied to transient artifact store failures.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 300,
            max_delay_ms: 5000,
        }
    }
}

impl RetrySettings {
    /// Delay before retrying after the given failed attempt, starting from 1.
    pub fn delay(&self, attempt: u32) -> std::time::Duration {
        let exp = std::cmp::min(attempt.saturating_sub(1), 20);
        let delay = self.base_delay_ms.saturating_mul(1_u64 << exp);
        std::time::Duration::from_millis(std::cmp::min(delay, self.max_delay_ms))
    }
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct BuildSettings {
    /// Interval between two reads of a build record while waiting.
    pub poll_interval_ms: u64,
    /// Lifetime of the build status and build request artifacts.
    pub artifact_ttl_secs: u64,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 200,
            artifact_ttl_secs: 86400,
        }
    }
}

impl BuildSettings {
    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(std::cmp::max(1, self.poll_interval_ms))
    }

    pub fn artifact_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.artifact_ttl_secs)
    }
}

/// The components of a running pipeline.
pub struct EdgelessDeploy {
    pub orchestrator: orchestrator::Orchestrator,
    pub listing: listing::ListingService,
}

/// Create the artifact store selected in the settings.
pub async fn artifact_store(settings: &StoreSettings) -> anyhow::Result<std::sync::Arc<dyn store::ArtifactStore>> {
    match settings.kind {
        StoreKind::Memory => {
            log::info!("using an in-memory artifact store");
            Ok(std::sync::Arc::new(store::memory::MemoryStore::new()))
        }
        StoreKind::Redis => Ok(std::sync::Arc::new(
            store::redis_store::RedisStore::new(&settings.redis_url, &settings.namespace).await?,
        )),
    }
}

/// Wire together the pipeline on top of the given artifact store, using the
/// local compute backend and the local build queue.
///
/// The returned task runs the builds and must be polled, e.g., spawned.
pub fn edgeless_deploy_init(
    settings: &EdgelessDeploySettings,
    artifact_store: std::sync::Arc<dyn store::ArtifactStore>,
    authorizer: std::sync::Arc<dyn authz::Authorizer>,
) -> (EdgelessDeploy, std::pin::Pin<Box<dyn futures::Future<Output = ()> + Send>>) {
    log::debug!("Settings: {:?}", settings);

    let store = store::StoreHandle::new(artifact_store, settings.retry.clone());
    let compute = std::sync::Arc::new(compute::LocalComputeBackend::new(store.clone()));
    let deployer = deployer::Deployer::new(store.clone(), compute, &settings.function_endpoint);
    let records = builder::BuildRecords::new(store.clone(), settings.build.artifact_ttl());
    let (queue, build_task) = builder::LocalBuildQueue::new(deployer.clone(), records.clone());

    let orchestrator = orchestrator::Orchestrator::new(deployer, records, std::sync::Arc::new(queue), authorizer, settings.build.clone());
    let listing = listing::ListingService::new(store, settings.list_max_results);

    (EdgelessDeploy { orchestrator, listing }, build_task)
}

pub fn edgeless_deploy_default_conf() -> String {
    String::from(
        r##"function_endpoint = "http://127.0.0.1:7035"
list_max_results = 100

[store]
kind = "Memory"
redis_url = "redis://127.0.0.1:6379"
namespace = "edgeless-deploy:"

[retry]
max_attempts = 5
base_delay_ms = 300
max_delay_ms = 5000

[build]
poll_interval_ms = 200
artifact_ttl_secs = 86400
"##,
    )
}

/// Write `content` into a new file, never overwriting an existing one.
pub fn create_template(path: &str, content: &str) -> anyhow::Result<()> {
    anyhow::ensure!(!path.is_empty(), "empty configuration file name");
    match std::path::Path::new(&path).exists() {
        true => anyhow::bail!("cannot overwrite configuration file: {}", path),
        false => {
            std::fs::write(path, content)?;
            Ok(())
        }
    }
}
