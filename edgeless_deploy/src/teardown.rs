// SPDX-FileCopyrightText: © 2024 Technical University of Munich, Chair of Connected Mobility
// SPDX-License-Identifier: MIT

use crate::error::{PipelineError, PipelineResult};
use crate::identity::FunctionIdentity;

/// Removes a function in four steps: cron registrations, package,
/// specification, deployed resource.
///
/// Artifacts already absent are skipped, any other failure stops the
/// teardown. Since every step can be repeated a failed teardown can be
/// retried from scratch.
#[derive(Clone)]
pub struct TeardownService {
    store: crate::store::StoreHandle,
    cron: crate::cron::CronRegistry,
    compute: std::sync::Arc<dyn crate::compute::ComputeBackend>,
}

impl TeardownService {
    pub fn new(
        store: crate::store::StoreHandle,
        cron: crate::cron::CronRegistry,
        compute: std::sync::Arc<dyn crate::compute::ComputeBackend>,
    ) -> Self {
        Self { store, cron, compute }
    }

    /// Return `NotFound` if there was no deployed resource, after removing
    /// any other artifact left.
    pub async fn delete_function(&self, identity: &FunctionIdentity) -> PipelineResult<()> {
        let removed = self.cron.remove(identity).await?;
        log::debug!("teardown {}: {} cron registration(s) removed", identity, removed);

        self.store.delete(&identity.build_package_key()).await?;
        log::debug!("teardown {}: package removed", identity);

        self.store.delete(&identity.spec_key()).await?;
        log::debug!("teardown {}: specification removed", identity);

        let existed = self
            .compute
            .delete(&identity.resource_name())
            .await
            .map_err(|err| PipelineError::Internal(format!("delete {}: {}", identity, err)))?;
        if !existed {
            log::info!("teardown {}: no deployed resource", identity);
            return Err(PipelineError::NotFound(format!("function {}", identity)));
        }

        log::info!("teardown {} completed", identity);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::ComputeBackend;
    use crate::store::memory::{MemoryStore, StoreOperation};

    struct Fixture {
        memory: std::sync::Arc<MemoryStore>,
        store: crate::store::StoreHandle,
        compute: std::sync::Arc<crate::compute::LocalComputeBackend>,
        teardown: TeardownService,
        identity: FunctionIdentity,
    }

    fn fixture() -> Fixture {
        let memory = std::sync::Arc::new(MemoryStore::new());
        let store = crate::store::StoreHandle::new(
            memory.clone(),
            crate::RetrySettings {
                max_attempts: 2,
                base_delay_ms: 1,
                max_delay_ms: 1,
            },
        );
        let compute = std::sync::Arc::new(crate::compute::LocalComputeBackend::new(store.clone()));
        let teardown = TeardownService::new(store.clone(), crate::cron::CronRegistry::new(store.clone()), compute.clone());
        Fixture {
            memory,
            store,
            compute,
            teardown,
            identity: FunctionIdentity::new("tenant-1", "b", "f").unwrap(),
        }
    }

    async fn deploy(fixture: &Fixture) {
        let deployer = crate::deployer::Deployer::new(fixture.store.clone(), fixture.compute.clone(), "http://127.0.0.1:7035");
        let specification = crate::specification::Specification::from_json(
            r#"{"files": {"index.js": "x"}, "schedule": {"cron": "*/5 * * * *"}}"#,
        )
        .unwrap();
        deployer
            .deploy(&fixture.identity, &specification, None, std::collections::BTreeMap::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn removes_everything() {
        let fixture = fixture();
        deploy(&fixture).await;
        assert_eq!(4, fixture.memory.keys().await.len());

        fixture.teardown.delete_function(&fixture.identity).await.unwrap();
        assert!(fixture.memory.keys().await.is_empty());

        let err = fixture.teardown.delete_function(&fixture.identity).await.unwrap_err();
        assert_eq!(404, err.status_code());
    }

    #[tokio::test]
    async fn artifacts_already_absent() {
        let fixture = fixture();
        deploy(&fixture).await;
        fixture.store.delete(&fixture.identity.spec_key()).await.unwrap();
        fixture.store.delete(&fixture.identity.build_package_key()).await.unwrap();
        fixture.teardown.cron.remove(&fixture.identity).await.unwrap();

        fixture.teardown.delete_function(&fixture.identity).await.unwrap();
        assert!(fixture.compute.describe(&fixture.identity.resource_name()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failure_aborts_and_retry_completes() {
        let fixture = fixture();
        deploy(&fixture).await;
        fixture
            .memory
            .inject_fault(
                StoreOperation::Delete,
                Some("spec/"),
                1,
                crate::error::StoreError::Permanent("access denied".to_string()),
            )
            .await;

        assert!(fixture.teardown.delete_function(&fixture.identity).await.is_err());

        // The steps before the failure took place, the following did not.
        assert!(!fixture.memory.contains(&fixture.identity.build_package_key()).await);
        assert!(fixture.memory.contains(&fixture.identity.spec_key()).await);
        assert!(fixture.compute.describe(&fixture.identity.resource_name()).await.unwrap().is_some());

        fixture.teardown.delete_function(&fixture.identity).await.unwrap();
        assert!(fixture.memory.keys().await.is_empty());
    }
}
