// SPDX-FileCopyrightText: © 2024 Technical University of Munich, Chair of Connected Mobility
// SPDX-License-Identifier: MIT

use crate::error::{PipelineError, PipelineResult};
use crate::identity::FunctionIdentity;
use crate::specification::Specification;

/// Current state of a deployed function, stored under its `spec` key.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SpecRecord {
    pub digest: String,
    pub version: u64,
    pub resource_name: String,
    pub location: String,
    pub specification: Specification,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub version: u64,
    pub location: String,
}

/// Deploys a specification and records the outcome.
///
/// Used both for the synchronous deployments and by the build workers.
#[derive(Clone)]
pub struct Deployer {
    store: crate::store::StoreHandle,
    compute: std::sync::Arc<dyn crate::compute::ComputeBackend>,
    cron: crate::cron::CronRegistry,
    function_endpoint: String,
}

impl Deployer {
    pub fn new(store: crate::store::StoreHandle, compute: std::sync::Arc<dyn crate::compute::ComputeBackend>, function_endpoint: &str) -> Self {
        Self {
            cron: crate::cron::CronRegistry::new(store.clone()),
            store,
            compute,
            function_endpoint: function_endpoint.to_string(),
        }
    }

    pub fn store(&self) -> &crate::store::StoreHandle {
        &self.store
    }

    pub fn compute(&self) -> std::sync::Arc<dyn crate::compute::ComputeBackend> {
        self.compute.clone()
    }

    pub fn cron(&self) -> &crate::cron::CronRegistry {
        &self.cron
    }

    pub fn location(&self, identity: &FunctionIdentity) -> String {
        identity.location(&self.function_endpoint)
    }

    pub async fn current(&self, identity: &FunctionIdentity) -> PipelineResult<Option<SpecRecord>> {
        self.store.get_json::<SpecRecord>(&identity.spec_key()).await
    }

    /// Make the cron registrations of a function match the given schedule.
    ///
    /// Called only once the specification record holds that schedule, and
    /// again on every unchanged update so that a failed call is repaired.
    pub async fn sync_schedule(&self, identity: &FunctionIdentity, schedule: Option<&crate::specification::Schedule>) -> PipelineResult<()> {
        match schedule {
            Some(schedule) => self.cron.upsert(identity, schedule).await,
            None => {
                self.cron.remove(identity).await?;
                Ok(())
            }
        }
    }

    /// Deploy a specification whose dependencies have been resolved already.
    ///
    /// `observed_digest` is the digest recorded when the decision to deploy
    /// was taken, if any. The specification record is written only if the
    /// recorded digest did not change in the meantime, and the cron
    /// registrations follow it.
    pub async fn deploy(
        &self,
        identity: &FunctionIdentity,
        specification: &Specification,
        observed_digest: Option<&str>,
        resolved_dependencies: std::collections::BTreeMap<String, String>,
    ) -> PipelineResult<Deployment> {
        let digest = specification.digest()?;
        let package = specification.package(resolved_dependencies);
        self.store
            .put(&identity.build_package_key(), package.to_bytes()?, crate::store::PutOptions::default())
            .await?;

        let resource_name = identity.resource_name();
        let version = self
            .compute
            .deploy(&resource_name, &package, &specification.deploy_config())
            .await
            .map_err(|err| PipelineError::Build(serde_json::json!({ "message": format!("deploy failed: {}", err) })))?;

        let recorded_digest = self.current(identity).await?.map(|x| x.digest);
        if recorded_digest.as_deref() != observed_digest {
            log::warn!("{} modified concurrently while deploying version {}", identity, version);
            return Err(PipelineError::Conflict(format!("{} modified concurrently", identity)));
        }

        let now = chrono::Utc::now();
        let mut specification = specification.clone();
        specification.updated_at = Some(now);
        let record = SpecRecord {
            digest,
            version,
            resource_name,
            location: self.location(identity),
            specification,
            updated_at: now,
        };
        self.store
            .put_json(&identity.spec_key(), &record, crate::store::PutOptions::default())
            .await?;

        log::info!("{} deployed at version {} (digest {})", identity, record.version, record.digest);

        self.sync_schedule(identity, record.specification.schedule.as_ref()).await?;
        Ok(Deployment {
            version: record.version,
            location: record.location,
        })
    }
}
