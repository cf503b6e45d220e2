// SPDX-FileCopyrightText: © 2024 Technical University of Munich, Chair of Connected Mobility
// SPDX-License-Identifier: MIT


use crate::authz::{Action, Actor, Permission};
use crate::builder::{BuildRecord, BuildStatus};
use crate::error::{PipelineError, PipelineResult};
use crate::identity::FunctionIdentity;
use crate::specification::Specification;

/// Outcome of a successful `create_or_update()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployOutcome {
    /// A new version has been deployed.
    Deployed { version: u64, location: String },
    /// The specification did not change, nothing has been deployed.
    Unchanged { version: u64, location: String },
    /// An asynchronous build has been started.
    Accepted { build_id: String, location: String },
}

impl DeployOutcome {
    pub fn code(&self) -> u16 {
        match self {
            Self::Deployed { .. } => 200,
            Self::Unchanged { .. } => 204,
            Self::Accepted { .. } => 201,
        }
    }
}

/// Non-terminal or successful state of a build, see `get_build()`.
#[derive(Debug, Clone, PartialEq)]
pub enum BuildState {
    Pending { progress: f32 },
    Completed(crate::deployer::Deployment),
}

impl BuildState {
    pub fn code(&self) -> u16 {
        match self {
            Self::Pending { .. } => 201,
            Self::Completed(_) => 200,
        }
    }
}

/// Decides when a function must be built and deployed, and tracks the
/// asynchronous builds.
#[derive(Clone)]
pub struct Orchestrator {
    deployer: crate::deployer::Deployer,
    records: crate::builder::BuildRecords,
    queue: std::sync::Arc<dyn crate::builder::BuildQueue>,
    authorizer: std::sync::Arc<dyn crate::authz::Authorizer>,
    teardown: crate::teardown::TeardownService,
    settings: crate::BuildSettings,
}

impl Orchestrator {
    pub fn new(
        deployer: crate::deployer::Deployer,
        records: crate::builder::BuildRecords,
        queue: std::sync::Arc<dyn crate::builder::BuildQueue>,
        authorizer: std::sync::Arc<dyn crate::authz::Authorizer>,
        settings: crate::BuildSettings,
    ) -> Self {
        let teardown = crate::teardown::TeardownService::new(deployer.store().clone(), deployer.cron().clone(), deployer.compute());
        Self {
            deployer,
            records,
            queue,
            authorizer,
            teardown,
            settings,
        }
    }

    async fn authorize(&self, actor: &Actor, action: Action, identity: &FunctionIdentity) -> PipelineResult<()> {
        match self.authorizer.check_permission(actor, action, identity).await {
            Permission::Allow => Ok(()),
            Permission::Deny => {
                log::info!("{} denied {:?} on {}", actor.subject, action, identity);
                Err(PipelineError::Authorization(format!("{:?} on {}", action, identity)))
            }
        }
    }

    /// Deploy the given specification, unless it is identical to the one
    /// currently deployed.
    ///
    /// If the specification requires a build step the deployment is carried
    /// out asynchronously: the result contains the identifier of the build,
    /// to be passed to `wait_for_function_build()`.
    pub async fn create_or_update(&self, identity: &FunctionIdentity, specification: &Specification, actor: &Actor) -> PipelineResult<DeployOutcome> {
        identity.validate()?;
        specification.validate()?;
        self.authorize(actor, Action::Deploy, identity).await?;

        let digest = specification.digest()?;
        let current = self.deployer.current(identity).await?;
        let observed_digest = current.as_ref().map(|x| x.digest.clone());
        if let Some(current) = current {
            if current.digest == digest {
                log::info!("{} unchanged at version {}", identity, current.version);
                self.deployer.sync_schedule(identity, current.specification.schedule.as_ref()).await?;
                return Ok(DeployOutcome::Unchanged {
                    version: current.version,
                    location: current.location,
                });
            }
        }

        if !specification.requires_build()? {
            let deployment = self
                .deployer
                .deploy(identity, specification, observed_digest.as_deref(), std::collections::BTreeMap::new())
                .await?;
            return Ok(DeployOutcome::Deployed {
                version: deployment.version,
                location: deployment.location,
            });
        }

        let build_id = uuid::Uuid::new_v4().to_string();
        let record = BuildRecord::pending(&build_id, identity);
        self.records.put(&record).await?;
        let request = crate::builder::BuildRequest {
            build_id: build_id.clone(),
            identity: identity.clone(),
            specification: specification.clone(),
            observed_digest,
            created_at: chrono::Utc::now(),
        };
        self.records.put_request(&request).await?;

        if let Err(err) = self.queue.enqueue(&request).await {
            log::error!("could not enqueue build {} of {}: {}", build_id, identity, err);
            let mut record = record;
            record.status = BuildStatus::Failed;
            record.error = Some(serde_json::json!({ "message": format!("could not enqueue the build: {}", err) }));
            if let Err(err) = self.records.put(&record).await {
                log::error!("could not mark build {} of {} as failed: {}", build_id, identity, err);
            }
            return Err(PipelineError::Internal(format!("could not enqueue the build of {}: {}", identity, err)));
        }

        log::info!("build {} of {} accepted", build_id, identity);
        Ok(DeployOutcome::Accepted {
            build_id,
            location: self.deployer.location(identity),
        })
    }

    /// Poll the status of a build until it completes or the timeout expires.
    ///
    /// The build is not cancelled upon timeout.
    pub async fn wait_for_function_build(
        &self,
        identity: &FunctionIdentity,
        build_id: &str,
        timeout: std::time::Duration,
        actor: &Actor,
    ) -> PipelineResult<crate::deployer::Deployment> {
        identity.validate()?;
        self.authorize(actor, Action::Read, identity).await?;

        let started = tokio::time::Instant::now();
        loop {
            if let BuildState::Completed(deployment) = self.build_state(identity, build_id).await? {
                return Ok(deployment);
            }
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                log::info!("timeout waiting for build {} of {} after {} ms", build_id, identity, elapsed.as_millis());
                return Err(PipelineError::Timeout(format!("build {} of {} still in progress", build_id, identity)));
            }
            tokio::time::sleep(std::cmp::min(self.settings.poll_interval(), timeout - elapsed)).await;
        }
    }

    /// Current state of a build, without waiting.
    pub async fn get_build(&self, identity: &FunctionIdentity, build_id: &str, actor: &Actor) -> PipelineResult<BuildState> {
        identity.validate()?;
        self.authorize(actor, Action::Read, identity).await?;
        self.build_state(identity, build_id).await
    }

    async fn build_state(&self, identity: &FunctionIdentity, build_id: &str) -> PipelineResult<BuildState> {
        let record = match self.records.get(identity, build_id).await? {
            Some(record) => record,
            None => return Err(PipelineError::NotFound(format!("build {} of {}", build_id, identity))),
        };
        match record.status {
            BuildStatus::Pending => Ok(BuildState::Pending { progress: record.progress }),
            BuildStatus::Success => match (record.version, record.location) {
                (Some(version), Some(location)) => Ok(BuildState::Completed(crate::deployer::Deployment { version, location })),
                _ => Err(PipelineError::Internal(format!("build {} of {} completed without version", build_id, identity))),
            },
            BuildStatus::Failed => Err(PipelineError::Build(
                record.error.unwrap_or_else(|| serde_json::json!({ "message": "unknown error" })),
            )),
        }
    }

    /// Remove a function and all its artifacts.
    pub async fn delete_function(&self, identity: &FunctionIdentity, actor: &Actor) -> PipelineResult<()> {
        identity.validate()?;
        self.authorize(actor, Action::Delete, identity).await?;
        self.teardown.delete_function(identity).await
    }

    pub async fn get_function(&self, identity: &FunctionIdentity, actor: &Actor) -> PipelineResult<crate::deployer::SpecRecord> {
        identity.validate()?;
        self.authorize(actor, Action::Read, identity).await?;
        match self.deployer.current(identity).await? {
            Some(record) => Ok(record),
            None => Err(PipelineError::NotFound(format!("function {}", identity))),
        }
    }

    pub async fn get_function_location(&self, identity: &FunctionIdentity, actor: &Actor) -> PipelineResult<String> {
        Ok(self.get_function(identity, actor).await?.location)
    }

    /// Invoke the deployed function.
    pub async fn execute_function(
        &self,
        identity: &FunctionIdentity,
        request: crate::compute::InvokeRequest,
        actor: &Actor,
    ) -> PipelineResult<crate::compute::InvokeResponse> {
        identity.validate()?;
        self.authorize(actor, Action::Execute, identity).await?;
        let record = match self.deployer.current(identity).await? {
            Some(record) => record,
            None => return Err(PipelineError::NotFound(format!("function {}", identity))),
        };
        self.deployer
            .compute()
            .invoke(&record.resource_name, request)
            .await
            .map_err(|err| PipelineError::Internal(format!("invoke {}: {}", identity, err)))
    }
}
