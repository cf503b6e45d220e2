// SPDX-FileCopyrightText: © 2024 Technical University of Munich, Chair of Connected Mobility
// SPDX-License-Identifier: MIT

use futures::{Future, StreamExt};

use crate::error::{PipelineError, PipelineResult};
use crate::identity::{FunctionIdentity, Namespace};
use crate::specification::Specification;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Pending,
    Success,
    Failed,
}

/// Status of an asynchronous build.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BuildRecord {
    pub build_id: String,
    pub identity: FunctionIdentity,
    pub status: BuildStatus,
    /// From 0 to 1.
    pub progress: f32,
    pub version: Option<u64>,
    pub location: Option<String>,
    /// Error reported by the builder, only when failed.
    pub error: Option<serde_json::Value>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl BuildRecord {
    pub fn pending(build_id: &str, identity: &FunctionIdentity) -> Self {
        Self {
            build_id: build_id.to_string(),
            identity: identity.clone(),
            status: BuildStatus::Pending,
            progress: 0.0,
            version: None,
            location: None,
            error: None,
            updated_at: chrono::Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != BuildStatus::Pending
    }

    fn progress(mut self, progress: f32) -> Self {
        self.progress = progress;
        self.updated_at = chrono::Utc::now();
        self
    }

    fn succeeded(mut self, deployment: crate::deployer::Deployment) -> Self {
        self.status = BuildStatus::Success;
        self.progress = 1.0;
        self.version = Some(deployment.version);
        self.location = Some(deployment.location);
        self.updated_at = chrono::Utc::now();
        self
    }

    fn failed(mut self, error: serde_json::Value) -> Self {
        self.status = BuildStatus::Failed;
        self.error = Some(error);
        self.updated_at = chrono::Utc::now();
        self
    }
}

/// Everything a builder needs to carry out a build.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BuildRequest {
    pub build_id: String,
    pub identity: FunctionIdentity,
    pub specification: Specification,
    /// Digest recorded when the build was requested, if the function existed.
    pub observed_digest: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Read and write access to the build status and build request artifacts,
/// which expire automatically.
#[derive(Clone)]
pub struct BuildRecords {
    store: crate::store::StoreHandle,
    ttl: std::time::Duration,
}

impl BuildRecords {
    pub fn new(store: crate::store::StoreHandle, ttl: std::time::Duration) -> Self {
        Self { store, ttl }
    }

    pub async fn get(&self, identity: &FunctionIdentity, build_id: &str) -> PipelineResult<Option<BuildRecord>> {
        self.store.get_json(&identity.storage_key(Namespace::BuildStatus, Some(build_id))?).await
    }

    /// Write a build record. A completed build is never overwritten.
    pub async fn put(&self, record: &BuildRecord) -> PipelineResult<()> {
        let key = record.identity.storage_key(Namespace::BuildStatus, Some(&record.build_id))?;
        if let Some(current) = self.store.get_json::<BuildRecord>(&key).await? {
            if current.is_terminal() {
                return Err(PipelineError::Internal(format!(
                    "build {} of {} already completed",
                    record.build_id, record.identity
                )));
            }
        }
        self.store.put_json(&key, record, crate::store::PutOptions::with_ttl(self.ttl)).await?;
        log::debug!("build {} of {}: {:?} {:.1}", record.build_id, record.identity, record.status, record.progress);
        Ok(())
    }

    pub async fn get_request(&self, identity: &FunctionIdentity, build_id: &str) -> PipelineResult<Option<BuildRequest>> {
        self.store.get_json(&identity.storage_key(Namespace::BuildRequest, Some(build_id))?).await
    }

    pub async fn put_request(&self, request: &BuildRequest) -> PipelineResult<()> {
        let key = request.identity.storage_key(Namespace::BuildRequest, Some(&request.build_id))?;
        self.store.put_json(&key, request, crate::store::PutOptions::with_ttl(self.ttl)).await
    }
}

/// Queue of the builds to be carried out.
///
/// The build request artifact is written before the request is enqueued.
#[async_trait::async_trait]
pub trait BuildQueue: Send + Sync {
    async fn enqueue(&self, request: &BuildRequest) -> anyhow::Result<()>;
}

struct BuildTicket {
    identity: FunctionIdentity,
    build_id: String,
}

/// Build queue served by a task in the same process.
///
/// The task receives only the identifiers of the builds: the parameters are
/// read from the build request artifact, like a remote builder would do.
pub struct LocalBuildQueue {
    sender: futures::channel::mpsc::UnboundedSender<BuildTicket>,
}

impl LocalBuildQueue {
    pub fn new(deployer: crate::deployer::Deployer, records: BuildRecords) -> (Self, std::pin::Pin<Box<dyn Future<Output = ()> + Send>>) {
        let (sender, receiver) = futures::channel::mpsc::unbounded();
        let main_task = Box::pin(async move {
            Self::main_task(receiver, deployer, records).await;
        });

        (Self { sender }, main_task)
    }

    async fn main_task(
        receiver: futures::channel::mpsc::UnboundedReceiver<BuildTicket>,
        deployer: crate::deployer::Deployer,
        records: BuildRecords,
    ) {
        let mut receiver = receiver;
        while let Some(ticket) = receiver.next().await {
            if let Err(err) = Self::build(&deployer, &records, &ticket).await {
                log::error!("build {} of {} left pending: {}", ticket.build_id, ticket.identity, err);
            }
        }
        log::info!("build queue closed");
    }

    // Carry out a build, recording its outcome. An error is returned only if
    // the outcome could not be recorded.
    async fn build(deployer: &crate::deployer::Deployer, records: &BuildRecords, ticket: &BuildTicket) -> PipelineResult<()> {
        let record = match records.get(&ticket.identity, &ticket.build_id).await? {
            Some(record) if record.is_terminal() => {
                log::warn!("build {} of {} already completed", ticket.build_id, ticket.identity);
                return Ok(());
            }
            Some(record) => record,
            None => BuildRecord::pending(&ticket.build_id, &ticket.identity),
        };

        let request = match records.get_request(&ticket.identity, &ticket.build_id).await? {
            Some(request) => request,
            None => {
                log::warn!("build {} of {} failed: request not found", ticket.build_id, ticket.identity);
                return records
                    .put(&record.failed(serde_json::json!({ "message": "build request not found" })))
                    .await;
            }
        };

        log::info!("build {} of {} started", request.build_id, request.identity);
        let dependencies = request.specification.dependencies().and_then(|deps| {
            resolve_dependencies(&deps).map_err(|message| PipelineError::Build(serde_json::json!({ "message": message })))
        });
        let dependencies = match dependencies {
            Ok(dependencies) => dependencies,
            Err(err) => {
                log::warn!("build {} of {} failed: {}", request.build_id, request.identity, err);
                return records.put(&record.failed(build_error(err))).await;
            }
        };
        if request.specification.compute.static_ip {
            log::info!("build {} of {}: static IP address requested", request.build_id, request.identity);
        }
        let record = record.progress(0.5);
        records.put(&record).await?;

        match deployer
            .deploy(&request.identity, &request.specification, request.observed_digest.as_deref(), dependencies)
            .await
        {
            Ok(deployment) => {
                log::info!("build {} of {} completed, version {}", request.build_id, request.identity, deployment.version);
                records.put(&record.succeeded(deployment)).await
            }
            Err(err) => {
                log::warn!("build {} of {} failed: {}", request.build_id, request.identity, err);
                records.put(&record.failed(build_error(err))).await
            }
        }
    }
}

#[async_trait::async_trait]
impl BuildQueue for LocalBuildQueue {
    async fn enqueue(&self, request: &BuildRequest) -> anyhow::Result<()> {
        self.sender
            .unbounded_send(BuildTicket {
                identity: request.identity.clone(),
                build_id: request.build_id.clone(),
            })
            .map_err(|_| anyhow::anyhow!("build queue closed"))
    }
}

fn build_error(err: PipelineError) -> serde_json::Value {
    match err {
        PipelineError::Build(payload) => payload,
        err => serde_json::json!({ "message": err.to_string() }),
    }
}

/// Pin every dependency to the version that satisfies its requirement.
///
/// Requirements can be `*`, `latest`, or a version optionally preceded by one
/// of `^`, `~`, `=`, `>=`, `>`, with missing or `x` components meaning zero,
/// e.g., `^1.2.3`, `~1.2`, `=0.0.1`, `1.x`.
pub fn resolve_dependencies(
    dependencies: &std::collections::BTreeMap<String, String>,
) -> Result<std::collections::BTreeMap<String, String>, String> {
    let name_re = regex::Regex::new(r"^(@[a-z0-9\-~][a-z0-9\-._~]*/)?[a-z0-9\-~][a-z0-9\-._~]*$").map_err(|err| err.to_string())?;
    let version_re = regex::Regex::new(r"^(\^|~|=|>=|>)?v?(\d+)(?:\.(\d+|x|\*))?(?:\.(\d+|x|\*))?$").map_err(|err| err.to_string())?;

    let mut ret = std::collections::BTreeMap::new();
    for (name, requirement) in dependencies {
        let unresolved = || format!("unable to resolve dependency {}@{}", name, requirement);
        if !name_re.is_match(name) {
            return Err(unresolved());
        }
        let requirement = requirement.trim();
        let version = match requirement {
            "*" | "latest" | "" => String::from("latest"),
            _ => {
                let captures = version_re.captures(requirement).ok_or_else(unresolved)?;
                let component = |i: usize| match captures.get(i).map(|x| x.as_str()) {
                    Some(num) if num.chars().all(|c| c.is_ascii_digit()) => num.to_string(),
                    _ => String::from("0"),
                };
                format!("{}.{}.{}", component(2), component(3), component(4))
            }
        };
        ret.insert(name.clone(), version);
    }
    Ok(ret)
}
