// SPDX-FileCopyrightText: © 2024 Technical University of Munich, Chair of Connected Mobility
// SPDX-License-Identifier: MIT

use sha2::Digest;

use crate::specification::{DeployConfig, FunctionPackage};

/// Resource as known by the compute backend.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DeployedResource {
    pub name: String,
    pub version: u64,
    /// Hex-encoded SHA-256 of the package deployed.
    pub package_digest: String,
    pub config: DeployConfig,
    pub deployed_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct InvokeRequest {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct InvokeResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

/// Backend that executes the deployed functions.
#[async_trait::async_trait]
pub trait ComputeBackend: Send + Sync {
    /// Deploy a new version of the resource with the given name, creating it
    /// if needed. Return the version deployed, which increases by one at
    /// every deploy.
    async fn deploy(&self, name: &str, package: &FunctionPackage, config: &DeployConfig) -> anyhow::Result<u64>;

    async fn invoke(&self, name: &str, request: InvokeRequest) -> anyhow::Result<InvokeResponse>;

    /// Remove the resource. Return false if it did not exist.
    async fn delete(&self, name: &str) -> anyhow::Result<bool>;

    async fn describe(&self, name: &str) -> anyhow::Result<Option<DeployedResource>>;
}

/// Reference compute backend that records the deployed resources in the
/// artifact store, under `deployment/{name}.json`, and answers invocations
/// by echoing the request together with the function configuration.
pub struct LocalComputeBackend {
    store: crate::store::StoreHandle,
}

impl LocalComputeBackend {
    pub fn new(store: crate::store::StoreHandle) -> Self {
        Self { store }
    }

    fn key(name: &str) -> String {
        format!("deployment/{}.json", name)
    }
}

#[async_trait::async_trait]
impl ComputeBackend for LocalComputeBackend {
    async fn deploy(&self, name: &str, package: &FunctionPackage, config: &DeployConfig) -> anyhow::Result<u64> {
        let current = self.describe(name).await?;
        let version = current.map_or(1, |x| x.version + 1);

        let mut hasher = sha2::Sha256::new();
        hasher.update(package.to_bytes()?);
        let resource = DeployedResource {
            name: name.to_string(),
            version,
            package_digest: hex::encode(hasher.finalize()),
            config: config.clone(),
            deployed_at: chrono::Utc::now(),
        };
        self.store
            .put_json(&Self::key(name), &resource, crate::store::PutOptions::default())
            .await?;
        log::info!("deployed {} version {}", name, version);
        Ok(version)
    }

    async fn invoke(&self, name: &str, request: InvokeRequest) -> anyhow::Result<InvokeResponse> {
        let resource = match self.describe(name).await? {
            Some(resource) => resource,
            None => anyhow::bail!("resource {} not deployed", name),
        };
        log::debug!("invoke {} version {}: {} {}", name, resource.version, request.method, request.path);
        Ok(InvokeResponse {
            status: 200,
            body: serde_json::json!({
                "name": name,
                "version": resource.version,
                "method": request.method,
                "path": request.path,
                "body": request.body,
                "configuration": resource.config.configuration,
            }),
        })
    }

    async fn delete(&self, name: &str) -> anyhow::Result<bool> {
        let key = Self::key(name);
        if self.store.get(&key).await?.is_none() {
            return Ok(false);
        }
        self.store.delete(&key).await?;
        log::info!("deleted {}", name);
        Ok(true)
    }

    async fn describe(&self, name: &str) -> anyhow::Result<Option<DeployedResource>> {
        Ok(self.store.get_json::<DeployedResource>(&Self::key(name)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> LocalComputeBackend {
        LocalComputeBackend::new(crate::store::StoreHandle::new(
            std::sync::Arc::new(crate::store::memory::MemoryStore::new()),
            crate::RetrySettings::default(),
        ))
    }

    fn package(code: &str) -> FunctionPackage {
        FunctionPackage {
            files: std::collections::BTreeMap::from([(
                "index.js".to_string(),
                crate::specification::FileContent::Text(code.to_string()),
            )]),
            dependencies: std::collections::BTreeMap::new(),
        }
    }

    fn config() -> DeployConfig {
        DeployConfig {
            runtime: "nodejs".to_string(),
            provider: "lambda".to_string(),
            configuration: std::collections::BTreeMap::from([("KEY".to_string(), "value".to_string())]),
            compute: crate::specification::ComputeLimits::default(),
        }
    }

    #[tokio::test]
    async fn versions_increase() {
        let backend = backend();
        assert_eq!(1, backend.deploy("fn-1", &package("a"), &config()).await.unwrap());
        assert_eq!(2, backend.deploy("fn-1", &package("b"), &config()).await.unwrap());
        assert_eq!(1, backend.deploy("fn-2", &package("a"), &config()).await.unwrap());
        assert_eq!(2, backend.describe("fn-1").await.unwrap().unwrap().version);
    }

    #[tokio::test]
    async fn invoke_and_delete() {
        let backend = backend();
        let request = InvokeRequest {
            method: "POST".to_string(),
            path: "/".to_string(),
            body: Some(serde_json::json!({"hello": "world"})),
        };
        assert!(backend.invoke("fn-1", request.clone()).await.is_err());

        backend.deploy("fn-1", &package("a"), &config()).await.unwrap();
        let response = backend.invoke("fn-1", request).await.unwrap();
        assert_eq!(200, response.status);
        assert_eq!(serde_json::json!({"hello": "world"}), response.body["body"]);
        assert_eq!("value", response.body["configuration"]["KEY"]);

        assert!(backend.delete("fn-1").await.unwrap());
        assert!(!backend.delete("fn-1").await.unwrap());
        assert!(backend.describe("fn-1").await.unwrap().is_none());
    }
}
