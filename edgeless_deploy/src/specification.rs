// SPDX-FileCopyrightText: © 2024 Technical University of Munich, Chair of Connected Mobility
// SPDX-License-Identifier: MIT

use sha2::Digest;

use crate::error::{PipelineError, PipelineResult};

pub const DEFAULT_RUNTIME: &str = "nodejs";
pub const DEFAULT_PROVIDER: &str = "lambda";
pub const DEFAULT_TIMEZONE: &str = "UTC";

const MEMORY_SIZE_RANGE: std::ops::RangeInclusive<u32> = 64..=3008;
const TIMEOUT_RANGE: std::ops::RangeInclusive<u32> = 1..=120;

/// Content of a source file: either plain text or a JSON document, the
/// latter being accepted for `package.json`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum FileContent {
    Text(String),
    Document(serde_json::Value),
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComputeLimits {
    /// Memory in MB.
    #[serde(default = "default_memory_size")]
    pub memory_size: u32,
    /// Maximum execution time in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u32,
    #[serde(default)]
    pub static_ip: bool,
}

impl Default for ComputeLimits {
    fn default() -> Self {
        Self {
            memory_size: default_memory_size(),
            timeout: default_timeout(),
            static_ip: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Schedule {
    pub cron: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Schedule {
    pub fn new(cron: &str, timezone: Option<&str>) -> Self {
        Self {
            cron: cron.to_string(),
            timezone: timezone.unwrap_or(DEFAULT_TIMEZONE).to_string(),
        }
    }

    pub fn validate(&self) -> PipelineResult<()> {
        let fields = self.cron.split_whitespace().count();
        if !(5..=6).contains(&fields) {
            return Err(PipelineError::Validation(format!(
                "cron expression '{}' must have 5 or 6 fields, found {}",
                self.cron, fields
            )));
        }
        if self.timezone.is_empty() || self.timezone.chars().any(|c| c.is_whitespace()) {
            return Err(PipelineError::Validation(format!("invalid timezone '{}'", self.timezone)));
        }
        Ok(())
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} ({})", self.cron, self.timezone)
    }
}

/// Full definition of a function.
///
/// Only the fields below are accepted, anything else is rejected when
/// deserializing. `updated_at` is volatile and does not contribute to the
/// content digest.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Specification {
    #[serde(default = "default_runtime")]
    pub runtime: String,
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub files: std::collections::BTreeMap<String, FileContent>,
    #[serde(default)]
    pub configuration: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub compute: ComputeLimits,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,
    #[serde(default)]
    pub metadata: std::collections::BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
}

// Fields of the specification that identify its content.
#[derive(serde::Serialize)]
struct DigestView<'a> {
    runtime: &'a str,
    provider: &'a str,
    files: std::collections::BTreeMap<&'a str, serde_json::Value>,
    configuration: &'a std::collections::BTreeMap<String, String>,
    compute: &'a ComputeLimits,
    schedule: &'a Option<Schedule>,
    metadata: &'a std::collections::BTreeMap<String, String>,
}

/// Parameters passed to the compute backend together with the package.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DeployConfig {
    pub runtime: String,
    pub provider: String,
    pub configuration: std::collections::BTreeMap<String, String>,
    pub compute: ComputeLimits,
}

/// Deployable unit: the source files plus the resolved dependencies.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FunctionPackage {
    pub files: std::collections::BTreeMap<String, FileContent>,
    pub dependencies: std::collections::BTreeMap<String, String>,
}

impl FunctionPackage {
    pub fn to_bytes(&self) -> PipelineResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> PipelineResult<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

impl Specification {
    pub fn from_json(data: &str) -> PipelineResult<Self> {
        serde_json::from_str(data).map_err(|err| PipelineError::Validation(format!("malformed specification: {}", err)))
    }

    pub fn validate(&self) -> PipelineResult<()> {
        for (name, value) in [("runtime", &self.runtime), ("provider", &self.provider)] {
            if value.is_empty() || !value.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()) {
                return Err(PipelineError::Validation(format!("invalid {} '{}'", name, value)));
            }
        }
        if self.files.is_empty() {
            return Err(PipelineError::Validation("the specification has no files".to_string()));
        }
        for path in self.files.keys() {
            if path.is_empty() || path.starts_with('/') || path.split('/').any(|x| x.is_empty() || x == "..") {
                return Err(PipelineError::Validation(format!("invalid file path '{}'", path)));
            }
        }
        if self.runtime == DEFAULT_RUNTIME && !self.files.contains_key("index.js") {
            return Err(PipelineError::Validation("nodejs functions require an index.js file".to_string()));
        }
        for key in self.configuration.keys() {
            if !crate::identity::matches_pattern(&crate::identity::CONFIGURATION_KEY_PATTERN, key)? {
                return Err(PipelineError::Validation(format!("invalid configuration key '{}'", key)));
            }
        }
        if !MEMORY_SIZE_RANGE.contains(&self.compute.memory_size) {
            return Err(PipelineError::Validation(format!(
                "memory size {} not in [{}, {}]",
                self.compute.memory_size,
                MEMORY_SIZE_RANGE.start(),
                MEMORY_SIZE_RANGE.end()
            )));
        }
        if !TIMEOUT_RANGE.contains(&self.compute.timeout) {
            return Err(PipelineError::Validation(format!(
                "timeout {} not in [{}, {}]",
                self.compute.timeout,
                TIMEOUT_RANGE.start(),
                TIMEOUT_RANGE.end()
            )));
        }
        if let Some(schedule) = &self.schedule {
            schedule.validate()?;
        }
        self.dependencies()?;
        Ok(())
    }

    /// Hex-encoded SHA-256 of the canonical serialization of the content.
    pub fn digest(&self) -> PipelineResult<String> {
        let view = DigestView {
            runtime: &self.runtime,
            provider: &self.provider,
            files: self
                .files
                .iter()
                .map(|(path, content)| (path.as_str(), digest_content(path, content)))
                .collect(),
            configuration: &self.configuration,
            compute: &self.compute,
            schedule: &self.schedule,
            metadata: &self.metadata,
        };
        let mut hasher = sha2::Sha256::new();
        hasher.update(serde_json::to_vec(&view)?);
        Ok(hex::encode(hasher.finalize()))
    }

    /// Dependencies declared in `package.json`, if any.
    pub fn dependencies(&self) -> PipelineResult<std::collections::BTreeMap<String, String>> {
        let doc = match self.files.get("package.json") {
            None => return Ok(std::collections::BTreeMap::new()),
            Some(FileContent::Document(doc)) => doc.clone(),
            Some(FileContent::Text(text)) => {
                serde_json::from_str(text).map_err(|err| PipelineError::Validation(format!("malformed package.json: {}", err)))?
            }
        };
        let mut ret = std::collections::BTreeMap::new();
        match doc.get("dependencies") {
            None | Some(serde_json::Value::Null) => {}
            Some(serde_json::Value::Object(deps)) => {
                for (name, version) in deps {
                    match version.as_str() {
                        Some(version) => {
                            ret.insert(name.clone(), version.to_string());
                        }
                        None => {
                            return Err(PipelineError::Validation(format!("dependency {} has a non-string version", name)));
                        }
                    }
                }
            }
            Some(_) => return Err(PipelineError::Validation("package.json dependencies must be an object".to_string())),
        }
        Ok(ret)
    }

    /// True if deploying requires the asynchronous build step: dependency
    /// resolution or the provisioning of a static IP address.
    pub fn requires_build(&self) -> PipelineResult<bool> {
        Ok(self.compute.static_ip || !self.dependencies()?.is_empty())
    }

    pub fn deploy_config(&self) -> DeployConfig {
        DeployConfig {
            runtime: self.runtime.clone(),
            provider: self.provider.clone(),
            configuration: self.configuration.clone(),
            compute: self.compute.clone(),
        }
    }

    pub fn package(&self, resolved_dependencies: std::collections::BTreeMap<String, String>) -> FunctionPackage {
        FunctionPackage {
            files: self.files.clone(),
            dependencies: resolved_dependencies,
        }
    }
}

// Rebuild every JSON object with sorted keys, so that the serialization does
// not depend on the order of the input.
// package.json is hashed as a document whether it is given as text or not.
// Other text files are hashed verbatim.
fn digest_content(path: &str, content: &FileContent) -> serde_json::Value {
    match content {
        FileContent::Document(doc) => canonical(doc),
        FileContent::Text(text) if path == "package.json" => match serde_json::from_str::<serde_json::Value>(text) {
            Ok(doc) => canonical(&doc),
            Err(_) => serde_json::Value::String(text.clone()),
        },
        FileContent::Text(text) => serde_json::Value::String(text.clone()),
    }
}

fn canonical(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut ret = serde_json::Map::new();
            for key in keys {
                ret.insert(key.clone(), canonical(&map[key]));
            }
            serde_json::Value::Object(ret)
        }
        serde_json::Value::Array(items) => serde_json::Value::Array(items.iter().map(canonical).collect()),
        _ => value.clone(),
    }
}

fn default_runtime() -> String {
    String::from(DEFAULT_RUNTIME)
}

fn default_provider() -> String {
    String::from(DEFAULT_PROVIDER)
}

fn default_timezone() -> String {
    String::from(DEFAULT_TIMEZONE)
}

fn default_memory_size() -> u32 {
    128
}

fn default_timeout() -> u32 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello_world() -> Specification {
        Specification::from_json(r#"{"files": {"index.js": "module.exports = (ctx, cb) => cb(null, { body: 'hello' });"}}"#).unwrap()
    }

    #[test]
    fn defaults_applied() {
        let spec = hello_world();
        assert_eq!("nodejs", spec.runtime);
        assert_eq!("lambda", spec.provider);
        assert_eq!(ComputeLimits::default(), spec.compute);
        assert!(spec.schedule.is_none());
        spec.validate().unwrap();
        assert!(!spec.requires_build().unwrap());
    }

    #[test]
    fn digest_ignores_field_ordering_and_timestamps() {
        let a = Specification::from_json(
            r#"{
                "configuration": {"B": "2", "A": "1"},
                "files": {"package.json": {"name": "x", "dependencies": {"b": "1.0.0", "a": "2.0.0"}}, "index.js": "x"},
                "updated_at": "2024-01-01T00:00:00Z"
            }"#,
        )
        .unwrap();
        let b = Specification::from_json(
            r#"{
                "files": {"index.js": "x", "package.json": {"dependencies": {"a": "2.0.0", "b": "1.0.0"}, "name": "x"}},
                "configuration": {"A": "1", "B": "2"},
                "updated_at": "2025-06-30T12:00:00Z"
            }"#,
        )
        .unwrap();
        assert_eq!(a.digest().unwrap(), b.digest().unwrap());
        assert_eq!(64, a.digest().unwrap().len());
    }

    #[test]
    fn digest_of_textual_package_json() {
        let document = Specification::from_json(
            r#"{"files": {"index.js": "x", "package.json": {"name": "x", "dependencies": {"a": "1.0.0", "b": "2.0.0"}}}}"#,
        )
        .unwrap();
        let mut text = document.clone();
        text.files.insert(
            "package.json".to_string(),
            FileContent::Text(r#"{"dependencies": {"b": "2.0.0", "a": "1.0.0"}, "name": "x"}"#.to_string()),
        );
        assert_eq!(document.digest().unwrap(), text.digest().unwrap());

        // Other text files are hashed as they are.
        let mut other = document.clone();
        other.files.insert("data.json".to_string(), FileContent::Text(r#"{"b": 1, "a": 2}"#.to_string()));
        let mut reordered = document.clone();
        reordered.files.insert("data.json".to_string(), FileContent::Text(r#"{"a": 2, "b": 1}"#.to_string()));
        assert_ne!(other.digest().unwrap(), reordered.digest().unwrap());
    }

    #[test]
    fn digest_changes_with_content() {
        let base = hello_world();
        let mut digests = std::collections::HashSet::new();
        digests.insert(base.digest().unwrap());

        for i in 0..50 {
            let mut spec = base.clone();
            spec.files.insert("index.js".to_string(), FileContent::Text(format!("module.exports = {};", i)));
            assert!(digests.insert(spec.digest().unwrap()));
        }

        let mut spec = base.clone();
        spec.configuration.insert("KEY".to_string(), "value".to_string());
        assert!(digests.insert(spec.digest().unwrap()));

        let mut spec = base.clone();
        spec.schedule = Some(Schedule::new("*/5 * * * *", None));
        assert!(digests.insert(spec.digest().unwrap()));

        let mut spec = base.clone();
        spec.compute.memory_size = 256;
        assert!(digests.insert(spec.digest().unwrap()));
    }

    #[test]
    fn unknown_fields_rejected() {
        let err = Specification::from_json(r#"{"files": {"index.js": "x"}, "lambda": {"memorySize": 128}}"#).unwrap_err();
        assert_eq!(400, err.status_code());
        assert!(Specification::from_json(r#"{"files": {"index.js": "x"}, "compute": {"memory": 128}}"#).is_err());
    }

    #[test]
    fn validation() {
        let mut spec = hello_world();
        spec.compute.memory_size = 32;
        assert!(spec.validate().is_err());

        let mut spec = hello_world();
        spec.compute.timeout = 121;
        assert!(spec.validate().is_err());

        let mut spec = hello_world();
        spec.files.clear();
        assert!(spec.validate().is_err());

        let mut spec = hello_world();
        spec.files.insert("../escape.js".to_string(), FileContent::Text(String::new()));
        assert!(spec.validate().is_err());

        let mut spec = hello_world();
        spec.configuration.insert("not-a-word".to_string(), "x".to_string());
        assert!(spec.validate().is_err());

        let mut spec = hello_world();
        spec.schedule = Some(Schedule::new("* *", None));
        assert!(spec.validate().is_err());

        let mut spec = hello_world();
        spec.files.remove("index.js");
        spec.files.insert("main.js".to_string(), FileContent::Text(String::new()));
        assert!(spec.validate().is_err());
    }

    #[test]
    fn build_requirement() {
        let spec = Specification::from_json(r#"{"files": {"index.js": "x", "package.json": "{\"dependencies\": {\"superagent\": \"^5.0.0\"}}"}}"#)
            .unwrap();
        assert_eq!(
            std::collections::BTreeMap::from([("superagent".to_string(), "^5.0.0".to_string())]),
            spec.dependencies().unwrap()
        );
        assert!(spec.requires_build().unwrap());

        let spec = Specification::from_json(r#"{"files": {"index.js": "x"}, "compute": {"static_ip": true}}"#).unwrap();
        assert!(spec.requires_build().unwrap());

        let spec = Specification::from_json(r#"{"files": {"index.js": "x", "package.json": {"dependencies": {}}}}"#).unwrap();
        assert!(!spec.requires_build().unwrap());

        let spec = Specification::from_json(r#"{"files": {"index.js": "x", "package.json": "{not json"}}"#).unwrap();
        assert!(spec.validate().is_err());
    }
}
