// SPDX-FileCopyrightText: © 2024 Technical University of Munich, Chair of Connected Mobility
// SPDX-License-Identifier: MIT

//! Mapping of logical function identities to storage keys and to the names of
//! the deployed resources in the compute backend.
//!
//! All the functions in this module are pure: they never perform I/O and
//! they only fail on malformed identities.

use sha2::Digest;

use crate::error::{PipelineError, PipelineResult};

// Compiled once, on first use.
pub(crate) type Pattern = std::sync::LazyLock<Result<regex::Regex, regex::Error>>;

static BOUNDARY_PATTERN: Pattern = std::sync::LazyLock::new(|| regex::Regex::new(r"^[A-Za-z0-9\-]{1,63}$"));
static FUNCTION_PATTERN: Pattern = std::sync::LazyLock::new(|| regex::Regex::new(r"^[A-Za-z0-9\-]{1,64}$"));
pub(crate) static CONFIGURATION_KEY_PATTERN: Pattern = std::sync::LazyLock::new(|| regex::Regex::new(r"^\w+$"));

/// Key-space of the artifacts persisted for a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    /// Current specification, digest and version of the function.
    Spec,
    /// Status of an asynchronous build, expires automatically.
    BuildStatus,
    /// Parameters of an asynchronous build, expires automatically.
    BuildRequest,
    /// Package deployed to the compute backend.
    BuildPackage,
    /// Cron registrations.
    Cron,
}

impl Namespace {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Spec => "spec",
            Self::BuildStatus => "build-status",
            Self::BuildRequest => "build-request",
            Self::BuildPackage => "build-package",
            Self::Cron => "cron",
        }
    }

    /// True if the artifacts in this namespace are written with a TTL.
    pub fn expires(&self) -> bool {
        matches!(self, Self::BuildStatus | Self::BuildRequest)
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.prefix())
    }
}

/// Tenant/boundary/function triple naming a function uniquely.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct FunctionIdentity {
    pub tenant_id: String,
    pub boundary_id: String,
    pub function_id: String,
}

impl FunctionIdentity {
    pub fn new(tenant_id: &str, boundary_id: &str, function_id: &str) -> PipelineResult<Self> {
        let identity = Self {
            tenant_id: tenant_id.to_string(),
            boundary_id: boundary_id.to_string(),
            function_id: function_id.to_string(),
        };
        identity.validate()?;
        Ok(identity)
    }

    /// Reject identities that could escape their key-space or exceed the
    /// naming limits.
    pub fn validate(&self) -> PipelineResult<()> {
        validate_tenant(&self.tenant_id)?;
        validate_boundary(&self.boundary_id)?;
        if !matches_pattern(&FUNCTION_PATTERN, &self.function_id)? {
            return Err(PipelineError::Validation(format!("invalid function id '{}'", self.function_id)));
        }
        Ok(())
    }

    /// Stable, fixed-length name of the deployed resource.
    ///
    /// The name does not depend on the specification of the function and
    /// cannot be reversed into the identity.
    pub fn resource_name(&self) -> String {
        let mut hasher = sha2::Sha256::new();
        hasher.update(self.description().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Name of a specific version of the deployed resource.
    pub fn qualified_resource_name(&self, version: u64) -> String {
        format!("{}:{}", self.resource_name(), version)
    }

    pub fn description(&self) -> String {
        format!("function:{}:{}:{}", self.tenant_id, self.boundary_id, self.function_id)
    }

    /// Key of an artifact in the given namespace.
    ///
    /// `build_id` is mandatory for the build status/request namespaces and
    /// ignored otherwise. For [`Namespace::Cron`] the result is the prefix
    /// under which the registrations of this function are stored.
    pub fn storage_key(&self, namespace: Namespace, build_id: Option<&str>) -> PipelineResult<String> {
        let base = format!("{}/{}/{}/{}", namespace.prefix(), self.tenant_id, self.boundary_id, self.function_id);
        match namespace {
            Namespace::Spec => Ok(format!("{}/spec.json", base)),
            Namespace::BuildPackage => Ok(format!("{}/package", base)),
            Namespace::Cron => Ok(format!("{}/", base)),
            Namespace::BuildStatus | Namespace::BuildRequest => match build_id {
                Some(build_id) if is_valid_build_id(build_id) => Ok(format!("{}/{}.json", base, build_id)),
                Some(build_id) => Err(PipelineError::Validation(format!("invalid build id '{}'", build_id))),
                None => Err(PipelineError::Validation(format!("missing build id for namespace {}", namespace))),
            },
        }
    }

    pub fn spec_key(&self) -> String {
        format!("{}/{}/{}/{}/spec.json", Namespace::Spec.prefix(), self.tenant_id, self.boundary_id, self.function_id)
    }

    pub fn build_package_key(&self) -> String {
        format!(
            "{}/{}/{}/{}/package",
            Namespace::BuildPackage.prefix(),
            self.tenant_id,
            self.boundary_id,
            self.function_id
        )
    }

    pub fn cron_prefix(&self) -> String {
        format!("{}/{}/{}/{}/", Namespace::Cron.prefix(), self.tenant_id, self.boundary_id, self.function_id)
    }

    /// Sort key of the function within its tenant, also used as listing cursor.
    pub fn sort_key(&self) -> String {
        format!("{}/{}", self.boundary_id, self.function_id)
    }

    /// Parse a listing cursor produced by [`FunctionIdentity::sort_key`].
    pub fn from_sort_key(tenant_id: &str, sort_key: &str) -> PipelineResult<Self> {
        match sort_key.split_once('/') {
            Some((boundary_id, function_id)) => Self::new(tenant_id, boundary_id, function_id),
            None => Err(PipelineError::Validation(format!("invalid cursor '{}'", sort_key))),
        }
    }

    /// Recover the identity from any key produced by this module, e.g.,
    /// `spec/{tenant}/{boundary}/{function}/spec.json`.
    pub fn from_storage_key(namespace: Namespace, key: &str) -> PipelineResult<Self> {
        let tokens: Vec<&str> = key.split('/').collect();
        if tokens.len() < 5 || tokens[0] != namespace.prefix() {
            return Err(PipelineError::Validation(format!("ill-formed {} key '{}'", namespace, key)));
        }
        Self::new(tokens[1], tokens[2], tokens[3])
    }

    /// Public URL at which the deployed function can be invoked.
    pub fn location(&self, function_endpoint: &str) -> String {
        format!(
            "{}/v1/run/{}/{}/{}",
            function_endpoint.trim_end_matches('/'),
            self.tenant_id,
            self.boundary_id,
            self.function_id
        )
    }
}

impl std::fmt::Display for FunctionIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.tenant_id, self.boundary_id, self.function_id)
    }
}

/// Prefix covering every artifact of a namespace within a tenant, or within a
/// boundary of the tenant if specified.
pub fn scope_prefix(namespace: Namespace, tenant_id: &str, boundary_id: Option<&str>) -> PipelineResult<String> {
    validate_tenant(tenant_id)?;
    match boundary_id {
        Some(boundary_id) => {
            validate_boundary(boundary_id)?;
            Ok(format!("{}/{}/{}/", namespace.prefix(), tenant_id, boundary_id))
        }
        None => Ok(format!("{}/{}/", namespace.prefix(), tenant_id)),
    }
}

fn validate_tenant(tenant_id: &str) -> PipelineResult<()> {
    if tenant_id.is_empty() || tenant_id.len() > 64 || tenant_id.contains('/') || tenant_id.chars().any(|c| c.is_whitespace()) {
        return Err(PipelineError::Validation(format!("invalid tenant id '{}'", tenant_id)));
    }
    Ok(())
}

fn validate_boundary(boundary_id: &str) -> PipelineResult<()> {
    if !matches_pattern(&BOUNDARY_PATTERN, boundary_id)? {
        return Err(PipelineError::Validation(format!("invalid boundary id '{}'", boundary_id)));
    }
    Ok(())
}

fn is_valid_build_id(build_id: &str) -> bool {
    !build_id.is_empty() && build_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

pub(crate) fn matches_pattern(pattern: &Pattern, value: &str) -> PipelineResult<bool> {
    match &**pattern {
        Ok(re) => Ok(re.is_match(value)),
        Err(err) => Err(PipelineError::Internal(format!("invalid pattern: {}", err))),
    }
}
