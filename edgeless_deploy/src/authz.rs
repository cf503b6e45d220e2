// SPDX-FileCopyrightText: © 2024 Technical University of Munich, Chair of Connected Mobility
// SPDX-License-Identifier: MIT

use crate::identity::FunctionIdentity;

/// The principal on behalf of which an operation is requested.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Actor {
    pub subject: String,
    /// Tenant the actor belongs to.
    pub tenant_id: String,
    /// A read-only actor can only read and execute functions.
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Action {
    Deploy,
    Read,
    Delete,
    Execute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Allow,
    Deny,
}

/// Predicate deciding whether an actor may perform an action on a function.
#[async_trait::async_trait]
pub trait Authorizer: Send + Sync {
    async fn check_permission(&self, actor: &Actor, action: Action, identity: &FunctionIdentity) -> Permission;
}

pub struct AllowAll {}

#[async_trait::async_trait]
impl Authorizer for AllowAll {
    async fn check_permission(&self, _actor: &Actor, _action: Action, _identity: &FunctionIdentity) -> Permission {
        Permission::Allow
    }
}

pub struct DenyAll {}

#[async_trait::async_trait]
impl Authorizer for DenyAll {
    async fn check_permission(&self, _actor: &Actor, _action: Action, _identity: &FunctionIdentity) -> Permission {
        Permission::Deny
    }
}

/// Actors are confined to the functions of their own tenant.
pub struct TenantScoped {}

#[async_trait::async_trait]
impl Authorizer for TenantScoped {
    async fn check_permission(&self, actor: &Actor, action: Action, identity: &FunctionIdentity) -> Permission {
        if actor.tenant_id != identity.tenant_id {
            return Permission::Deny;
        }
        match (actor.read_only, action) {
            (true, Action::Deploy) | (true, Action::Delete) => Permission::Deny,
            _ => Permission::Allow,
        }
    }
}

struct CachedDecision {
    permission: Permission,
    decided_at: std::time::Instant,
}

/// Memoizes the decisions of another authorizer.
///
/// A decision is reused for at most `max_age`, after which the inner
/// authorizer is asked again. `refresh()` drops all the decisions.
pub struct CachedAuthorizer {
    inner: std::sync::Arc<dyn Authorizer>,
    max_age: std::time::Duration,
    decisions: tokio::sync::Mutex<std::collections::HashMap<(Actor, Action, FunctionIdentity), CachedDecision>>,
}

impl CachedAuthorizer {
    pub fn new(inner: std::sync::Arc<dyn Authorizer>, max_age: std::time::Duration) -> Self {
        Self {
            inner,
            max_age,
            decisions: tokio::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub async fn refresh(&self) {
        let mut decisions = self.decisions.lock().await;
        log::debug!("dropping {} cached authorization decisions", decisions.len());
        decisions.clear();
    }
}

#[async_trait::async_trait]
impl Authorizer for CachedAuthorizer {
    async fn check_permission(&self, actor: &Actor, action: Action, identity: &FunctionIdentity) -> Permission {
        let key = (actor.clone(), action, identity.clone());
        if let Some(decision) = self.decisions.lock().await.get(&key) {
            if decision.decided_at.elapsed() < self.max_age {
                return decision.permission;
            }
        }

        // The lock is not held while the inner authorizer decides.
        let permission = self.inner.check_permission(actor, action, identity).await;
        self.decisions.lock().await.insert(
            key,
            CachedDecision {
                permission,
                decided_at: std::time::Instant::now(),
            },
        );
        permission
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingAuthorizer {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Authorizer for CountingAuthorizer {
        async fn check_permission(&self, _actor: &Actor, _action: Action, _identity: &FunctionIdentity) -> Permission {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Permission::Allow
        }
    }

    fn actor(tenant_id: &str, read_only: bool) -> Actor {
        Actor {
            subject: "user-1".to_string(),
            tenant_id: tenant_id.to_string(),
            read_only,
        }
    }

    #[tokio::test]
    async fn tenant_scoped() {
        let authz = TenantScoped {};
        let identity = FunctionIdentity::new("tenant-1", "b", "f").unwrap();
        assert_eq!(Permission::Allow, authz.check_permission(&actor("tenant-1", false), Action::Deploy, &identity).await);
        assert_eq!(Permission::Deny, authz.check_permission(&actor("tenant-2", false), Action::Read, &identity).await);
        assert_eq!(Permission::Allow, authz.check_permission(&actor("tenant-1", true), Action::Read, &identity).await);
        assert_eq!(Permission::Allow, authz.check_permission(&actor("tenant-1", true), Action::Execute, &identity).await);
        assert_eq!(Permission::Deny, authz.check_permission(&actor("tenant-1", true), Action::Delete, &identity).await);
    }

    #[tokio::test]
    async fn cached_decisions_expire() {
        let inner = std::sync::Arc::new(CountingAuthorizer {
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let authz = CachedAuthorizer::new(inner.clone(), std::time::Duration::from_millis(50));
        let identity = FunctionIdentity::new("tenant-1", "b", "f").unwrap();
        let actor = actor("tenant-1", false);

        for _ in 0..3 {
            assert_eq!(Permission::Allow, authz.check_permission(&actor, Action::Deploy, &identity).await);
        }
        assert_eq!(1, inner.calls.load(std::sync::atomic::Ordering::SeqCst));

        authz.check_permission(&actor, Action::Read, &identity).await;
        assert_eq!(2, inner.calls.load(std::sync::atomic::Ordering::SeqCst));

        authz.refresh().await;
        authz.check_permission(&actor, Action::Deploy, &identity).await;
        assert_eq!(3, inner.calls.load(std::sync::atomic::Ordering::SeqCst));

        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        authz.check_permission(&actor, Action::Deploy, &identity).await;
        assert_eq!(4, inner.calls.load(std::sync::atomic::Ordering::SeqCst));
    }
}
