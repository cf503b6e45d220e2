// SPDX-FileCopyrightText: © 2024 Technical University of Munich, Chair of Connected Mobility
// SPDX-License-Identifier: MIT

use crate::error::{PipelineError, PipelineResult};
use crate::identity::{FunctionIdentity, Namespace};
use crate::specification::Schedule;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CronRegistration {
    pub identity: FunctionIdentity,
    pub schedule: Schedule,
}

/// Registry of the functions invoked periodically.
///
/// Each registration is stored under `cron/{tenant}/{boundary}/{function}/`
/// followed by the hex encoding of the JSON array `[cron, timezone]`, so
/// that a scan over the keys alone recovers all the schedules.
#[derive(Clone)]
pub struct CronRegistry {
    store: crate::store::StoreHandle,
}

impl CronRegistry {
    pub fn new(store: crate::store::StoreHandle) -> Self {
        Self { store }
    }

    pub fn encode_suffix(schedule: &Schedule) -> PipelineResult<String> {
        Ok(hex::encode(serde_json::to_vec(&[&schedule.cron, &schedule.timezone])?))
    }

    pub fn decode_suffix(suffix: &str) -> PipelineResult<Schedule> {
        let malformed = |reason: String| PipelineError::Internal(format!("malformed cron key suffix '{}': {}", suffix, reason));
        let data = hex::decode(suffix).map_err(|err| malformed(err.to_string()))?;
        let fields: Vec<Option<String>> = serde_json::from_slice(&data).map_err(|err| malformed(err.to_string()))?;
        match fields.as_slice() {
            [Some(cron)] | [Some(cron), None] => Ok(Schedule::new(cron, None)),
            [Some(cron), Some(timezone)] => Ok(Schedule::new(cron, Some(timezone))),
            _ => Err(malformed("expected [cron, timezone]".to_string())),
        }
    }

    /// Register the schedule of a function, replacing any previous one.
    ///
    /// The new registration is written before removing the others, so that a
    /// failure never leaves a scheduled function without a registration.
    pub async fn upsert(&self, identity: &FunctionIdentity, schedule: &Schedule) -> PipelineResult<()> {
        let prefix = identity.cron_prefix();
        let key = format!("{}{}", prefix, Self::encode_suffix(schedule)?);
        let registration = CronRegistration {
            identity: identity.clone(),
            schedule: schedule.clone(),
        };
        self.store.put_json(&key, &registration, crate::store::PutOptions::default()).await?;

        for stale in self.store.list_all(&prefix).await?.into_iter().filter(|x| *x != key) {
            log::debug!("removing stale cron registration {}", stale);
            self.store.delete(&stale).await?;
        }
        log::info!("cron registration {} at {}", identity, schedule);
        Ok(())
    }

    pub async fn get(&self, identity: &FunctionIdentity) -> PipelineResult<Option<Schedule>> {
        let prefix = identity.cron_prefix();
        match self.store.list_all(&prefix).await?.first() {
            Some(key) => Ok(Some(Self::decode_suffix(&key[prefix.len()..])?)),
            None => Ok(None),
        }
    }

    /// Remove the registrations of a function. Return how many there were.
    pub async fn remove(&self, identity: &FunctionIdentity) -> PipelineResult<usize> {
        let keys = self.store.list_all(&identity.cron_prefix()).await?;
        for key in &keys {
            self.store.delete(key).await?;
        }
        if !keys.is_empty() {
            log::info!("removed {} cron registration(s) of {}", keys.len(), identity);
        }
        Ok(keys.len())
    }

    /// All the registrations of a tenant, or of a boundary within a tenant,
    /// in storage key order.
    pub async fn list_by_scope(&self, tenant_id: &str, boundary_id: Option<&str>) -> PipelineResult<Vec<CronRegistration>> {
        let prefix = crate::identity::scope_prefix(Namespace::Cron, tenant_id, boundary_id)?;
        let mut ret = vec![];
        for key in self.store.list_all(&prefix).await? {
            let identity = match FunctionIdentity::from_storage_key(Namespace::Cron, &key) {
                Ok(identity) => identity,
                Err(err) => {
                    log::warn!("skipping cron key {}: {}", key, err);
                    continue;
                }
            };
            let suffix = &key[identity.cron_prefix().len()..];
            match Self::decode_suffix(suffix) {
                Ok(schedule) => ret.push(CronRegistration { identity, schedule }),
                Err(err) => log::warn!("skipping cron key {}: {}", key, err),
            }
        }
        Ok(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (CronRegistry, std::sync::Arc<crate::store::memory::MemoryStore>) {
        let store = std::sync::Arc::new(crate::store::memory::MemoryStore::new());
        let handle = crate::store::StoreHandle::new(store.clone(), crate::RetrySettings::default());
        (CronRegistry::new(handle), store)
    }

    fn identity(boundary_id: &str, function_id: &str) -> FunctionIdentity {
        FunctionIdentity::new("tenant-1", boundary_id, function_id).unwrap()
    }

    #[test]
    fn suffix_encoding() {
        let schedule = Schedule::new("*/5 * * * *", Some("Europe/Rome"));
        let suffix = CronRegistry::encode_suffix(&schedule).unwrap();
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(schedule, CronRegistry::decode_suffix(&suffix).unwrap());

        // A missing timezone means UTC.
        let suffix = hex::encode(r#"["0 0 * * *",null]"#);
        assert_eq!(Schedule::new("0 0 * * *", None), CronRegistry::decode_suffix(&suffix).unwrap());
        let suffix = hex::encode(r#"["0 0 * * *"]"#);
        assert_eq!("UTC", CronRegistry::decode_suffix(&suffix).unwrap().timezone);

        assert!(CronRegistry::decode_suffix("zz").is_err());
        assert!(CronRegistry::decode_suffix(&hex::encode("{}")).is_err());
    }

    #[tokio::test]
    async fn upsert_replaces_previous_schedule() {
        let (registry, store) = registry();
        let id = identity("b", "f");
        registry.upsert(&id, &Schedule::new("* * * * *", None)).await.unwrap();
        registry.upsert(&id, &Schedule::new("0 * * * *", Some("Europe/Berlin"))).await.unwrap();

        assert_eq!(1, store.keys().await.len());
        assert_eq!(Some(Schedule::new("0 * * * *", Some("Europe/Berlin"))), registry.get(&id).await.unwrap());

        // Upserting the same schedule again is harmless.
        registry.upsert(&id, &Schedule::new("0 * * * *", Some("Europe/Berlin"))).await.unwrap();
        assert_eq!(1, store.keys().await.len());
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let (registry, _) = registry();
        let id = identity("b", "f");
        registry.upsert(&id, &Schedule::new("* * * * *", None)).await.unwrap();
        assert_eq!(1, registry.remove(&id).await.unwrap());
        assert_eq!(0, registry.remove(&id).await.unwrap());
        assert_eq!(None, registry.get(&id).await.unwrap());
    }

    #[tokio::test]
    async fn list_scoped() {
        let (registry, _) = registry();
        registry.upsert(&identity("b1", "f1"), &Schedule::new("* * * * *", None)).await.unwrap();
        registry.upsert(&identity("b1", "f2"), &Schedule::new("0 * * * *", None)).await.unwrap();
        registry.upsert(&identity("b2", "f1"), &Schedule::new("0 0 * * *", None)).await.unwrap();
        registry
            .upsert(
                &FunctionIdentity::new("tenant-2", "b1", "f1").unwrap(),
                &Schedule::new("0 0 * * *", None),
            )
            .await
            .unwrap();

        let all = registry.list_by_scope("tenant-1", None).await.unwrap();
        assert_eq!(
            vec![identity("b1", "f1"), identity("b1", "f2"), identity("b2", "f1")],
            all.iter().map(|x| x.identity.clone()).collect::<Vec<_>>()
        );
        assert_eq!("0 * * * *", all[1].schedule.cron);

        let b2 = registry.list_by_scope("tenant-1", Some("b2")).await.unwrap();
        assert_eq!(1, b2.len());
        assert!(registry.list_by_scope("tenant-3", None).await.unwrap().is_empty());
    }
}
