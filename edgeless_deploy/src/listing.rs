// SPDX-FileCopyrightText: © 2024 Technical University of Munich, Chair of Connected Mobility
// SPDX-License-Identifier: MIT

use crate::error::{PipelineError, PipelineResult};
use crate::identity::{FunctionIdentity, Namespace};
use crate::specification::Schedule;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CronFilter {
    /// Only the functions with a schedule.
    Only,
    /// Only the functions without a schedule.
    Exclude,
}

#[derive(Debug, Clone, Default)]
pub struct ListRequest {
    pub cron_filter: Option<CronFilter>,
    /// Maximum number of items, capped by the service configuration.
    pub count: Option<usize>,
    /// Value of `next` from the previous page.
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FunctionSummary {
    pub boundary_id: String,
    pub function_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ListResponse {
    pub items: Vec<FunctionSummary>,
    /// Cursor of the next page, if there are more items.
    pub next: Option<String>,
}

/// Paginated view over the functions of a tenant, annotated with their
/// schedules.
///
/// Items are returned in the order of their storage keys, which is the
/// order of `{boundary}/{function}` except that a `-` sorts before the `/`
/// separator.
#[derive(Clone)]
pub struct ListingService {
    store: crate::store::StoreHandle,
    cron: crate::cron::CronRegistry,
    max_results: usize,
}

impl ListingService {
    pub fn new(store: crate::store::StoreHandle, max_results: usize) -> Self {
        Self {
            cron: crate::cron::CronRegistry::new(store.clone()),
            store,
            max_results: std::cmp::max(1, max_results),
        }
    }

    pub async fn list(&self, tenant_id: &str, boundary_id: Option<&str>, request: ListRequest) -> PipelineResult<ListResponse> {
        let count = match request.count {
            Some(0) => return Err(PipelineError::Validation("count must be positive".to_string())),
            Some(count) => std::cmp::min(count, self.max_results),
            None => self.max_results,
        };
        let cursor = match &request.cursor {
            Some(cursor) => {
                let cursor = FunctionIdentity::from_sort_key(tenant_id, cursor)?;
                if let Some(boundary_id) = boundary_id {
                    if cursor.boundary_id != boundary_id {
                        return Err(PipelineError::Validation(format!("cursor {} outside boundary {}", cursor.sort_key(), boundary_id)));
                    }
                }
                Some(cursor)
            }
            None => None,
        };

        let registrations = self.cron.list_by_scope(tenant_id, boundary_id).await?;
        log::debug!("listing {} with {} cron registration(s)", tenant_id, registrations.len());

        match request.cron_filter {
            Some(CronFilter::Only) => Ok(Self::page_registrations(registrations, cursor.as_ref(), count)),
            _ => {
                let schedules: std::collections::HashMap<FunctionIdentity, Schedule> =
                    registrations.into_iter().map(|x| (x.identity, x.schedule)).collect();
                self.page_catalog(tenant_id, boundary_id, &schedules, cursor.as_ref(), count, request.cron_filter)
                    .await
            }
        }
    }

    fn page_registrations(registrations: Vec<crate::cron::CronRegistration>, cursor: Option<&FunctionIdentity>, count: usize) -> ListResponse {
        let mut registrations = registrations;
        registrations.dedup_by(|a, b| a.identity == b.identity);
        let start_after = cursor.map(|x| x.cron_prefix());
        let mut remaining = registrations
            .into_iter()
            .filter(|x| start_after.as_ref().map_or(true, |start_after| x.identity.cron_prefix() > *start_after));

        let items: Vec<FunctionSummary> = remaining.by_ref().take(count).map(|x| summary(x.identity, Some(x.schedule))).collect();
        let next = match remaining.next() {
            Some(_) => items.last().map(|x| format!("{}/{}", x.boundary_id, x.function_id)),
            None => None,
        };
        ListResponse { items, next }
    }

    async fn page_catalog(
        &self,
        tenant_id: &str,
        boundary_id: Option<&str>,
        schedules: &std::collections::HashMap<FunctionIdentity, Schedule>,
        cursor: Option<&FunctionIdentity>,
        count: usize,
        cron_filter: Option<CronFilter>,
    ) -> PipelineResult<ListResponse> {
        let prefix = crate::identity::scope_prefix(Namespace::Spec, tenant_id, boundary_id)?;
        let mut start_after = cursor.map(|x| x.spec_key());
        let mut items = vec![];

        loop {
            let page = self
                .store
                .list_by_prefix(
                    &prefix,
                    crate::store::ListOptions {
                        max_keys: Some(count),
                        start_after: start_after.take(),
                        continuation_token: None,
                    },
                )
                .await?;
            let last_key = page.items.last().cloned();
            let scanned = page.items.len();

            for (i, key) in page.items.into_iter().enumerate() {
                let identity = match FunctionIdentity::from_storage_key(Namespace::Spec, &key) {
                    Ok(identity) => identity,
                    Err(err) => {
                        log::warn!("skipping specification key {}: {}", key, err);
                        continue;
                    }
                };
                let schedule = schedules.get(&identity).cloned();
                if cron_filter == Some(CronFilter::Exclude) && schedule.is_some() {
                    continue;
                }
                items.push(summary(identity, schedule));

                if items.len() == count {
                    let more = i + 1 < scanned || page.truncated;
                    let next = match more {
                        true => items.last().map(|x| format!("{}/{}", x.boundary_id, x.function_id)),
                        false => None,
                    };
                    return Ok(ListResponse { items, next });
                }
            }

            match (page.truncated, last_key) {
                (true, Some(last_key)) => start_after = Some(last_key),
                _ => return Ok(ListResponse { items, next: None }),
            }
        }
    }
}

fn summary(identity: FunctionIdentity, schedule: Option<Schedule>) -> FunctionSummary {
    FunctionSummary {
        boundary_id: identity.boundary_id,
        function_id: identity.function_id,
        schedule,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn service(functions: &[(&str, &str, Option<&str>)]) -> ListingService {
        let store = crate::store::StoreHandle::new(
            std::sync::Arc::new(crate::store::memory::MemoryStore::new()),
            crate::RetrySettings::default(),
        );
        let cron = crate::cron::CronRegistry::new(store.clone());
        for (boundary_id, function_id, cron_expr) in functions {
            let identity = FunctionIdentity::new("tenant-1", boundary_id, function_id).unwrap();
            store
                .put(&identity.spec_key(), b"{}".to_vec(), crate::store::PutOptions::default())
                .await
                .unwrap();
            if let Some(cron_expr) = cron_expr {
                cron.upsert(&identity, &Schedule::new(cron_expr, None)).await.unwrap();
            }
        }
        let other = FunctionIdentity::new("tenant-2", "b1", "f1").unwrap();
        store.put(&other.spec_key(), b"{}".to_vec(), crate::store::PutOptions::default()).await.unwrap();
        ListingService::new(store, 100)
    }

    fn names(response: &ListResponse) -> Vec<String> {
        response.items.iter().map(|x| format!("{}/{}", x.boundary_id, x.function_id)).collect()
    }

    #[tokio::test]
    async fn pagination_complete() {
        let service = service(&[
            ("b1", "f3", None),
            ("b1", "f1", None),
            ("b2", "f1", None),
            ("b1", "f2", None),
            ("b1", "f4", None),
        ])
        .await;

        let mut seen = vec![];
        let mut cursor = None;
        let mut pages = 0;
        loop {
            let response = service
                .list(
                    "tenant-1",
                    None,
                    ListRequest {
                        cron_filter: None,
                        count: Some(2),
                        cursor: cursor.clone(),
                    },
                )
                .await
                .unwrap();
            pages += 1;
            assert!(response.items.len() <= 2);
            seen.extend(names(&response));
            match response.next {
                Some(next) => {
                    assert_eq!(seen.last(), Some(&next));
                    cursor = Some(next);
                }
                None => break,
            }
        }
        assert_eq!(3, pages);
        assert_eq!(vec!["b1/f1", "b1/f2", "b1/f3", "b1/f4", "b2/f1"], seen);

        // Same cursor, same continuation.
        let request = ListRequest {
            cron_filter: None,
            count: Some(2),
            cursor: Some("b1/f2".to_string()),
        };
        let a = service.list("tenant-1", None, request.clone()).await.unwrap();
        let b = service.list("tenant-1", None, request).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(vec!["b1/f3", "b1/f4"], names(&a));
    }

    #[tokio::test]
    async fn exact_page_has_no_next() {
        let service = service(&[("b1", "f1", None), ("b1", "f2", None)]).await;
        let response = service
            .list(
                "tenant-1",
                Some("b1"),
                ListRequest {
                    count: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(2, response.items.len());
        assert_eq!(None, response.next);

        assert!(service
            .list(
                "tenant-1",
                None,
                ListRequest {
                    count: Some(0),
                    ..Default::default()
                }
            )
            .await
            .is_err());
    }

    #[tokio::test]
    async fn cron_filters() {
        let service = service(&[("b1", "f1", None), ("b1", "f2", Some("*/5 * * * *")), ("b1", "f3", None)]).await;

        let only = service
            .list(
                "tenant-1",
                None,
                ListRequest {
                    cron_filter: Some(CronFilter::Only),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(vec!["b1/f2"], names(&only));
        assert_eq!("*/5 * * * *", only.items[0].schedule.as_ref().unwrap().cron);

        let exclude = service
            .list(
                "tenant-1",
                None,
                ListRequest {
                    cron_filter: Some(CronFilter::Exclude),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(vec!["b1/f1", "b1/f3"], names(&exclude));
        assert!(exclude.items.iter().all(|x| x.schedule.is_none()));

        let all = service.list("tenant-1", None, ListRequest::default()).await.unwrap();
        assert_eq!(vec!["b1/f1", "b1/f2", "b1/f3"], names(&all));
        assert!(all.items[1].schedule.is_some());
        assert!(all.items[0].schedule.is_none());
    }

    #[tokio::test]
    async fn filters_paginate() {
        let service = service(&[
            ("b1", "f1", Some("* * * * *")),
            ("b1", "f2", None),
            ("b1", "f3", Some("* * * * *")),
            ("b1", "f4", None),
            ("b1", "f5", Some("* * * * *")),
        ])
        .await;

        let first = service
            .list(
                "tenant-1",
                None,
                ListRequest {
                    cron_filter: Some(CronFilter::Exclude),
                    count: Some(1),
                    cursor: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(vec!["b1/f2"], names(&first));
        let second = service
            .list(
                "tenant-1",
                None,
                ListRequest {
                    cron_filter: Some(CronFilter::Exclude),
                    count: Some(1),
                    cursor: first.next,
                },
            )
            .await
            .unwrap();
        assert_eq!(vec!["b1/f4"], names(&second));

        let only = service
            .list(
                "tenant-1",
                None,
                ListRequest {
                    cron_filter: Some(CronFilter::Only),
                    count: Some(2),
                    cursor: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(vec!["b1/f1", "b1/f3"], names(&only));
        assert_eq!(Some("b1/f3".to_string()), only.next);
        let only = service
            .list(
                "tenant-1",
                None,
                ListRequest {
                    cron_filter: Some(CronFilter::Only),
                    count: Some(2),
                    cursor: only.next,
                },
            )
            .await
            .unwrap();
        assert_eq!(vec!["b1/f5"], names(&only));
        assert_eq!(None, only.next);
    }
}
