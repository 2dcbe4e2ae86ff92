//! Weighted routing of new instances across workflow refs.

use rand::Rng;
use uuid::Uuid;

use direktiv_core::catalog::{RouteRecord, LATEST_REF};
use direktiv_core::error::{DirektivError, Result};

use super::Engine;
use crate::bus::handlers;

/// Pick a ref from `routes`, where `roll` is in `0..total weight`.
fn weighted_pick(routes: &[RouteRecord], roll: u64) -> Option<&str> {
    let mut acc = 0u64;
    for route in routes {
        acc += u64::from(route.weight);
        if roll < acc {
            return Some(&route.ref_name);
        }
    }
    None
}

impl Engine {
    /// Ref a new instance of `workflow_id` runs when none was requested.
    pub(crate) async fn pick_route(&self, workflow_id: Uuid) -> Result<String> {
        let cached = self
            .inner
            .routes
            .lock()
            .map_err(|_| DirektivError::internal("route cache poisoned"))?
            .get(&workflow_id)
            .cloned();

        let routes = match cached {
            Some(routes) => routes,
            None => {
                let routes = self.inner.store.list_routes(workflow_id).await?;
                self.inner
                    .routes
                    .lock()
                    .map_err(|_| DirektivError::internal("route cache poisoned"))?
                    .insert(workflow_id, routes.clone());
                routes
            }
        };

        let total: u64 = routes.iter().map(|r| u64::from(r.weight)).sum();
        if total == 0 {
            return Ok(LATEST_REF.to_string());
        }
        let roll = rand::thread_rng().gen_range(0..total);
        Ok(weighted_pick(&routes, roll)
            .unwrap_or(LATEST_REF)
            .to_string())
    }

    pub(crate) fn invalidate_routes(&self, workflow_id: Uuid) {
        if let Ok(mut routes) = self.inner.routes.lock() {
            if routes.remove(&workflow_id).is_some() {
                tracing::debug!(workflow = %workflow_id, "Route cache invalidated");
            }
        }
    }

    /// Replace the routes of a workflow and tell every replica to reload them.
    pub async fn set_routes(&self, workflow_id: Uuid, routes: Vec<RouteRecord>) -> Result<()> {
        self.inner.store.set_routes(workflow_id, &routes).await?;
        self.invalidate_routes(workflow_id);
        self.inner
            .bus
            .publish(handlers::CONFIGURE_ROUTER, &workflow_id.to_string());
        tracing::info!(workflow = %workflow_id, routes = routes.len(), "Routes configured");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(name: &str, weight: u32) -> RouteRecord {
        RouteRecord {
            workflow_id: Uuid::nil(),
            ref_name: name.into(),
            weight,
        }
    }

    #[test]
    fn test_weighted_pick_boundaries() {
        let routes = vec![route("v1", 3), route("v2", 1)];
        assert_eq!(weighted_pick(&routes, 0), Some("v1"));
        assert_eq!(weighted_pick(&routes, 2), Some("v1"));
        assert_eq!(weighted_pick(&routes, 3), Some("v2"));
        assert_eq!(weighted_pick(&routes, 4), None);
    }

    #[test]
    fn test_zero_weight_is_never_picked() {
        let routes = vec![route("off", 0), route("on", 2)];
        for roll in 0..2 {
            assert_eq!(weighted_pick(&routes, roll), Some("on"));
        }
    }
}
