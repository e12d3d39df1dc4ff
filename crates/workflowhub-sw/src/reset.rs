//! Recovery path: wipe every cache and registration for the origin.

use futures::future::join_all;
use tracing::{info, warn};

use crate::cache::CacheStore;
use crate::registration::{ScriptSource, ServiceWorkerContainer};
use crate::worker::WorkerScript;

/// What a reset managed to remove.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResetReport {
    pub caches_deleted: Vec<String>,
    pub caches_failed: Vec<(String, String)>,
    pub unregistered: Vec<String>,
}

/// Delete all caches and unregister all registrations.
///
/// Best effort: failures are logged and reported, never returned.
pub async fn reset_offline_state<S, L, C>(
    container: &ServiceWorkerContainer<S, L>,
    caches: &C,
) -> ResetReport
where
    S: WorkerScript,
    L: ScriptSource<S>,
    C: CacheStore,
{
    let mut report = ResetReport::default();

    match caches.cache_names().await {
        Ok(names) => {
            let results = join_all(names.into_iter().map(|name| async move {
                let result = caches.delete_cache(&name).await;
                (name, result)
            }))
            .await;
            for (name, result) in results {
                match result {
                    Ok(_) => report.caches_deleted.push(name),
                    Err(e) => {
                        warn!(cache = %name, error = %e, "Reset could not delete cache");
                        report.caches_failed.push((name, e.to_string()));
                    }
                }
            }
        }
        Err(e) => warn!(error = %e, "Reset could not list caches"),
    }

    for scope in container.get_registrations().await {
        if container.unregister(&scope).await {
            report.unregistered.push(scope);
        }
    }

    info!(
        deleted = report.caches_deleted.len(),
        failed = report.caches_failed.len(),
        unregistered = report.unregistered.len(),
        "Offline state reset"
    );
    report
}
