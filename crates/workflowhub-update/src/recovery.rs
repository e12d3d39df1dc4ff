//! Last-resort recovery for a page stuck on a broken worker or stale cache.

use tracing::info;
use workflowhub_sw::{
    reset_offline_state, CacheStore, ResetReport, ScriptSource, ServiceWorkerContainer,
    WorkerScript,
};

use crate::coordinator::PageHost;

/// Wipe every cache and registration, then reload the page so it starts
/// from the network.
pub async fn reset_and_reload<S, L, C, P>(
    container: &ServiceWorkerContainer<S, L>,
    caches: &C,
    page: &P,
) -> ResetReport
where
    S: WorkerScript,
    L: ScriptSource<S>,
    C: CacheStore,
    P: PageHost,
{
    let report = reset_offline_state(container, caches).await;
    info!(
        caches = report.caches_deleted.len(),
        registrations = report.unregistered.len(),
        "Offline state cleared, reloading"
    );
    page.reload();
    report
}
