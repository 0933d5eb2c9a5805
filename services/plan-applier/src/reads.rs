//! Blocking reads over the state store.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::instrument;

use fleet_id::DeploymentId;
use fleet_rpc::{blocking_query, BlockingQueryConfig, Paginator, QueryMeta, QueryOptions, RpcError, RpcInfo};
use fleet_structs::{AllocListStub, Allocation, Deployment};

use crate::state::StateStore;

/// Namespace value that lists across every namespace.
pub const ALL_NAMESPACES: &str = "*";

/// Lists allocation stubs one page at a time, newest last unless
/// `opts.reverse` is set. Matches on namespace and ID prefix.
#[instrument(skip(store, config, opts, cancel), fields(namespace = opts.request_namespace()))]
pub async fn list_allocations(
    store: &StateStore,
    config: &BlockingQueryConfig,
    opts: &QueryOptions,
    cancel: watch::Receiver<bool>,
) -> Result<(Vec<AllocListStub>, QueryMeta), RpcError> {
    let namespace = opts.request_namespace();
    let ((stubs, next_token), mut meta) =
        blocking_query(config, store.watch_index(), opts, cancel, || {
            let snapshot = store.snapshot();
            let paginator = Paginator::new(opts)?.with_filter(|alloc: &Arc<Allocation>| {
                (namespace == ALL_NAMESPACES || alloc.namespace == namespace)
                    && alloc.id.as_str().starts_with(&opts.prefix)
            });
            let (page, next_token) = paginator.page(snapshot.allocs().cloned());
            let stubs: Vec<AllocListStub> = page.iter().map(|alloc| alloc.stub()).collect();
            Ok(((stubs, next_token), snapshot.index()))
        })
        .await?;
    meta.next_token = next_token;
    Ok((stubs, meta))
}

/// Looks up a deployment, blocking until it changes past
/// `opts.min_query_index`. A missing deployment is `None`, not an error.
#[instrument(skip(store, config, opts, cancel))]
pub async fn get_deployment(
    store: &StateStore,
    config: &BlockingQueryConfig,
    opts: &QueryOptions,
    id: &DeploymentId,
    cancel: watch::Receiver<bool>,
) -> Result<(Option<Deployment>, QueryMeta), RpcError> {
    blocking_query(config, store.watch_index(), opts, cancel, || {
        let snapshot = store.snapshot();
        let deployment = snapshot.deployment_by_id(id).map(|d| Deployment::clone(d));
        Ok((deployment, snapshot.index()))
    })
    .await
}
