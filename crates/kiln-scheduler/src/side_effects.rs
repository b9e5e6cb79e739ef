//! Batch-wide side effects of scheduling.
//!
//! These run after ids and numbers are assigned and before any build is
//! committed. A failure of any of them fails the whole schedule call.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln_core::build::StringPair;
use kiln_core::{Build, BuildId, BuilderId, Error, Result};
use kiln_db::Store;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::numbers::BUILD_ADDRESS_KEY;

/// Tag keys with an index entry.
const INDEXED_TAG_KEYS: &[&str] = &["buildset", BUILD_ADDRESS_KEY];

/// Creates invocations in the external result service.
#[async_trait]
pub trait InvocationService: Send + Sync {
    /// Returns the invocation name for each build.
    async fn create_invocations(
        &self,
        host: &str,
        builds: &[Build],
    ) -> Result<HashMap<BuildId, String>>;
}

/// Names invocations after their builds without calling out anywhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalInvocations;

#[async_trait]
impl InvocationService for LocalInvocations {
    async fn create_invocations(
        &self,
        _host: &str,
        builds: &[Build],
    ) -> Result<HashMap<BuildId, String>> {
        Ok(builds
            .iter()
            .map(|b| (b.id, format!("invocations/build-{}", b.id)))
            .collect())
    }
}

pub(crate) async fn run(
    store: &dyn Store,
    invocations: &dyn InvocationService,
    result_store_host: &str,
    builds: &mut [Build],
    now: DateTime<Utc>,
) -> Result<()> {
    let builders: Vec<BuilderId> = builds
        .iter()
        .map(|b| b.builder.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let tags: Vec<(StringPair, BuildId)> = builds
        .iter()
        .flat_map(|b| {
            b.tags
                .iter()
                .filter(|t| INDEXED_TAG_KEYS.contains(&t.key.as_str()))
                .map(|t| (t.clone(), b.id))
        })
        .collect();

    let shared: &[Build] = builds;
    let stats = async {
        store
            .update_builder_stats(&builders, now)
            .await
            .map_err(|e| Error::from(e).annotate("updating builder stats"))
    };
    let invocation_names = async {
        if result_store_host.is_empty() {
            return Ok(HashMap::new());
        }
        invocations
            .create_invocations(result_store_host, shared)
            .await
            .map_err(|e| e.annotate("creating invocations"))
    };
    let index = async {
        if tags.is_empty() {
            return Ok(());
        }
        store
            .index_tags(&tags)
            .await
            .map_err(|e| Error::from(e).annotate("updating tag index"))
    };

    let ((), mut names, ()) = tokio::try_join!(stats, invocation_names, index)?;
    debug!(
        builders = builders.len(),
        tags = tags.len(),
        invocations = names.len(),
        "batch side effects done"
    );

    for build in builds.iter_mut() {
        if let Some(name) = names.remove(&build.id) {
            build.infra.result_store.invocation = name;
        }
    }
    Ok(())
}
