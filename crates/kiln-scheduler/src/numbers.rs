//! Per-builder build numbers.

use futures::future::{BoxFuture, FutureExt};
use futures::{StreamExt, TryStreamExt, stream};
use kiln_core::build::StringPair;
use kiln_core::{Build, BuilderId, Error, Result};
use kiln_db::{Store, sequence_name};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::MAX_CONCURRENCY;
use crate::retry::retry_transient;

pub const BUILD_ADDRESS_KEY: &str = "build_address";

/// Value of the `build_address` tag for a numbered build.
pub fn build_address(builder: &BuilderId, number: u32) -> String {
    format!(
        "kiln.{}.{}/{}/{}",
        builder.project, builder.bucket, builder.builder, number
    )
}

/// Assigns consecutive numbers to `builds`, reserving one range per builder.
///
/// Any builder failing to reserve its range fails the whole call.
pub async fn generate_build_numbers<'a>(
    store: &dyn Store,
    builds: impl IntoIterator<Item = &'a mut Build>,
) -> Result<()> {
    let mut builds: Vec<&mut Build> = builds.into_iter().collect();
    if builds.is_empty() {
        return Ok(());
    }

    let mut counts: BTreeMap<BuilderId, u32> = BTreeMap::new();
    for build in &builds {
        *counts.entry(build.builder.clone()).or_default() += 1;
    }

    let reservations: Vec<BoxFuture<'_, Result<(BuilderId, u32)>>> = counts
        .into_iter()
        .map(|(builder, count)| {
            async move {
                let name = sequence_name(&builder);
                let seq = name.as_str();
                let start = retry_transient("next_sequence", || async move {
                    store.next_sequence(seq, count).await.map_err(Error::from)
                })
                .await
                .map_err(|e| e.annotate(format!("generating build numbers for {builder}")))?;
                debug!(%builder, start, count, "reserved build numbers");
                Ok::<_, Error>((builder, start))
            }
            .boxed()
        })
        .collect();
    let mut next: HashMap<BuilderId, u32> = stream::iter(reservations)
        .buffer_unordered(MAX_CONCURRENCY)
        .try_collect()
        .await?;

    for build in builds.iter_mut() {
        let number = next
            .get_mut(&build.builder)
            .ok_or_else(|| Error::Internal(format!("no sequence for {}", build.builder)))?;
        build.number = Some(*number);
        build.tags.push(StringPair::new(
            BUILD_ADDRESS_KEY,
            build_address(&build.builder, *number),
        ));
        build.tags.sort();
        *number += 1;
    }
    Ok(())
}
