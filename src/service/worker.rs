use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use log::{error, info, warn};
use tokio::task::JoinHandle;

use super::ServiceContext;
use crate::infer::PathVectorBuilder;
use crate::store::{event_tag, result_key};
use crate::Asn;

/// Spawn the inference workers consuming `procqueue:<tag>`. Each worker
/// registers on the queue's listener counter for its lifetime.
pub(super) fn spawn_workers(
    ctx: &Arc<ServiceContext>,
    tag: &str,
    count: usize,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|id| {
            let ctx = Arc::clone(ctx);
            let tag = tag.to_string();
            tokio::spawn(async move { run(ctx, tag, id).await })
        })
        .collect()
}

async fn run(ctx: Arc<ServiceContext>, tag: String, worker_id: usize) {
    let queue = match ctx.store.queue(&tag) {
        Some(queue) => Arc::clone(queue),
        None => {
            error!("No processing queue for tag '{}'; worker exiting", tag);
            return;
        }
    };
    let _listening = queue.subscribe();

    let tags = vec![tag.clone()];
    let tag_key = result_key(&tags);
    // Load the link structure once, outside the processing loop.
    let links = ctx.store.composite_links(&tags);
    info!(
        "Inferrer {} for '{}' ready with {} linked ASes",
        worker_id,
        tag,
        links.len()
    );

    loop {
        let dest = queue.next().await;
        let started = Instant::now();

        if ctx.store.result_exists(&tag_key, &dest).await {
            // Left over from a previous run; just wake any waiters.
            ctx.store.publish(event_tag(&tag, &dest));
            continue;
        }

        let seeds = ctx.store.seeds_for(&tags, &dest);
        if seeds.is_empty() {
            warn!("No known routes to {}", dest);
        } else {
            info!(
                "{}/{} ASes have sure paths to {}",
                seeds.len(),
                links.len(),
                dest
            );
        }

        let mut builder = PathVectorBuilder::new(&links, &ctx.store.relations);
        let inferred = builder.infer(seeds);
        let rendered: BTreeMap<Asn, String> = inferred
            .iter()
            .map(|(src, path)| (src.clone(), path.render()))
            .collect();

        ctx.store.write_results(&tag_key, &dest, rendered).await;
        ctx.store.publish(event_tag(&tag, &dest));
        info!(
            "Done. Inferred routes to {} for {} sources. Took {:?}.",
            dest,
            inferred.len(),
            started.elapsed()
        );
    }
}
