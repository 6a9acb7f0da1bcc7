//! Key layout and the revision-ordered wait shared by elections and mutexes

use crate::context::Context;
use crate::error::{Error, Result};
use crate::store::{Client, GetOptions, Kv, WatchOptions, Watcher};
use crate::types::{LeaseId, ResponseHeader, Revision};
use futures_util::StreamExt;
use tracing::debug;

/// Ensure `prefix` ends with a separator so sibling prefixes don't overlap
pub fn normalize_prefix(prefix: &str) -> String {
    if prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{}/", prefix)
    }
}

/// Candidacy key owned by `lease` under `prefix`
pub fn candidacy_key(prefix: &str, lease: LeaseId) -> String {
    format!("{}{:016x}", prefix, lease)
}

/// Block until `key` is deleted, watching from `rev`
async fn wait_delete(ctx: &Context, client: &dyn Client, key: &str, rev: Revision) -> Result<()> {
    let mut watch = ctx
        .run(client.watch(key, WatchOptions::key().from_revision(rev)))
        .await?;

    loop {
        let batch = tokio::select! {
            err = ctx.done() => return Err(err),
            batch = watch.next() => batch,
        };
        match batch {
            Some(Ok(resp)) => {
                if resp.events.iter().any(|ev| ev.is_delete()) {
                    return Ok(());
                }
            }
            Some(Err(err)) => return Err(err),
            None => return Err(Error::WatchLost),
        }
    }
}

/// Wait until no key under `prefix` has a creation revision at or below
/// `max_create_rev`.
///
/// Only the newest such key is watched at a time; when it goes away the
/// range is read again. A compacted watch falls back to a fresh read.
pub async fn wait_deletes(
    ctx: &Context,
    client: &dyn Client,
    prefix: &str,
    max_create_rev: Revision,
) -> Result<ResponseHeader> {
    let options = GetOptions::prefix()
        .last_create()
        .with_max_create_revision(max_create_rev);

    loop {
        let resp = ctx.run(client.get(prefix, options.clone())).await?;
        let Some(last) = resp.kvs.first() else {
            return Ok(resp.header);
        };

        debug!(
            "Election: Waiting on {} (created at {}) under {}",
            last.key, last.create_revision, prefix
        );
        match wait_delete(ctx, client, &last.key, resp.header.revision).await {
            Ok(()) => {}
            Err(Error::Compacted(rev)) => {
                debug!("Election: Watch compacted at {}, re-reading {}", rev, prefix);
            }
            Err(err) => return Err(err),
        }
    }
}
