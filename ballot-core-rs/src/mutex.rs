//! Distributed mutex on a key prefix.
//!
//! Same ordering as elections: each holder writes an empty key under the
//! session lease and owns the lock once it is the oldest key under the
//! prefix.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::key::{candidacy_key, normalize_prefix, wait_deletes};
use crate::session::Session;
use crate::store::{Compare, CompareOp, GetOptions, Kv, Op, Txn, TxnResponse};
use crate::types::{ResponseHeader, Revision};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Mutex {
    session: Arc<Session>,
    prefix: String,
    my_key: Option<String>,
    my_rev: Revision,
    header: Option<ResponseHeader>,
}

impl Mutex {
    pub fn new(session: Arc<Session>, prefix: &str) -> Self {
        Self {
            session,
            prefix: normalize_prefix(prefix),
            my_key: None,
            my_rev: 0,
            header: None,
        }
    }

    /// Acquire the lock, waiting for every older holder to release.
    ///
    /// If the wait fails the key is released before the error is returned.
    /// A key that vanished while waiting means the session expired.
    pub async fn lock(&mut self, ctx: &Context) -> Result<()> {
        let resp = self.try_acquire(ctx).await?;
        if self.owns(&resp) {
            self.header = Some(resp.header);
            info!("Mutex: Locked {}", self.prefix);
            return Ok(());
        }

        let client = self.session.client().clone();
        if let Err(e) = wait_deletes(ctx, &*client, &self.prefix, self.my_rev - 1).await {
            debug!("Mutex: Wait on {} failed: {}", self.prefix, e);
            let release = self.session.ctx().clone();
            if let Err(unlock_err) = self.unlock(&release).await {
                warn!("Mutex: Failed to release {}: {}", self.prefix, unlock_err);
            }
            return Err(e);
        }

        let Some(key) = self.my_key.clone() else {
            return Err(Error::SessionExpired);
        };
        let resp = match ctx.run(client.get(&key, GetOptions::key())).await {
            Ok(resp) => resp,
            Err(e) => {
                let release = self.session.ctx().clone();
                if let Err(unlock_err) = self.unlock(&release).await {
                    warn!("Mutex: Failed to release {}: {}", self.prefix, unlock_err);
                }
                return Err(e);
            }
        };
        if resp.kvs.is_empty() {
            warn!("Mutex: Key {} gone while waiting, session expired", key);
            return Err(Error::SessionExpired);
        }

        self.header = Some(resp.header);
        info!("Mutex: Locked {}", self.prefix);
        Ok(())
    }

    /// Acquire the lock only if nobody holds it; otherwise `Error::Locked`
    pub async fn try_lock(&mut self, ctx: &Context) -> Result<()> {
        let resp = self.try_acquire(ctx).await?;
        if self.owns(&resp) {
            self.header = Some(resp.header);
            return Ok(());
        }

        // Keep the key recorded until it is really gone so unlock can retry
        self.unlock(ctx).await?;
        Err(Error::Locked)
    }

    pub async fn unlock(&mut self, ctx: &Context) -> Result<()> {
        if let Some(key) = &self.my_key {
            ctx.run(self.session.client().delete(key, false)).await?;
            debug!("Mutex: Unlocked {}", self.prefix);
        }
        self.my_key = None;
        self.my_rev = 0;
        Ok(())
    }

    /// Guard that holds only while this mutex still owns its key.
    ///
    /// Without a key the guard compares the prefix against a negative
    /// revision, which no key can have.
    pub fn is_owner(&self) -> Compare {
        match &self.my_key {
            Some(key) => Compare::create_revision(key, CompareOp::Equal, self.my_rev),
            None => Compare::create_revision(&self.prefix, CompareOp::Less, 0),
        }
    }

    pub fn key(&self) -> Option<&str> {
        self.my_key.as_deref()
    }

    pub fn header(&self) -> Option<&ResponseHeader> {
        self.header.as_ref()
    }

    /// Write our key if missing and read the current owner in the same txn
    async fn try_acquire(&mut self, ctx: &Context) -> Result<TxnResponse> {
        let lease = self.session.lease();
        let key = candidacy_key(&self.prefix, lease);
        let owner = Op::get(&self.prefix, GetOptions::prefix().first_create());

        let txn = Txn::new()
            .when([Compare::create_revision(&key, CompareOp::Equal, 0)])
            .and_then([Op::put(&key, Vec::new(), lease), owner.clone()])
            .or_else([Op::get(&key, GetOptions::key()), owner]);
        let resp = ctx.run(self.session.client().txn(txn)).await?;

        self.my_rev = if resp.succeeded {
            resp.header.revision
        } else {
            resp.range(0)
                .and_then(|r| r.kvs.first())
                .map_or(resp.header.revision, |kv| kv.create_revision)
        };
        self.my_key = Some(key);
        Ok(resp)
    }

    fn owns(&self, resp: &TxnResponse) -> bool {
        match resp.range(1).and_then(|r| r.kvs.first()) {
            Some(owner) => owner.create_revision == self.my_rev,
            None => true,
        }
    }
}

impl std::fmt::Debug for Mutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutex")
            .field("prefix", &self.prefix)
            .field("key", &self.my_key)
            .field("rev", &self.my_rev)
            .finish()
    }
}
