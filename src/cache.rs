use std::collections::HashMap;

use log::{debug, warn};

use crate::error::{Error, Result};

/// Key separating interleaved forward/backward pairs on one module.
pub type MicroBatchId = usize;

pub const DEFAULT_MUBATCH: MicroBatchId = 0;

/// Per-micro-batch state a layer keeps between `forward` and `backward`.
///
/// Entries are single-use: `forward` inserts, `backward` takes. Taking an
/// entry removes it, so a finished micro-batch leaves nothing behind.
#[derive(Debug)]
pub struct ActivationCache<C> {
    owner: &'static str,
    entries: HashMap<MicroBatchId, C>,
}

impl<C> ActivationCache<C> {
    /// `owner` names the layer in logs and errors.
    pub fn new(owner: &'static str) -> Self {
        Self {
            owner,
            entries: HashMap::new(),
        }
    }

    /// Stores `state` for `mubatch_id`, returning any entry that was never consumed.
    pub fn insert(&mut self, mubatch_id: MicroBatchId, state: C) -> Option<C> {
        let stale = self.entries.insert(mubatch_id, state);
        if stale.is_some() {
            warn!(
                "{}: overwriting unconsumed cache entry for micro-batch {}",
                self.owner, mubatch_id
            );
        } else {
            debug!("{}: cached micro-batch {}", self.owner, mubatch_id);
        }
        stale
    }

    pub fn take(&mut self, mubatch_id: MicroBatchId) -> Result<C> {
        let state = self
            .entries
            .remove(&mubatch_id)
            .ok_or_else(|| self.missing(mubatch_id))?;
        debug!("{}: consumed micro-batch {}", self.owner, mubatch_id);
        Ok(state)
    }

    /// Looks at an entry without consuming it, so a rejected backward can be retried.
    pub fn require(&self, mubatch_id: MicroBatchId) -> Result<&C> {
        self.entries
            .get(&mubatch_id)
            .ok_or_else(|| self.missing(mubatch_id))
    }

    pub fn get(&self, mubatch_id: MicroBatchId) -> Option<&C> {
        self.entries.get(&mubatch_id)
    }

    /// Drops the entry for an abandoned micro-batch. Returns whether one existed.
    pub fn discard(&mut self, mubatch_id: MicroBatchId) -> bool {
        let existed = self.entries.remove(&mubatch_id).is_some();
        if existed {
            debug!("{}: discarded micro-batch {}", self.owner, mubatch_id);
        }
        existed
    }

    pub fn contains(&self, mubatch_id: MicroBatchId) -> bool {
        self.entries.contains_key(&mubatch_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            debug!("{}: dropping {} cache entries", self.owner, self.entries.len());
        }
        self.entries.clear();
    }

    fn missing(&self, mubatch_id: MicroBatchId) -> Error {
        Error::MissingCache {
            module: self.owner.to_string(),
            mubatch_id,
        }
    }
}
