use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::store::ProcessStore;

/// An inclusive range of ids reserved from the store's shared counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdBlock {
    pub next: u64,
    pub last: u64,
}

impl IdBlock {
    /// `size` ids starting at `first`. `size` must be positive.
    pub fn new(first: u64, size: u64) -> Self {
        Self {
            next: first,
            last: first + size - 1,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.next > self.last
    }

    pub fn take(&mut self) -> Option<u64> {
        if self.is_exhausted() {
            return None;
        }
        let id = self.next;
        self.next += 1;
        Some(id)
    }
}

/// Hands out ids from a cached block, refilling from the store.
///
/// Refills call `ProcessStore::reserve_id_block` directly, outside any unit
/// of work: a rolled-back command burns its ids but never the counter.
pub struct IdGenerator {
    store: Arc<dyn ProcessStore>,
    block_size: u64,
    block: Mutex<Option<IdBlock>>,
}

impl IdGenerator {
    pub fn new(store: Arc<dyn ProcessStore>, block_size: u64) -> Self {
        Self {
            store,
            block_size: block_size.max(1),
            block: Mutex::new(None),
        }
    }

    pub async fn next_id(&self) -> Result<u64, StoreError> {
        let mut guard = self.block.lock().await;
        if let Some(id) = guard.as_mut().and_then(IdBlock::take) {
            return Ok(id);
        }

        let mut fresh = self.store.reserve_id_block(self.block_size).await?;
        tracing::debug!(
            first = fresh.next,
            last = fresh.last,
            "Reserved id block"
        );
        let id = fresh
            .take()
            .ok_or_else(|| anyhow::anyhow!("store returned an empty id block"))?;
        *guard = Some(fresh);
        Ok(id)
    }
}
