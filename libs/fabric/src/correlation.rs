//! Matching inbound responses with the callers awaiting them

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use courier_core::CommandResponse;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{Error, Result};

/// Waiters allocated up front by [`CorrelationTable::new`]
pub const DEFAULT_POOL_DEPTH: usize = 10;

#[derive(Debug, Default)]
struct Waiter {
    response: Mutex<Option<CommandResponse>>,
    signal: Notify,
}

#[derive(Debug, Default)]
struct Slots {
    pool: Vec<Arc<Waiter>>,
    live: HashMap<i64, Arc<Waiter>>,
}

/// Pool of reusable waiters keyed by unique key
///
/// The pool and the live map sit behind one lock, so a response racing with
/// [`acquire`](Self::acquire) either finds no entry or the freshly bound one.
/// The lock is never held across I/O or while waiting.
#[derive(Debug)]
pub struct CorrelationTable {
    slots: Mutex<Slots>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::with_pool_depth(DEFAULT_POOL_DEPTH)
    }

    pub fn with_pool_depth(depth: usize) -> Self {
        let pool = (0..depth).map(|_| Arc::new(Waiter::default())).collect();
        Self {
            slots: Mutex::new(Slots {
                pool,
                live: HashMap::new(),
            }),
        }
    }

    /// Bind a waiter to `key`
    ///
    /// The waiter is released when the returned guard is dropped or handed
    /// to [`release`](Self::release).
    pub fn acquire(&self, key: i64) -> Result<PendingResponse<'_>> {
        let mut slots = self.slots.lock();
        if slots.live.contains_key(&key) {
            return Err(Error::DuplicateKey(key));
        }

        let waiter = slots.pool.pop().unwrap_or_default();
        *waiter.response.lock() = None;
        slots.live.insert(key, waiter.clone());

        Ok(PendingResponse {
            table: self,
            key,
            waiter,
        })
    }

    /// Unbind a waiter and return it to the pool
    pub fn release(&self, pending: PendingResponse<'_>) {
        drop(pending);
    }

    fn release_slot(&self, key: i64, waiter: &Arc<Waiter>) {
        let mut slots = self.slots.lock();
        if slots
            .live
            .get(&key)
            .is_some_and(|bound| Arc::ptr_eq(bound, waiter))
        {
            slots.live.remove(&key);
        }
        *waiter.response.lock() = None;
        slots.pool.push(waiter.clone());
    }

    /// Hand a response to the caller waiting on its key
    ///
    /// Returns the response back when nobody is waiting for it, so the
    /// caller can surface it as unsolicited.
    pub fn deliver(&self, response: CommandResponse) -> Option<CommandResponse> {
        let slots = self.slots.lock();
        match slots.live.get(&response.unique_key) {
            Some(waiter) => {
                *waiter.response.lock() = Some(response);
                waiter.signal.notify_one();
                None
            }
            None => Some(response),
        }
    }

    /// Idle waiters in the pool
    pub fn pooled(&self) -> usize {
        self.slots.lock().pool.len()
    }

    /// Keys currently awaiting a response
    pub fn awaiting(&self) -> usize {
        self.slots.lock().live.len()
    }
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

/// A waiter bound to one outstanding key
#[derive(Debug)]
pub struct PendingResponse<'a> {
    table: &'a CorrelationTable,
    key: i64,
    waiter: Arc<Waiter>,
}

impl PendingResponse<'_> {
    pub fn key(&self) -> i64 {
        self.key
    }

    /// Wait until a response for this key is delivered
    pub async fn wait(&self) -> CommandResponse {
        loop {
            let notified = self.waiter.signal.notified();
            if let Some(response) = self.waiter.response.lock().take() {
                return response;
            }
            // A permit left over from an earlier binding wakes us spuriously;
            // the slot check above sends us back to sleep.
            notified.await;
        }
    }

    /// Wait at most `timeout`; `None` means the wait expired
    pub async fn wait_timeout(&self, timeout: Duration) -> Option<CommandResponse> {
        tokio::time::timeout(timeout, self.wait()).await.ok()
    }
}

impl Drop for PendingResponse<'_> {
    fn drop(&mut self) {
        self.table.release_slot(self.key, &self.waiter);
    }
}
