//! Tracks DHCP transaction IDs (XIDs) this relay has forwarded upstream.
//!
//! Membership grants a later server-originated reply (OFFER/ACK/NAK)
//! permission to be relayed back to the client; absence causes a silent
//! drop. XIDs are swept after 60 seconds so the set doesn't grow without
//! bound over the process lifetime.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const SWEEP_AGE: Duration = Duration::from_secs(60);

pub struct TransactionSet {
    inner: Mutex<HashMap<u32, Instant>>,
}

impl TransactionSet {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Record that `xid` was forwarded upstream just now.
    pub fn insert(&self, xid: u32) {
        self.inner.lock().unwrap().insert(xid, Instant::now());
    }

    /// Whether `xid` is a transaction this relay is currently tracking.
    pub fn contains(&self, xid: u32) -> bool {
        self.inner.lock().unwrap().contains_key(&xid)
    }

    /// Remove entries older than `SWEEP_AGE`. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.len();
        inner.retain(|_, inserted_at| inserted_at.elapsed() < SWEEP_AGE);
        before - inner.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TransactionSet {
    fn default() -> Self {
        Self::new()
    }
}
