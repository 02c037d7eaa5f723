//! The batch table: shared state between the ingress endpoint and the
//! scheduler in batch mode, a parallel map to the proxy-mode lease table,
//! populated by pushes from trusted edge routers instead of passively
//! observed DHCPACKs.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use serde::Serialize;

/// One lease event pushed by a batch router. Same shape as `rb_dhcp::Lease`
/// minus `router`/`lease_time_remaining`, which only proxy mode observes.
#[derive(Debug, Clone, Serialize)]
pub struct BatchEntry {
    pub mac: String,
    pub ip: Ipv4Addr,
    pub remote_id: Option<String>,
    /// "0" or "1", forwarded verbatim to the upstream API.
    pub expired: String,
}

pub struct BatchTable {
    inner: Mutex<HashMap<String, BatchEntry>>,
}

impl BatchTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Record a pushed lease event. Last-writer-wins, keyed by MAC, same as
    /// the proxy-mode Lease Table.
    pub fn upsert(&self, mac: String, ip: Ipv4Addr, expired: String, remote_id: Option<String>) {
        let entry = BatchEntry {
            mac: mac.clone(),
            ip,
            remote_id,
            expired,
        };
        self.inner.lock().unwrap().insert(mac, entry);
    }

    /// Snapshot and clear every entry. Unlike the Lease Table's `drain`,
    /// this is the *only* read path for the batch table — there is no
    /// natural-ageing proxy-mode reason to leave entries visible between
    /// cycles.
    pub fn drain(&self) -> Vec<BatchEntry> {
        let mut table = self.inner.lock().unwrap();
        let entries: Vec<BatchEntry> = table.values().cloned().collect();
        table.clear();
        entries
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for BatchTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_then_drain() {
        let table = BatchTable::new();
        table.upsert(
            "aa:bb:cc:dd:ee:ff".to_string(),
            Ipv4Addr::new(10, 0, 0, 5),
            "0".to_string(),
            None,
        );
        let drained = table.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].ip, Ipv4Addr::new(10, 0, 0, 5));
        assert!(table.is_empty());
    }

    #[test]
    fn test_second_push_overwrites_in_place() {
        let table = BatchTable::new();
        table.upsert("aa:bb:cc:dd:ee:ff".to_string(), Ipv4Addr::new(10, 0, 0, 5), "0".to_string(), None);
        table.upsert(
            "aa:bb:cc:dd:ee:ff".to_string(),
            Ipv4Addr::new(10, 0, 0, 6),
            "1".to_string(),
            Some("switch-1".to_string()),
        );
        assert_eq!(table.len(), 1);
        let drained = table.drain();
        assert_eq!(drained[0].ip, Ipv4Addr::new(10, 0, 0, 6));
        assert_eq!(drained[0].expired, "1");
    }

    #[test]
    fn test_drain_is_empty_on_fresh_table() {
        let table = BatchTable::new();
        assert!(table.drain().is_empty());
    }
}
