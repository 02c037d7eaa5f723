//! The lease table the relay learns passively from DHCPACKs it forwards.
//!
//! Unlike an authoritative server's pool, this table never grants or denies
//! an address; it just mirrors what the real upstream server decided, so it
//! can later be reported upstream in batch form. A single lock guards the
//! whole map — there is no independent read path outside the scheduler's
//! snapshot, which also takes the lock exclusively.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::options::{DhcpOption, OPT_ROUTER, RAI_SUBOPT_CIRCUIT_ID, RAI_SUBOPT_REMOTE_ID};

const TRIM_STEP_SECS: u32 = 10;

/// A single learned lease, keyed externally by the client's MAC address.
#[derive(Debug, Clone, Serialize)]
pub struct Lease {
    pub mac: String,
    pub ip: Ipv4Addr,
    pub router: Option<Ipv4Addr>,
    pub circuit_id: Option<String>,
    pub remote_id: Option<String>,
    pub lease_time_remaining: u32,
    pub created_at: u64,
    /// "0" or "1", kept as a string for upstream API compatibility.
    pub expired: String,
}

pub struct LeaseTable {
    inner: Mutex<HashMap<String, Lease>>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Record a freshly-acknowledged lease. A second ACK for the same MAC
    /// overwrites the entry in place and resets `created_at`.
    pub fn upsert(
        &self,
        mac: &str,
        ip: Ipv4Addr,
        lease_time: u32,
        options: &[DhcpOption],
    ) {
        let router = options
            .iter()
            .find(|o| o.code == OPT_ROUTER)
            .and_then(|o| o.as_ipv4());
        let (circuit_id, remote_id) = parse_option82(options);

        let lease = Lease {
            mac: mac.to_string(),
            ip,
            router,
            circuit_id,
            remote_id,
            lease_time_remaining: lease_time,
            created_at: now_unix(),
            expired: "0".to_string(),
        };

        self.inner.lock().unwrap().insert(mac.to_string(), lease);
    }

    /// Mark a lease expired immediately, e.g. on an explicit RELEASE or
    /// DECLINE. Leases that were never learned are silently ignored.
    pub fn mark_expired(&self, mac: &str) {
        if let Some(lease) = self.inner.lock().unwrap().get_mut(mac) {
            lease.lease_time_remaining = 0;
            lease.expired = "1".to_string();
        }
    }

    /// Decrement every non-expired lease's remaining time by one trim step.
    /// Entries are never deleted here — only the scheduler drain removes
    /// them (and only in batch mode).
    pub fn trim(&self) {
        let mut table = self.inner.lock().unwrap();
        for lease in table.values_mut() {
            if lease.expired == "1" {
                continue;
            }
            if lease.lease_time_remaining < TRIM_STEP_SECS {
                lease.lease_time_remaining = 0;
                lease.expired = "1".to_string();
            } else {
                lease.lease_time_remaining -= TRIM_STEP_SECS;
            }
        }
    }

    /// Snapshot all leases for proxy-mode reporting without removing them;
    /// the table keeps accumulating trim decrements across cycles.
    pub fn snapshot(&self) -> Vec<Lease> {
        self.inner.lock().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LeaseTable {
    fn default() -> Self {
        Self::new()
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Parse RFC 3046 Option 82 (Relay Agent Information) sub-options out of a
/// packet's option list, returning `(circuit_id, remote_id)`.
///
/// Sub-options are TLV-encoded (`[code][len][value...]`) inside the Option
/// 82 payload. Each sub-option is bounds-checked individually; if a
/// declared length would run past the end of the payload, the rest of the
/// option is skipped rather than treated as a reason to drop the packet.
pub fn parse_option82(options: &[DhcpOption]) -> (Option<String>, Option<String>) {
    let Some(opt) = options.iter().find(|o| o.code == crate::options::OPT_RELAY_AGENT_INFO) else {
        return (None, None);
    };
    if opt.data.len() <= 2 {
        return (None, None);
    }

    let mut circuit_id = None;
    let mut remote_id = None;
    let data = &opt.data;
    let mut i = 0;

    while i + 2 <= data.len() {
        let subcode = data[i];
        let sublen = data[i + 1] as usize;
        let start = i + 2;
        let end = start + sublen;
        if end > data.len() {
            break;
        }

        let value = &data[start..end];
        match subcode {
            RAI_SUBOPT_CIRCUIT_ID => circuit_id = Some(bytes_to_display_string(value)),
            RAI_SUBOPT_REMOTE_ID => remote_id = Some(bytes_to_display_string(value)),
            _ => {}
        }

        i = end;
    }

    (circuit_id, remote_id)
}

fn bytes_to_display_string(value: &[u8]) -> String {
    String::from_utf8(value.to_vec()).unwrap_or_else(|_| {
        value.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join("")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::DhcpOption;

    fn option82(circuit_id: &[u8], remote_id: &[u8]) -> DhcpOption {
        let mut data = Vec::new();
        data.push(RAI_SUBOPT_CIRCUIT_ID);
        data.push(circuit_id.len() as u8);
        data.extend_from_slice(circuit_id);
        data.push(RAI_SUBOPT_REMOTE_ID);
        data.push(remote_id.len() as u8);
        data.extend_from_slice(remote_id);
        DhcpOption::new(crate::options::OPT_RELAY_AGENT_INFO, data)
    }

    #[test]
    fn test_upsert_then_snapshot() {
        let table = LeaseTable::new();
        table.upsert("aa:bb:cc:dd:ee:ff", Ipv4Addr::new(10, 0, 0, 5), 3600, &[]);
        let snap = table.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].ip, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(snap[0].expired, "0");
    }

    #[test]
    fn test_second_ack_overwrites_in_place() {
        let table = LeaseTable::new();
        table.upsert("aa:bb:cc:dd:ee:ff", Ipv4Addr::new(10, 0, 0, 5), 3600, &[]);
        table.upsert("aa:bb:cc:dd:ee:ff", Ipv4Addr::new(10, 0, 0, 6), 7200, &[]);
        assert_eq!(table.len(), 1);
        let snap = table.snapshot();
        assert_eq!(snap[0].ip, Ipv4Addr::new(10, 0, 0, 6));
        assert_eq!(snap[0].lease_time_remaining, 7200);
    }

    #[test]
    fn test_trim_decrements_then_expires() {
        let table = LeaseTable::new();
        table.upsert("aa:bb:cc:dd:ee:ff", Ipv4Addr::new(10, 0, 0, 5), 15, &[]);
        table.trim();
        assert_eq!(table.snapshot()[0].lease_time_remaining, 5);
        assert_eq!(table.snapshot()[0].expired, "0");
        table.trim();
        let snap = table.snapshot();
        assert_eq!(snap[0].lease_time_remaining, 0);
        assert_eq!(snap[0].expired, "1");
    }

    #[test]
    fn test_trim_never_touches_already_expired() {
        let table = LeaseTable::new();
        table.upsert("aa:bb:cc:dd:ee:ff", Ipv4Addr::new(10, 0, 0, 5), 0, &[]);
        table.trim();
        assert_eq!(table.snapshot()[0].expired, "1");
        table.trim();
        assert_eq!(table.snapshot()[0].lease_time_remaining, 0);
    }

    #[test]
    fn test_snapshot_does_not_clear_table() {
        let table = LeaseTable::new();
        table.upsert("aa:bb:cc:dd:ee:ff", Ipv4Addr::new(10, 0, 0, 5), 3600, &[]);
        let _ = table.snapshot();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_parse_option82_extracts_both_suboptions() {
        let opts = vec![option82(b"eth0/1", b"switch-42")];
        let (cid, rid) = parse_option82(&opts);
        assert_eq!(cid.as_deref(), Some("eth0/1"));
        assert_eq!(rid.as_deref(), Some("switch-42"));
    }

    #[test]
    fn test_parse_option82_missing_option_returns_none() {
        let (cid, rid) = parse_option82(&[]);
        assert!(cid.is_none());
        assert!(rid.is_none());
    }

    #[test]
    fn test_parse_option82_truncated_suboption_stops_without_panic() {
        // Declares a sub-option of length 20 but only 2 bytes actually follow.
        let opt = DhcpOption::new(crate::options::OPT_RELAY_AGENT_INFO, vec![RAI_SUBOPT_CIRCUIT_ID, 20, 1, 2]);
        let (cid, rid) = parse_option82(&[opt]);
        assert!(cid.is_none());
        assert!(rid.is_none());
    }

    #[test]
    fn test_mark_expired() {
        let table = LeaseTable::new();
        table.upsert("aa:bb:cc:dd:ee:ff", Ipv4Addr::new(10, 0, 0, 5), 3600, &[]);
        table.mark_expired("aa:bb:cc:dd:ee:ff");
        let snap = table.snapshot();
        assert_eq!(snap[0].expired, "1");
        assert_eq!(snap[0].lease_time_remaining, 0);
    }
}
