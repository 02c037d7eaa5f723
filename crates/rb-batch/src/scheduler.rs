//! Batch scheduler: periodically drains the batch-mode lease table (or,
//! in proxy mode, snapshots the DHCP Lease Table without clearing it) and
//! fires an upstream POST to the configured Sonar instance.
//!
//! A plain ticker loop, a fire-and-forget dispatch task per cycle, and no
//! retry beyond a logged failure.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use rb_common::config::SonarConfig;
use rb_dhcp::Lease;

const DEFAULT_CYCLE_SECS: u64 = 15;
const SONAR_V1_PATH: &str = "/api/v1/network/ipam/batch_dynamic_ip_assignment";

/// One entry in the upstream POST body. Field names and JSON tags are
/// fixed by the upstream API contract.
#[derive(Debug, Serialize)]
pub struct Assignment {
    pub expired: String,
    pub ip_address: String,
    pub mac_address: String,
    pub remote_id: String,
}

#[derive(Debug, Serialize)]
struct BatchPayload {
    data: Vec<Assignment>,
}

impl From<&Lease> for Assignment {
    fn from(lease: &Lease) -> Self {
        Assignment {
            expired: lease.expired.clone(),
            ip_address: lease.ip.to_string(),
            mac_address: lease.mac.clone(),
            remote_id: lease.remote_id.clone().unwrap_or_default(),
        }
    }
}

impl From<&crate::table::BatchEntry> for Assignment {
    fn from(entry: &crate::table::BatchEntry) -> Self {
        Assignment {
            expired: entry.expired.clone(),
            ip_address: entry.ip.to_string(),
            mac_address: entry.mac.clone(),
            remote_id: entry.remote_id.clone().unwrap_or_default(),
        }
    }
}

/// Source of assignments for one scheduler cycle: either a draining batch
/// table (batch mode) or a non-clearing lease table snapshot (proxy mode).
pub enum AssignmentSource {
    Batch(Arc<crate::table::BatchTable>),
    Proxy(Arc<rb_dhcp::LeaseTable>),
}

impl AssignmentSource {
    fn collect(&self) -> Vec<Assignment> {
        match self {
            AssignmentSource::Batch(table) => table.drain().iter().map(Assignment::from).collect(),
            AssignmentSource::Proxy(table) => table.snapshot().iter().map(Assignment::from).collect(),
        }
    }
}

fn cycle_duration(cycle_time_minutes: u64) -> Duration {
    if cycle_time_minutes == 0 {
        Duration::from_secs(DEFAULT_CYCLE_SECS)
    } else {
        Duration::from_secs(cycle_time_minutes * 60)
    }
}

/// Run the scheduler loop until `shutdown` fires. Each cycle collects
/// assignments from `source`, and if non-empty, spawns a fire-and-forget
/// dispatch to the Sonar instance.
pub async fn run(
    source: AssignmentSource,
    sonar: SonarConfig,
    cycle_time_minutes: u64,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    let interval = cycle_duration(cycle_time_minutes);
    info!("batch scheduler: cycle time {:?}", interval);

    let client = Client::new();
    let mut cycle_id: u64 = 0;
    let mut skipped: u64 = 0;

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("batch scheduler: shutting down");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        let assignments = source.collect();
        if assignments.is_empty() {
            skipped += 1;
            debug!("batch scheduler: cycle empty, skipped={}", skipped);
            continue;
        }

        cycle_id += 1;
        let count = assignments.len();
        let client = client.clone();
        let sonar = sonar.clone();
        tokio::spawn(async move {
            dispatch(&client, &sonar, assignments).await;
        });
        debug!("batch scheduler: cycle {} dispatched {} assignment(s)", cycle_id, count);
    }
}

/// POST one batch to the upstream API. Only version 1 has a defined wire
/// format; version 2 is accepted at config time but dispatch is a no-op.
async fn dispatch(client: &Client, sonar: &SonarConfig, assignments: Vec<Assignment>) {
    if sonar.version != 1 {
        debug!("batch scheduler: sonar_version {} has no defined batch endpoint, skipping dispatch", sonar.version);
        return;
    }

    let url = format!("https://{}{}", sonar.instance_name, SONAR_V1_PATH);
    let payload = BatchPayload { data: assignments };

    let result = client
        .post(&url)
        .basic_auth(&sonar.api_username, Some(&sonar.api_key))
        .header("Content-Type", "application/json")
        .json(&payload)
        .send()
        .await;

    match result {
        Ok(response) => {
            let status = response.status();
            match response.text().await {
                Ok(body) => debug!("batch scheduler: upstream responded {}: {}", status, body),
                Err(e) => debug!("batch scheduler: upstream responded {} (body unreadable: {})", status, e),
            }
            if !status.is_success() {
                warn!("batch scheduler: upstream rejected batch with status {}", status);
            }
        }
        Err(e) => error!("batch scheduler: upstream dispatch failed: {}", e),
    }
}
