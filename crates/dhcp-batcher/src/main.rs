use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use rb_batch::endpoint::{self, BatchEndpointState};
use rb_batch::table::BatchTable;
use rb_batch::{scheduler, AssignmentSource};
use rb_common::config::{OperationMode, ProgramConfig};
use rb_common::shutdown::Shutdown;
use rb_dhcp::listener::InterfacePair;
use rb_dhcp::server::ProxyRuntime;
use rb_dhcp::{LeaseTable, TransactionSet};

const DEFAULT_CONFIG_PATH: &str = "./conf/dhcp-batcher.yaml";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const LEASE_TRIM_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = parse_args();

    let mut config = match ProgramConfig::load_from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("config error: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("config error: {e}");
        std::process::exit(1);
    }

    rb_common::logging::init_logging(&config.logging);

    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    info!("dhcp-batcher starting in {:?} mode", config.operation_mode);

    let shutdown = Shutdown::new();
    shutdown.listen_for_sigint();

    match config.operation_mode {
        OperationMode::Proxy => run_proxy_mode(&config, &shutdown).await?,
        OperationMode::Batch => run_batch_mode(&config, &shutdown).await?,
    }

    let mut main_rx = shutdown.subscribe();
    let _ = main_rx.recv().await;
    info!("shutdown signal received, waiting up to {:?} for tasks to finish", SHUTDOWN_GRACE);
    tokio::time::sleep(SHUTDOWN_GRACE).await;

    info!("dhcp-batcher exiting");
    Ok(())
}

/// Scans argv for the documented command-line flags. `--configurator` and
/// `--loadyaml` select an interactive config TUI this build doesn't have,
/// so they're accepted and logged rather than rejected as unknown flags.
fn parse_args() -> PathBuf {
    let mut config_path = PathBuf::from(DEFAULT_CONFIG_PATH);
    let args: Vec<String> = std::env::args().collect();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--configurator" | "--loadyaml" => {
                eprintln!("warning: {} is not supported by this build, ignoring", args[i]);
            }
            "--config" => {
                if let Some(path) = args.get(i + 1) {
                    config_path = PathBuf::from(path);
                    i += 1;
                }
            }
            "--logging_mode" | "--logging_output" => {
                // Handled from the config file; accepted here only so the
                // process doesn't fail when invoked with these flags.
                i += 1;
            }
            _ => {}
        }
        i += 1;
    }

    config_path
}

async fn run_proxy_mode(config: &ProgramConfig, shutdown: &Shutdown) -> anyhow::Result<()> {
    let proxy = &config.proxy;

    let proxy_server_ip: Ipv4Addr = proxy.proxy_server_ip.parse()?;
    let upstream_dhcp_servers: Vec<Ipv4Addr> = proxy
        .upstream_dhcp_ips
        .iter()
        .map(|s| s.parse())
        .collect::<Result<_, _>>()?;

    let interfaces = InterfacePair::resolve(&proxy.upstream_interface, &proxy.downstream_interface)?;

    let leases = Arc::new(LeaseTable::new());
    let transactions = Arc::new(TransactionSet::new());

    let runtime = Arc::new(ProxyRuntime {
        proxy_server_ip,
        upstream_dhcp_servers,
        interfaces,
    });

    tokio::spawn(rb_dhcp::server::run(
        runtime,
        leases.clone(),
        transactions.clone(),
        shutdown.subscribe(),
    ));

    spawn_lease_trim(leases.clone(), transactions.clone(), shutdown.subscribe());

    tokio::spawn(scheduler::run(
        AssignmentSource::Proxy(leases),
        config.sonar.clone(),
        config.batch.cycle_time_minutes,
        shutdown.subscribe(),
    ));

    Ok(())
}

async fn run_batch_mode(config: &ProgramConfig, shutdown: &Shutdown) -> anyhow::Result<()> {
    let table = Arc::new(BatchTable::new());

    let state = Arc::new(BatchEndpointState {
        config: config.batch.clone(),
        table: table.clone(),
    });

    tokio::spawn(endpoint::run(state, shutdown.subscribe()));

    tokio::spawn(scheduler::run(
        AssignmentSource::Batch(table),
        config.sonar.clone(),
        config.batch.cycle_time_minutes,
        shutdown.subscribe(),
    ));

    Ok(())
}

/// Trims the lease table every tick, and also sweeps stale XIDs out of the
/// transaction set every sixth tick (60s) — one ticker drives both, rather
/// than a separate task, since neither does meaningful work between ticks.
fn spawn_lease_trim(
    leases: Arc<LeaseTable>,
    transactions: Arc<TransactionSet>,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticks: u32 = 0;
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = tokio::time::sleep(LEASE_TRIM_INTERVAL) => {
                    leases.trim();
                    ticks += 1;
                    if ticks % 6 == 0 {
                        transactions.sweep();
                    }
                }
            }
        }
    });
}
