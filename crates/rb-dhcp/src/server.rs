//! Orchestration for proxy mode: binds the two interface-pair listeners
//! (server port UDP/67, client port UDP/68), applies the packet drop
//! rules, dispatches surviving packets to the relay handler, and routes
//! the handler's output to the right destination and egress interface.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use socket2::Socket;
use tracing::{debug, error, info, warn};

use crate::lease::LeaseTable;
use crate::listener::{self, InterfacePair};
use crate::options;
use crate::packet::DhcpPacket;
use crate::relay;
use crate::transaction::TransactionSet;

const SERVER_PORT: u16 = 67;
const CLIENT_PORT: u16 = 68;

/// Everything the proxy-mode listeners need, resolved once at startup.
pub struct ProxyRuntime {
    pub proxy_server_ip: Ipv4Addr,
    pub upstream_dhcp_servers: Vec<Ipv4Addr>,
    pub interfaces: InterfacePair,
}

/// Spawn both interface listeners, run until `shutdown` fires, and return
/// once both listener tasks have exited.
pub async fn run(
    runtime: Arc<ProxyRuntime>,
    leases: Arc<LeaseTable>,
    transactions: Arc<TransactionSet>,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let socket_a = listener::bind_pktinfo_socket(SERVER_PORT)?;
    let socket_b = listener::bind_pktinfo_socket(CLIENT_PORT)?;
    info!("proxy: listening on UDP/{} and UDP/{}", SERVER_PORT, CLIENT_PORT);

    let runtime_a = runtime.clone();
    let leases_a = leases.clone();
    let transactions_a = transactions.clone();
    let task_a = tokio::task::spawn_blocking(move || {
        listener_loop(socket_a, runtime_a, leases_a, transactions_a)
    });

    let runtime_b = runtime.clone();
    let leases_b = leases.clone();
    let transactions_b = transactions.clone();
    let task_b = tokio::task::spawn_blocking(move || {
        listener_loop(socket_b, runtime_b, leases_b, transactions_b)
    });

    // Listener threads run a blocking recv loop for the process lifetime;
    // they exit when their socket closes. We wait for shutdown, then drop
    // the sockets out from under them by simply returning — the process is
    // expected to exit shortly after.
    let _ = shutdown.recv().await;
    info!("proxy: shutdown received, interface listeners will exit with the process");
    drop(task_a);
    drop(task_b);
    Ok(())
}

fn listener_loop(
    socket: Socket,
    runtime: Arc<ProxyRuntime>,
    leases: Arc<LeaseTable>,
    transactions: Arc<TransactionSet>,
) {
    let mut buf = [0u8; 1500];
    loop {
        let received = match listener::recv_with_ifindex(&socket, &mut buf) {
            Ok(r) => r,
            Err(e) => {
                error!("proxy: recv error: {}", e);
                return;
            }
        };

        if !runtime.interfaces.contains(received.ifindex) {
            debug!(ifindex = received.ifindex, "dropping packet from unrecognized interface");
            continue;
        }

        let data = &buf[..received.len];
        if data.len() < 240 {
            continue;
        }

        let packet = match DhcpPacket::parse(data) {
            Ok(p) => p,
            Err(e) => {
                debug!("dropping unparseable packet: {}", e);
                continue;
            }
        };

        if packet.hlen > 16 {
            continue;
        }

        // Drop rule 3: message type must be present and fall in the
        // DISCOVER(1)..=INFORM(8) range, not merely equal to either endpoint.
        match packet.msg_type() {
            Some(t) if (options::DHCPDISCOVER..=options::DHCPINFORM).contains(&t) => {}
            _ => continue,
        }

        let Some(response) = relay::handle(&packet, runtime.proxy_server_ip, &transactions, &leases) else {
            continue;
        };

        emit(&socket, &runtime, received.ifindex, &response);
    }
}

/// Route the relay handler's output packet to its destination: a
/// BootRequest goes out the egress interface toward every upstream DHCP
/// server, a BootReply goes back out the receiving interface toward the
/// router named in its Option 3.
fn emit(socket: &Socket, runtime: &ProxyRuntime, received_ifindex: i32, response: &DhcpPacket) {
    let bytes = response.to_bytes();

    if relay::is_boot_request(response) {
        let egress_ifindex = runtime.interfaces.other(received_ifindex);
        for server_ip in &runtime.upstream_dhcp_servers {
            let dst = SocketAddrV4::new(*server_ip, SERVER_PORT);
            if let Err(e) = listener::send_with_pktinfo(
                socket,
                &bytes,
                dst,
                runtime.proxy_server_ip,
                egress_ifindex,
            ) {
                error!("proxy: failed to forward BootRequest to {}: {}", server_ip, e);
            }
        }
    } else {
        match relay::extract_router_option(response) {
            Some(router_ip) => {
                let dst = SocketAddrV4::new(router_ip, SERVER_PORT);
                if let Err(e) = listener::send_with_pktinfo(
                    socket,
                    &bytes,
                    dst,
                    runtime.proxy_server_ip,
                    received_ifindex,
                ) {
                    error!("proxy: failed to forward BootReply to {}: {}", router_ip, e);
                }
            }
            None => {
                warn!("proxy: dropping BootReply with invalid or missing Option 3 (Router)");
            }
        }
    }
}
