//! The relay's core packet transform: turns a client request into a
//! BootRequest bound for the upstream DHCP server, or an upstream reply into
//! a BootReply bound for the client. Produces no output of its own — the
//! listener inspects the returned packet's `op` field to decide where it
//! goes next.

use std::net::Ipv4Addr;

use tracing::debug;

use crate::lease::LeaseTable;
use crate::options::{
    self, DhcpOption, DHCPACK, DHCPDECLINE, DHCPDISCOVER, DHCPNAK, DHCPOFFER, DHCPRELEASE,
    DHCPREQUEST, OPT_LEASE_TIME, OPT_SERVER_ID,
};
use crate::packet::DhcpPacket;
use crate::transaction::TransactionSet;

/// Apply the relay transform described for each DHCP message type.
/// Returns `None` when the packet should be silently dropped.
pub fn handle(
    packet: &DhcpPacket,
    proxy_ip: Ipv4Addr,
    transactions: &TransactionSet,
    leases: &LeaseTable,
) -> Option<DhcpPacket> {
    let msg_type = packet.msg_type()?;

    match msg_type {
        DHCPDISCOVER | DHCPREQUEST => {
            transactions.insert(packet.xid);
            Some(packet.build_forward(proxy_ip))
        }
        DHCPRELEASE | DHCPDECLINE => {
            // Forwarded as-is; the lease table is left untouched here; an
            // explicit RELEASE/DECLINE doesn't get its own table update,
            // only the trim loop and a later ACK affect it.
            Some(packet.build_forward(proxy_ip))
        }
        DHCPOFFER => {
            if !transactions.contains(packet.xid) {
                debug!(xid = packet.xid, "dropping OFFER for unknown transaction");
                return None;
            }
            let mut reply = packet.clone();
            options::replace_or_append(&mut reply.options, DhcpOption::server_id(proxy_ip));
            Some(reply)
        }
        DHCPACK => {
            if !transactions.contains(packet.xid) {
                debug!(xid = packet.xid, "dropping ACK for unknown transaction");
                return None;
            }
            match packet.get_option(OPT_LEASE_TIME).and_then(|o| o.as_u32()) {
                Some(lease_time) => {
                    leases.upsert(&packet.mac_str(), packet.yiaddr, lease_time, &packet.options);
                }
                None => {
                    debug!(mac = %packet.mac_str(), "ACK missing lease time option, not recording lease");
                }
            }
            let mut reply = packet.clone();
            options::replace_or_append(&mut reply.options, DhcpOption::server_id(proxy_ip));
            Some(reply)
        }
        DHCPNAK => {
            if !transactions.contains(packet.xid) {
                debug!(xid = packet.xid, "dropping NAK for unknown transaction");
                return None;
            }
            let mut reply = packet.clone();
            options::replace_or_append(&mut reply.options, DhcpOption::server_id(proxy_ip));
            Some(reply)
        }
        other => {
            debug!(msg_type = other, "ignoring unsupported DHCP message type");
            None
        }
    }
}

/// True if this (already-relayed) packet's op field marks it a BootRequest
/// headed to the upstream server rather than a BootReply headed to the
/// client. Mirrors RFC 2131's op codes: 1 = BOOTREQUEST, 2 = BOOTREPLY.
pub fn is_boot_request(packet: &DhcpPacket) -> bool {
    packet.op == 1
}

/// Pull Option 3 (Router) out of a packet bound for the client, which per
/// the interface-listener's routing rule tells it which upstream DHCP
/// server to send the BootReply through. The option must carry exactly one
/// IPv4 address; anything else is treated as invalid.
pub fn extract_router_option(packet: &DhcpPacket) -> Option<Ipv4Addr> {
    packet.get_option(options::OPT_ROUTER).and_then(|o| o.as_ipv4())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::DhcpOption;

    fn base_packet(msg_type: u8, xid: u32) -> DhcpPacket {
        DhcpPacket {
            op: 1,
            htype: 1,
            hlen: 6,
            hops: 0,
            xid,
            secs: 0,
            flags: 0x8000,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr: {
                let mut c = [0u8; 16];
                c[..6].copy_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
                c
            },
            sname: [0u8; 64],
            file: [0u8; 128],
            options: vec![DhcpOption::msg_type(msg_type)],
        }
    }

    #[test]
    fn test_discover_is_forwarded_and_tracked() {
        let transactions = TransactionSet::new();
        let leases = LeaseTable::new();
        let pkt = base_packet(DHCPDISCOVER, 0x12345678);

        let result = handle(&pkt, Ipv4Addr::new(10, 0, 0, 1), &transactions, &leases).unwrap();

        assert_eq!(result.op, 1);
        assert_eq!(result.giaddr, Ipv4Addr::new(10, 0, 0, 1));
        assert!(transactions.contains(0x12345678));
        assert_eq!(result.flags & 0x8000, 0);
    }

    #[test]
    fn test_offer_for_unknown_xid_is_dropped() {
        let transactions = TransactionSet::new();
        let leases = LeaseTable::new();
        let mut pkt = base_packet(DHCPOFFER, 0xdeadbeef);
        pkt.op = 2;

        assert!(handle(&pkt, Ipv4Addr::new(10, 0, 0, 1), &transactions, &leases).is_none());
    }

    #[test]
    fn test_ack_records_lease_and_substitutes_server_id() {
        let transactions = TransactionSet::new();
        let leases = LeaseTable::new();
        transactions.insert(0x12345678);

        let mut pkt = base_packet(DHCPACK, 0x12345678);
        pkt.op = 2;
        pkt.yiaddr = Ipv4Addr::new(192, 168, 1, 50);
        pkt.options.push(DhcpOption::lease_time(86400));
        pkt.options.push(DhcpOption::server_id(Ipv4Addr::new(192, 168, 1, 1)));

        let result = handle(&pkt, Ipv4Addr::new(10, 0, 0, 1), &transactions, &leases).unwrap();

        assert_eq!(leases.len(), 1);
        let snap = leases.snapshot();
        assert_eq!(snap[0].ip, Ipv4Addr::new(192, 168, 1, 50));

        let server_ids: Vec<_> = result.options.iter().filter(|o| o.code == OPT_SERVER_ID).collect();
        assert_eq!(server_ids.len(), 1);
        assert_eq!(server_ids[0].as_ipv4(), Some(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn test_ack_without_lease_time_does_not_record_lease() {
        let transactions = TransactionSet::new();
        let leases = LeaseTable::new();
        transactions.insert(1);
        let mut pkt = base_packet(DHCPACK, 1);
        pkt.op = 2;

        handle(&pkt, Ipv4Addr::new(10, 0, 0, 1), &transactions, &leases);
        assert!(leases.is_empty());
    }

    #[test]
    fn test_release_forwards_without_table_mutation() {
        let transactions = TransactionSet::new();
        let leases = LeaseTable::new();
        leases.upsert("aa:bb:cc:dd:ee:ff", Ipv4Addr::new(10, 0, 0, 9), 3600, &[]);

        let pkt = base_packet(DHCPRELEASE, 42);
        let result = handle(&pkt, Ipv4Addr::new(10, 0, 0, 1), &transactions, &leases).unwrap();

        assert_eq!(result.op, 1);
        // RELEASE forwards upstream but leaves the lease table untouched.
        assert_eq!(leases.snapshot()[0].expired, "0");
    }

    #[test]
    fn test_nak_for_tracked_xid_is_relayed() {
        let transactions = TransactionSet::new();
        let leases = LeaseTable::new();
        transactions.insert(7);
        let mut pkt = base_packet(DHCPNAK, 7);
        pkt.op = 2;

        let result = handle(&pkt, Ipv4Addr::new(10, 0, 0, 1), &transactions, &leases).unwrap();
        assert_eq!(result.op, 2);
        assert!(leases.is_empty());
    }
}
