//! Interface-bound UDP/67 and UDP/68 listeners.
//!
//! A DHCP relay has to know which physical interface a broadcast arrived on
//! — the same wildcard-bound socket serves both the upstream and downstream
//! links, and the BOOTP client/server port is shared by every host on the
//! segment. Linux gives us that per-packet receive interface, and lets us
//! pin the send interface, through `IP_PKTINFO` ancillary data on a raw
//! `recvmsg`/`sendmsg` pair. `socket2` doesn't expose ancillary data itself,
//! so the `libc` calls below are scoped to this one file.

use std::ffi::CString;
use std::io;
use std::mem::{size_of, MaybeUninit};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::AsRawFd;

use socket2::{Domain, Protocol, Socket, Type};

/// The pair of interfaces an Interface Pair Listener accepts packets from,
/// resolved to kernel interface indices once at startup.
#[derive(Debug, Clone, Copy)]
pub struct InterfacePair {
    pub upstream_ifindex: i32,
    pub downstream_ifindex: i32,
}

impl InterfacePair {
    pub fn resolve(upstream_name: &str, downstream_name: &str) -> io::Result<Self> {
        Ok(Self {
            upstream_ifindex: resolve_ifindex(upstream_name)?,
            downstream_ifindex: resolve_ifindex(downstream_name)?,
        })
    }

    /// Whether `ifindex` is one of this pair's two interfaces (drop rule 4).
    pub fn contains(&self, ifindex: i32) -> bool {
        ifindex == self.upstream_ifindex || ifindex == self.downstream_ifindex
    }

    /// The other interface of the pair, used when forwarding a client
    /// broadcast upstream via the opposite link.
    pub fn other(&self, ifindex: i32) -> i32 {
        if ifindex == self.upstream_ifindex {
            self.downstream_ifindex
        } else {
            self.upstream_ifindex
        }
    }
}

fn resolve_ifindex(name: &str) -> io::Result<i32> {
    let cname = CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "interface name has a NUL byte"))?;
    // SAFETY: `cname` is a valid NUL-terminated C string for the duration of the call.
    let idx = unsafe { libc::if_nametoindex(cname.as_ptr()) };
    if idx == 0 {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no such network interface: {name}"),
        ));
    }
    Ok(idx as i32)
}

/// Bind a UDP socket to `0.0.0.0:<port>` with `IP_PKTINFO` enabled so every
/// `recvmsg` carries the receiving interface's index and destination address.
pub fn bind_pktinfo_socket(port: u16) -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    let addr: SocketAddrV4 = format!("0.0.0.0:{port}").parse().unwrap();
    socket.bind(&addr.into())?;

    let enable: libc::c_int = 1;
    // SAFETY: valid fd, valid pointer/len to a live `c_int`.
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_PKTINFO,
            &enable as *const _ as *const libc::c_void,
            size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(socket)
}

/// A packet received on a `bind_pktinfo_socket`, with the interface it
/// arrived on and the sender's address.
pub struct ReceivedPacket {
    pub len: usize,
    pub ifindex: i32,
    pub from: SocketAddr,
}

/// Blocking receive with `IP_PKTINFO` ancillary data decoded. Intended to be
/// called from a `spawn_blocking` task as the blocking read loop driving
/// each bound port.
pub fn recv_with_ifindex(socket: &Socket, buf: &mut [u8]) -> io::Result<ReceivedPacket> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };

    let mut cmsg_buf = [0u8; 128];
    let mut src_addr: MaybeUninit<libc::sockaddr_in> = MaybeUninit::zeroed();

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_name = src_addr.as_mut_ptr() as *mut libc::c_void;
    msg.msg_namelen = size_of::<libc::sockaddr_in>() as u32;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len();

    // SAFETY: `msg` points at valid, live buffers of the sizes declared above.
    let n = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let ifindex = unsafe { extract_pktinfo_ifindex(&msg) }.unwrap_or(0);
    let src_addr = unsafe { src_addr.assume_init() };
    let from = sockaddr_in_to_socket_addr(&src_addr);

    Ok(ReceivedPacket {
        len: n as usize,
        ifindex,
        from,
    })
}

/// Send `data` to `dst`, pinning the outgoing source address and egress
/// interface via `IP_PKTINFO` ancillary data.
pub fn send_with_pktinfo(
    socket: &Socket,
    data: &[u8],
    dst: SocketAddrV4,
    src_ip: Ipv4Addr,
    ifindex: i32,
) -> io::Result<usize> {
    let mut iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };

    let dst_sockaddr = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: dst.port().to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(dst.ip().octets()),
        },
        sin_zero: [0; 8],
    };

    let pktinfo = libc::in_pktinfo {
        ipi_ifindex: ifindex,
        ipi_spec_dst: libc::in_addr {
            s_addr: u32::from_ne_bytes(src_ip.octets()),
        },
        ipi_addr: libc::in_addr { s_addr: 0 },
    };

    let cmsg_len = unsafe { libc::CMSG_SPACE(size_of::<libc::in_pktinfo>() as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_len];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_name = &dst_sockaddr as *const _ as *mut libc::c_void;
    msg.msg_namelen = size_of::<libc::sockaddr_in>() as u32;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len();

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null() {
            return Err(io::Error::new(io::ErrorKind::Other, "no room for IP_PKTINFO cmsg"));
        }
        (*cmsg).cmsg_level = libc::IPPROTO_IP;
        (*cmsg).cmsg_type = libc::IP_PKTINFO;
        (*cmsg).cmsg_len = libc::CMSG_LEN(size_of::<libc::in_pktinfo>() as u32) as _;
        std::ptr::write(libc::CMSG_DATA(cmsg) as *mut libc::in_pktinfo, pktinfo);
    }

    // SAFETY: `msg` points at valid, live buffers of the sizes declared above.
    let n = unsafe { libc::sendmsg(socket.as_raw_fd(), &msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

unsafe fn extract_pktinfo_ifindex(msg: &libc::msghdr) -> Option<i32> {
    let mut cmsg = libc::CMSG_FIRSTHDR(msg);
    while !cmsg.is_null() {
        if (*cmsg).cmsg_level == libc::IPPROTO_IP && (*cmsg).cmsg_type == libc::IP_PKTINFO {
            let info = libc::CMSG_DATA(cmsg) as *const libc::in_pktinfo;
            return Some((*info).ipi_ifindex);
        }
        cmsg = libc::CMSG_NXTHDR(msg, cmsg);
    }
    None
}

fn sockaddr_in_to_socket_addr(addr: &libc::sockaddr_in) -> SocketAddr {
    let ip = Ipv4Addr::from(u32::from_ne_bytes(addr.sin_addr.s_addr.to_ne_bytes()));
    let port = u16::from_be(addr.sin_port);
    SocketAddr::V4(SocketAddrV4::new(ip, port))
}
