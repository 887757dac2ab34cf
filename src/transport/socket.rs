use anyhow::{Result, anyhow};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Poll interval for the blocking ICMP read loop.
pub const ICMP_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Check raw socket permissions early with an actionable error.
pub fn check_permissions() -> Result<()> {
    if create_raw_icmp_socket().is_ok() {
        return Ok(());
    }

    let binary_path = std::env::current_exe()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "pingtun".to_string());

    Err(anyhow!(
        "Insufficient permissions for raw ICMP sockets.\n\n\
         Fix options:\n\
         \u{2022} Run with sudo: sudo pingtun\n\
         \u{2022} Add capability: sudo setcap cap_net_raw+ep {}",
        binary_path
    ))
}

/// Create the raw IPv4 ICMP socket used for both sending and receiving.
///
/// The read timeout bounds each poll of the receive loop so cancellation is
/// observed promptly.
pub fn create_raw_icmp_socket() -> Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?;
    socket.set_nonblocking(false)?;
    socket.set_read_timeout(Some(ICMP_READ_TIMEOUT))?;
    let _ = socket.set_recv_buffer_size(1024 * 1024);
    Ok(socket)
}

/// Send a marshalled ICMP frame to a peer.
///
/// ENOBUFS means the kernel send buffer is exhausted; the datagram is already
/// built and dropping it here loses tunnel data, so the write is retried
/// until the kernel accepts it. There is no upper bound on the retry
/// (carried from the original design; a known backpressure hazard).
/// Any other error propagates to the caller, which logs and drops.
pub fn send_icmp(socket: &Socket, frame: &[u8], peer: IpAddr) -> Result<usize> {
    let addr = SockAddr::from(SocketAddr::new(peer, 0));
    loop {
        match socket.send_to(frame, &addr) {
            Ok(sent) => return Ok(sent),
            Err(e) if e.raw_os_error() == Some(libc::ENOBUFS) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Receive one ICMP packet with its source address.
///
/// Returns the raw bytes as delivered by the kernel, IPv4 header included.
/// A timeout surfaces as `WouldBlock`/`TimedOut` and is not an error to the
/// receive loop.
#[cfg(unix)]
pub fn recv_icmp(socket: &Socket, buffer: &mut [u8]) -> std::io::Result<(usize, IpAddr)> {
    use std::os::unix::io::AsRawFd;

    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut addr_len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    let len = unsafe {
        libc::recvfrom(
            socket.as_raw_fd(),
            buffer.as_mut_ptr() as *mut libc::c_void,
            buffer.len(),
            0,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut addr_len,
        )
    };

    if len < 0 {
        return Err(std::io::Error::last_os_error());
    }

    let source = parse_sockaddr_storage(&storage)?;
    Ok((len as usize, source))
}

/// Parse sockaddr_storage to IpAddr
#[cfg(unix)]
fn parse_sockaddr_storage(storage: &libc::sockaddr_storage) -> std::io::Result<IpAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let addr: &libc::sockaddr_in = unsafe { &*(storage as *const _ as *const _) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            Ok(IpAddr::V4(ip))
        }
        libc::AF_INET6 => {
            let addr: &libc::sockaddr_in6 = unsafe { &*(storage as *const _ as *const _) };
            let ip = std::net::Ipv6Addr::from(addr.sin6_addr.s6_addr);
            Ok(IpAddr::V6(ip))
        }
        family => Err(std::io::Error::other(format!(
            "unknown address family: {family}"
        ))),
    }
}
