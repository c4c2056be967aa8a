//! Per-platform socket tweaks. Each may be a no-op where the OS has no equivalent.

use std::io;
use std::time::Duration;

use socket2::Socket;

/// BSD-derived raw sockets with `IP_HDRINCL` on macOS expect `ip_len` in host byte order.
pub const fn total_length_in_host_order() -> bool {
    cfg!(any(target_os = "macos", target_os = "ios"))
}

/// Asks the kernel to queue ICMP errors related to this socket (`IP_RECVERR`).
#[cfg(target_os = "linux")]
pub fn set_receive_error_reporting(socket: &Socket) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let enable: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_RECVERR,
            &enable as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn set_receive_error_reporting(_socket: &Socket) -> io::Result<()> {
    Ok(())
}

/// Bounds each blocking `recv`, so read loops get to check their stop signal.
pub fn set_receive_timeout(socket: &Socket, timeout: Duration) -> io::Result<()> {
    socket.set_read_timeout(Some(timeout))
}

pub fn set_receive_buffer(socket: &Socket, bytes: usize) -> io::Result<()> {
    socket.set_recv_buffer_size(bytes)
}
