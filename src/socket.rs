//! Non-blocking sockets with a deadline and an external wake descriptor.
//!
//! Grounded on the raw-`libc` idiom the reference tooling reaches for
//! whenever `std` doesn't expose a needed syscall (`getuid`/`umask`/`kill`
//! for PID-file bookkeeping there; `socketpair`/`poll`/`getsockopt` here).
//! Every blocking primitive is interruptible: writing any bytes to the
//! write end of the wake pair makes every outstanding wait return a
//! timeout, indistinguishable from a real deadline expiry. That is the
//! only cancellation mechanism this type has.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::time::{Duration, Instant};

use crate::error::{would_block_as_timeout, RecvOutcome, SendOutcome};

/// Direction a blocking wait should watch for on the data descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitFor {
    Readable,
    Writable,
}

/// A non-blocking socket wrapped with a deadline and an optional wake fd.
///
/// `timeout = None` means "wait forever" (still interruptible by the wake
/// descriptor). A `Some(d)` deadline applies to every blocking primitive
/// unless that primitive is explicitly called with `unbounded = true`
/// (used by the UDP discovery wait, which has no timeout of its own).
pub struct InterruptibleSocket {
    fd: RawFd,
    wake_fd: Option<RawFd>,
    timeout: Option<Duration>,
}

impl InterruptibleSocket {
    /// Wrap an already-created, not-yet-configured raw descriptor.
    fn from_raw_fd(fd: RawFd) -> io::Result<Self> {
        set_nonblocking(fd)?;
        Ok(Self { fd, wake_fd: None, timeout: None })
    }

    /// Create a UDP socket, enable address reuse, and bind it.
    ///
    /// `port = 0` binds an ephemeral port; call [`Self::local_port`]
    /// afterwards to read back the chosen port.
    pub fn udp_bind(port: u16) -> io::Result<Self> {
        unsafe {
            let fd = libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            let one: libc::c_int = 1;
            if libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &one as *const _ as *const libc::c_void,
                mem::size_of_val(&one) as libc::socklen_t,
            ) < 0
            {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err);
            }

            let addr = sockaddr_in(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
            if libc::bind(fd, &addr as *const _ as *const libc::sockaddr, mem::size_of_val(&addr) as libc::socklen_t) < 0 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err);
            }

            Self::from_raw_fd(fd)
        }
    }

    /// Create an unconnected, non-blocking TCP socket.
    pub fn tcp() -> io::Result<Self> {
        unsafe {
            let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            Self::from_raw_fd(fd)
        }
    }

    /// Install the wake descriptor whose readability aborts every wait.
    pub fn set_wake_fd(&mut self, wake_fd: RawFd) {
        self.wake_fd = Some(wake_fd);
    }

    /// Set the deadline applied to subsequent blocking primitives.
    /// `None` means wait forever.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// The port this socket is bound to (used to read back an ephemeral
    /// UDP port chosen by the kernel).
    pub fn local_port(&self) -> io::Result<u16> {
        unsafe {
            let mut addr: libc::sockaddr_in = mem::zeroed();
            let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            if libc::getsockname(self.fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(u16::from_be(addr.sin_port))
        }
    }

    /// Block until the data descriptor is ready in `direction`, the wake
    /// descriptor becomes readable, or the deadline expires.
    ///
    /// Wake-readable and deadline expiry are both surfaced as
    /// `io::ErrorKind::TimedOut` — this is what lets an external shutdown
    /// unblock every loop without a distinct cancellation API.
    fn wait(&self, direction: WaitFor, unbounded: bool) -> io::Result<()> {
        let deadline = if unbounded { None } else { self.timeout };
        let start = Instant::now();

        loop {
            let remaining_ms: i32 = match deadline {
                None => -1,
                Some(d) => {
                    let elapsed = start.elapsed();
                    if elapsed >= d {
                        return Err(crate::error::timed_out());
                    }
                    (d - elapsed).as_millis().min(i32::MAX as u128) as i32
                }
            };

            let mut fds = [
                libc::pollfd {
                    fd: self.fd,
                    events: match direction {
                        WaitFor::Readable => libc::POLLIN,
                        WaitFor::Writable => libc::POLLOUT,
                    },
                    revents: 0,
                },
                libc::pollfd {
                    fd: self.wake_fd.unwrap_or(-1),
                    events: libc::POLLIN,
                    revents: 0,
                },
            ];

            let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, remaining_ms) };

            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue; // restart with the remaining deadline
                }
                return Err(err);
            }

            if n == 0 {
                return Err(crate::error::timed_out());
            }

            if self.wake_fd.is_some() && fds[1].revents != 0 {
                return Err(crate::error::timed_out());
            }

            if fds[0].revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                // Surface as readable/writable; the caller's own read/write
                // call will report the concrete error.
                return Ok(());
            }

            if fds[0].revents != 0 {
                return Ok(());
            }
            // Spurious wakeup, loop.
        }
    }

    /// Connect to `peer`, honoring the deadline and wake descriptor.
    pub fn connect(&mut self, peer: SocketAddr) -> io::Result<()> {
        let SocketAddr::V4(v4) = peer else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "only IPv4 peers are supported"));
        };
        let addr = sockaddr_in(v4);

        let rc = unsafe {
            libc::connect(self.fd, &addr as *const _ as *const libc::sockaddr, mem::size_of_val(&addr) as libc::socklen_t)
        };

        if rc == 0 {
            return Ok(());
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            return Err(err);
        }

        self.wait(WaitFor::Writable, false)?;

        unsafe {
            let mut sockerr: libc::c_int = 0;
            let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
            if libc::getsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut sockerr as *mut _ as *mut libc::c_void,
                &mut len,
            ) < 0
            {
                return Err(io::Error::last_os_error());
            }
            if sockerr != 0 {
                return Err(io::Error::from_raw_os_error(sockerr));
            }
        }
        Ok(())
    }

    /// Read exactly `buf.len()` bytes, looping across partial reads.
    ///
    /// Returns [`RecvOutcome::ClosedAtStart`] only if the peer closed
    /// before any byte of this call was read; a close partway through a
    /// frame is always an error, never a silent short read.
    pub fn recv_exact(&mut self, buf: &mut [u8]) -> io::Result<RecvOutcome> {
        let mut read = 0;
        while read < buf.len() {
            self.wait(WaitFor::Readable, false)?;
            let n = unsafe {
                libc::read(self.fd, buf[read..].as_mut_ptr() as *mut libc::c_void, buf.len() - read)
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock || err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if n == 0 {
                if read == 0 {
                    return Ok(RecvOutcome::ClosedAtStart);
                }
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed mid-frame"));
            }
            read += n as usize;
        }
        Ok(RecvOutcome::Complete)
    }

    /// Read and discard exactly `len` bytes, same shape as [`Self::recv_exact`].
    pub fn recv_discard(&mut self, len: usize) -> io::Result<RecvOutcome> {
        let mut scratch = vec![0u8; 4096];
        let mut remaining = len;
        let mut touched_any = false;
        while remaining > 0 {
            let chunk = remaining.min(scratch.len());
            match self.recv_exact(&mut scratch[..chunk])? {
                RecvOutcome::Complete => {
                    touched_any = true;
                    remaining -= chunk;
                }
                RecvOutcome::ClosedAtStart => {
                    if touched_any {
                        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed mid-frame"));
                    }
                    return Ok(RecvOutcome::ClosedAtStart);
                }
            }
        }
        Ok(RecvOutcome::Complete)
    }

    /// Receive a single datagram. `unbounded` disables the deadline for
    /// this call only, used by the UDP discovery wait.
    pub fn recv_from(&mut self, buf: &mut [u8], unbounded: bool) -> io::Result<(usize, SocketAddr)> {
        loop {
            self.wait(WaitFor::Readable, unbounded)?;
            unsafe {
                let mut addr: libc::sockaddr_in = mem::zeroed();
                let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
                let n = libc::recvfrom(
                    self.fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                    &mut addr as *mut _ as *mut libc::sockaddr,
                    &mut len,
                );
                if n < 0 {
                    let err = would_block_as_timeout(io::Error::last_os_error());
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    return Err(err);
                }
                if (len as usize) < mem::size_of::<libc::sockaddr_in>() {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, "unexpected sender address family"));
                }
                let peer = SocketAddr::V4(SocketAddrV4::new(
                    Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
                    u16::from_be(addr.sin_port),
                ));
                return Ok((n as usize, peer));
            }
        }
    }

    /// Send a single datagram.
    pub fn send_to(&mut self, buf: &[u8], peer: SocketAddr) -> io::Result<SendOutcome> {
        let SocketAddr::V4(v4) = peer else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "only IPv4 peers are supported"));
        };
        let addr = sockaddr_in(v4);

        self.wait(WaitFor::Writable, false)?;
        let n = unsafe {
            libc::sendto(
                self.fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                0,
                &addr as *const _ as *const libc::sockaddr,
                mem::size_of_val(&addr) as libc::socklen_t,
            )
        };
        if n < 0 {
            return Err(would_block_as_timeout(io::Error::last_os_error()));
        }
        if n as usize == buf.len() {
            Ok(SendOutcome::All)
        } else {
            Ok(SendOutcome::Partial(n as usize))
        }
    }

    /// Write the full buffer, looping across partial writes.
    ///
    /// Returns `Ok(false)` (not an error) if the connection was lost
    /// mid-send (`EPIPE`/`ECONNRESET`), matching the "0 on connection
    /// lost" outcome of the source protocol.
    pub fn send_all(&mut self, buf: &[u8]) -> io::Result<bool> {
        let mut written = 0;
        while written < buf.len() {
            self.wait(WaitFor::Writable, false)?;
            let flags = no_sigpipe_flag();
            let n = unsafe {
                libc::send(
                    self.fd,
                    buf[written..].as_ptr() as *const libc::c_void,
                    buf.len() - written,
                    flags,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EPIPE) | Some(libc::ECONNRESET) => return Ok(false),
                    _ if err.kind() == io::ErrorKind::WouldBlock || err.kind() == io::ErrorKind::Interrupted => continue,
                    _ => return Err(err),
                }
            }
            written += n as usize;
        }
        Ok(true)
    }
}

impl AsRawFd for InterruptibleSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for InterruptibleSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(target_os = "linux")]
fn no_sigpipe_flag() -> libc::c_int {
    libc::MSG_NOSIGNAL
}

#[cfg(not(target_os = "linux"))]
fn no_sigpipe_flag() -> libc::c_int {
    0
}

fn sockaddr_in(addr: SocketAddrV4) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: addr.port().to_be(),
        sin_addr: libc::in_addr { s_addr: u32::from(*addr.ip()).to_be() },
        sin_zero: [0; 8],
        #[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "ios"))]
        sin_len: 0,
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// A pair of connected stream sockets used as a wake pipe: writing any
/// bytes to `pair.1` (the "owner" end) makes every blocking primitive
/// watching `pair.0` (the "worker" end) return a timeout.
pub struct WakePair {
    /// The end the Driver's blocking I/O watches.
    pub worker: RawFd,
    /// The end the owner writes to on shutdown.
    pub owner: RawFd,
}

impl WakePair {
    /// Create a connected pair via `socketpair(2)` where available, falling
    /// back to a loopback listen/connect/accept dance on platforms without
    /// `AF_UNIX` socketpairs. Every transient descriptor is closed on every
    /// error path — the pack's loopback fallback used to leak these.
    pub fn new() -> io::Result<Self> {
        Self::via_socketpair().or_else(|_| Self::via_loopback())
    }

    fn via_socketpair() -> io::Result<Self> {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        set_nonblocking(fds[0])?;
        Ok(Self { worker: fds[0], owner: fds[1] })
    }

    fn via_loopback() -> io::Result<Self> {
        unsafe {
            let listener = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
            if listener < 0 {
                return Err(io::Error::last_os_error());
            }
            let bind_addr = sockaddr_in(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));
            if libc::bind(listener, &bind_addr as *const _ as *const libc::sockaddr, mem::size_of_val(&bind_addr) as libc::socklen_t) < 0 {
                let err = io::Error::last_os_error();
                libc::close(listener);
                return Err(err);
            }
            if libc::listen(listener, 1) < 0 {
                let err = io::Error::last_os_error();
                libc::close(listener);
                return Err(err);
            }

            let mut bound: libc::sockaddr_in = mem::zeroed();
            let mut bound_len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            if libc::getsockname(listener, &mut bound as *mut _ as *mut libc::sockaddr, &mut bound_len) < 0 {
                let err = io::Error::last_os_error();
                libc::close(listener);
                return Err(err);
            }

            let connector = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
            if connector < 0 {
                let err = io::Error::last_os_error();
                libc::close(listener);
                return Err(err);
            }
            if set_nonblocking(connector).is_err() {
                let err = io::Error::last_os_error();
                libc::close(listener);
                libc::close(connector);
                return Err(err);
            }

            let rc = libc::connect(connector, &bound as *const _ as *const libc::sockaddr, bound_len);
            if rc < 0 && io::Error::last_os_error().raw_os_error() != Some(libc::EINPROGRESS) {
                let err = io::Error::last_os_error();
                libc::close(listener);
                libc::close(connector);
                return Err(err);
            }

            let mut pfd = libc::pollfd { fd: listener, events: libc::POLLIN, revents: 0 };
            let n = libc::poll(&mut pfd, 1, 1000);
            if n <= 0 {
                libc::close(listener);
                libc::close(connector);
                return Err(io::Error::new(io::ErrorKind::TimedOut, "loopback wake pair accept timed out"));
            }

            let accepted = libc::accept(listener, std::ptr::null_mut(), std::ptr::null_mut());
            libc::close(listener);
            if accepted < 0 {
                let err = io::Error::last_os_error();
                libc::close(connector);
                return Err(err);
            }

            // Restore blocking mode on the connected end per the spec.
            let flags = libc::fcntl(connector, libc::F_GETFL, 0);
            if flags >= 0 {
                libc::fcntl(connector, libc::F_SETFL, flags & !libc::O_NONBLOCK);
            }

            Ok(Self { worker: accepted, owner: connector })
        }
    }
}

impl Drop for WakePair {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.worker);
            libc::close(self.owner);
        }
    }
}

/// Write a 4-byte value to the owner end, forcing every blocking
/// primitive on the worker end to time out. Idempotent: repeated writes
/// are benign (the worker side drains or ignores the bytes).
pub fn wake(owner_fd: RawFd) -> io::Result<()> {
    let buf = [0u8; 4];
    let n = unsafe { libc::write(owner_fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(()); // buffer full from a previous wake; already pending
        }
        return Err(err);
    }
    Ok(())
}
