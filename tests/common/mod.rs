//! Shared helpers for the end-to-end driver tests: a loopback UDP
//! "announcer" and a loopback TCP "test server" thread, driving the
//! crate's public API the way a real catalog server would.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream, UdpSocket};
use std::sync::Once;
use std::time::Duration;

use reccaster_client::wire;

static INIT: Once = Once::new();

#[allow(dead_code)]
pub fn init_logging() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Send one announcement datagram to `target`, with `server_ip` as the
/// encoded field (`0xFFFFFFFF` exercises source-IP substitution).
#[allow(dead_code)]
pub fn send_announcement(target: SocketAddr, server_ip: u32, server_port: u16, server_key: u32) {
    let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    let mut buf = [0u8; wire::ANNOUNCEMENT_LEN];
    buf[0..2].copy_from_slice(&wire::MAGIC.to_be_bytes());
    buf[2] = 0; // version
    buf[3] = 0; // reserved
    buf[4..8].copy_from_slice(&server_ip.to_be_bytes());
    buf[8..10].copy_from_slice(&server_port.to_be_bytes());
    buf[10..12].copy_from_slice(&0u16.to_be_bytes());
    buf[12..16].copy_from_slice(&server_key.to_be_bytes());
    sock.send_to(&buf, target).unwrap();
}

/// Poll `f` until it returns `Some`, or panic after `timeout`.
#[allow(dead_code)]
pub fn wait_for<T>(timeout: Duration, mut f: impl FnMut() -> Option<T>) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {timeout:?}");
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Poll `f` until it returns `true`, or give up and return `false` after
/// `timeout` (non-panicking variant, for conditions the caller wants to
/// assert on itself).
#[allow(dead_code)]
pub fn wait_for_bool(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let start = std::time::Instant::now();
    loop {
        if f() {
            return true;
        }
        if start.elapsed() > timeout {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// A minimal blocking reader/writer of the TCP framing, for driving the
/// server side of the protocol from a test thread.
#[allow(dead_code)]
pub struct TestServerConn {
    pub stream: TcpStream,
}

#[allow(dead_code)]
impl TestServerConn {
    pub fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = listener.accept().unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        Self { stream }
    }

    /// Read one full message (header + body), blocking.
    pub fn read_message(&mut self) -> wire::RawMessage {
        let mut header_buf = [0u8; wire::HEADER_LEN];
        self.stream.read_exact(&mut header_buf).unwrap();
        let header = wire::Header::decode(&header_buf).unwrap();
        let mut body = vec![0u8; header.body_len as usize];
        if !body.is_empty() {
            self.stream.read_exact(&mut body).unwrap();
        }
        wire::RawMessage { msg_id: header.msg_id, body }
    }

    pub fn send(&mut self, msg: &[u8]) {
        self.stream.write_all(msg).unwrap();
    }

    /// Read and discard messages until one with `msg_id` arrives, then
    /// return it. Used to skip past the built-in environment info tags
    /// (§6), whose exact count depends on the host's process environment.
    pub fn read_until(&mut self, msg_id: u16) -> wire::RawMessage {
        loop {
            let msg = self.read_message();
            if msg.msg_id == msg_id {
                return msg;
            }
        }
    }

    pub fn close(self) {
        drop(self.stream);
    }
}

/// Bind a TCP listener on an ephemeral loopback port, returning it and
/// the port chosen.
#[allow(dead_code)]
pub fn bind_test_server() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

#[allow(dead_code)]
pub fn loopback(port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
}

/// Build a raw framed message the way a real server would, for tests
/// driving the server side of the wire protocol.
#[allow(dead_code)]
pub fn frame(msg_id: u16, body: &[u8]) -> Vec<u8> {
    let header = wire::Header { msg_id, body_len: body.len() as u32 };
    let mut out = header.encode().to_vec();
    out.extend_from_slice(body);
    out
}
