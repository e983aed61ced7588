//! The long-lived discovery → connect → upload → maintain state machine.
//!
//! A [`Driver`] owns a background thread running [`run`] and a small
//! shared-state block (phase, last message, shutdown flag, config lists)
//! protected by one lock, matching the "shutdown, lastMsg, phase, and the
//! two Config lists are protected by the DriverState lock" resource
//! policy. Everything else touched inside the loop — the socket for the
//! current cycle, the record-id counter, the error streak — is local to
//! the thread and never shared.

use std::net::{SocketAddr, SocketAddrV4};
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::catalog::CatalogUploader;
use crate::config::Config;
use crate::socket::{wake, InterruptibleSocket, WakePair};
use crate::wire::{self, MSG_SERVER_GREETING, MSG_SERVER_PING};

/// Current position in the discover/connect/upload/maintain cycle.
///
/// Monotonic within a single cycle (`Init` only ever occurs once, before
/// the first `Listen`); any failure sends the driver back to `Listen`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Listen,
    Connect,
    Upload,
    Done,
}

/// Point at which [`Handlers::test_hook`] is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestStage {
    UdpSetup,
    TcpSetup,
}

/// Process-wide tunables, read once when the driver starts.
#[derive(Debug, Clone, Copy)]
pub struct DriverConfig {
    /// Base per-operation timeout. The maintenance loop uses 4x this.
    pub timeout: Duration,
    /// Upper bound for the randomized post-discovery connect delay.
    pub max_holdoff: Duration,
    /// UDP listen port; 0 binds an ephemeral port.
    pub udp_port: u16,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            max_holdoff: Duration::from_secs(10),
            udp_port: 5049,
        }
    }
}

/// Host-supplied extension points, a capability set fixed at construction.
///
/// There is no API to change these after [`DriverBuilder::start`]: the
/// "no later mutation" rule for host callbacks is enforced by the type
/// system rather than a runtime phase check.
#[derive(Default)]
pub struct Handlers {
    on_msg: Option<Box<dyn Fn(&str) + Send + Sync>>,
    get_records: Option<Box<dyn Fn(&mut CatalogUploader<'_>, &Config) -> Result<()> + Send + Sync>>,
    test_hook: Option<Box<dyn Fn(TestStage) + Send + Sync>>,
}

struct Shared {
    phase: Phase,
    shutdown: bool,
    last_msg: String,
    udp_port: Option<u16>,
}

/// Handle to a running driver thread.
///
/// Dropping it (or calling [`Driver::shutdown`]) requests cooperative
/// shutdown and blocks until the worker thread has exited.
pub struct Driver {
    shared: Arc<Mutex<Shared>>,
    config: Arc<Config>,
    wake_owner: RawFd,
    thread_handle: Option<JoinHandle<()>>,
}

impl Driver {
    pub fn builder() -> DriverBuilder {
        DriverBuilder::new()
    }

    /// The externally observable current phase.
    pub fn phase(&self) -> Phase {
        self.shared.lock().unwrap().phase
    }

    /// A copy of the last status line, updated once per state transition.
    pub fn last_message(&self) -> String {
        self.shared.lock().unwrap().last_msg.clone()
    }

    /// The UDP port currently (or most recently) bound for discovery.
    /// `None` until the first UDP phase has bound its socket; useful for
    /// tests and diagnostics when `udp_port` was configured as 0.
    pub fn udp_port(&self) -> Option<u16> {
        self.shared.lock().unwrap().udp_port
    }

    /// The frozen configuration lists this driver was started with.
    /// Read-only: there is no mutator once the driver has started.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Request shutdown and wait for the worker thread to exit.
    ///
    /// Idempotent: a second call is a no-op. Matches I6 — the thread is
    /// joined (the Rust stand-in for `shutdownEvent`) exactly once.
    pub fn shutdown(&mut self) {
        {
            let mut shared = self.shared.lock().unwrap();
            if shared.shutdown {
                return;
            }
            shared.shutdown = true;
        }
        let _ = wake(self.wake_owner);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Builds a [`Driver`]: configuration and callbacks may only be set here,
/// before the worker thread starts.
pub struct DriverBuilder {
    driver_config: DriverConfig,
    config: Config,
    handlers: Handlers,
}

impl DriverBuilder {
    pub fn new() -> Self {
        Self {
            driver_config: DriverConfig::default(),
            config: Config::new(),
            handlers: Handlers::default(),
        }
    }

    pub fn driver_config(mut self, driver_config: DriverConfig) -> Self {
        self.driver_config = driver_config;
        self
    }

    /// Add extra environment-variable names sent as info tags during upload.
    pub fn add_env_vars<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.add_env_vars(names, true);
        self
    }

    /// Add glob patterns excluding matching record instance names.
    pub fn add_exclude_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.add_exclude_patterns(patterns, true);
        self
    }

    /// Fired whenever the last status message changes.
    pub fn on_msg(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.handlers.on_msg = Some(Box::new(f));
        self
    }

    /// Invoked once per TCP cycle at the start of upload; the callback
    /// drives `CatalogUploader::send_record`/`send_alias`/`send_info`,
    /// using the passed [`Config`] to apply exclusion globs to candidate
    /// instance names before uploading them.
    pub fn get_records(
        mut self,
        f: impl Fn(&mut CatalogUploader<'_>, &Config) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.handlers.get_records = Some(Box::new(f));
        self
    }

    /// Invoked immediately after socket setup in each phase.
    pub fn test_hook(mut self, f: impl Fn(TestStage) + Send + Sync + 'static) -> Self {
        self.handlers.test_hook = Some(Box::new(f));
        self
    }

    /// Allocate the wakeup pair and spawn the driver thread.
    pub fn start(self) -> Result<Driver> {
        let wake_pair = WakePair::new().context("allocating shutdown wake pair")?;
        let wake_owner = wake_pair.owner;

        let shared = Arc::new(Mutex::new(Shared {
            phase: Phase::Init,
            shutdown: false,
            last_msg: String::new(),
            udp_port: None,
        }));
        let config = Arc::new(self.config);

        let thread_shared = Arc::clone(&shared);
        let thread_config = Arc::clone(&config);
        let driver_config = self.driver_config;
        let handlers = self.handlers;

        let thread_handle = thread::Builder::new()
            .name("reccaster-driver".into())
            .spawn(move || run(driver_config, thread_shared, thread_config, handlers, wake_pair))
            .context("spawning driver thread")?;

        Ok(Driver { shared, config, wake_owner, thread_handle: Some(thread_handle) })
    }
}

impl Default for DriverBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn set_phase(shared: &Mutex<Shared>, phase: Phase) {
    shared.lock().unwrap().phase = phase;
}

fn set_last_msg(shared: &Mutex<Shared>, handlers: &Handlers, msg: impl Into<String>) {
    let msg = msg.into();
    shared.lock().unwrap().last_msg = msg.clone();
    if let Some(on_msg) = &handlers.on_msg {
        on_msg(&msg);
    }
}

fn is_shutdown(shared: &Mutex<Shared>) -> bool {
    shared.lock().unwrap().shutdown
}

/// The driver thread's main body, run until shutdown is observed.
fn run(
    driver_config: DriverConfig,
    shared: Arc<Mutex<Shared>>,
    config: Arc<Config>,
    handlers: Handlers,
    wake_pair: WakePair,
) {
    let mut error_streak: u32 = 0;
    let mut next_rec_id: i64 = 1;

    loop {
        if is_shutdown(&shared) {
            break;
        }

        let capped = error_streak.min(10);
        if capped > 0 {
            thread::sleep(Duration::from_secs_f64(capped as f64 * 5.0));
        }
        error_streak = (error_streak + 1).min(10);

        set_phase(&shared, Phase::Listen);
        let discovery = run_udp_phase(&driver_config, &shared, &handlers, &wake_pair);
        let (peer, server_key) = match discovery {
            Ok(found) => found,
            Err(e) => {
                log::warn!("UDP discovery failed: {e:#}");
                set_last_msg(&shared, &handlers, format!("discovery failed: {e}"));
                continue;
            }
        };

        let holdoff_secs = rand::random::<f64>() * driver_config.max_holdoff.as_secs_f64();
        if holdoff_secs > 2.0 {
            log::info!("connect hold-off {holdoff_secs:.1}s before {peer}");
        }
        if wait_holdoff(&wake_pair, Duration::from_secs_f64(holdoff_secs)).is_err() {
            log::warn!("holdoff wait failed, retrying discovery");
            continue;
        }
        if is_shutdown(&shared) {
            continue;
        }

        set_phase(&shared, Phase::Connect);
        match run_tcp_phase(&driver_config, &shared, &config, &handlers, &wake_pair, peer, server_key, &mut next_rec_id) {
            Ok(()) => {
                error_streak = 0;
            }
            Err(e) => {
                log::warn!("TCP cycle with {peer} failed: {e:#}");
                set_last_msg(&shared, &handlers, format!("lost server: {e}"));
            }
        }

        set_phase(&shared, Phase::Listen);
        log::info!("Lost server {peer}");
    }

    log::info!("Stopping");
    set_last_msg(&shared, &handlers, "stopped");
}

/// Block for `duration` on a throwaway socket watching only the wake
/// descriptor (the UDP phase's own socket isn't open yet at this point in
/// the cycle). No data is expected; the call always ends in a timeout,
/// either real (holdoff elapsed) or from the wake descriptor (shutdown).
fn wait_holdoff(wake_pair: &WakePair, duration: Duration) -> std::io::Result<()> {
    let mut sock = InterruptibleSocket::udp_bind(0)?;
    sock.set_wake_fd(wake_pair.worker);
    sock.set_timeout(Some(duration));
    let mut scratch = [0u8; 1];
    let _ = sock.recv_from(&mut scratch, false);
    Ok(())
}

/// Run the UDP discovery phase until shutdown or a valid announcement.
fn run_udp_phase(
    driver_config: &DriverConfig,
    shared: &Mutex<Shared>,
    handlers: &Handlers,
    wake_pair: &WakePair,
) -> Result<(SocketAddr, u32)> {
    let mut sock = InterruptibleSocket::udp_bind(driver_config.udp_port).context("binding UDP discovery socket")?;
    sock.set_wake_fd(wake_pair.worker);

    let bound_port = sock.local_port().context("reading back ephemeral UDP port")?;
    shared.lock().unwrap().udp_port = Some(bound_port);
    log::debug!("listening for announcements on UDP port {bound_port}");

    if let Some(test_hook) = &handlers.test_hook {
        test_hook(TestStage::UdpSetup);
    }

    let mut buf = [0u8; 64];
    loop {
        if is_shutdown(shared) {
            bail!("shutdown requested during discovery");
        }

        match sock.recv_from(&mut buf, true) {
            Ok((n, SocketAddr::V4(source))) => {
                let Some(announcement) = wire::Announcement::decode(&buf[..n]) else {
                    continue;
                };
                let resolved_ip = announcement.resolve_ip(*source.ip());
                let peer = SocketAddr::V4(SocketAddrV4::new(resolved_ip, announcement.server_port));
                return Ok((peer, announcement.server_key));
            }
            Ok((_, SocketAddr::V6(_))) => continue,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                if is_shutdown(shared) {
                    bail!("shutdown requested during discovery");
                }
                continue;
            }
            Err(e) => return Err(e).context("udp recv failed"),
        }
    }
}

/// Run the TCP connect/handshake/upload/maintain phase for one cycle.
/// `Ok(())` means the remote disconnected cleanly after maintenance.
fn run_tcp_phase(
    driver_config: &DriverConfig,
    shared: &Mutex<Shared>,
    config: &Config,
    handlers: &Handlers,
    wake_pair: &WakePair,
    peer: SocketAddr,
    server_key: u32,
    next_rec_id: &mut i64,
) -> Result<()> {
    let mut sock = InterruptibleSocket::tcp().context("creating TCP socket")?;
    sock.set_wake_fd(wake_pair.worker);
    sock.set_timeout(Some(driver_config.timeout));
    sock.connect(peer).with_context(|| format!("connecting to {peer}"))?;

    if let Some(test_hook) = &handlers.test_hook {
        test_hook(TestStage::TcpSetup);
    }

    handshake(&mut sock, server_key)?;

    set_phase(shared, Phase::Upload);
    set_last_msg(shared, handlers, format!("Connected to {peer}"));

    {
        let mut uploader = CatalogUploader::new(&mut sock, next_rec_id);
        uploader.send_default_env_tags(config).context("sending environment info tags")?;
    }

    if let Some(get_records) = &handlers.get_records {
        let mut uploader = CatalogUploader::new(&mut sock, next_rec_id);
        get_records(&mut uploader, config).context("getRecords callback failed")?;
    }

    send_message(&mut sock, &wire::client_done()).context("sending client done")?;
    set_phase(shared, Phase::Done);
    set_last_msg(shared, handlers, format!("Synchronized with {peer}"));

    maintain(&mut sock, driver_config)
}

/// Ceiling on what a single inbound TCP message body is read into a real
/// buffer for. Every message this client ever receives (server greeting,
/// server ping) fits well inside this; a peer advertising more than this
/// in `body_len` has the excess drained via [`InterruptibleSocket::recv_discard`]
/// instead of allocated, matching `caster.c`'s `casterRecvPMsg`, which reads
/// into a fixed-size `union casterTCPBody` and calls `shRecvIgnore` on the
/// remainder (spec §4.2).
const MAX_INBOUND_BODY: usize = 64;

/// Read a message body bounded by [`MAX_INBOUND_BODY`], discarding any
/// bytes beyond it rather than allocating to fit `body_len`.
fn recv_bounded_body(sock: &mut InterruptibleSocket, body_len: u32) -> Result<Vec<u8>> {
    let total = body_len as usize;
    let kept = total.min(MAX_INBOUND_BODY);
    let mut scratch = [0u8; MAX_INBOUND_BODY];
    sock.recv_exact(&mut scratch[..kept]).context("reading message body")?;
    if total > kept {
        sock.recv_discard(total - kept).context("discarding oversized message body")?;
    }
    Ok(scratch[..kept].to_vec())
}

fn handshake(sock: &mut InterruptibleSocket, server_key: u32) -> Result<()> {
    send_message(sock, &wire::client_greeting(server_key)).context("sending client greeting")?;

    let mut header_buf = [0u8; wire::HEADER_LEN];
    let outcome = sock.recv_exact(&mut header_buf).context("reading server greeting header")?;
    if outcome == crate::error::RecvOutcome::ClosedAtStart {
        bail!("peer closed before handshake reply");
    }
    let header = wire::Header::decode(&header_buf)?;
    if header.msg_id != MSG_SERVER_GREETING {
        bail!("expected server greeting (0x8001), got 0x{:04x}", header.msg_id);
    }

    let body = recv_bounded_body(sock, header.body_len).context("reading server greeting body")?;
    let greeting = wire::ServerGreeting::decode(&body)?;
    // local version is always 0 today, so the negotiated version is
    // always 0 regardless of what the server offers.
    log::debug!("server offered protocol version {}, negotiated 0", greeting.version);
    Ok(())
}

/// Answer liveness pings until the remote disconnects cleanly or times out.
fn maintain(sock: &mut InterruptibleSocket, driver_config: &DriverConfig) -> Result<()> {
    sock.set_timeout(Some(driver_config.timeout * 4));

    loop {
        let mut header_buf = [0u8; wire::HEADER_LEN];
        let outcome = match sock.recv_exact(&mut header_buf) {
            Ok(outcome) => outcome,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => bail!("server timeout"),
            Err(e) => return Err(e).context("maintenance recv failed"),
        };

        if outcome == crate::error::RecvOutcome::ClosedAtStart {
            return Ok(());
        }

        let header = wire::Header::decode(&header_buf)?;
        let body = recv_bounded_body(sock, header.body_len).context("reading maintenance message body")?;

        if header.msg_id == MSG_SERVER_PING {
            send_message(sock, &wire::client_pong(&body)).context("replying to ping")?;
        }
    }
}

fn send_message(sock: &mut InterruptibleSocket, msg: &[u8]) -> Result<()> {
    let sent = sock.send_all(msg)?;
    if !sent {
        bail!("connection lost mid-send");
    }
    Ok(())
}
