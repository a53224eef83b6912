//! Tokio driver for [`FtpControlSocket`].
//!
//! Owns the control stream, the TLS session and the data task. Every input
//! (engine commands, control bytes, data-channel events, lock hand-overs,
//! timers) is turned into an [`FtpEvent`]; every [`FtpEffect`] the state
//! machine emits is carried out here, in order.

use crate::ftp::backend::{connect_tcp, Stream};
use crate::ftp::control::FtpControlSocket;
use crate::ftp::effect::{FtpEffect, FtpEvent, TransferSetup};
use crate::ftp::tls::{Handshake, TlsSession};
use crate::ftp::transfer::{self, DataContext};
use crate::ftp::LOG_TARGET;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use filetime::FileTime;
use std::future::pending;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use xfer_core::command::Command;
use xfer_core::driver::{ControlSocket, DriverInput, DriverInputs, ProtocolDriver, SocketEnv};
use xfer_core::error::{EngineError, EngineResult};
use xfer_core::logging::Logger;
use xfer_core::reply::ReplyCode;
use xfer_core::server::Server;

const READ_BUFFER: usize = 16 * 1024;

/// Results of background connect work, tagged with the connection epoch
/// they were started in.
enum Internal {
    Connected(u64, EngineResult<TcpStream>),
    Tls(u64, EngineResult<Handshake>),
}

enum Wake {
    Input(Option<DriverInput>),
    LockGranted,
    Control(std::io::Result<usize>),
    Internal(Internal),
    Data(Option<FtpEvent>),
    Timer,
}

pub struct FtpDriver {
    env: SocketEnv,
    logger: Logger,
    socket: FtpControlSocket,
    server: Option<Server>,
    control: Option<Stream>,
    read_buf: Vec<u8>,
    tls: Option<TlsSession>,
    /// Where the last `Connect` effect went; TLS names the same host.
    target: Option<(String, u16)>,
    internal_tx: UnboundedSender<Internal>,
    internal_rx: UnboundedReceiver<Internal>,
    /// Bumped on every close so late connect or handshake results are dropped.
    epoch: u64,
    setup_task: Option<JoinHandle<()>>,
    data_task: Option<JoinHandle<()>>,
    data_rx: Option<UnboundedReceiver<FtpEvent>>,
    ended: Option<ReplyCode>,
}

impl FtpDriver {
    pub fn new(env: SocketEnv, server: Server) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        Self {
            logger: env.logger(LOG_TARGET),
            socket: FtpControlSocket::new(env.clone()),
            env,
            server: Some(server),
            control: None,
            read_buf: vec![0u8; READ_BUFFER],
            tls: None,
            target: None,
            internal_tx,
            internal_rx,
            epoch: 0,
            setup_task: None,
            data_task: None,
            data_rx: None,
            ended: None,
        }
    }

    pub fn socket(&self) -> &FtpControlSocket {
        &self.socket
    }

    fn timeout(&self) -> Option<Duration> {
        let secs = self.env.context.options().timeout_secs;
        (secs > 0).then(|| Duration::from_secs(secs))
    }

    fn finished(&self) -> bool {
        !self.socket.is_open() && self.socket.is_idle()
    }

    fn execute(&mut self, command: Command) {
        let code = self.socket.execute(command);
        if code != ReplyCode::WOULDBLOCK {
            self.env.complete(code);
        }
    }

    // ─── Wakeups ─────────────────────────────────────────────────────

    async fn next_wake(&mut self, inputs: &mut DriverInputs) -> Wake {
        let deadline = self.socket.next_deadline();
        let control = &mut self.control;
        let read_buf = &mut self.read_buf;
        let data_rx = &mut self.data_rx;
        let internal_rx = &mut self.internal_rx;
        tokio::select! {
            input = inputs.commands.recv() => Wake::Input(input),
            Some(()) = inputs.lock_wakeups.recv() => Wake::LockGranted,
            read = async {
                match control.as_mut() {
                    Some(stream) => stream.read(read_buf).await,
                    None => pending().await,
                }
            } => Wake::Control(read),
            Some(msg) = internal_rx.recv() => Wake::Internal(msg),
            event = async {
                match data_rx.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => pending().await,
                }
            } => Wake::Data(event),
            _ = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at.into()).await,
                    None => pending().await,
                }
            } => Wake::Timer,
        }
    }

    fn on_wake(&mut self, wake: Wake) -> bool {
        match wake {
            Wake::Input(None) => {
                self.logger.debug("Engine went away, closing connection");
                if self.socket.is_idle() {
                    self.socket.close();
                } else {
                    self.socket.reset_operation(ReplyCode::CANCELED | ReplyCode::DISCONNECTED);
                }
                return false;
            }
            Wake::Input(Some(DriverInput::Command(command))) => self.execute(command),
            Wake::Input(Some(DriverInput::AsyncReply(envelope))) => {
                self.socket.handle(FtpEvent::AsyncReply(envelope))
            }
            Wake::Input(Some(DriverInput::Cancel)) => self.socket.handle(FtpEvent::Cancel),
            Wake::LockGranted => self.socket.handle(FtpEvent::LockGranted),
            Wake::Control(Ok(0)) => {
                self.control = None;
                self.socket.handle(FtpEvent::ConnectionLost(EngineError::disconnected(
                    "Connection closed by server",
                )));
            }
            Wake::Control(Ok(n)) => {
                let data = self.read_buf[..n].to_vec();
                self.socket.handle(FtpEvent::Received(data));
            }
            Wake::Control(Err(e)) => {
                self.control = None;
                self.socket.handle(FtpEvent::ConnectionLost(e.into()));
            }
            Wake::Internal(msg) => self.on_internal(msg),
            Wake::Data(Some(event)) => self.socket.handle(event),
            Wake::Data(None) => {
                self.data_rx = None;
                self.data_task = None;
            }
            Wake::Timer => self.socket.handle(FtpEvent::Timer(std::time::Instant::now())),
        }
        true
    }

    fn on_internal(&mut self, msg: Internal) {
        match msg {
            Internal::Connected(epoch, _) | Internal::Tls(epoch, _) if epoch != self.epoch => {
                self.logger.verbose("Dropping result of an abandoned connection attempt");
            }
            Internal::Connected(_, Ok(tcp)) => {
                self.setup_task = None;
                let addrs = tcp.local_addr().and_then(|l| tcp.peer_addr().map(|p| (l, p)));
                match addrs {
                    Ok((local, peer)) => {
                        self.control = Some(Stream::Plain(tcp));
                        self.socket.handle(FtpEvent::Connected { local, peer });
                    }
                    Err(e) => self.socket.handle(FtpEvent::ConnectFailed(e.into())),
                }
            }
            Internal::Connected(_, Err(e)) => {
                self.setup_task = None;
                self.socket.handle(FtpEvent::ConnectFailed(e));
            }
            Internal::Tls(_, Ok(handshake)) => {
                self.setup_task = None;
                self.control = Some(handshake.stream);
                self.socket.handle(FtpEvent::TlsEstablished {
                    certificate: handshake.certificate,
                    verified: handshake.verified,
                });
            }
            Internal::Tls(_, Err(e)) => {
                self.setup_task = None;
                self.socket.handle(FtpEvent::TlsFailed(e));
            }
        }
    }

    // ─── Effects ─────────────────────────────────────────────────────

    async fn drain_effects(&mut self) {
        while let Some(effect) = self.socket.poll_effect() {
            self.apply(effect).await;
        }
    }

    async fn apply(&mut self, effect: FtpEffect) {
        match effect {
            FtpEffect::Connect { host, port } => self.start_connect(host, port),
            FtpEffect::StartTls => self.start_tls(),
            FtpEffect::Send(bytes) => self.send(&bytes).await,
            FtpEffect::OpenPassive { addr, setup } => self.open_passive(addr, setup),
            FtpEffect::ListenActive { setup } => self.listen_active(setup),
            FtpEffect::AbortTransfer => self.abort_data(),
            FtpEffect::Notify(notification) => self.env.post(notification),
            FtpEffect::Complete(code) => {
                self.env.status.set_connected(self.socket.is_connected());
                if code.is_disconnected() || !self.socket.is_open() {
                    self.ended = Some(code);
                }
                self.env.complete(code);
            }
            FtpEffect::DiscardEmptyLocalFile(path) => discard_if_empty(path, &self.logger).await,
            FtpEffect::SetLocalMtime { path, time } => set_mtime(&path, time, &self.logger),
            FtpEffect::Close => {
                self.shutdown();
                self.env.status.set_connected(false);
                self.ended = Some(ReplyCode::DISCONNECTED);
            }
        }
    }

    fn start_connect(&mut self, host: String, port: u16) {
        self.logger.debug(format!("Connecting to {}:{}", host, port));
        let proxy = self.env.context.options().proxy.clone();
        let timeout = self.timeout();
        let tx = self.internal_tx.clone();
        let epoch = self.epoch;
        self.target = Some((host.clone(), port));
        self.setup_task = Some(tokio::spawn(async move {
            let result = connect_tcp(&host, port, &proxy, timeout).await;
            let _ = tx.send(Internal::Connected(epoch, result));
        }));
    }

    fn start_tls(&mut self) {
        let tcp = match self.control.take() {
            Some(Stream::Plain(tcp)) => tcp,
            Some(tls @ Stream::Tls(_)) => {
                self.control = Some(tls);
                self.socket
                    .handle(FtpEvent::TlsFailed(EngineError::tls_failed("TLS is already active")));
                return;
            }
            None => {
                self.socket.handle(FtpEvent::TlsFailed(EngineError::tls_failed(
                    "No control connection to secure",
                )));
                return;
            }
        };
        let (host, port) = self.target.clone().unwrap_or_default();
        let session = match TlsSession::new(&host, port) {
            Ok(s) => s,
            Err(e) => {
                self.socket.handle(FtpEvent::TlsFailed(e));
                return;
            }
        };
        self.tls = Some(session.clone());
        let tx = self.internal_tx.clone();
        let epoch = self.epoch;
        self.setup_task = Some(tokio::spawn(async move {
            let result = session.handshake_control(tcp).await;
            let _ = tx.send(Internal::Tls(epoch, result));
        }));
    }

    async fn send(&mut self, bytes: &[u8]) {
        let Some(stream) = self.control.as_mut() else {
            self.socket.handle(FtpEvent::ConnectionLost(EngineError::disconnected(
                "Not connected",
            )));
            return;
        };
        let written = match stream.write_all(bytes).await {
            Ok(()) => stream.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            self.control = None;
            self.socket.handle(FtpEvent::ConnectionLost(EngineError::io_error(format!(
                "Could not write to control connection: {}",
                e
            ))));
        }
    }

    fn data_context(&mut self, setup: TransferSetup) -> DataContext {
        self.abort_data();
        let options = self.env.context.options();
        let (events, rx) = mpsc::unbounded_channel();
        self.data_rx = Some(rx);
        DataContext {
            setup,
            tls: self.tls.clone(),
            limiter: self.env.context.rate_limiter().clone(),
            buffer_size: options.transfer_buffer_size,
            connect_timeout: self.timeout(),
            logger: self.logger.clone(),
            log_raw_listing: options.log_raw_listing,
            notifications: self.env.notifications.clone(),
            events,
        }
    }

    fn open_passive(&mut self, addr: SocketAddr, setup: TransferSetup) {
        let ctx = self.data_context(setup);
        self.data_task = Some(tokio::spawn(transfer::run_passive(addr, ctx)));
    }

    fn listen_active(&mut self, setup: TransferSetup) {
        let ctx = self.data_context(setup);
        let Some(stream) = self.control.as_ref() else {
            let _ = ctx
                .events
                .send(FtpEvent::DataFailed(EngineError::disconnected("Not connected")));
            return;
        };
        let tcp = stream.tcp();
        let local_ip = match tcp.local_addr() {
            Ok(addr) => addr.ip(),
            Err(e) => {
                let _ = ctx.events.send(FtpEvent::DataFailed(e.into()));
                return;
            }
        };
        let peer_ip = tcp.peer_addr().ok().map(|a| a.ip());
        let options = self.env.context.options();
        let range = options
            .limit_ports
            .then_some((options.port_range_low, options.port_range_high));
        self.data_task = Some(tokio::spawn(async move {
            match transfer::bind_active(local_ip, range).await {
                Ok(listener) => transfer::run_active(listener, peer_ip, ctx).await,
                Err(e) => {
                    let _ = ctx.events.send(FtpEvent::DataFailed(e));
                }
            }
        }));
    }

    fn abort_data(&mut self) {
        if let Some(task) = self.data_task.take() {
            task.abort();
        }
        self.data_rx = None;
    }

    fn shutdown(&mut self) {
        self.abort_data();
        if let Some(task) = self.setup_task.take() {
            task.abort();
        }
        self.control = None;
        self.tls = None;
        self.epoch += 1;
    }
}

impl Drop for FtpDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl ProtocolDriver for FtpDriver {
    async fn run(&mut self, inputs: &mut DriverInputs) -> ReplyCode {
        if let Some(server) = self.server.take() {
            self.execute(Command::Connect { server });
        }
        self.drain_effects().await;
        while !self.finished() {
            let wake = self.next_wake(inputs).await;
            let keep_going = self.on_wake(wake);
            self.drain_effects().await;
            if !keep_going {
                break;
            }
        }
        self.shutdown();
        self.ended.unwrap_or(ReplyCode::DISCONNECTED)
    }
}

async fn discard_if_empty(path: PathBuf, logger: &Logger) {
    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.len() == 0 => {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                logger.debug(format!("Could not remove empty file \"{}\": {}", path.display(), e));
            }
        }
        _ => {}
    }
}

fn set_mtime(path: &std::path::Path, time: DateTime<Utc>, logger: &Logger) {
    let mtime = FileTime::from_unix_time(time.timestamp(), time.timestamp_subsec_nanos());
    if let Err(e) = filetime::set_file_mtime(path, mtime) {
        logger.warning(format!(
            "Could not set modification time of \"{}\": {}",
            path.display(),
            e
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn discards_only_empty_files() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty");
        let full = dir.path().join("full");
        std::fs::write(&empty, b"").unwrap();
        std::fs::write(&full, b"data").unwrap();
        let logger = Logger::detached(xfer_core::lock::EngineId(1), LOG_TARGET);
        discard_if_empty(empty.clone(), &logger).await;
        discard_if_empty(full.clone(), &logger).await;
        assert!(!empty.exists());
        assert!(full.exists());
    }

    #[test]
    fn mtime_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();
        let time = DateTime::parse_from_rfc3339("2020-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        let logger = Logger::detached(xfer_core::lock::EngineId(1), LOG_TARGET);
        set_mtime(&file, time, &logger);
        let meta = std::fs::metadata(&file).unwrap();
        assert_eq!(FileTime::from_last_modification_time(&meta).unix_seconds(), time.timestamp());
    }
}
