//! Data channel task: one per data connection.
//!
//! Passive: connect to the announced address. Active: accept on a bound
//! listener, only from the control connection's peer. Either way TLS is
//! layered on when PROT P is in effect, then the payload runs in one of
//! four modes and completion is reported exactly once as
//! `FtpEvent::TransferEnded`.

use crate::ftp::backend::{copy_limited, CopyError, Stream};
use crate::ftp::effect::{FtpEvent, TransferMode, TransferSetup};
use crate::ftp::pasv::port_candidates;
use crate::ftp::tls::TlsSession;
use std::io::SeekFrom;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedSender;
use xfer_core::error::EngineError;
use xfer_core::listing::DirEntry;
use xfer_core::listing_parser::ListingParser;
use xfer_core::logging::Logger;
use xfer_core::notification::{MessageType, Notification, TransferStatus};
use xfer_core::operation::TransferEndReason;
use xfer_core::rate_limit::{Direction, RateLimiter};

/// Minimum spacing of progress notifications.
const STATUS_INTERVAL: Duration = Duration::from_millis(100);
/// Minimum spacing of activity pings to the control socket.
const ACTIVITY_INTERVAL: Duration = Duration::from_secs(1);

/// Everything a data task needs from its driver.
#[derive(Debug, Clone)]
pub struct DataContext {
    pub setup: TransferSetup,
    pub tls: Option<TlsSession>,
    pub limiter: RateLimiter,
    pub buffer_size: usize,
    pub connect_timeout: Option<Duration>,
    pub logger: Logger,
    pub log_raw_listing: bool,
    pub notifications: UnboundedSender<Notification>,
    /// Events for the control socket, tagged by the driver.
    pub events: UnboundedSender<FtpEvent>,
}

impl DataContext {
    fn send(&self, event: FtpEvent) {
        let _ = self.events.send(event);
    }

    fn notify(&self, notification: Notification) {
        let _ = self.notifications.send(notification);
    }
}

#[derive(Debug)]
pub struct Outcome {
    pub reason: TransferEndReason,
    pub error: Option<EngineError>,
    pub listing: Option<Vec<DirEntry>>,
    pub transferred: i64,
    pub tls_resumed: Option<bool>,
}

impl Outcome {
    fn new(reason: TransferEndReason) -> Self {
        Self {
            reason,
            error: None,
            listing: None,
            transferred: 0,
            tls_resumed: None,
        }
    }

    fn failed(reason: TransferEndReason, error: EngineError) -> Self {
        Self {
            error: Some(error),
            ..Self::new(reason)
        }
    }

    fn into_event(self) -> FtpEvent {
        FtpEvent::TransferEnded {
            reason: self.reason,
            error: self.error,
            listing: self.listing,
            transferred: self.transferred,
            tls_resumed: self.tls_resumed,
        }
    }
}

// ─── Connection setup ────────────────────────────────────────────────

/// Passive mode: connect, report, run.
pub async fn run_passive(addr: SocketAddr, ctx: DataContext) {
    ctx.logger.debug(format!("Connecting data channel to {}", addr));
    let connect = TcpStream::connect(addr);
    let connected = match ctx.connect_timeout {
        Some(dur) => tokio::time::timeout(dur, connect)
            .await
            .unwrap_or_else(|_| Err(std::io::ErrorKind::TimedOut.into())),
        None => connect.await,
    };
    let tcp = match connected {
        Ok(tcp) => tcp,
        Err(e) => {
            ctx.send(FtpEvent::DataFailed(EngineError::data_channel(format!(
                "Could not open data connection to {}: {}",
                addr, e
            ))));
            return;
        }
    };
    tcp.set_nodelay(true).ok();
    ctx.send(FtpEvent::DataConnected);
    let outcome = run_on(tcp, &ctx).await;
    ctx.send(outcome.into_event());
}

/// Bind a listener for active mode on `local_ip`, trying the configured
/// port range from a random start.
pub async fn bind_active(local_ip: IpAddr, port_range: Option<(u16, u16)>) -> Result<TcpListener, EngineError> {
    let Some((low, high)) = port_range else {
        return TcpListener::bind(SocketAddr::new(local_ip, 0))
            .await
            .map_err(|e| EngineError::data_channel(format!("Could not create listen socket: {}", e)));
    };
    for port in port_candidates(low, high) {
        if let Ok(listener) = TcpListener::bind(SocketAddr::new(local_ip, port)).await {
            return Ok(listener);
        }
    }
    Err(EngineError::data_channel(format!(
        "No free port between {} and {} for the data connection",
        low, high
    )))
}

/// Active mode: report the listener, accept the server's connection, run.
pub async fn run_active(listener: TcpListener, peer: Option<IpAddr>, ctx: DataContext) {
    match listener.local_addr() {
        Ok(addr) => ctx.send(FtpEvent::DataListening(addr)),
        Err(e) => {
            ctx.send(FtpEvent::DataFailed(e.into()));
            return;
        }
    }
    let tcp = loop {
        let accepted = match ctx.connect_timeout {
            Some(dur) => match tokio::time::timeout(dur, listener.accept()).await {
                Ok(result) => result,
                Err(_) => {
                    let err = EngineError::timeout("Server did not connect to the data port");
                    ctx.send(Outcome::failed(TransferEndReason::Timeout, err).into_event());
                    return;
                }
            },
            None => listener.accept().await,
        };
        match accepted {
            Ok((tcp, from)) => {
                if peer.map_or(true, |ip| ip == from.ip()) {
                    break tcp;
                }
                ctx.logger.warning(format!("Rejected data connection from unexpected address {}", from));
            }
            Err(e) => {
                let err = EngineError::data_channel(format!("Accepting the data connection failed: {}", e));
                ctx.send(Outcome::failed(TransferEndReason::TransferFailure, err).into_event());
                return;
            }
        }
    };
    drop(listener);
    tcp.set_nodelay(true).ok();
    let outcome = run_on(tcp, &ctx).await;
    ctx.send(outcome.into_event());
}

async fn run_on(tcp: TcpStream, ctx: &DataContext) -> Outcome {
    let (mut stream, tls_resumed) = match (&ctx.tls, ctx.setup.protect) {
        (Some(session), true) => match session.handshake_data(tcp).await {
            Ok((stream, resumed)) => (stream, Some(resumed)),
            Err(e) => return Outcome::failed(TransferEndReason::TransferFailure, e),
        },
        _ => (Stream::Plain(tcp), None),
    };
    let mut outcome = match &ctx.setup.mode {
        TransferMode::List { server_type, latin1 } => {
            let parser = ListingParser::new(*server_type).with_latin1(*latin1);
            receive_listing(&mut stream, parser, ctx).await
        }
        TransferMode::Download {
            local_file,
            offset,
            total_size,
        } => download(&mut stream, local_file, *offset, *total_size, ctx).await,
        TransferMode::Upload { local_file, offset } => upload(&mut stream, local_file, *offset, ctx).await,
        TransferMode::ResumeTest => resume_test(&mut stream).await,
    };
    outcome.tls_resumed = tls_resumed;
    outcome
}

// ─── Progress ────────────────────────────────────────────────────────

struct Progress<'a> {
    ctx: &'a DataContext,
    status: TransferStatus,
    direction: Direction,
    last_status: Instant,
    last_activity: Instant,
}

impl<'a> Progress<'a> {
    fn new(ctx: &'a DataContext, status: TransferStatus, direction: Direction) -> Self {
        let now = Instant::now();
        Self {
            ctx,
            status,
            direction,
            last_status: now,
            last_activity: now - ACTIVITY_INTERVAL,
        }
    }

    fn add(&mut self, bytes: usize) {
        self.status.current_offset += bytes as i64;
        let now = Instant::now();
        if now.duration_since(self.last_activity) >= ACTIVITY_INTERVAL {
            self.last_activity = now;
            self.ctx.send(FtpEvent::DataActivity);
            self.ctx.notify(Notification::Active(self.direction));
        }
        if now.duration_since(self.last_status) >= STATUS_INTERVAL {
            self.last_status = now;
            self.ctx.notify(Notification::TransferStatus(Some(self.status.clone())));
        }
    }

    fn transferred(&self) -> i64 {
        self.status.transferred()
    }

    fn finish(&self) {
        self.ctx.notify(Notification::TransferStatus(Some(self.status.clone())));
    }
}

// ─── Payload modes ───────────────────────────────────────────────────

async fn receive_listing(stream: &mut Stream, mut parser: ListingParser, ctx: &DataContext) -> Outcome {
    let mut progress = Progress::new(ctx, TransferStatus::new(-1, 0, true), Direction::Inbound);
    let mut buf = vec![0u8; ctx.buffer_size.max(1024)];
    let mut raw = Vec::new();
    loop {
        let allowed = ctx.limiter.acquire(Direction::Inbound, buf.len()).await.max(1);
        match stream.read(&mut buf[..allowed]).await {
            Ok(0) => break,
            Ok(n) => {
                parser.add_data(&buf[..n]);
                if ctx.log_raw_listing {
                    raw.extend_from_slice(&buf[..n]);
                }
                progress.add(n);
            }
            Err(e) => {
                let mut out = Outcome::failed(TransferEndReason::TransferFailure, e.into());
                out.transferred = progress.transferred();
                return out;
            }
        }
    }
    if ctx.log_raw_listing {
        for line in String::from_utf8_lossy(&raw).lines().filter(|l| !l.is_empty()) {
            ctx.logger.log(MessageType::RawList, line);
        }
    }
    let mut out = Outcome::new(TransferEndReason::Successful);
    out.transferred = progress.transferred();
    out.listing = Some(parser.finish());
    out
}

async fn download(
    stream: &mut Stream,
    local_file: &Path,
    offset: i64,
    total_size: i64,
    ctx: &DataContext,
) -> Outcome {
    let opened = if offset > 0 {
        OpenOptions::new().append(true).open(local_file).await
    } else {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(local_file)
            .await
    };
    let mut file = match opened {
        Ok(f) => f,
        Err(e) => {
            let err = EngineError::io_error(format!("Failed to open \"{}\" for writing: {}", local_file.display(), e));
            return Outcome::failed(TransferEndReason::TransferFailureCritical, err);
        }
    };
    let mut progress = Progress::new(ctx, TransferStatus::new(total_size, offset, false), Direction::Inbound);
    let copied = copy_limited(
        stream,
        &mut file,
        &ctx.limiter,
        Direction::Inbound,
        ctx.buffer_size,
        |n| progress.add(n),
    )
    .await;
    progress.finish();
    let mut out = match copied {
        Ok(_) => match file.sync_all().await {
            Ok(()) => Outcome::new(TransferEndReason::Successful),
            Err(e) => Outcome::failed(
                TransferEndReason::TransferFailureCritical,
                EngineError::write_failed(format!("Could not write to local file: {}", e)),
            ),
        },
        Err(CopyError::Source(e)) => Outcome::failed(TransferEndReason::TransferFailure, e.into()),
        Err(CopyError::Sink(e)) => Outcome::failed(
            TransferEndReason::TransferFailureCritical,
            EngineError::write_failed(format!("Could not write to local file: {}", e)),
        ),
    };
    out.transferred = progress.transferred();
    out
}

async fn upload(stream: &mut Stream, local_file: &Path, offset: i64, ctx: &DataContext) -> Outcome {
    let mut file = match File::open(local_file).await {
        Ok(f) => f,
        Err(e) => {
            let err = EngineError::io_error(format!("Failed to open \"{}\" for reading: {}", local_file.display(), e));
            return Outcome::failed(TransferEndReason::TransferFailureCritical, err);
        }
    };
    let total = file.metadata().await.map(|m| m.len() as i64).unwrap_or(-1);
    if offset > 0 {
        if let Err(e) = file.seek(SeekFrom::Start(offset as u64)).await {
            return Outcome::failed(TransferEndReason::TransferFailureCritical, e.into());
        }
    }
    let mut progress = Progress::new(ctx, TransferStatus::new(total, offset, false), Direction::Outbound);
    let copied = copy_limited(
        &mut file,
        stream,
        &ctx.limiter,
        Direction::Outbound,
        ctx.buffer_size,
        |n| progress.add(n),
    )
    .await;
    progress.finish();
    let mut out = match copied {
        Ok(_) => match stream.shutdown().await {
            Ok(()) => Outcome::new(TransferEndReason::Successful),
            Err(e) => Outcome::failed(TransferEndReason::TransferFailure, e.into()),
        },
        Err(CopyError::Source(e)) => Outcome::failed(
            TransferEndReason::TransferFailureCritical,
            EngineError::io_error(format!("Could not read local file: {}", e)),
        ),
        Err(CopyError::Sink(e)) => Outcome::failed(TransferEndReason::TransferFailure, e.into()),
    };
    out.transferred = progress.transferred();
    out
}

/// Exactly one byte must follow a REST to the last byte of the file.
async fn resume_test(stream: &mut Stream) -> Outcome {
    let mut buf = [0u8; 2];
    let mut received = 0usize;
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                received += n;
                if received > 1 {
                    break;
                }
            }
            Err(e) => return Outcome::failed(TransferEndReason::TransferFailure, e.into()),
        }
    }
    let mut out = if received == 1 {
        Outcome::new(TransferEndReason::Successful)
    } else {
        Outcome::new(TransferEndReason::FailedResumetest)
    };
    out.transferred = received as i64;
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use xfer_core::lock::EngineId;
    use xfer_core::server::ServerType;

    fn context(mode: TransferMode) -> (DataContext, mpsc::UnboundedReceiver<FtpEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (notifications, _) = mpsc::unbounded_channel();
        let ctx = DataContext {
            setup: TransferSetup {
                mode,
                protect: false,
                binary: true,
            },
            tls: None,
            limiter: RateLimiter::unlimited(),
            buffer_size: 4096,
            connect_timeout: Some(Duration::from_secs(5)),
            logger: Logger::detached(EngineId(1), "xfer::test"),
            log_raw_listing: false,
            notifications,
            events,
        };
        (ctx, rx)
    }

    async fn serve_once(payload: &'static [u8]) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(payload).await.unwrap();
        });
        addr
    }

    async fn ended(rx: &mut mpsc::UnboundedReceiver<FtpEvent>) -> FtpEvent {
        loop {
            match rx.recv().await.unwrap() {
                ev @ FtpEvent::TransferEnded { .. } => return ev,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn passive_download_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("out.bin");
        let addr = serve_once(b"hello world").await;
        let (ctx, mut rx) = context(TransferMode::Download {
            local_file: file.clone(),
            offset: 0,
            total_size: 11,
        });
        run_passive(addr, ctx).await;
        assert!(matches!(rx.recv().await, Some(FtpEvent::DataConnected)));
        match ended(&mut rx).await {
            FtpEvent::TransferEnded { reason, transferred, .. } => {
                assert_eq!(reason, TransferEndReason::Successful);
                assert_eq!(transferred, 11);
            }
            _ => unreachable!(),
        }
        assert_eq!(std::fs::read(&file).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn resume_download_appends() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("part.bin");
        std::fs::write(&file, b"hello ").unwrap();
        let addr = serve_once(b"world").await;
        let (ctx, mut rx) = context(TransferMode::Download {
            local_file: file.clone(),
            offset: 6,
            total_size: 11,
        });
        run_passive(addr, ctx).await;
        ended(&mut rx).await;
        assert_eq!(std::fs::read(&file).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn listing_is_parsed() {
        let addr = serve_once(b"-rw-r--r-- 1 user group 42 Jan 01 12:00 a.txt\r\ndrwxr-xr-x 2 user group 4096 Jan 01 12:00 sub\r\n").await;
        let (ctx, mut rx) = context(TransferMode::List {
            server_type: ServerType::Unix,
            latin1: false,
        });
        run_passive(addr, ctx).await;
        match ended(&mut rx).await {
            FtpEvent::TransferEnded { listing: Some(entries), .. } => {
                assert_eq!(entries.len(), 2);
                assert!(entries.iter().any(|e| e.name == "sub" && e.is_dir()));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn resume_probe_wants_exactly_one_byte() {
        for (payload, expected) in [
            (&b"x"[..], TransferEndReason::Successful),
            (&b"xy"[..], TransferEndReason::FailedResumetest),
            (&b""[..], TransferEndReason::FailedResumetest),
        ] {
            let addr = serve_once(payload).await;
            let (ctx, mut rx) = context(TransferMode::ResumeTest);
            run_passive(addr, ctx).await;
            match ended(&mut rx).await {
                FtpEvent::TransferEnded { reason, .. } => assert_eq!(reason, expected),
                _ => unreachable!(),
            }
        }
    }

    #[tokio::test]
    async fn refused_passive_connection_reports_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let (ctx, mut rx) = context(TransferMode::ResumeTest);
        run_passive(addr, ctx).await;
        assert!(matches!(rx.recv().await, Some(FtpEvent::DataFailed(_))));
    }

    #[tokio::test]
    async fn active_upload_sends_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("up.txt");
        std::fs::write(&file, b"0123456789").unwrap();
        let listener = bind_active("127.0.0.1".parse().unwrap(), None).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (ctx, mut rx) = context(TransferMode::Upload {
            local_file: file,
            offset: 4,
        });
        let task = tokio::spawn(run_active(listener, Some(addr.ip()), ctx));
        let mut sock = TcpStream::connect(addr).await.unwrap();
        let mut got = Vec::new();
        sock.read_to_end(&mut got).await.unwrap();
        task.await.unwrap();
        assert_eq!(got, b"456789");
        assert!(matches!(rx.recv().await, Some(FtpEvent::DataListening(_))));
        match ended(&mut rx).await {
            FtpEvent::TransferEnded { reason, transferred, .. } => {
                assert_eq!(reason, TransferEndReason::Successful);
                assert_eq!(transferred, 6);
            }
            _ => unreachable!(),
        }
    }
}
