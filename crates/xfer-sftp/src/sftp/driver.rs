//! Tokio driver for [`SftpControlSocket`].
//!
//! Owns the helper process. Its stdout is decoded by a reader task into
//! [`SftpEvent`]s; request lines go to its stdin in the order the state
//! machine emits them. Rate-limit grants are computed in short-lived tasks
//! so a throttled transfer never blocks the loop.

use crate::sftp::control::SftpControlSocket;
use crate::sftp::effect::{SftpEffect, SftpEvent};
use crate::sftp::event::EventDecoder;
use crate::sftp::request::Request;
use crate::sftp::LOG_TARGET;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use filetime::FileTime;
use std::future::pending;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use xfer_core::command::Command;
use xfer_core::driver::{ControlSocket, DriverInput, DriverInputs, ProtocolDriver, SocketEnv};
use xfer_core::error::EngineError;
use xfer_core::logging::Logger;
use xfer_core::rate_limit::Direction;
use xfer_core::reply::ReplyCode;
use xfer_core::server::Server;

const READ_BUFFER: usize = 16 * 1024;

/// Decode helper output from `reader` until EOF or a framing error.
///
/// Exactly one [`SftpEvent::Terminated`] is sent at the end, whatever the
/// cause.
pub async fn read_events<R: AsyncRead + Unpin>(mut reader: R, tx: UnboundedSender<SftpEvent>) {
    let mut decoder = EventDecoder::new();
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                let end = match decoder.finish() {
                    Ok(()) => EngineError::disconnected("SFTP helper exited"),
                    Err(e) => EngineError::helper_failed(e.to_string()),
                };
                let _ = tx.send(SftpEvent::Terminated(end));
                return;
            }
            Ok(n) => n,
            Err(e) => {
                let _ = tx.send(SftpEvent::Terminated(e.into()));
                return;
            }
        };
        decoder.push(&buf[..n]);
        loop {
            match decoder.next_event() {
                Ok(Some(event)) => {
                    if tx.send(SftpEvent::Helper(event)).is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(SftpEvent::Terminated(EngineError::helper_failed(e.to_string())));
                    return;
                }
            }
        }
    }
}

/// Quota grants, tagged with the helper generation they were computed for.
struct Grant {
    epoch: u64,
    direction: Direction,
    bytes: Option<usize>,
}

enum Wake {
    Input(Option<DriverInput>),
    LockGranted,
    Helper(Option<SftpEvent>),
    Grant(Grant),
    Timer,
}

pub struct SftpDriver {
    env: SocketEnv,
    logger: Logger,
    socket: SftpControlSocket,
    server: Option<Server>,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    reader_task: Option<JoinHandle<()>>,
    helper_rx: Option<UnboundedReceiver<SftpEvent>>,
    grant_tx: UnboundedSender<Grant>,
    grant_rx: UnboundedReceiver<Grant>,
    /// Bumped whenever the helper goes away so stale grants are dropped.
    epoch: u64,
    ended: Option<ReplyCode>,
}

impl SftpDriver {
    pub fn new(env: SocketEnv, server: Server) -> Self {
        let (grant_tx, grant_rx) = mpsc::unbounded_channel();
        Self {
            logger: env.logger(LOG_TARGET),
            socket: SftpControlSocket::new(env.clone()),
            env,
            server: Some(server),
            child: None,
            stdin: None,
            reader_task: None,
            helper_rx: None,
            grant_tx,
            grant_rx,
            epoch: 0,
            ended: None,
        }
    }

    pub fn socket(&self) -> &SftpControlSocket {
        &self.socket
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
        let helper_rx = &mut self.helper_rx;
        let grant_rx = &mut self.grant_rx;
        tokio::select! {
            input = inputs.commands.recv() => Wake::Input(input),
            Some(()) = inputs.lock_wakeups.recv() => Wake::LockGranted,
            event = async {
                match helper_rx.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => pending().await,
                }
            } => Wake::Helper(event),
            Some(grant) = grant_rx.recv() => Wake::Grant(grant),
            _ = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at.into()).await,
                    None => pending().await,
                }
            } => Wake::Timer,
        }
    }

    async fn on_wake(&mut self, wake: Wake) -> bool {
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
                self.socket.handle(SftpEvent::AsyncReply(envelope))
            }
            Wake::Input(Some(DriverInput::Cancel)) => self.socket.handle(SftpEvent::Cancel),
            Wake::LockGranted => self.socket.handle(SftpEvent::LockGranted),
            Wake::Helper(Some(event)) => {
                if matches!(event, SftpEvent::Terminated(_)) {
                    self.helper_rx = None;
                }
                self.socket.handle(event);
            }
            Wake::Helper(None) => {
                self.helper_rx = None;
                self.socket.handle(SftpEvent::Terminated(EngineError::disconnected(
                    "SFTP helper output closed",
                )));
            }
            Wake::Grant(grant) if grant.epoch != self.epoch => {}
            Wake::Grant(grant) => {
                let request = Request::Quota {
                    direction: grant.direction,
                    bytes: grant.bytes,
                };
                self.write(request).await;
            }
            Wake::Timer => self.socket.handle(SftpEvent::Timer(std::time::Instant::now())),
        }
        true
    }

    // ─── Effects ─────────────────────────────────────────────────────

    async fn drain_effects(&mut self) {
        while let Some(effect) = self.socket.poll_effect() {
            self.apply(effect).await;
        }
    }

    async fn apply(&mut self, effect: SftpEffect) {
        match effect {
            SftpEffect::Spawn => self.spawn(),
            SftpEffect::Send(request) => self.write(request).await,
            SftpEffect::GrantQuota(direction) => self.grant(direction),
            SftpEffect::Notify(notification) => self.env.post(notification),
            SftpEffect::Complete(code) => {
                self.env.status.set_connected(self.socket.is_connected());
                if code.is_disconnected() || !self.socket.is_open() {
                    self.ended = Some(code);
                }
                self.env.complete(code);
            }
            SftpEffect::DiscardEmptyLocalFile(path) => discard_if_empty(path, &self.logger).await,
            SftpEffect::SetLocalMtime { path, time } => set_mtime(&path, time, &self.logger),
            SftpEffect::Close => {
                self.shutdown();
                self.env.status.set_connected(false);
                self.ended = Some(ReplyCode::DISCONNECTED);
            }
        }
    }

    fn spawn(&mut self) {
        self.shutdown();
        let helper = self.env.context.options().sftp_helper.clone();
        self.logger
            .debug(format!("Starting SFTP helper {}", helper.display()));
        let spawned = tokio::process::Command::new(&helper)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                self.socket.handle(SftpEvent::SpawnFailed(EngineError::helper_failed(format!(
                    "{}: {}",
                    helper.display(),
                    e
                ))));
                return;
            }
        };
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            self.socket.handle(SftpEvent::SpawnFailed(EngineError::helper_failed(
                "helper pipes unavailable",
            )));
            return;
        };
        let (tx, rx) = mpsc::unbounded_channel();
        self.reader_task = Some(tokio::spawn(read_events(stdout, tx)));
        self.helper_rx = Some(rx);
        self.stdin = Some(stdin);
        self.child = Some(child);
        self.socket.handle(SftpEvent::Started);
    }

    async fn write(&mut self, request: Request) {
        let Some(stdin) = self.stdin.as_mut() else {
            self.socket.handle(SftpEvent::Terminated(EngineError::disconnected(
                "SFTP helper is not running",
            )));
            return;
        };
        let mut line = request.line();
        line.push('\n');
        let written = match stdin.write_all(line.as_bytes()).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            self.stdin = None;
            self.socket.handle(SftpEvent::Terminated(EngineError::write_failed(format!(
                "Could not write to SFTP helper: {}",
                e
            ))));
        }
    }

    /// Answer a quota request once the limiter hands out the next chunk.
    fn grant(&mut self, direction: Direction) {
        let limiter = self.env.context.rate_limiter().clone();
        let chunk = self.env.context.options().transfer_buffer_size.max(1);
        let tx = self.grant_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let bytes = if limiter.is_limited(direction) {
                Some(limiter.acquire(direction, chunk).await)
            } else {
                None
            };
            let _ = tx.send(Grant {
                epoch,
                direction,
                bytes,
            });
        });
    }

    fn shutdown(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        self.helper_rx = None;
        self.stdin = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
        }
        self.epoch += 1;
    }
}

impl Drop for SftpDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl ProtocolDriver for SftpDriver {
    async fn run(&mut self, inputs: &mut DriverInputs) -> ReplyCode {
        if let Some(server) = self.server.take() {
            self.execute(Command::Connect { server });
        }
        self.drain_effects().await;
        while !self.finished() {
            let wake = self.next_wake(inputs).await;
            let keep_going = self.on_wake(wake).await;
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
    let mtime = FileTime::from_unix_time(time.timestamp(), 0);
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
    use crate::sftp::event::HelperEvent;

    async fn collect(input: &'static [u8]) -> Vec<SftpEvent> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        read_events(input, tx).await;
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn clean_exit_is_a_disconnect() {
        let events = collect(b"0fzSftp started, protocol_version=11\n11\n").await;
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], SftpEvent::Helper(HelperEvent::Reply(_))));
        assert!(matches!(&events[1], SftpEvent::Helper(HelperEvent::Done(true))));
        match &events[2] {
            SftpEvent::Terminated(e) => assert_eq!(e.kind, xfer_core::error::ErrorKind::Disconnected),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn truncated_event_terminates_once() {
        // Listentry announced but only one of its three lines arrived.
        let events = collect(b"9-rw-r--r-- 1 u g 3 Jan 1 2020 a\n").await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            SftpEvent::Terminated(e) => {
                assert_eq!(e.kind, xfer_core::error::ErrorKind::HelperFailed);
                assert!(e.message.contains("unexpected EOF"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn garbage_stops_decoding() {
        let events = collect(b"11\n~junk\n11\n").await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], SftpEvent::Terminated(_)));
    }

    #[tokio::test]
    async fn discards_only_empty_files() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty");
        let full = dir.path().join("full");
        std::fs::write(&empty, b"").unwrap();
        std::fs::write(&full, b"data").unwrap();
        let logger = Logger::detached(xfer_core::lock::EngineId(2), LOG_TARGET);
        discard_if_empty(empty.clone(), &logger).await;
        discard_if_empty(full.clone(), &logger).await;
        assert!(!empty.exists());
        assert!(full.exists());
    }
}
