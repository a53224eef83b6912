//! Sans-IO SFTP control socket.
//!
//! Every request written to the helper ends with exactly one `Done` event.
//! Requests still in flight when an operation is reset have their `Done`
//! (and everything reported before it) skipped, so a late answer never
//! reaches the next operation.

use crate::sftp::connect::Challenge;
use crate::sftp::effect::{SftpEffect, SftpEvent};
use crate::sftp::event::HelperEvent;
use crate::sftp::ops::{ConnectState, ListState, MkdirState, SftpOp, Step};
use crate::sftp::request::Request;
use crate::sftp::LOG_TARGET;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;
use xfer_core::command::Command;
use xfer_core::context::EngineContext;
use xfer_core::driver::{ControlSocket, SocketEnv};
use xfer_core::logging::Logger;
use xfer_core::notification::{AsyncReply, AsyncRequest, MessageType, Notification, TransferStatus};
use xfer_core::operation::{ActivityTimer, OpStack, TimerAction};
use xfer_core::options::EngineOptions;
use xfer_core::path::ServerPath;
use xfer_core::reply::ReplyCode;
use xfer_core::server::{Protocol, Server, ServerKey};

/// Minimum spacing of progress notifications.
const STATUS_INTERVAL: Duration = Duration::from_millis(100);

pub struct SftpControlSocket {
    pub(crate) env: SocketEnv,
    pub(crate) options: Arc<EngineOptions>,
    pub(crate) logger: Logger,
    pub(crate) server: Server,
    pub(crate) key: ServerKey,
    pub(crate) ops: OpStack<SftpOp>,
    effects: VecDeque<SftpEffect>,
    pub(crate) current_path: ServerPath,
    /// Helper is running (or being started).
    pub(crate) open: bool,
    pub(crate) logged_in: bool,
    pub(crate) pending_request: Option<Uuid>,
    /// Requests sent whose `Done` has not arrived.
    in_flight: u32,
    dones_to_skip: u32,
    /// Last error line of the current request.
    pub(crate) last_error: Option<String>,
    pub(crate) challenge: Challenge,
    /// Host key awaiting the user's decision.
    pub(crate) host_key: Option<(String, u16, String)>,
    pub(crate) host_key_refused: bool,
    pub(crate) auth_failed: bool,
    pub(crate) transfer_status: Option<TransferStatus>,
    last_status: Instant,
    timer: ActivityTimer,
}

fn timer_for(options: &EngineOptions) -> ActivityTimer {
    let timeout = (options.timeout_secs > 0).then(|| Duration::from_secs(options.timeout_secs));
    ActivityTimer::new(timeout, None)
}

impl SftpControlSocket {
    pub fn new(env: SocketEnv) -> Self {
        let options = env.context.options();
        let server = Server::new(Protocol::Sftp, "", 0);
        Self {
            logger: env.logger(LOG_TARGET),
            key: server.key(),
            server,
            timer: timer_for(&options),
            options,
            env,
            ops: OpStack::new(),
            effects: VecDeque::new(),
            current_path: ServerPath::empty(),
            open: false,
            logged_in: false,
            pending_request: None,
            in_flight: 0,
            dones_to_skip: 0,
            last_error: None,
            challenge: Challenge::default(),
            host_key: None,
            host_key_refused: false,
            auth_failed: false,
            transfer_status: None,
            last_status: Instant::now(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.logged_in
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn current_path(&self) -> &ServerPath {
        &self.current_path
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    pub(crate) fn context(&self) -> &EngineContext {
        &self.env.context
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        if self.waiting_on_helper() {
            self.timer.next_deadline(true)
        } else {
            None
        }
    }

    fn waiting_on_helper(&self) -> bool {
        if !self.open || self.pending_request.is_some() {
            return false;
        }
        if self.in_flight > 0 {
            return true;
        }
        matches!(self.ops.top(), Some(SftpOp::Connect(o)) if o.state == ConnectState::Banner)
    }

    // ─── Output ──────────────────────────────────────────────────────

    pub(crate) fn emit(&mut self, effect: SftpEffect) {
        self.effects.push_back(effect);
    }

    pub(crate) fn notify(&mut self, notification: Notification) {
        self.emit(SftpEffect::Notify(notification));
    }

    pub(crate) fn send_request(&mut self, request: Request) {
        self.logger.log(MessageType::Command, request.display());
        if request.expects_done() {
            self.in_flight += 1;
            self.last_error = None;
        }
        self.emit(SftpEffect::Send(request));
        self.timer.record_activity(Instant::now());
    }

    pub(crate) fn request(&mut self, request: AsyncRequest) {
        let request_id = Uuid::new_v4();
        self.pending_request = Some(request_id);
        self.notify(Notification::AsyncRequest { request_id, request });
    }

    /// Helper reported progress of the running get/put.
    fn on_transfer_progress(&mut self, bytes: i64) {
        if let Some(SftpOp::FileTransfer(o)) = self.ops.top_mut() {
            o.transferred += bytes;
        }
        let Some(status) = self.transfer_status.as_mut() else {
            return;
        };
        status.current_offset += bytes;
        let now = Instant::now();
        if now.duration_since(self.last_status) >= STATUS_INTERVAL {
            self.last_status = now;
            let snapshot = status.clone();
            self.notify(Notification::TransferStatus(Some(snapshot)));
        }
    }

    pub(crate) fn start_transfer_status(&mut self, status: TransferStatus) {
        self.last_status = Instant::now();
        self.transfer_status = Some(status.clone());
        self.notify(Notification::TransferStatus(Some(status)));
    }

    // ─── Connection lifecycle ────────────────────────────────────────

    pub(crate) fn close(&mut self) {
        if self.open {
            self.emit(SftpEffect::Close);
        }
        self.open = false;
        self.logged_in = false;
        self.in_flight = 0;
        self.dones_to_skip = 0;
        self.current_path = ServerPath::empty();
        self.transfer_status = None;
        self.challenge = Challenge::default();
        self.host_key = None;
    }

    pub(crate) fn mark_open(&mut self) {
        self.open = true;
        self.timer.record_activity(Instant::now());
    }

    pub(crate) fn prepare_connect(&mut self, server: Server) {
        self.options = self.env.context.options();
        self.timer = timer_for(&self.options);
        self.key = server.key();
        self.server = server;
        self.current_path = ServerPath::empty();
        self.in_flight = 0;
        self.dones_to_skip = 0;
        self.challenge = Challenge::default();
        self.host_key_refused = false;
        self.auth_failed = false;
    }

    fn connection_lost(&mut self, message: &str) {
        if !self.open {
            return;
        }
        self.logger.error(message);
        if self.ops.is_empty() {
            self.close();
        } else {
            self.reset_operation(ReplyCode::ERROR | ReplyCode::DISCONNECTED);
        }
    }

    // ─── Input ───────────────────────────────────────────────────────

    fn on_helper(&mut self, event: HelperEvent) {
        self.timer.record_activity(Instant::now());
        let skipping = self.dones_to_skip > 0;
        match event {
            HelperEvent::Reply(text) => {
                self.logger.log(MessageType::Response, text.as_str());
                if !skipping {
                    let step = self.with_top(|s, op| s.parse_reply(op, &text));
                    self.advance(step);
                }
            }
            HelperEvent::Done(ok) => {
                if self.in_flight == 0 {
                    self.logger.debug("Unexpected end of request");
                    return;
                }
                self.in_flight -= 1;
                if self.dones_to_skip > 0 {
                    self.dones_to_skip -= 1;
                    return;
                }
                let step = self.with_top(|s, op| s.parse_done(op, ok));
                self.advance(step);
            }
            HelperEvent::Error(text) => {
                self.logger.error(text.as_str());
                self.last_error = Some(text);
            }
            HelperEvent::Verbose(text) => self.logger.verbose(text),
            HelperEvent::Status(text) => self.logger.status(text),
            HelperEvent::Activity(direction) => self.notify(Notification::Active(direction)),
            HelperEvent::Close => self.connection_lost("Server closed the connection"),
            HelperEvent::Request(request) => {
                let step = self.with_top(|s, op| match op {
                    SftpOp::Connect(o) => s.connect_helper_request(o, request),
                    _ => {
                        s.logger.debug("Helper asked for input outside of a connect");
                        Step::Wait
                    }
                });
                self.advance(step);
            }
            HelperEvent::ListEntry { text, mtime, name } => {
                if !skipping {
                    let step = self.with_top(|s, op| match op {
                        SftpOp::List(o) => s.list_entry(o, &text, mtime, name),
                        _ => Step::Wait,
                    });
                    self.advance(step);
                }
            }
            HelperEvent::Transfer(bytes) => {
                if !skipping {
                    self.on_transfer_progress(bytes);
                }
            }
            HelperEvent::RequestPreamble(text) => self.challenge.preamble = text,
            HelperEvent::RequestInstruction(text) => self.challenge.instruction = text,
            HelperEvent::QuotaUsed { direction, bytes } => {
                self.logger
                    .verbose(format!("Helper used {} bytes of {:?} quota", bytes, direction));
                self.emit(SftpEffect::GrantQuota(direction));
            }
            HelperEvent::SessionInfo(kind, value) => {
                self.logger.debug(format!("{}: {}", kind.label(), value))
            }
        }
    }

    fn on_timer(&mut self, now: Instant) {
        if self.timer.poll(now, self.waiting_on_helper()) != TimerAction::TimedOut {
            return;
        }
        self.logger.error(format!(
            "Connection timed out after {} seconds of inactivity",
            self.options.timeout_secs
        ));
        if self.ops.is_empty() {
            self.close();
        } else {
            self.reset_operation(ReplyCode::TIMEOUT | ReplyCode::DISCONNECTED);
        }
    }

    // ─── Dispatch ────────────────────────────────────────────────────

    pub(crate) fn with_top<F>(&mut self, f: F) -> Step
    where
        F: FnOnce(&mut Self, &mut SftpOp) -> Step,
    {
        let Some(mut op) = self.ops.pop() else {
            return Step::Wait;
        };
        let step = f(self, &mut op);
        self.ops.push(op);
        step
    }

    pub(crate) fn advance(&mut self, mut step: Step) {
        loop {
            step = match step {
                Step::Wait => return,
                Step::Continue => self.with_top(|s, op| s.send_next(op)),
                Step::Push(sub) => {
                    self.ops.push(sub);
                    Step::Continue
                }
                Step::Done(code) => {
                    if self.ops.len() <= 1 {
                        self.reset_operation(code);
                        return;
                    }
                    if let Some(op) = self.ops.pop() {
                        self.cleanup_op(op, code, false);
                    }
                    self.with_top(|s, parent| s.sub_result(parent, code))
                }
            };
        }
    }

    fn send_next(&mut self, op: &mut SftpOp) -> Step {
        match op {
            SftpOp::Connect(o) => self.connect_send(o),
            SftpOp::ChangeDir(o) => self.cwd_send(o),
            SftpOp::List(o) => self.list_send(o),
            SftpOp::FileTransfer(o) => self.transfer_send(o),
            SftpOp::Mkdir(o) => self.mkdir_send(o),
            SftpOp::Delete(o) => self.delete_send(o),
            SftpOp::RemoveDir(o) => self.rmdir_send(o),
            SftpOp::Rename(o) => self.rename_send(o),
            SftpOp::Chmod(o) => self.chmod_send(o),
            SftpOp::Raw(o) => self.raw_send(o),
        }
    }

    fn parse_reply(&mut self, op: &mut SftpOp, text: &str) -> Step {
        match op {
            SftpOp::Connect(o) => self.connect_reply(o, text),
            SftpOp::ChangeDir(o) => self.cwd_reply(o, text),
            SftpOp::FileTransfer(o) => self.transfer_reply(o, text),
            _ => Step::Wait,
        }
    }

    fn parse_done(&mut self, op: &mut SftpOp, ok: bool) -> Step {
        match op {
            SftpOp::Connect(o) => self.connect_done(o, ok),
            SftpOp::ChangeDir(o) => self.cwd_done(o, ok),
            SftpOp::List(o) => self.list_done(o, ok),
            SftpOp::FileTransfer(o) => self.transfer_done(o, ok),
            SftpOp::Mkdir(o) => self.mkdir_done(o, ok),
            SftpOp::Delete(o) => self.delete_done(o, ok),
            SftpOp::RemoveDir(o) => self.rmdir_done(o, ok),
            SftpOp::Rename(o) => self.rename_done(o, ok),
            SftpOp::Chmod(o) => self.chmod_done(o, ok),
            SftpOp::Raw(_) => Step::Done(if ok { ReplyCode::OK } else { ReplyCode::ERROR }),
        }
    }

    fn sub_result(&mut self, op: &mut SftpOp, code: ReplyCode) -> Step {
        match op {
            SftpOp::List(o) => self.list_sub_result(o, code),
            SftpOp::FileTransfer(o) => self.transfer_sub_result(o, code),
            other => {
                self.logger
                    .debug(format!("Unexpected sub-result for {}", other.name()));
                Step::Done(ReplyCode::INTERNALERROR)
            }
        }
    }

    fn on_async_reply(&mut self, op: &mut SftpOp, reply: AsyncReply) -> Step {
        match op {
            SftpOp::Connect(o) => self.connect_async_reply(o, reply),
            SftpOp::FileTransfer(o) => self.transfer_async_reply(o, reply),
            _ => Step::Wait,
        }
    }

    // ─── Cleanup funnel ──────────────────────────────────────────────

    fn cleanup_op(&mut self, op: SftpOp, code: ReplyCode, root: bool) -> ReplyCode {
        let mut code = code;
        match op {
            SftpOp::Connect(_) => {
                if code.is_error() {
                    code |= ReplyCode::DISCONNECTED;
                    if self.auth_failed {
                        code |= ReplyCode::PASSWORDFAILED | ReplyCode::CRITICALERROR;
                    }
                    if self.host_key_refused {
                        code |= ReplyCode::CRITICALERROR;
                    }
                    if root && !code.contains(ReplyCode::CANCELED) {
                        self.logger.error("Could not connect to server");
                    }
                } else {
                    self.logger
                        .status(format!("Connected to {}", self.server.format_host()));
                }
            }
            SftpOp::List(o) => {
                if let Some(lock) = &o.lock {
                    self.env.context.release_lock(self.env.engine, lock);
                }
                if root {
                    if code.is_ok() {
                        self.logger.status(format!(
                            "Directory listing of \"{}\" successful",
                            self.current_path
                        ));
                    } else if !code.contains(ReplyCode::CANCELED) {
                        self.logger.error("Failed to retrieve directory listing");
                        let path = o.path.change_path(&o.subdir).unwrap_or(o.path);
                        if !path.is_empty() {
                            self.notify(Notification::Listing {
                                path,
                                primary: true,
                                failed: true,
                            });
                        }
                    }
                }
            }
            SftpOp::Mkdir(o) => {
                if let Some(lock) = &o.lock {
                    self.env.context.release_lock(self.env.engine, lock);
                }
                if root && code.is_error() && !code.contains(ReplyCode::CANCELED) {
                    self.logger.error("Directory creation failed");
                }
            }
            SftpOp::FileTransfer(o) => {
                if code.is_error() && o.command.download && o.fresh_local && o.transferred == 0 {
                    self.emit(SftpEffect::DiscardEmptyLocalFile(o.command.local_file.clone()));
                }
                if root {
                    if self.transfer_status.take().is_some() {
                        self.notify(Notification::TransferStatus(None));
                    }
                    if code.is_ok() {
                        self.logger.status("File transfer successful");
                    } else if !code.contains(ReplyCode::CANCELED) {
                        self.logger.error("File transfer failed");
                    }
                }
            }
            SftpOp::ChangeDir(_) => {}
            other @ (SftpOp::Delete(_)
            | SftpOp::RemoveDir(_)
            | SftpOp::Rename(_)
            | SftpOp::Chmod(_)
            | SftpOp::Raw(_)) => {
                if root && code.is_error() && !code.contains(ReplyCode::CANCELED) {
                    self.logger.error(format!("Command {} failed", other.name()));
                }
            }
        }
        if root && code.contains(ReplyCode::CANCELED) {
            self.logger.error("Interrupted by user");
        }
        code
    }
}

impl ControlSocket for SftpControlSocket {
    type Event = SftpEvent;
    type Effect = SftpEffect;

    fn execute(&mut self, command: Command) -> ReplyCode {
        if !self.ops.is_empty() {
            return ReplyCode::BUSY;
        }
        if !command.is_valid() {
            return ReplyCode::SYNTAXERROR;
        }
        self.options = self.env.context.options();
        let op = match command {
            Command::Connect { server } => {
                if self.open {
                    return ReplyCode::ALREADYCONNECTED;
                }
                self.start_connect(server)
            }
            Command::Disconnect => {
                if self.open {
                    self.logger.status("Disconnected from server");
                }
                self.close();
                self.emit(SftpEffect::Complete(ReplyCode::OK));
                return ReplyCode::WOULDBLOCK;
            }
            _ if !self.logged_in => return ReplyCode::NOTCONNECTED,
            Command::List { path, subdir, flags } => self.start_list(path, subdir, flags),
            Command::FileTransfer(cmd) => self.start_transfer(cmd),
            Command::Mkdir { path } => self.start_mkdir(path),
            Command::Delete { path, files } => self.start_delete(path, files),
            Command::RemoveDir { path, subdir } => self.start_rmdir(path, subdir),
            Command::Rename {
                from_path,
                from_file,
                to_path,
                to_file,
            } => self.start_rename(from_path, from_file, to_path, to_file),
            Command::Chmod { path, file, permission } => self.start_chmod(path, file, permission),
            Command::Raw { command } => self.start_raw(command),
        };
        self.ops.push(op);
        self.advance(Step::Continue);
        ReplyCode::WOULDBLOCK
    }

    fn handle(&mut self, event: SftpEvent) {
        match event {
            SftpEvent::Started => self.logger.debug("SFTP helper started"),
            SftpEvent::SpawnFailed(err) => {
                self.logger
                    .error(format!("Could not start the SFTP helper: {}", err.message));
                self.reset_operation(ReplyCode::CRITICALERROR | ReplyCode::DISCONNECTED);
            }
            SftpEvent::Helper(event) => {
                if self.open {
                    self.on_helper(event);
                }
            }
            SftpEvent::Terminated(err) => self.connection_lost(&format!("SFTP helper terminated: {}", err.message)),
            SftpEvent::LockGranted => {
                let waiting = match self.ops.top() {
                    Some(SftpOp::List(o)) => o.state == ListState::WaitLock,
                    Some(SftpOp::Mkdir(o)) => o.state == MkdirState::WaitLock,
                    _ => false,
                };
                if waiting {
                    self.advance(Step::Continue);
                }
            }
            SftpEvent::AsyncReply(envelope) => {
                if self.pending_request != Some(envelope.request_id) {
                    self.logger.debug("Ignoring reply to a stale request");
                    return;
                }
                self.pending_request = None;
                self.timer.record_activity(Instant::now());
                let step = self.with_top(|s, op| s.on_async_reply(op, envelope.reply));
                self.advance(step);
            }
            SftpEvent::Timer(now) => self.on_timer(now),
            SftpEvent::Cancel => {
                if !self.ops.is_empty() {
                    self.reset_operation(ReplyCode::CANCELED);
                }
            }
        }
    }

    fn reset_operation(&mut self, code: ReplyCode) -> ReplyCode {
        let mut code = code;
        self.dones_to_skip = self.in_flight;
        self.pending_request = None;
        let frames = self.ops.drain();
        let had_ops = !frames.is_empty();
        let count = frames.len();
        for (i, op) in frames.into_iter().enumerate() {
            code = self.cleanup_op(op, code, i + 1 == count);
        }
        if code.is_disconnected() {
            self.close();
        }
        if had_ops {
            self.emit(SftpEffect::Complete(code));
        }
        code
    }

    fn poll_effect(&mut self) -> Option<SftpEffect> {
        self.effects.pop_front()
    }

    fn is_idle(&self) -> bool {
        self.ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sftp::event::{HelperRequest, HostKeyKind};
    use tokio::sync::mpsc;
    use std::path::Path;
    use xfer_core::command::{FileTransferCommand, ListFlags, TransferSettings};
    use xfer_core::context::HostKeyStatus;
    use xfer_core::driver::EngineStatus;
    use xfer_core::lock::{LockKey, LockOutcome, LockReason};
    use xfer_core::notification::AsyncReplyEnvelope;
    use xfer_core::server::{LogonType, ServerType};

    const BANNER: &str = "fzSftp started, protocol_version=11";

    struct Harness {
        sock: SftpControlSocket,
        effects: Vec<SftpEffect>,
    }

    impl Harness {
        fn new() -> Self {
            let context = EngineContext::shared(EngineOptions::default());
            let (engine, _) = context.register_engine();
            let (notifications, _) = mpsc::unbounded_channel();
            let env = SocketEnv {
                engine,
                context,
                status: Arc::new(EngineStatus::default()),
                notifications,
            };
            Self {
                sock: SftpControlSocket::new(env),
                effects: Vec::new(),
            }
        }

        /// Request lines written since the last call; other effects are kept.
        fn sent(&mut self) -> Vec<String> {
            let mut out = Vec::new();
            while let Some(effect) = self.sock.poll_effect() {
                match effect {
                    SftpEffect::Send(request) => out.push(request.line()),
                    other => self.effects.push(other),
                }
            }
            out
        }

        fn helper(&mut self, event: HelperEvent) -> Vec<String> {
            self.sock.handle(SftpEvent::Helper(event));
            self.sent()
        }

        fn completed(&self) -> Option<ReplyCode> {
            self.effects.iter().rev().find_map(|e| match e {
                SftpEffect::Complete(code) => Some(*code),
                _ => None,
            })
        }

        fn closes(&self) -> usize {
            self.effects.iter().filter(|e| matches!(e, SftpEffect::Close)).count()
        }

        fn last_request_id(&self) -> Option<Uuid> {
            self.effects.iter().rev().find_map(|e| match e {
                SftpEffect::Notify(Notification::AsyncRequest { request_id, .. }) => Some(*request_id),
                _ => None,
            })
        }

        /// Start connecting as bob; returns once `open` is out.
        fn open(&mut self) {
            let mut server = Server::new(Protocol::Sftp, "sftp.example.com", 22);
            server.logon_type = LogonType::Normal;
            server.user = "bob".into();
            server.password = "secret".into();
            assert_eq!(self.sock.execute(Command::Connect { server }), ReplyCode::WOULDBLOCK);
            assert!(self.sent().is_empty());
            assert!(matches!(self.effects.last(), Some(SftpEffect::Spawn)));
            self.sock.handle(SftpEvent::Started);
            assert_eq!(
                self.helper(HelperEvent::Reply(BANNER.into())),
                vec!["open \"bob@sftp.example.com\" 22"]
            );
        }

        fn login(&mut self) {
            self.open();
            let prompt = HelperRequest::Password {
                prompt: "Password:".into(),
            };
            assert_eq!(self.helper(HelperEvent::Request(prompt)), vec!["-secret"]);
            assert!(self.helper(HelperEvent::Done(true)).is_empty());
            assert_eq!(self.completed(), Some(ReplyCode::OK));
            assert!(self.sock.is_connected());
            self.effects.clear();
        }
    }

    fn home() -> ServerPath {
        ServerPath::parse("/home", ServerType::Unix).unwrap()
    }

    #[test]
    fn connect_and_login() {
        let mut h = Harness::new();
        h.login();
        assert!(h.sock.is_open());
    }

    #[test]
    fn wrong_banner_is_critical() {
        let mut h = Harness::new();
        let server = Server::new(Protocol::Sftp, "sftp.example.com", 22);
        h.sock.execute(Command::Connect { server });
        h.sent();
        h.helper(HelperEvent::Reply("fzSftp started, protocol_version=3".into()));
        let code = h.completed().unwrap();
        assert!(code.contains(ReplyCode::CRITICALERROR));
        assert!(code.contains(ReplyCode::DISCONNECTED));
        assert_eq!(h.closes(), 1);
    }

    #[test]
    fn repeated_challenge_fails_the_password() {
        let mut h = Harness::new();
        h.open();
        let prompt = || {
            HelperEvent::Request(HelperRequest::Password {
                prompt: "Password:".into(),
            })
        };
        assert_eq!(h.helper(prompt()), vec!["-secret"]);
        assert!(h.helper(prompt()).is_empty());
        let code = h.completed().unwrap();
        assert!(code.contains(ReplyCode::PASSWORDFAILED));
        assert!(code.contains(ReplyCode::CRITICALERROR));
        assert!(!h.sock.is_open());
    }

    #[test]
    fn unknown_host_key_is_asked_and_stored() {
        let mut h = Harness::new();
        h.open();
        let key = HelperRequest::HostKey {
            kind: HostKeyKind::New,
            host: "sftp.example.com".into(),
            port: 22,
            fingerprint: "ssh-ed25519 SHA256:abc".into(),
        };
        assert!(h.helper(HelperEvent::Request(key)).is_empty());
        let request_id = h.last_request_id().unwrap();
        h.sock.handle(SftpEvent::AsyncReply(AsyncReplyEnvelope {
            request_id,
            reply: AsyncReply::HostKey {
                trust: true,
                always: true,
            },
        }));
        assert_eq!(h.sent(), vec!["y"]);
        let status = h
            .sock
            .context()
            .trust()
            .host_key_status("sftp.example.com", 22, "ssh-ed25519 SHA256:abc");
        assert_eq!(status, HostKeyStatus::Trusted);
    }

    #[test]
    fn helper_exit_closes_once() {
        let mut h = Harness::new();
        h.login();
        h.sock
            .handle(SftpEvent::Terminated(xfer_core::error::EngineError::helper_failed("unexpected EOF")));
        h.sock
            .handle(SftpEvent::Terminated(xfer_core::error::EngineError::disconnected("exited")));
        h.sent();
        assert_eq!(h.closes(), 1);
        assert!(!h.sock.is_open());
    }

    #[test]
    fn answers_of_canceled_requests_are_skipped() {
        let mut h = Harness::new();
        h.login();
        let list = || Command::List {
            path: home(),
            subdir: String::new(),
            flags: ListFlags::empty(),
        };
        h.sock.execute(list());
        assert_eq!(h.sent(), vec!["cd \"/home\""]);
        h.sock.handle(SftpEvent::Cancel);
        assert_eq!(h.completed(), Some(ReplyCode::CANCELED));
        h.effects.clear();

        h.sock.execute(list());
        assert_eq!(h.sent(), vec!["cd \"/home\""]);
        // Answer to the first cd, then to the second.
        assert!(h.helper(HelperEvent::Reply("/home".into())).is_empty());
        assert!(h.helper(HelperEvent::Done(true)).is_empty());
        assert!(h.completed().is_none());
        assert!(h.helper(HelperEvent::Reply("/home".into())).is_empty());
        assert_eq!(h.helper(HelperEvent::Done(true)), vec!["ls"]);
        h.helper(HelperEvent::ListEntry {
            text: "-rw-r--r--    1 bob      bob           3 Jan 01 12:00 a.txt".into(),
            mtime: 1_577_836_800,
            name: "a.txt".into(),
        });
        h.helper(HelperEvent::Done(true));
        assert_eq!(h.completed(), Some(ReplyCode::OK));
        let cached = h.sock.context().directory_cache().lookup(&h.sock.key, &home());
        assert_eq!(cached.unwrap().listing.entries.len(), 1);
    }

    fn list_home() -> Command {
        Command::List {
            path: home(),
            subdir: String::new(),
            flags: ListFlags::empty(),
        }
    }

    /// Lists `/home` with one entry, up to the completion.
    fn finish_home_listing(h: &mut Harness) {
        assert!(h.helper(HelperEvent::Reply("/home".into())).is_empty());
        assert_eq!(h.helper(HelperEvent::Done(true)), vec!["ls"]);
        h.helper(HelperEvent::ListEntry {
            text: "-rw-r--r--    1 bob      bob           3 Jan 01 12:00 a.txt".into(),
            mtime: 1_577_836_800,
            name: "a.txt".into(),
        });
        assert!(h.helper(HelperEvent::Done(true)).is_empty());
        assert_eq!(h.completed(), Some(ReplyCode::OK));
    }

    #[test]
    fn second_list_of_a_fresh_path_is_served_from_cache() {
        let mut h = Harness::new();
        h.login();
        h.sock.execute(list_home());
        assert_eq!(h.sent(), vec!["cd \"/home\""]);
        finish_home_listing(&mut h);

        h.effects.clear();
        h.sock.execute(list_home());
        assert!(h.sent().is_empty());
        assert_eq!(h.completed(), Some(ReplyCode::OK));
    }

    #[test]
    fn list_waits_for_a_lock_held_by_another_engine() {
        let mut h = Harness::new();
        h.login();
        let (other, _wakeups) = h.sock.context().register_engine();
        let held = LockKey::new(h.sock.key.clone(), home(), LockReason::List);
        assert_eq!(h.sock.context().acquire_lock(other, &held), LockOutcome::Acquired);

        h.sock.execute(list_home());
        assert_eq!(h.sent(), vec!["cd \"/home\""]);
        assert!(h.helper(HelperEvent::Reply("/home".into())).is_empty());
        assert!(h.helper(HelperEvent::Done(true)).is_empty());
        assert!(h.completed().is_none());

        h.sock.context().release_lock(other, &held);
        h.sock.handle(SftpEvent::LockGranted);
        assert_eq!(h.sent(), vec!["ls"]);
    }

    #[test]
    fn mkdir_tells_missing_parent_from_existing_directory() {
        let mut h = Harness::new();
        h.login();
        let path = ServerPath::parse("/x", ServerType::Unix).unwrap();
        h.sock.execute(Command::Mkdir { path: path.clone() });
        assert_eq!(h.sent(), vec!["cd \"/\""]);
        assert_eq!(h.helper(HelperEvent::Done(true)), vec!["mkdir \"/x\""]);
        h.helper(HelperEvent::Error("mkdir /x: parent directory does not exist".into()));
        assert!(h.helper(HelperEvent::Done(false)).is_empty());
        assert_eq!(h.completed(), Some(ReplyCode::ERROR));

        h.effects.clear();
        h.sock.execute(Command::Mkdir { path });
        assert_eq!(h.sent(), vec!["mkdir \"/x\""]);
        h.helper(HelperEvent::Error("mkdir /x: File exists".into()));
        assert!(h.helper(HelperEvent::Done(false)).is_empty());
        assert_eq!(h.completed(), Some(ReplyCode::OK));
    }

    /// Download of `/home/a.bin` to `local` whose `get` fails.
    fn failed_download(local: &Path) -> Harness {
        let mut h = Harness::new();
        h.login();
        h.sock.execute(Command::FileTransfer(FileTransferCommand {
            local_file: local.to_path_buf(),
            remote_path: home(),
            remote_file: "a.bin".into(),
            download: true,
            settings: TransferSettings {
                binary: true,
                resume: true,
            },
        }));
        assert_eq!(h.sent(), vec!["cd \"/home\""]);
        h.helper(HelperEvent::Reply("/home".into()));
        let mtime = h.helper(HelperEvent::Done(true));
        assert!(mtime[0].starts_with("mtime "));
        let get = h.helper(HelperEvent::Done(true));
        assert!(get[0].starts_with("get "));
        h.helper(HelperEvent::Error("open for read: no such file".into()));
        h.helper(HelperEvent::Done(false));
        assert!(h.completed().unwrap().is_error());
        h
    }

    #[test]
    fn only_files_created_by_the_download_are_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let discards = |h: &Harness| {
            h.effects
                .iter()
                .filter(|e| matches!(e, SftpEffect::DiscardEmptyLocalFile(_)))
                .count()
        };

        let existing = dir.path().join("existing.bin");
        std::fs::write(&existing, b"").unwrap();
        assert_eq!(discards(&failed_download(&existing)), 0);
        assert_eq!(discards(&failed_download(&dir.path().join("missing.bin"))), 1);
    }

    #[test]
    fn commands_need_a_connection() {
        let mut h = Harness::new();
        let code = h.sock.execute(Command::Mkdir { path: home() });
        assert_eq!(code, ReplyCode::NOTCONNECTED);
    }
}
