//! Sans-IO FTP control socket.
//!
//! Owns the operation stack and everything learned about the connection.
//! Replies are paired with commands strictly in order through a
//! pending-reply counter; keep-alive commands bump a skip counter so their
//! replies never reach an operation. Every terminal result, success or
//! failure, leaves through [`FtpControlSocket::reset_operation`].

use crate::ftp::codec::{decode_line, encode_command};
use crate::ftp::effect::{FtpEffect, FtpEvent};
use crate::ftp::ops::{FtpOp, ListState, MkdirState, Step};
use crate::ftp::reply::{Assembled, FtpReply, LineSplitter, ReplyAssembler};
use crate::ftp::LOG_TARGET;
use rand::seq::SliceRandom;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;
use xfer_core::capabilities::{CapState, Capability};
use xfer_core::command::Command;
use xfer_core::context::EngineContext;
use xfer_core::driver::{ControlSocket, SocketEnv};
use xfer_core::listing::DirEntry;
use xfer_core::logging::Logger;
use xfer_core::notification::{AsyncReply, AsyncRequest, MessageType, Notification};
use xfer_core::operation::{ActivityTimer, OpStack, TimerAction, TransferEndReason};
use xfer_core::options::EngineOptions;
use xfer_core::path::ServerPath;
use xfer_core::reply::ReplyCode;
use xfer_core::server::{Encoding, Protocol, Server, ServerKey, ServerType};

pub struct FtpControlSocket {
    pub(crate) env: SocketEnv,
    pub(crate) options: Arc<EngineOptions>,
    pub(crate) logger: Logger,
    pub(crate) server: Server,
    pub(crate) key: ServerKey,
    /// Directory dialect in use; SYST or PWD may refine the configured one.
    pub(crate) server_type: ServerType,
    pub(crate) ops: OpStack<FtpOp>,
    effects: VecDeque<FtpEffect>,
    splitter: LineSplitter,
    assembler: ReplyAssembler,
    pub(crate) pending_replies: u32,
    pub(crate) replies_to_skip: u32,
    pub(crate) current_path: ServerPath,
    pub(crate) use_utf8: bool,
    pub(crate) tls_active: bool,
    pub(crate) protect_data: bool,
    /// `Some(true)` after TYPE I, `Some(false)` after TYPE A.
    pub(crate) current_type: Option<bool>,
    pub(crate) peer: Option<SocketAddr>,
    pub(crate) local: Option<SocketAddr>,
    /// Control connection is open (or being opened).
    pub(crate) open: bool,
    pub(crate) logged_in: bool,
    pub(crate) pending_request: Option<Uuid>,
    pub(crate) transfer_active: bool,
    /// Entries of the last finished listing transfer, taken by List.
    pub(crate) transfer_listing: Option<Vec<DirEntry>>,
    /// How the last data connection ended and how many bytes it moved.
    pub(crate) last_end_reason: TransferEndReason,
    pub(crate) last_transferred: i64,
    timer: ActivityTimer,
}

fn timer_for(options: &EngineOptions) -> ActivityTimer {
    let timeout = (options.timeout_secs > 0).then(|| Duration::from_secs(options.timeout_secs));
    let keepalive = (options.keepalive && options.keepalive_interval_secs > 0)
        .then(|| Duration::from_secs(options.keepalive_interval_secs));
    ActivityTimer::new(timeout, keepalive)
}

impl FtpControlSocket {
    pub fn new(env: SocketEnv) -> Self {
        let options = env.context.options();
        let logger = env.logger(LOG_TARGET);
        let server = Server::new(Protocol::Ftp, "", 0);
        Self {
            key: server.key(),
            server,
            server_type: ServerType::Unix,
            timer: timer_for(&options),
            options,
            logger,
            env,
            ops: OpStack::new(),
            effects: VecDeque::new(),
            splitter: LineSplitter::new(),
            assembler: ReplyAssembler::new(),
            pending_replies: 0,
            replies_to_skip: 0,
            current_path: ServerPath::empty(),
            use_utf8: false,
            tls_active: false,
            protect_data: false,
            current_type: None,
            peer: None,
            local: None,
            open: false,
            logged_in: false,
            pending_request: None,
            transfer_active: false,
            transfer_listing: None,
            last_end_reason: TransferEndReason::None,
            last_transferred: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.logged_in
    }

    /// Control connection is up or being set up.
    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn use_utf8(&self) -> bool {
        self.use_utf8
    }

    pub fn current_path(&self) -> &ServerPath {
        &self.current_path
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    pub fn server_type(&self) -> ServerType {
        self.server_type
    }

    pub(crate) fn context(&self) -> &EngineContext {
        &self.env.context
    }

    pub(crate) fn capability(&self, cap: Capability) -> CapState {
        self.env.context.capabilities().get(&self.key, cap)
    }

    pub(crate) fn set_capability(&self, cap: Capability, state: CapState) {
        self.env.context.capabilities().set(&self.key, cap, state);
    }

    /// When the driver should next deliver [`FtpEvent::Timer`].
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.waiting_on_server() {
            self.timer.next_deadline(true)
        } else if self.logged_in && self.ops.is_empty() {
            self.timer.next_deadline(false)
        } else {
            None
        }
    }

    fn waiting_on_server(&self) -> bool {
        if !self.open || self.pending_request.is_some() {
            return false;
        }
        if self.pending_replies > 0 {
            return true;
        }
        match self.ops.top() {
            None => false,
            Some(FtpOp::List(o)) => o.state != ListState::WaitLock,
            Some(FtpOp::Mkdir(o)) => o.state != MkdirState::WaitLock,
            Some(_) => true,
        }
    }

    // ─── Output ──────────────────────────────────────────────────────

    pub(crate) fn emit(&mut self, effect: FtpEffect) {
        self.effects.push_back(effect);
    }

    pub(crate) fn notify(&mut self, notification: Notification) {
        self.emit(FtpEffect::Notify(notification));
    }

    pub(crate) fn send_command(&mut self, command: &str) {
        self.send_line(command, command);
    }

    /// Send `command`, logging `display` in its place.
    pub(crate) fn send_line(&mut self, command: &str, display: &str) {
        self.logger.log(MessageType::Command, display);
        let bytes = encode_command(command, self.use_utf8);
        self.emit(FtpEffect::Send(bytes));
        self.pending_replies += 1;
        self.timer.record_activity(Instant::now());
    }

    /// Post an async request and remember its id.
    pub(crate) fn request(&mut self, request: AsyncRequest) {
        let request_id = Uuid::new_v4();
        self.pending_request = Some(request_id);
        self.notify(Notification::AsyncRequest { request_id, request });
    }

    /// Skip every reply still owed for commands of an operation that is gone.
    fn discard_pending_replies(&mut self) {
        if self.pending_replies > self.replies_to_skip {
            self.replies_to_skip = self.pending_replies;
        }
    }

    // ─── Connection lifecycle ────────────────────────────────────────

    pub(crate) fn close(&mut self) {
        if self.open {
            self.emit(FtpEffect::Close);
        }
        self.open = false;
        self.logged_in = false;
        self.pending_replies = 0;
        self.replies_to_skip = 0;
        self.assembler.reset();
        self.splitter = LineSplitter::new();
        self.tls_active = false;
        self.protect_data = false;
        self.current_type = None;
        self.current_path = ServerPath::empty();
        self.transfer_active = false;
    }

    pub(crate) fn mark_open(&mut self) {
        self.open = true;
        self.timer.record_activity(Instant::now());
    }

    /// Reset per-connection state for a new server.
    pub(crate) fn prepare_connect(&mut self, server: Server) {
        self.options = self.env.context.options();
        self.timer = timer_for(&self.options);
        self.key = server.key();
        self.server_type = server.server_type;
        self.use_utf8 = match server.encoding {
            Encoding::Utf8 => true,
            Encoding::Latin1 => false,
            Encoding::Auto => self.capability(Capability::Utf8Command) != CapState::No,
        };
        self.server = server;
        self.current_path = ServerPath::empty();
        self.current_type = None;
        self.pending_replies = 0;
        self.replies_to_skip = 0;
        self.assembler.reset();
        self.splitter = LineSplitter::new();
    }

    // ─── Input ───────────────────────────────────────────────────────

    fn on_received(&mut self, data: &[u8]) {
        self.timer.record_activity(Instant::now());
        for (raw, clamped) in self.splitter.push(data) {
            if !self.open {
                break;
            }
            if clamped {
                self.logger.warning("Received too long response line, truncated");
            }
            let decoded = decode_line(&raw, self.use_utf8);
            if decoded.invalid_utf8 && self.server.encoding == Encoding::Auto {
                self.logger
                    .warning("Invalid character sequence received, disabling UTF-8");
                self.use_utf8 = false;
            }
            self.logger.log(MessageType::Response, decoded.text.as_str());
            match self.assembler.push_line(decoded.text) {
                Assembled::Reply(reply) => self.on_reply(reply),
                Assembled::Partial => {}
                Assembled::Malformed(line) => {
                    self.logger.warning(format!("Ignoring malformed reply line: {}", line))
                }
            }
        }
    }

    fn on_reply(&mut self, reply: FtpReply) {
        if reply.is_preliminary() {
            if self.replies_to_skip == 0 && self.pending_replies > 0 {
                let step = self.with_top(|s, op| match op {
                    FtpOp::RawTransfer(o) => s.raw_preliminary(o, &reply),
                    _ => Step::Wait,
                });
                self.advance(step);
            }
            return;
        }
        if self.pending_replies == 0 {
            self.logger.debug(format!("Unexpected reply: {}", reply.text()));
            return;
        }
        self.pending_replies -= 1;

        if reply.code == 421 {
            self.logger.error("Server closed the connection");
            if self.ops.is_empty() {
                self.close();
            } else {
                self.reset_operation(ReplyCode::ERROR | ReplyCode::DISCONNECTED);
            }
            return;
        }
        if self.replies_to_skip > 0 {
            self.replies_to_skip -= 1;
            return;
        }
        let step = self.with_top(|s, op| s.parse_reply(op, &reply));
        self.advance(step);
    }

    fn on_timer(&mut self, now: Instant) {
        let busy = self.waiting_on_server();
        match self.timer.poll(now, busy) {
            TimerAction::TimedOut => {
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
            TimerAction::KeepAlive if self.logged_in && self.ops.is_empty() && self.pending_replies == 0 => {
                self.send_keepalive()
            }
            _ => {}
        }
    }

    fn send_keepalive(&mut self) {
        let mut choices = vec!["NOOP", "PWD"];
        match self.current_type {
            Some(true) => choices.push("TYPE I"),
            Some(false) => choices.push("TYPE A"),
            None => {}
        }
        let cmd = choices
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or("NOOP");
        self.logger.debug("Sending keep-alive command");
        self.send_command(cmd);
        self.replies_to_skip += 1;
    }

    // ─── Dispatch ────────────────────────────────────────────────────

    /// Run `f` on the top frame, taken off the stack for the duration so
    /// `f` may use `&mut self` freely.
    pub(crate) fn with_top<F>(&mut self, f: F) -> Step
    where
        F: FnOnce(&mut Self, &mut FtpOp) -> Step,
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

    fn send_next(&mut self, op: &mut FtpOp) -> Step {
        match op {
            FtpOp::Logon(o) => self.logon_send(o),
            FtpOp::ChangeDir(o) => self.cwd_send(o),
            FtpOp::List(o) => self.list_send(o),
            FtpOp::FileTransfer(o) => self.transfer_send(o),
            FtpOp::RawTransfer(o) => self.raw_send(o),
            FtpOp::Mkdir(o) => self.mkdir_send(o),
            FtpOp::Delete(o) => self.delete_send(o),
            FtpOp::RemoveDir(o) => self.rmd_send(o),
            FtpOp::Rename(o) => self.rename_send(o),
            FtpOp::Chmod(o) => self.chmod_send(o),
            FtpOp::Raw(o) => self.raw_command_send(o),
        }
    }

    fn parse_reply(&mut self, op: &mut FtpOp, reply: &FtpReply) -> Step {
        match op {
            FtpOp::Logon(o) => self.logon_reply(o, reply),
            FtpOp::ChangeDir(o) => self.cwd_reply(o, reply),
            FtpOp::List(o) => self.list_reply(o, reply),
            FtpOp::FileTransfer(o) => self.transfer_reply(o, reply),
            FtpOp::RawTransfer(o) => self.raw_reply(o, reply),
            FtpOp::Mkdir(o) => self.mkdir_reply(o, reply),
            FtpOp::Delete(o) => self.delete_reply(o, reply),
            FtpOp::RemoveDir(o) => self.rmd_reply(o, reply),
            FtpOp::Rename(o) => self.rename_reply(o, reply),
            FtpOp::Chmod(o) => self.chmod_reply(o, reply),
            FtpOp::Raw(o) => self.raw_command_reply(o, reply),
        }
    }

    fn sub_result(&mut self, op: &mut FtpOp, code: ReplyCode) -> Step {
        match op {
            FtpOp::ChangeDir(o) => self.cwd_sub_result(o, code),
            FtpOp::List(o) => self.list_sub_result(o, code),
            FtpOp::FileTransfer(o) => self.transfer_sub_result(o, code),
            FtpOp::Delete(o) => self.delete_sub_result(o, code),
            FtpOp::RemoveDir(o) => self.rmd_sub_result(o, code),
            FtpOp::Rename(o) => self.rename_sub_result(o, code),
            FtpOp::Chmod(o) => self.chmod_sub_result(o, code),
            other => {
                self.logger
                    .debug(format!("Unexpected sub-result for {}", other.name()));
                Step::Done(ReplyCode::INTERNALERROR)
            }
        }
    }

    fn on_async_reply(&mut self, op: &mut FtpOp, reply: AsyncReply) -> Step {
        match op {
            FtpOp::Logon(o) => self.logon_async_reply(o, reply),
            FtpOp::FileTransfer(o) => self.transfer_async_reply(o, reply),
            _ => Step::Wait,
        }
    }

    // ─── Cleanup funnel ──────────────────────────────────────────────

    /// Per-frame cleanup; returns the code with any flags the frame adds.
    fn cleanup_op(&mut self, op: FtpOp, code: ReplyCode, root: bool) -> ReplyCode {
        let mut code = code;
        match op {
            FtpOp::Logon(_) => {
                if code.is_error() {
                    code |= ReplyCode::DISCONNECTED;
                    if root && !code.contains(ReplyCode::CANCELED) {
                        self.logger.error("Could not connect to server");
                    }
                } else {
                    self.logger.status("Logged in");
                }
            }
            FtpOp::List(o) => {
                if let Some(lock) = &o.lock {
                    self.env.context.release_lock(self.env.engine, lock);
                }
                if root {
                    if code.is_ok() {
                        let path = o.listing.as_ref().map(|l| l.path.clone()).unwrap_or_else(|| self.current_path.clone());
                        self.logger
                            .status(format!("Directory listing of \"{}\" successful", path));
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
            FtpOp::Mkdir(o) => {
                if let Some(lock) = &o.lock {
                    self.env.context.release_lock(self.env.engine, lock);
                }
                if root && code.is_error() && !code.contains(ReplyCode::CANCELED) {
                    self.logger.error("Directory creation failed");
                }
            }
            FtpOp::RawTransfer(o) => {
                if o.data_open || self.transfer_active {
                    self.emit(FtpEffect::AbortTransfer);
                    self.transfer_active = false;
                }
            }
            FtpOp::FileTransfer(o) => {
                if code.is_error() {
                    if o.end_reason.is_critical() {
                        code |= ReplyCode::CRITICALERROR;
                    }
                    if o.command.download && o.fresh_local && !o.transfer_started {
                        self.emit(FtpEffect::DiscardEmptyLocalFile(o.command.local_file.clone()));
                    }
                }
                if root {
                    self.notify(Notification::TransferStatus(None));
                    let canceled = code.contains(ReplyCode::CANCELED);
                    if code.is_ok() {
                        self.logger.status("File transfer successful");
                    } else if !canceled && code.contains(ReplyCode::CRITICALERROR) {
                        self.logger.error("Critical file transfer error");
                    } else if !canceled {
                        self.logger.error("File transfer failed");
                    }
                }
            }
            FtpOp::ChangeDir(_) => {}
            FtpOp::Delete(_) | FtpOp::RemoveDir(_) | FtpOp::Rename(_) | FtpOp::Chmod(_) | FtpOp::Raw(_) => {
                if root && code.is_error() && !code.contains(ReplyCode::CANCELED) {
                    self.logger.error(format!("Command {} failed", op_name_for_log(&op)));
                }
            }
        }
        if root && code.contains(ReplyCode::CANCELED) {
            self.logger.error("Interrupted by user");
        }
        code
    }
}

fn op_name_for_log(op: &FtpOp) -> &'static str {
    match op {
        FtpOp::Delete(_) => "DELE",
        FtpOp::RemoveDir(_) => "RMD",
        FtpOp::Rename(_) => "RNFR/RNTO",
        FtpOp::Chmod(_) => "SITE CHMOD",
        _ => "raw",
    }
}

impl ControlSocket for FtpControlSocket {
    type Event = FtpEvent;
    type Effect = FtpEffect;

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
                self.emit(FtpEffect::Complete(ReplyCode::OK));
                return ReplyCode::WOULDBLOCK;
            }
            _ if !self.logged_in => return ReplyCode::NOTCONNECTED,
            Command::List { path, subdir, flags } => self.start_list(path, subdir, flags),
            Command::FileTransfer(cmd) => self.start_transfer(cmd),
            Command::Mkdir { path } => self.start_mkdir(path),
            Command::Delete { path, files } => self.start_delete(path, files),
            Command::RemoveDir { path, subdir } => self.start_rmd(path, subdir),
            Command::Rename {
                from_path,
                from_file,
                to_path,
                to_file,
            } => self.start_rename(from_path, from_file, to_path, to_file),
            Command::Chmod { path, file, permission } => self.start_chmod(path, file, permission),
            Command::Raw { command } => self.start_raw_command(command),
        };
        self.ops.push(op);
        self.advance(Step::Continue);
        ReplyCode::WOULDBLOCK
    }

    fn handle(&mut self, event: FtpEvent) {
        match event {
            FtpEvent::Connected { local, peer } => {
                self.local = Some(local);
                self.peer = Some(peer);
                self.mark_open();
                let step = self.with_top(|s, op| match op {
                    FtpOp::Logon(o) => s.logon_connected(o),
                    _ => Step::Wait,
                });
                self.advance(step);
            }
            FtpEvent::ConnectFailed(err) => {
                self.logger.error(err.message.clone());
                self.reset_operation(err.reply_code() | ReplyCode::ERROR | ReplyCode::DISCONNECTED);
            }
            FtpEvent::TlsEstablished { certificate, verified } => {
                let step = self.with_top(|s, op| match op {
                    FtpOp::Logon(o) => s.logon_tls_established(o, certificate, verified),
                    _ => Step::Wait,
                });
                self.advance(step);
            }
            FtpEvent::TlsFailed(err) => {
                self.logger.error(format!("TLS handshake failed: {}", err.message));
                self.reset_operation(ReplyCode::CRITICALERROR | ReplyCode::DISCONNECTED);
            }
            FtpEvent::Received(data) => self.on_received(&data),
            FtpEvent::ConnectionLost(err) => {
                if !self.open {
                    return;
                }
                self.logger.error(format!("Connection closed: {}", err.message));
                if self.ops.is_empty() {
                    self.close();
                } else {
                    self.reset_operation(ReplyCode::ERROR | ReplyCode::DISCONNECTED);
                }
            }
            FtpEvent::DataActivity => self.timer.record_activity(Instant::now()),
            ev @ (FtpEvent::DataConnected
            | FtpEvent::DataListening(_)
            | FtpEvent::DataFailed(_)
            | FtpEvent::TransferEnded { .. }) => {
                if let FtpEvent::TransferEnded { .. } = ev {
                    self.transfer_active = false;
                }
                let step = self.with_top(|s, op| match op {
                    FtpOp::RawTransfer(o) => s.raw_data_event(o, ev),
                    _ => Step::Wait,
                });
                self.advance(step);
            }
            FtpEvent::LockGranted => {
                let waiting = match self.ops.top() {
                    Some(FtpOp::List(o)) => o.state == ListState::WaitLock,
                    Some(FtpOp::Mkdir(o)) => o.state == MkdirState::WaitLock,
                    _ => false,
                };
                if waiting {
                    self.advance(Step::Continue);
                }
            }
            FtpEvent::AsyncReply(envelope) => {
                if self.pending_request != Some(envelope.request_id) {
                    self.logger.debug("Ignoring reply to a stale request");
                    return;
                }
                self.pending_request = None;
                self.timer.record_activity(Instant::now());
                let step = self.with_top(|s, op| s.on_async_reply(op, envelope.reply));
                self.advance(step);
            }
            FtpEvent::Timer(now) => self.on_timer(now),
            FtpEvent::Cancel => {
                if !self.ops.is_empty() {
                    self.reset_operation(ReplyCode::CANCELED);
                }
            }
        }
    }

    fn reset_operation(&mut self, code: ReplyCode) -> ReplyCode {
        let mut code = code;
        self.discard_pending_replies();
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
            self.emit(FtpEffect::Complete(code));
        }
        code
    }

    fn poll_effect(&mut self) -> Option<FtpEffect> {
        self.effects.pop_front()
    }

    fn is_idle(&self) -> bool {
        self.ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use xfer_core::command::{FileTransferCommand, ListFlags, TransferSettings};
    use xfer_core::driver::EngineStatus;
    use xfer_core::lock::{LockKey, LockOutcome, LockReason};
    use xfer_core::server::LogonType;
    use tokio::sync::mpsc;

    struct Harness {
        sock: FtpControlSocket,
        effects: Vec<FtpEffect>,
    }

    impl Harness {
        fn new(options: EngineOptions) -> Self {
            let context = EngineContext::shared(options);
            let (engine, _) = context.register_engine();
            let (notifications, _) = mpsc::unbounded_channel();
            let env = SocketEnv {
                engine,
                context,
                status: Arc::new(EngineStatus::default()),
                notifications,
            };
            Self {
                sock: FtpControlSocket::new(env),
                effects: Vec::new(),
            }
        }

        /// Commands sent since the last call; other effects are kept.
        fn sent(&mut self) -> Vec<String> {
            let mut out = Vec::new();
            while let Some(effect) = self.sock.poll_effect() {
                match effect {
                    FtpEffect::Send(bytes) => out.push(String::from_utf8_lossy(&bytes).trim_end().to_string()),
                    other => self.effects.push(other),
                }
            }
            out
        }

        fn reply(&mut self, text: &str) -> Vec<String> {
            self.sock.handle(FtpEvent::Received(format!("{}\r\n", text).into_bytes()));
            self.sent()
        }

        fn completed(&self) -> Option<ReplyCode> {
            self.effects.iter().rev().find_map(|e| match e {
                FtpEffect::Complete(code) => Some(*code),
                _ => None,
            })
        }

        fn login(&mut self) {
            let mut server = Server::new(Protocol::InsecureFtp, "ftp.example.com", 21);
            server.logon_type = LogonType::Anonymous;
            assert_eq!(self.sock.execute(Command::Connect { server }), ReplyCode::WOULDBLOCK);
            assert!(self.sent().is_empty());
            assert!(matches!(self.effects.last(), Some(FtpEffect::Connect { port: 21, .. })));
            self.sock.handle(FtpEvent::Connected {
                local: "10.0.0.2:50000".parse().unwrap(),
                peer: "93.184.216.34:21".parse().unwrap(),
            });
            assert_eq!(self.reply("220 Welcome"), vec!["USER anonymous"]);
            assert_eq!(self.reply("331 Password required"), vec!["PASS anonymous@example.com"]);
            assert_eq!(self.reply("230 Logged in"), vec!["SYST"]);
            assert_eq!(self.reply("215 UNIX Type: L8"), vec!["FEAT"]);
            assert!(self.sock.use_utf8());
            assert!(self.reply("211-Features:\r\n MDTM\r\n SIZE\r\n211 End").is_empty());
            assert_eq!(self.completed(), Some(ReplyCode::OK));
            assert!(self.sock.is_connected());
            self.effects.clear();
        }
    }

    #[test]
    fn feat_without_utf8_disables_utf8() {
        let mut h = Harness::new(EngineOptions::default());
        h.login();
        assert!(!h.sock.use_utf8());
        assert_eq!(h.sock.capability(Capability::Utf8Command), CapState::No);
        assert_eq!(h.sock.capability(Capability::SizeCommand), CapState::Yes);
    }

    #[test]
    fn unroutable_pasv_address_is_replaced_by_peer() {
        let options = EngineOptions {
            pasv_reply_fallback_mode: 1,
            ..EngineOptions::default()
        };
        let mut h = Harness::new(options);
        h.login();
        let list = Command::List {
            path: ServerPath::empty(),
            subdir: String::new(),
            flags: ListFlags::empty(),
        };
        assert_eq!(h.sock.execute(list), ReplyCode::WOULDBLOCK);
        assert_eq!(h.sent(), vec!["PWD"]);
        assert_eq!(h.reply("257 \"/\" is the current directory"), vec!["TYPE A"]);
        assert_eq!(h.reply("200 Type set to A"), vec!["PASV"]);
        assert!(h.reply("227 Entering Passive Mode (192,168,1,5,19,137).").is_empty());
        let target = h.effects.iter().find_map(|e| match e {
            FtpEffect::OpenPassive { addr, .. } => Some(*addr),
            _ => None,
        });
        assert_eq!(target, Some("93.184.216.34:5001".parse().unwrap()));
    }

    #[test]
    fn mkdir_creates_missing_segments() {
        let mut h = Harness::new(EngineOptions::default());
        h.login();
        let path = ServerPath::parse("/a/b/c", ServerType::Unix).unwrap();
        assert_eq!(h.sock.execute(Command::Mkdir { path: path.clone() }), ReplyCode::WOULDBLOCK);
        assert_eq!(h.sent(), vec!["CWD /a/b"]);
        assert_eq!(h.reply("550 No such directory"), vec!["CWD /a"]);
        assert_eq!(h.reply("250 OK"), vec!["MKD b"]);
        assert_eq!(h.reply("257 \"/a/b\" created"), vec!["CWD b"]);
        assert_eq!(h.reply("250 OK"), vec!["MKD c"]);
        assert_eq!(h.reply("257 \"/a/b/c\" created"), vec!["CWD c"]);
        assert!(h.completed().is_none());
        assert!(h.reply("250 OK").is_empty());
        assert_eq!(h.completed(), Some(ReplyCode::OK));
        assert_eq!(h.sock.current_path(), &path);
    }

    #[test]
    fn keepalive_reply_never_reaches_an_operation() {
        let mut h = Harness::new(EngineOptions::default());
        h.login();
        h.sock.send_keepalive();
        let keepalive = h.sent();
        assert_eq!(keepalive.len(), 1);
        h.sock.execute(Command::Raw {
            command: "SITE HELP".to_string(),
        });
        assert_eq!(h.sent(), vec!["SITE HELP"]);
        // Reply to the keep-alive: skipped.
        h.reply("200 NOOP ok");
        assert!(h.completed().is_none());
        h.reply("214 Help follows");
        assert_eq!(h.completed(), Some(ReplyCode::OK));
    }

    #[test]
    fn connection_lost_mid_command_disconnects() {
        let mut h = Harness::new(EngineOptions::default());
        h.login();
        h.sock.execute(Command::Raw {
            command: "STAT".to_string(),
        });
        h.sent();
        h.sock.handle(FtpEvent::ConnectionLost(xfer_core::error::EngineError::disconnected("gone")));
        h.sent();
        let code = h.completed().unwrap();
        assert!(code.is_disconnected());
        assert!(h.effects.iter().any(|e| matches!(e, FtpEffect::Close)));
        assert!(!h.sock.is_open());
        assert!(h.sock.is_idle());
    }

    fn list(path: &str) -> Command {
        Command::List {
            path: ServerPath::parse(path, ServerType::Unix).unwrap_or_else(ServerPath::empty),
            subdir: String::new(),
            flags: ListFlags::empty(),
        }
    }

    #[test]
    fn mkdir_reports_missing_parent_as_error() {
        let mut h = Harness::new(EngineOptions::default());
        h.login();
        let path = ServerPath::parse("/x", ServerType::Unix).unwrap();
        assert_eq!(h.sock.execute(Command::Mkdir { path }), ReplyCode::WOULDBLOCK);
        assert_eq!(h.sent(), vec!["CWD /"]);
        assert_eq!(h.reply("250 OK"), vec!["MKD x"]);
        assert_eq!(
            h.reply("550 Cannot create x: parent directory does not exist"),
            vec!["MKD /x"]
        );
        assert!(h.reply("550 /x: parent directory does not exist").is_empty());
        assert_eq!(h.completed(), Some(ReplyCode::ERROR));
    }

    #[test]
    fn second_list_of_a_fresh_path_is_served_from_cache() {
        let mut h = Harness::new(EngineOptions::default());
        h.login();
        assert_eq!(h.sock.execute(list("/pub")), ReplyCode::WOULDBLOCK);
        assert_eq!(h.sent(), vec!["CWD /pub"]);
        assert_eq!(h.reply("250 Directory changed"), vec!["PWD"]);
        assert_eq!(h.reply("257 \"/pub\" is the current directory"), vec!["TYPE A"]);
        assert_eq!(h.reply("200 Type set to A"), vec!["PASV"]);
        assert!(h.reply("227 Entering Passive Mode (93,184,216,34,19,137).").is_empty());
        h.sock.handle(FtpEvent::DataConnected);
        assert_eq!(h.sent(), vec!["LIST"]);
        assert!(h.reply("150 Here comes the listing").is_empty());
        h.sock.handle(FtpEvent::TransferEnded {
            reason: TransferEndReason::Successful,
            error: None,
            listing: Some(vec![DirEntry::file("a.txt", 3)]),
            transferred: 60,
            tls_resumed: None,
        });
        assert!(h.sent().is_empty());
        assert!(h.reply("226 Transfer complete").is_empty());
        assert_eq!(h.completed(), Some(ReplyCode::OK));
        let pub_dir = ServerPath::parse("/pub", ServerType::Unix).unwrap();
        assert!(h.sock.context().directory_cache().lookup(&h.sock.key, &pub_dir).is_some());

        h.effects.clear();
        h.sock.execute(list("/pub"));
        assert!(h.sent().is_empty());
        assert_eq!(h.completed(), Some(ReplyCode::OK));
    }

    #[test]
    fn list_waits_for_a_lock_held_by_another_engine() {
        let mut h = Harness::new(EngineOptions::default());
        h.login();
        let (other, _wakeups) = h.sock.context().register_engine();
        let root = ServerPath::parse("/", ServerType::Unix).unwrap();
        let held = LockKey::new(h.sock.key.clone(), root, LockReason::List);
        assert_eq!(h.sock.context().acquire_lock(other, &held), LockOutcome::Acquired);

        assert_eq!(h.sock.execute(list("")), ReplyCode::WOULDBLOCK);
        assert_eq!(h.sent(), vec!["PWD"]);
        assert!(h.reply("257 \"/\" is the current directory").is_empty());
        assert!(h.completed().is_none());

        h.sock.context().release_lock(other, &held);
        h.sock.handle(FtpEvent::LockGranted);
        assert_eq!(h.sent(), vec!["TYPE A"]);
    }

    /// Download of `a.bin` from `/pub` whose TYPE I is refused.
    fn refused_download(local: &Path) -> Harness {
        let mut h = Harness::new(EngineOptions::default());
        h.login();
        let transfer = Command::FileTransfer(FileTransferCommand {
            local_file: local.to_path_buf(),
            remote_path: ServerPath::parse("/pub", ServerType::Unix).unwrap(),
            remote_file: "a.bin".into(),
            download: true,
            settings: TransferSettings {
                binary: true,
                resume: true,
            },
        });
        assert_eq!(h.sock.execute(transfer), ReplyCode::WOULDBLOCK);
        assert_eq!(h.sent(), vec!["CWD /pub"]);
        assert_eq!(h.reply("250 Directory changed"), vec!["PWD"]);
        assert_eq!(h.reply("257 \"/pub\" is the current directory"), vec!["SIZE a.bin"]);
        assert_eq!(h.reply("213 5"), vec!["MDTM a.bin"]);
        assert_eq!(h.reply("213 20200101000000"), vec!["TYPE I"]);
        assert!(h.reply("500 Unknown command").is_empty());
        h
    }

    #[test]
    fn refused_type_ends_before_the_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let h = refused_download(&dir.path().join("a.bin"));
        assert!(h.completed().unwrap().is_error());
        assert_eq!(h.sock.last_end_reason, TransferEndReason::PreTransferCommandFailure);
    }

    #[test]
    fn only_files_created_by_the_download_are_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let discards = |h: &Harness| {
            h.effects
                .iter()
                .filter(|e| matches!(e, FtpEffect::DiscardEmptyLocalFile(_)))
                .count()
        };

        let existing = dir.path().join("existing.bin");
        std::fs::write(&existing, b"").unwrap();
        let h = refused_download(&existing);
        assert!(h.completed().unwrap().is_error());
        assert_eq!(discards(&h), 0);

        let h = refused_download(&dir.path().join("missing.bin"));
        assert!(h.completed().unwrap().is_error());
        assert_eq!(discards(&h), 1);
    }

    #[test]
    fn commands_need_a_connection() {
        let mut h = Harness::new(EngineOptions::default());
        let code = h.sock.execute(Command::Raw {
            command: "NOOP".to_string(),
        });
        assert_eq!(code, ReplyCode::NOTCONNECTED);
    }
}
