use crate::engine::{runner, LOG_TARGET};
use futures::stream::{self, Stream};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;
use xfer_core::command::Command;
use xfer_core::context::EngineContext;
use xfer_core::driver::{DriverInput, DriverInputs, EngineStatus, SocketEnv};
use xfer_core::error::{EngineError, EngineResult};
use xfer_core::listing::DirectoryListing;
use xfer_core::lock::EngineId;
use xfer_core::logging::Logger;
use xfer_core::notification::{AsyncReply, AsyncReplyEnvelope, Notification};
use xfer_core::path::ServerPath;
use xfer_core::reply::ReplyCode;
use xfer_core::server::ServerKey;

/// One connection's worth of engine. Must be created inside a tokio runtime.
pub struct Engine {
    id: EngineId,
    context: Arc<EngineContext>,
    status: Arc<EngineStatus>,
    inputs: UnboundedSender<DriverInput>,
    notifications: UnboundedReceiver<Notification>,
    logger: Logger,
    /// Server of the last `Connect`, for cache lookups.
    server: Option<ServerKey>,
}

impl Engine {
    pub fn new(context: Arc<EngineContext>) -> Self {
        let (id, lock_wakeups) = context.register_engine();
        let (inputs, commands) = mpsc::unbounded_channel();
        let (notify_tx, notifications) = mpsc::unbounded_channel();
        let status = Arc::new(EngineStatus::default());
        let env = SocketEnv {
            engine: id,
            context: Arc::clone(&context),
            status: Arc::clone(&status),
            notifications: notify_tx,
        };
        let logger = env.logger(LOG_TARGET);
        tokio::spawn(runner::run(
            env,
            DriverInputs {
                commands,
                lock_wakeups,
            },
        ));
        Self {
            id,
            context,
            status,
            inputs,
            notifications,
            logger,
            server: None,
        }
    }

    pub fn id(&self) -> EngineId {
        self.id
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.context
    }

    pub fn is_busy(&self) -> bool {
        self.status.is_busy()
    }

    pub fn is_connected(&self) -> bool {
        self.status.is_connected()
    }

    /// Start `command`. `WOULDBLOCK` means it runs and an
    /// `OperationComplete` notification will follow; anything else is the
    /// final result and nothing was started.
    pub fn execute(&mut self, command: Command) -> ReplyCode {
        if self.status.is_busy() {
            return ReplyCode::BUSY;
        }
        if !command.is_valid() {
            return ReplyCode::SYNTAXERROR;
        }
        match &command {
            Command::Connect { .. } if self.status.is_connected() => return ReplyCode::ALREADYCONNECTED,
            Command::Connect { .. } | Command::Disconnect => {}
            _ if !self.status.is_connected() => return ReplyCode::NOTCONNECTED,
            _ => {}
        }
        if !self.status.try_begin() {
            return ReplyCode::BUSY;
        }
        if let Command::Connect { server } = &command {
            self.server = Some(server.key());
        }
        self.logger.debug(format!("Executing {:?}", command.id()));
        if self.inputs.send(DriverInput::Command(command)).is_err() {
            self.status.finish();
            return ReplyCode::INTERNALERROR;
        }
        ReplyCode::WOULDBLOCK
    }

    /// Abort the running command; it completes with `CANCELED`.
    pub fn cancel(&self) -> bool {
        if !self.status.is_busy() {
            return false;
        }
        self.inputs.send(DriverInput::Cancel).is_ok()
    }

    /// Answer the async request `request_id`. Replies to requests that are
    /// no longer pending are dropped by the control socket.
    pub fn set_async_request_reply(&self, request_id: Uuid, reply: AsyncReply) -> bool {
        if !self.status.is_busy() {
            return false;
        }
        let envelope = AsyncReplyEnvelope { request_id, reply };
        self.inputs.send(DriverInput::AsyncReply(envelope)).is_ok()
    }

    /// Cached listing of `path` on the current server; `Ok(None)` when
    /// nothing usable is cached.
    pub fn cache_lookup(&self, path: &ServerPath) -> EngineResult<Option<DirectoryListing>> {
        let Some(key) = self.server.as_ref() else {
            return Err(EngineError::disconnected("No server to look up"));
        };
        let cached = self.context.directory_cache().lookup(key, path);
        Ok(cached.filter(|c| !c.listing.failed).map(|c| c.listing))
    }

    pub async fn next_notification(&mut self) -> Option<Notification> {
        self.notifications.recv().await
    }

    /// Notification already queued, if any.
    pub fn try_notification(&mut self) -> Option<Notification> {
        self.notifications.try_recv().ok()
    }

    pub fn notifications(&mut self) -> impl Stream<Item = Notification> + '_ {
        stream::poll_fn(move |cx| self.notifications.poll_recv(cx))
    }

    /// Skip notifications until the running command completes.
    pub async fn wait_for_completion(&mut self) -> Option<ReplyCode> {
        while let Some(notification) = self.notifications.recv().await {
            if let Notification::OperationComplete { reply } = notification {
                return Some(reply);
            }
        }
        None
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // The task winds the connection down once the input channel closes.
        self.context.unregister_engine(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;
    use xfer_core::options::EngineOptions;
    use xfer_core::server::{Protocol, ServerType};
    use xfer_core::Server;

    fn engine(options: EngineOptions) -> Engine {
        Engine::new(EngineContext::shared(options))
    }

    fn home() -> ServerPath {
        ServerPath::parse("/home", ServerType::Unix).unwrap()
    }

    async fn completion(engine: &mut Engine) -> ReplyCode {
        tokio::time::timeout(Duration::from_secs(10), engine.wait_for_completion())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn validation_happens_before_anything_runs() {
        let mut e = engine(EngineOptions::default());
        assert_eq!(e.execute(Command::Mkdir { path: home() }), ReplyCode::NOTCONNECTED);
        let bad = Command::Raw { command: "  ".into() };
        assert_eq!(e.execute(bad), ReplyCode::SYNTAXERROR);
        assert!(!e.is_busy());
        assert!(e.cache_lookup(&home()).is_err());
    }

    #[tokio::test]
    async fn disconnect_while_idle_succeeds() {
        let mut e = engine(EngineOptions::default());
        assert_eq!(e.execute(Command::Disconnect), ReplyCode::WOULDBLOCK);
        assert_eq!(completion(&mut e).await, ReplyCode::OK);
        assert!(!e.is_busy());
    }

    #[tokio::test]
    async fn refused_connection_reports_disconnected() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let mut e = engine(EngineOptions::default());
        let server = Server::new(Protocol::InsecureFtp, "127.0.0.1", port);
        assert_eq!(e.execute(Command::Connect { server }), ReplyCode::WOULDBLOCK);
        let code = completion(&mut e).await;
        assert!(code.is_error());
        assert!(code.is_disconnected());
        assert!(!e.is_connected());
    }

    #[tokio::test]
    async fn busy_engine_rejects_and_cancels() {
        // Accepts but never greets.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut e = engine(EngineOptions::default());
        let server = Server::new(Protocol::InsecureFtp, "127.0.0.1", port);
        assert_eq!(e.execute(Command::Connect { server: server.clone() }), ReplyCode::WOULDBLOCK);
        assert_eq!(e.execute(Command::Connect { server }), ReplyCode::BUSY);
        let (_conn, _) = listener.accept().await.unwrap();
        assert!(e.cancel());
        let code = completion(&mut e).await;
        assert!(code.contains(ReplyCode::CANCELED));
        assert!(!e.is_busy());
    }

    #[tokio::test]
    async fn missing_sftp_helper_is_critical() {
        let options = EngineOptions {
            sftp_helper: "/nonexistent/fzsftp-helper".into(),
            ..EngineOptions::default()
        };
        let mut e = engine(options);
        let server = Server::new(Protocol::Sftp, "sftp.example.com", 22);
        assert_eq!(e.execute(Command::Connect { server }), ReplyCode::WOULDBLOCK);
        let code = completion(&mut e).await;
        assert!(code.contains(ReplyCode::CRITICALERROR));
        assert!(code.is_disconnected());
    }

    #[tokio::test]
    async fn notifications_form_a_stream() {
        let mut e = engine(EngineOptions::default());
        e.execute(Command::Disconnect);
        let mut completions = Box::pin(e.notifications().filter_map(|n| async move {
            match n {
                Notification::OperationComplete { reply } => Some(reply),
                _ => None,
            }
        }));
        let reply = tokio::time::timeout(Duration::from_secs(5), completions.next())
            .await
            .unwrap();
        assert_eq!(reply, Some(ReplyCode::OK));
    }
}
