//! Contract between an engine and the protocol that serves it.
//!
//! A protocol supplies a sans-IO [`ControlSocket`] state machine and an async
//! [`ProtocolDriver`] that owns the sockets or helper process and feeds the
//! state machine until the connection closes.

use crate::command::Command;
use crate::context::EngineContext;
use crate::lock::EngineId;
use crate::logging::Logger;
use crate::notification::{AsyncReplyEnvelope, Notification};
use crate::reply::ReplyCode;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

/// Pure state machine: `(state, event) -> effects`.
pub trait ControlSocket {
    type Event;
    type Effect;

    /// Start a command. Returns `WOULDBLOCK` while it runs.
    fn execute(&mut self, command: Command) -> ReplyCode;

    fn handle(&mut self, event: Self::Event);

    /// Abort whatever is running with `code`; the single failure funnel.
    fn reset_operation(&mut self, code: ReplyCode) -> ReplyCode;

    /// Next effect for the driver to carry out.
    fn poll_effect(&mut self) -> Option<Self::Effect>;

    fn is_idle(&self) -> bool;
}

/// Facade-visible flags, written by the driver.
#[derive(Debug, Default)]
pub struct EngineStatus {
    busy: AtomicBool,
    connected: AtomicBool,
}

impl EngineStatus {
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Claim the engine for a new command; false if already busy.
    pub fn try_begin(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn finish(&self) {
        self.busy.store(false, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverInput {
    Command(Command),
    AsyncReply(AsyncReplyEnvelope),
    Cancel,
}

/// Everything a driver reads from.
#[derive(Debug)]
pub struct DriverInputs {
    pub commands: UnboundedReceiver<DriverInput>,
    /// Fires when a cache lock this engine waited for was handed over.
    pub lock_wakeups: UnboundedReceiver<()>,
}

/// What a driver needs from the engine that owns it.
#[derive(Debug, Clone)]
pub struct SocketEnv {
    pub engine: EngineId,
    pub context: Arc<EngineContext>,
    pub status: Arc<EngineStatus>,
    pub notifications: UnboundedSender<Notification>,
}

impl SocketEnv {
    pub fn logger(&self, target: &'static str) -> Logger {
        Logger::new(
            self.engine,
            target,
            self.context.options().debug_level,
            Some(self.notifications.clone()),
        )
    }

    pub fn post(&self, notification: Notification) {
        let _ = self.notifications.send(notification);
    }

    /// Report the end of the running command.
    pub fn complete(&self, reply: ReplyCode) {
        self.status.finish();
        self.post(Notification::OperationComplete { reply });
    }
}

#[async_trait]
pub trait ProtocolDriver: Send {
    /// Connect, then serve commands until the connection is gone.
    /// Returns the reply code the connection ended with.
    async fn run(&mut self, inputs: &mut DriverInputs) -> ReplyCode;
}
