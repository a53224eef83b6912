//! Per-socket logging context.
//!
//! Every line goes to the `log` facade and, if the debug level allows it,
//! to the engine's notification stream.

use crate::lock::EngineId;
use crate::notification::{MessageType, Notification};
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, Clone)]
pub struct Logger {
    engine: EngineId,
    target: &'static str,
    debug_level: u8,
    sender: Option<UnboundedSender<Notification>>,
}

impl Logger {
    pub fn new(
        engine: EngineId,
        target: &'static str,
        debug_level: u8,
        sender: Option<UnboundedSender<Notification>>,
    ) -> Self {
        Self {
            engine,
            target,
            debug_level,
            sender,
        }
    }

    /// Logger that only writes to the `log` facade.
    pub fn detached(engine: EngineId, target: &'static str) -> Self {
        Self::new(engine, target, 0, None)
    }

    pub fn engine(&self) -> EngineId {
        self.engine
    }

    pub fn set_debug_level(&mut self, level: u8) {
        self.debug_level = level;
    }

    pub fn should_log(&self, kind: MessageType) -> bool {
        kind.debug_level() <= self.debug_level
    }

    pub fn log(&self, kind: MessageType, message: impl Into<String>) {
        let message = message.into();
        let level = match kind {
            MessageType::Error => log::Level::Error,
            MessageType::DebugWarning => log::Level::Warn,
            MessageType::Status | MessageType::Command | MessageType::Response => log::Level::Info,
            MessageType::DebugInfo | MessageType::RawList => log::Level::Debug,
            MessageType::DebugVerbose | MessageType::DebugDebug => log::Level::Trace,
        };
        log::log!(target: self.target, level, "{} {:?}: {}", self.engine, kind, message);
        if !self.should_log(kind) {
            return;
        }
        if let Some(tx) = &self.sender {
            let _ = tx.send(Notification::Log { kind, message });
        }
    }

    pub fn status(&self, message: impl Into<String>) {
        self.log(MessageType::Status, message)
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(MessageType::Error, message)
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(MessageType::DebugInfo, message)
    }

    pub fn verbose(&self, message: impl Into<String>) {
        self.log(MessageType::DebugVerbose, message)
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.log(MessageType::DebugWarning, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn debug_messages_are_gated() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut logger = Logger::new(EngineId(1), "xfer::test", 0, Some(tx));
        logger.status("hello");
        logger.debug("hidden");
        logger.set_debug_level(2);
        logger.debug("shown");
        let mut seen = Vec::new();
        while let Ok(Notification::Log { message, .. }) = rx.try_recv() {
            seen.push(message);
        }
        assert_eq!(seen, vec!["hello".to_string(), "shown".to_string()]);
    }
}
