//! Connect: start the helper, check its banner, then `proxy`, one
//! `keyfile` per key and `open`. Host key and password prompts arrive while
//! `open` is running.

use crate::sftp::control::SftpControlSocket;
use crate::sftp::effect::SftpEffect;
use crate::sftp::event::{HelperRequest, HostKeyKind};
use crate::sftp::ops::{ConnectOp, ConnectState, SftpOp, Step};
use crate::sftp::request::Request;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::VecDeque;
use xfer_core::context::HostKeyStatus;
use xfer_core::notification::{AsyncReply, AsyncRequest};
use xfer_core::reply::ReplyCode;
use xfer_core::server::{LogonType, Server};

/// Protocol revision of the helper this crate speaks.
pub const PROTOCOL_VERSION: u32 = 11;

lazy_static! {
    static ref BANNER: Regex = Regex::new(r"^fzSftp started, protocol_version=(\d+)$").expect("static regex");
}

/// Helper version announced in its banner, `None` for anything else.
pub fn banner_version(line: &str) -> Option<u32> {
    BANNER.captures(line.trim())?.get(1)?.as_str().parse().ok()
}

/// Text of the prompts leading up to a password request.
#[derive(Debug, Default)]
pub struct Challenge {
    pub preamble: String,
    pub instruction: String,
    /// Identity of the last challenge answered.
    pub last: Option<String>,
    /// The stored password was already sent once.
    pub password_sent: bool,
}

impl Challenge {
    /// What makes two prompts "the same question".
    pub fn identity(&self, prompt: &str) -> String {
        format!("{}\n{}\n{}", self.preamble, self.instruction, prompt)
    }

    /// Prompt shown to the user.
    pub fn text(&self, prompt: &str) -> String {
        [self.preamble.as_str(), self.instruction.as_str(), prompt]
            .iter()
            .filter(|s| !s.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl SftpControlSocket {
    pub(crate) fn start_connect(&mut self, server: Server) -> SftpOp {
        self.logger
            .status(format!("Connecting to {}...", server.format_host()));
        let key_files: VecDeque<String> = if server.logon_type == LogonType::Key {
            server.key_files.iter().cloned().collect()
        } else {
            VecDeque::new()
        };
        self.prepare_connect(server);
        SftpOp::Connect(ConnectOp {
            state: ConnectState::Init,
            key_files,
            sent: false,
        })
    }

    pub(crate) fn connect_send(&mut self, op: &mut ConnectOp) -> Step {
        if op.sent {
            return Step::Wait;
        }
        match op.state {
            ConnectState::Init => {
                op.state = ConnectState::Banner;
                self.mark_open();
                self.emit(SftpEffect::Spawn);
                Step::Wait
            }
            ConnectState::Banner => Step::Wait,
            ConnectState::Proxy => {
                let proxy = self.options.proxy.clone();
                if !proxy.is_enabled() || self.server.bypass_proxy {
                    op.state = ConnectState::Keyfile;
                    return Step::Continue;
                }
                self.logger.status(format!(
                    "Connecting through {} proxy {}:{}",
                    proxy.proxy_type.keyword(),
                    proxy.host,
                    proxy.port
                ));
                op.sent = true;
                self.send_request(Request::Proxy(proxy));
                Step::Wait
            }
            ConnectState::Keyfile => match op.key_files.pop_front() {
                Some(file) => {
                    op.sent = true;
                    self.send_request(Request::Keyfile(file));
                    Step::Wait
                }
                None => {
                    op.state = ConnectState::Open;
                    Step::Continue
                }
            },
            ConnectState::Open => {
                op.sent = true;
                let request = Request::Open {
                    user: self.server.effective_user().to_string(),
                    host: self.server.host.clone(),
                    port: self.server.port,
                };
                self.send_request(request);
                Step::Wait
            }
        }
    }

    pub(crate) fn connect_reply(&mut self, op: &mut ConnectOp, text: &str) -> Step {
        if op.state != ConnectState::Banner {
            return Step::Wait;
        }
        match banner_version(text) {
            Some(PROTOCOL_VERSION) => {
                op.state = ConnectState::Proxy;
                Step::Continue
            }
            Some(version) => {
                self.logger.error(format!(
                    "SFTP helper speaks protocol version {}, expected {}",
                    version, PROTOCOL_VERSION
                ));
                Step::Done(ReplyCode::CRITICALERROR)
            }
            None => {
                self.logger
                    .error(format!("SFTP helper sent an unexpected banner: {}", text));
                Step::Done(ReplyCode::CRITICALERROR)
            }
        }
    }

    pub(crate) fn connect_done(&mut self, op: &mut ConnectOp, ok: bool) -> Step {
        op.sent = false;
        match op.state {
            ConnectState::Proxy if ok => {
                op.state = ConnectState::Keyfile;
                Step::Continue
            }
            ConnectState::Keyfile if ok => Step::Continue,
            ConnectState::Open if ok => {
                self.logged_in = true;
                self.forget_challenge();
                Step::Done(ReplyCode::OK)
            }
            ConnectState::Proxy | ConnectState::Keyfile | ConnectState::Open => Step::Done(ReplyCode::ERROR),
            ConnectState::Init | ConnectState::Banner => Step::Wait,
        }
    }

    fn forget_challenge(&mut self) {
        self.challenge.last = None;
        self.challenge.preamble.clear();
        self.challenge.instruction.clear();
    }

    pub(crate) fn connect_helper_request(&mut self, _op: &mut ConnectOp, request: HelperRequest) -> Step {
        match request {
            HelperRequest::HostKey {
                kind,
                host,
                port,
                fingerprint,
            } => self.on_host_key(kind, host, port, fingerprint),
            HelperRequest::Password { prompt } => self.on_password_prompt(&prompt),
        }
    }

    fn on_host_key(&mut self, kind: HostKeyKind, host: String, port: u16, fingerprint: String) -> Step {
        let status = self.context().trust().host_key_status(&host, port, &fingerprint);
        if status == HostKeyStatus::Trusted {
            self.logger.debug("Host key already trusted");
            self.send_request(Request::HostKey {
                trust: true,
                always: false,
            });
            return Step::Wait;
        }
        let changed = status == HostKeyStatus::Changed || kind == HostKeyKind::Changed;
        self.host_key = Some((host.clone(), port, fingerprint.clone()));
        self.request(AsyncRequest::HostKey {
            host,
            port,
            fingerprint,
            changed,
        });
        Step::Wait
    }

    fn on_password_prompt(&mut self, prompt: &str) -> Step {
        let identity = self.challenge.identity(prompt);
        if self.challenge.last.as_deref() == Some(identity.as_str()) {
            self.logger
                .error("Authentication failed: the server repeated the same challenge");
            self.auth_failed = true;
            return Step::Done(ReplyCode::ERROR);
        }
        let text = self.challenge.text(prompt);
        self.challenge.last = Some(identity);
        self.challenge.preamble.clear();
        self.challenge.instruction.clear();

        let stored = self.server.effective_password().to_string();
        let can_use_stored = self.server.logon_type != LogonType::Interactive
            && !stored.is_empty()
            && !self.challenge.password_sent;
        if can_use_stored {
            self.challenge.password_sent = true;
            self.send_request(Request::Password(stored));
            return Step::Wait;
        }
        let password_only = !text.contains('\n');
        self.request(AsyncRequest::InteractiveLogin {
            challenge: text,
            password_only,
        });
        Step::Wait
    }

    pub(crate) fn connect_async_reply(&mut self, _op: &mut ConnectOp, reply: AsyncReply) -> Step {
        match reply {
            AsyncReply::HostKey { trust, always } => {
                let Some((host, port, fingerprint)) = self.host_key.take() else {
                    return Step::Wait;
                };
                if trust && always {
                    self.context().trust().trust_host_key(&host, port, &fingerprint);
                }
                if !trust {
                    self.logger.error("Host key was rejected");
                    self.host_key_refused = true;
                }
                self.send_request(Request::HostKey { trust, always });
                Step::Wait
            }
            AsyncReply::InteractiveLogin(Some(answer)) => {
                self.send_request(Request::Password(answer));
                Step::Wait
            }
            AsyncReply::InteractiveLogin(None) => Step::Done(ReplyCode::CANCELED),
            _ => Step::Wait,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banner_parsing() {
        assert_eq!(banner_version("fzSftp started, protocol_version=11"), Some(11));
        assert_eq!(banner_version("fzSftp started, protocol_version=9\r"), Some(9));
        assert_eq!(banner_version("hello"), None);
    }

    #[test]
    fn challenge_identity_covers_all_parts() {
        let mut c = Challenge::default();
        let plain = c.identity("Password:");
        c.instruction = "Enter OTP".into();
        assert_ne!(c.identity("Password:"), plain);
        assert_eq!(c.text("Code:"), "Enter OTP\nCode:");
    }
}
