//! Logon: greeting, optional TLS upgrade, login sequence and the
//! post-login negotiation (SYST, FEAT, CLNT, OPTS UTF8, PBSZ/PROT, OPTS MLST).

use crate::ftp::control::FtpControlSocket;
use crate::ftp::effect::FtpEffect;
use crate::ftp::features::{mlst_opts, server_type_from_syst, FeatureSet};
use crate::ftp::login::{login_sequence, LoginProgress, LoginSequence, LoginStepKind};
use crate::ftp::ops::{FtpOp, LogonOp, LogonState, Step};
use crate::ftp::reply::FtpReply;
use xfer_core::capabilities::{CapState, Capability};
use xfer_core::notification::{AsyncReply, AsyncRequest, CertificateInfo};
use xfer_core::reply::ReplyCode;
use xfer_core::server::{Encoding, FtpProxyType, LogonType, Protocol, Server, ServerType};

impl FtpControlSocket {
    pub(crate) fn start_connect(&mut self, server: Server) -> FtpOp {
        self.prepare_connect(server);
        let proxy = self.active_ftp_proxy();
        let steps = login_sequence(&self.server, proxy.as_ref());
        let custom = self
            .server
            .post_login_commands
            .iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        FtpOp::Logon(LogonOp {
            state: LogonState::Connecting,
            sequence: LoginSequence::new(steps),
            custom,
            last_reply: String::new(),
            certificate: None,
            early_reply: None,
        })
    }

    /// FTP-level proxy applying to the current server, if any.
    fn active_ftp_proxy(&self) -> Option<xfer_core::server::FtpProxy> {
        if self.server.bypass_proxy {
            return None;
        }
        self.options
            .ftp_proxy
            .clone()
            .filter(|p| p.proxy_type != FtpProxyType::None && !p.host.is_empty())
    }

    pub(crate) fn logon_send(&mut self, op: &mut LogonOp) -> Step {
        match op.state {
            LogonState::Connecting => {
                let (host, port) = match self.active_ftp_proxy() {
                    Some(p) => (p.host, p.port),
                    None => (self.server.host.clone(), self.server.port),
                };
                self.logger.status(format!("Connecting to {}:{}...", host, port));
                self.open = true;
                self.emit(FtpEffect::Connect { host, port });
                Step::Wait
            }
            LogonState::Login => {
                let Some(step) = op.sequence.next_step().cloned() else {
                    self.logger.error("Login sequence is empty");
                    return Step::Done(ReplyCode::INTERNALERROR);
                };
                let interactive = matches!(self.server.logon_type, LogonType::Ask | LogonType::Interactive);
                if step.kind == LoginStepKind::Pass && interactive && self.server.password.is_empty() {
                    op.state = LogonState::Password;
                    let challenge = op.last_reply.clone();
                    self.request(AsyncRequest::InteractiveLogin {
                        challenge,
                        password_only: true,
                    });
                    return Step::Wait;
                }
                self.send_line(&step.command, &step.display());
                Step::Wait
            }
            LogonState::Syst => {
                let cached = self.context().capabilities().get_text(&self.key, Capability::SystCommand);
                match (self.capability(Capability::SystCommand), cached) {
                    (CapState::Unknown, _) => {
                        self.send_command("SYST");
                        Step::Wait
                    }
                    (_, syst) => {
                        if let Some(text) = syst {
                            self.apply_syst(&text);
                        }
                        op.state = LogonState::Feat;
                        Step::Continue
                    }
                }
            }
            LogonState::Feat => {
                if self.capability(Capability::FeatCommand) == CapState::Unknown {
                    self.send_command("FEAT");
                    return Step::Wait;
                }
                self.apply_utf8_capability();
                op.state = LogonState::Clnt;
                Step::Continue
            }
            LogonState::Clnt => {
                let name = self.options.client_name.clone();
                if self.use_utf8 && !name.is_empty() && self.capability(Capability::ClntCommand) == CapState::Yes {
                    self.send_command(&format!("CLNT {}", name));
                    return Step::Wait;
                }
                op.state = LogonState::OptsUtf8;
                Step::Continue
            }
            LogonState::OptsUtf8 => {
                if self.use_utf8 && self.capability(Capability::Utf8Command) == CapState::Yes {
                    self.send_command("OPTS UTF8 ON");
                    return Step::Wait;
                }
                op.state = LogonState::Pbsz;
                Step::Continue
            }
            LogonState::Pbsz => {
                if self.tls_active {
                    self.send_command("PBSZ 0");
                    return Step::Wait;
                }
                op.state = LogonState::OptsMlst;
                Step::Continue
            }
            LogonState::Prot => {
                self.send_command("PROT P");
                Step::Wait
            }
            LogonState::OptsMlst => {
                let facts = self.context().capabilities().get_text(&self.key, Capability::MlstFacts);
                let opts = match (self.capability(Capability::MlsdCommand), facts) {
                    (CapState::Yes, Some(facts)) => mlst_opts(&facts, &self.options.mlst_facts),
                    _ => None,
                };
                match opts {
                    Some(cmd) => {
                        self.send_command(&cmd);
                        Step::Wait
                    }
                    None => {
                        op.state = LogonState::Custom;
                        Step::Continue
                    }
                }
            }
            LogonState::Custom => match op.custom.pop_front() {
                Some(cmd) => {
                    self.send_command(&cmd);
                    Step::Wait
                }
                None => {
                    self.logged_in = true;
                    Step::Done(ReplyCode::OK)
                }
            },
            LogonState::Welcome
            | LogonState::Handshake
            | LogonState::AuthTls
            | LogonState::AuthSsl
            | LogonState::AuthHandshake
            | LogonState::Certificate
            | LogonState::Insecure
            | LogonState::Password => Step::Wait,
        }
    }

    pub(crate) fn logon_connected(&mut self, op: &mut LogonOp) -> Step {
        if op.state != LogonState::Connecting {
            return Step::Wait;
        }
        if self.server.protocol == Protocol::Ftps {
            self.logger.status("Connection established, initializing TLS...");
            op.state = LogonState::Handshake;
            self.emit(FtpEffect::StartTls);
        } else {
            self.logger.status("Connection established, waiting for welcome message...");
            op.state = LogonState::Welcome;
            self.pending_replies += 1;
        }
        Step::Wait
    }

    pub(crate) fn logon_tls_established(
        &mut self,
        op: &mut LogonOp,
        certificate: CertificateInfo,
        verified: bool,
    ) -> Step {
        let implicit = match op.state {
            LogonState::Handshake => true,
            LogonState::AuthHandshake => false,
            _ => return Step::Wait,
        };
        self.tls_active = true;
        if implicit {
            // The greeting follows the handshake whether or not the
            // certificate is accepted yet.
            self.pending_replies += 1;
        }
        self.logger.status("TLS connection established.");

        let trusted = verified
            || self.context().trust().is_certificate_trusted(
                &certificate.host,
                certificate.port,
                &certificate.fingerprint_sha256,
            );
        if trusted {
            return self.certificate_accepted(op, implicit);
        }
        op.state = LogonState::Certificate;
        op.certificate = Some(certificate.clone());
        self.request(AsyncRequest::Certificate(certificate));
        Step::Wait
    }

    fn certificate_accepted(&mut self, op: &mut LogonOp, implicit: bool) -> Step {
        if implicit {
            op.state = LogonState::Welcome;
            match op.early_reply.take() {
                Some(reply) => self.logon_reply(op, &reply),
                None => Step::Wait,
            }
        } else {
            op.state = LogonState::Login;
            Step::Continue
        }
    }

    pub(crate) fn logon_async_reply(&mut self, op: &mut LogonOp, reply: AsyncReply) -> Step {
        match (op.state, reply) {
            (LogonState::Certificate, AsyncReply::Certificate { trust, always }) => {
                let certificate = op.certificate.take();
                if !trust {
                    self.logger.error("Remote certificate not trusted.");
                    return Step::Done(ReplyCode::CRITICALERROR);
                }
                if let (true, Some(cert)) = (always, certificate) {
                    self.context()
                        .trust()
                        .trust_certificate(&cert.host, cert.port, &cert.fingerprint_sha256);
                }
                let implicit = self.server.protocol == Protocol::Ftps;
                self.certificate_accepted(op, implicit)
            }
            (LogonState::Insecure, AsyncReply::InsecureConnection { allow }) => {
                if !allow {
                    self.logger.error("Refusing to continue over an unencrypted connection");
                    return Step::Done(ReplyCode::CRITICALERROR);
                }
                op.state = LogonState::Login;
                Step::Continue
            }
            (LogonState::Password, AsyncReply::InteractiveLogin(password)) => {
                let Some(password) = password else {
                    return Step::Done(ReplyCode::CANCELED);
                };
                op.sequence.set_current_argument(&password);
                op.state = LogonState::Login;
                match op.sequence.current().cloned() {
                    Some(step) => {
                        self.send_line(&step.command, &step.display());
                        Step::Wait
                    }
                    None => Step::Done(ReplyCode::INTERNALERROR),
                }
            }
            (state, other) => {
                self.logger
                    .debug(format!("Unexpected async reply {:?} in logon state {:?}", other, state));
                Step::Wait
            }
        }
    }

    pub(crate) fn logon_reply(&mut self, op: &mut LogonOp, reply: &FtpReply) -> Step {
        match op.state {
            LogonState::Welcome => {
                if !reply.is_completion() {
                    return Step::Done(ReplyCode::ERROR | ReplyCode::CRITICALERROR);
                }
                let try_tls = match self.server.protocol {
                    Protocol::Ftpes => true,
                    Protocol::Ftp => self.capability(Capability::AuthTls) != CapState::No,
                    _ => false,
                };
                if try_tls {
                    op.state = LogonState::AuthTls;
                    self.send_command("AUTH TLS");
                    return Step::Wait;
                }
                if self.server.protocol == Protocol::Ftp {
                    return self.unencrypted_fallback(op);
                }
                op.state = LogonState::Login;
                Step::Continue
            }
            LogonState::AuthTls | LogonState::AuthSsl => {
                if reply.is_success() {
                    if op.state == LogonState::AuthTls {
                        self.set_capability(Capability::AuthTls, CapState::Yes);
                    }
                    self.logger.status("Initializing TLS...");
                    op.state = LogonState::AuthHandshake;
                    self.emit(FtpEffect::StartTls);
                    return Step::Wait;
                }
                if op.state == LogonState::AuthTls {
                    self.set_capability(Capability::AuthTls, CapState::No);
                    if self.capability(Capability::AuthSsl) != CapState::No {
                        op.state = LogonState::AuthSsl;
                        self.send_command("AUTH SSL");
                        return Step::Wait;
                    }
                } else {
                    self.set_capability(Capability::AuthSsl, CapState::No);
                }
                if self.server.protocol == Protocol::Ftpes {
                    self.logger.error("Server does not support FTP over TLS.");
                    return Step::Done(ReplyCode::ERROR | ReplyCode::CRITICALERROR);
                }
                self.unencrypted_fallback(op)
            }
            LogonState::Login => match op.sequence.on_reply(reply) {
                LoginProgress::Continue => {
                    op.last_reply = reply.message().to_string();
                    Step::Continue
                }
                LoginProgress::LoggedIn => {
                    op.state = LogonState::Syst;
                    Step::Continue
                }
                LoginProgress::Incomplete => {
                    self.logger.error("Login sequence fully executed yet not logged in");
                    Step::Done(ReplyCode::ERROR | ReplyCode::CRITICALERROR)
                }
                LoginProgress::Failed(code) => {
                    if code.contains(ReplyCode::PASSWORDFAILED) {
                        self.logger.error("Authentication failed.");
                    }
                    Step::Done(code)
                }
            },
            LogonState::Syst => {
                if reply.is_completion() {
                    let text = reply.message().to_string();
                    self.context()
                        .capabilities()
                        .set_text(&self.key, Capability::SystCommand, CapState::Yes, text.clone());
                    self.apply_syst(&text);
                } else {
                    self.set_capability(Capability::SystCommand, CapState::No);
                }
                op.state = LogonState::Feat;
                Step::Continue
            }
            LogonState::Feat => {
                let features = FeatureSet::parse(reply);
                features.store(&mut self.context().capabilities(), &self.key, reply.is_completion());
                self.apply_utf8_capability();
                op.state = LogonState::Clnt;
                Step::Continue
            }
            LogonState::Clnt => {
                op.state = LogonState::OptsUtf8;
                Step::Continue
            }
            LogonState::OptsUtf8 => {
                if !reply.is_completion() {
                    self.logger.debug("OPTS UTF8 refused, keeping the negotiated encoding");
                }
                op.state = LogonState::Pbsz;
                Step::Continue
            }
            LogonState::Pbsz => {
                op.state = LogonState::Prot;
                Step::Continue
            }
            LogonState::Prot => {
                self.protect_data = reply.is_completion();
                if !self.protect_data {
                    self.logger.warning("Server refused PROT P, data connections stay unencrypted");
                }
                op.state = LogonState::OptsMlst;
                Step::Continue
            }
            LogonState::OptsMlst => {
                op.state = LogonState::Custom;
                Step::Continue
            }
            LogonState::Custom => Step::Continue,
            LogonState::Certificate => {
                op.early_reply = Some(reply.clone());
                Step::Wait
            }
            LogonState::Connecting
            | LogonState::Handshake
            | LogonState::AuthHandshake
            | LogonState::Insecure
            | LogonState::Password => {
                self.logger.debug(format!("Unexpected reply during logon: {}", reply.text()));
                Step::Wait
            }
        }
    }

    /// Plain FTP after TLS was found missing: allowed outright or asked for.
    fn unencrypted_fallback(&mut self, op: &mut LogonOp) -> Step {
        if self.options.allow_unencrypted_fallback {
            self.logger
                .warning("Server does not support FTP over TLS, continuing unencrypted.");
            op.state = LogonState::Login;
            return Step::Continue;
        }
        op.state = LogonState::Insecure;
        let (host, port) = (self.server.host.clone(), self.server.port);
        self.request(AsyncRequest::InsecureConnection { host, port });
        Step::Wait
    }

    fn apply_syst(&mut self, text: &str) {
        if self.server.server_type != ServerType::Unix {
            return;
        }
        if let Some(detected) = server_type_from_syst(&format!("215 {}", text)) {
            self.logger.debug(format!("SYST reply implies {:?} server", detected));
            self.server_type = detected;
        }
    }

    fn apply_utf8_capability(&mut self) {
        if self.server.encoding == Encoding::Auto {
            self.use_utf8 = self.capability(Capability::Utf8Command) == CapState::Yes;
        }
    }
}
