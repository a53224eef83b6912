//! RawTransfer: TYPE, data connection setup (PASV/EPSV or PORT/EPRT with
//! fallback between the two), REST, the transfer command itself, and the
//! rendezvous of its final reply with the end of the data connection.

use crate::ftp::control::FtpControlSocket;
use crate::ftp::effect::{FtpEffect, FtpEvent, TransferMode};
use crate::ftp::list::is_misleading_empty;
use crate::ftp::ops::{RawState, RawTransferOp, Step};
use crate::ftp::pasv::{format_port_command, parse_epsv, parse_pasv, pasv_target};
use crate::ftp::reply::FtpReply;
use std::net::{IpAddr, SocketAddr};
use xfer_core::capabilities::{CapState, Capability};
use xfer_core::operation::TransferEndReason;
use xfer_core::reply::ReplyCode;

impl FtpControlSocket {
    fn peer_ip(&self) -> Option<IpAddr> {
        self.peer.map(|p| p.ip())
    }

    /// Address to announce in PORT/EPRT for a listener bound at `bound`.
    fn announced_listener(&self, bound: SocketAddr) -> SocketAddr {
        if let Ok(ip) = self.options.external_ip.trim().parse::<IpAddr>() {
            if ip.is_ipv4() == bound.is_ipv4() {
                return SocketAddr::new(ip, bound.port());
            }
        }
        if bound.ip().is_unspecified() {
            if let Some(local) = self.local {
                return SocketAddr::new(local.ip(), bound.port());
            }
        }
        bound
    }

    /// EPSV for IPv6 peers and servers advertising it, until it fails once.
    fn use_epsv(&self, op: &RawTransferOp) -> bool {
        let ipv6 = self.peer.map_or(false, |p| p.is_ipv6());
        !op.epsv_failed && (ipv6 || self.capability(Capability::EpsvCommand) == CapState::Yes)
    }

    fn may_switch_mode(&self) -> bool {
        self.options.allow_transfer_mode_fallback
    }

    fn drop_data(&mut self, op: &mut RawTransferOp) {
        if op.data_open {
            self.emit(FtpEffect::AbortTransfer);
            op.data_open = false;
            self.transfer_active = false;
        }
    }

    pub(crate) fn raw_send(&mut self, op: &mut RawTransferOp) -> Step {
        match op.state {
            RawState::Type => {
                if self.current_type == Some(op.setup.binary) {
                    op.state = RawState::PortPasv;
                    return Step::Continue;
                }
                self.send_command(if op.setup.binary { "TYPE I" } else { "TYPE A" });
                Step::Wait
            }
            RawState::PortPasv => {
                if op.passive {
                    op.state = RawState::Pasv;
                    return Step::Continue;
                }
                op.tried_active = true;
                op.state = RawState::WaitData;
                op.data_open = true;
                self.transfer_active = true;
                self.emit(FtpEffect::ListenActive { setup: op.setup.clone() });
                Step::Wait
            }
            RawState::Pasv => {
                op.tried_passive = true;
                let cmd = if self.use_epsv(op) { "EPSV" } else { "PASV" };
                self.send_command(cmd);
                Step::Wait
            }
            RawState::Port => {
                let Some(bound) = op.target else {
                    return Step::Done(ReplyCode::INTERNALERROR);
                };
                let cmd = format_port_command(self.announced_listener(bound));
                self.send_command(&cmd);
                Step::Wait
            }
            RawState::Rest => {
                if op.rest_offset > 0 {
                    self.send_command(&format!("REST {}", op.rest_offset));
                    return Step::Wait;
                }
                op.state = RawState::Transfer;
                Step::Continue
            }
            RawState::Transfer => {
                let cmd = op.command.clone();
                self.send_command(&cmd);
                Step::Wait
            }
            RawState::WaitData | RawState::WaitFinish => Step::Wait,
        }
    }

    pub(crate) fn raw_reply(&mut self, op: &mut RawTransferOp, reply: &FtpReply) -> Step {
        match op.state {
            RawState::Type => {
                if !reply.is_completion() {
                    return self.raw_command_refused();
                }
                self.current_type = Some(op.setup.binary);
                op.state = RawState::PortPasv;
                Step::Continue
            }
            RawState::Pasv => self.raw_pasv_reply(op, reply),
            RawState::Port => {
                if reply.is_completion() {
                    op.state = RawState::Rest;
                    return Step::Continue;
                }
                self.drop_data(op);
                if self.may_switch_mode() && !op.tried_passive {
                    self.logger.status("Active mode refused, trying passive mode");
                    op.passive = true;
                    op.state = RawState::PortPasv;
                    return Step::Continue;
                }
                self.raw_command_refused()
            }
            RawState::Rest => {
                if !reply.is_success() {
                    self.logger.error("Server refused to resume the transfer");
                    return self.raw_command_refused();
                }
                op.state = RawState::Transfer;
                Step::Continue
            }
            RawState::Transfer | RawState::WaitFinish => self.raw_final_reply(op, reply),
            RawState::PortPasv | RawState::WaitData => {
                self.logger.debug(format!("Unexpected reply during data setup: {}", reply.text()));
                Step::Wait
            }
        }
    }

    fn raw_pasv_reply(&mut self, op: &mut RawTransferOp, reply: &FtpReply) -> Step {
        let peer = self.peer_ip();
        let announced = match (reply.code, peer) {
            (229, Some(ip)) => parse_epsv(&reply.text()).map(|port| SocketAddr::new(ip, port)),
            (229, None) => None,
            _ if reply.is_completion() => parse_pasv(&reply.text()),
            _ => None,
        };

        let Some(announced) = announced else {
            if self.use_epsv(op) {
                op.epsv_failed = true;
                return Step::Continue;
            }
            if self.may_switch_mode() && !op.tried_active {
                self.logger.status("Passive mode refused, trying active mode");
                op.passive = false;
                op.state = RawState::PortPasv;
                return Step::Continue;
            }
            self.logger.error("Failed to set up passive data connection");
            return self.raw_command_refused();
        };

        op.announced = Some(announced);
        let target = match (op.force_peer, peer) {
            (true, Some(ip)) => SocketAddr::new(ip, announced.port()),
            (false, Some(ip)) => pasv_target(announced, ip, self.options.pasv_reply_fallback_mode),
            (_, None) => announced,
        };
        if target != announced {
            self.logger
                .status("Server sent passive reply with unroutable address. Using server address instead.");
        }
        op.target = Some(target);
        op.state = RawState::WaitData;
        op.data_open = true;
        self.transfer_active = true;
        self.emit(FtpEffect::OpenPassive {
            addr: target,
            setup: op.setup.clone(),
        });
        Step::Wait
    }

    /// TYPE, PASV/EPSV, PORT/EPRT or REST failed; the transfer command was
    /// never sent.
    fn raw_command_refused(&mut self) -> Step {
        self.last_end_reason = TransferEndReason::PreTransferCommandFailure;
        Step::Done(ReplyCode::ERROR)
    }

    /// Final reply to the transfer command itself.
    fn raw_final_reply(&mut self, op: &mut RawTransferOp, reply: &FtpReply) -> Step {
        if reply.is_completion() {
            op.final_reply = Some(ReplyCode::OK);
        } else if op.setup.mode.is_list() && is_misleading_empty(reply) {
            self.logger.debug("Treating reply as an empty directory listing");
            self.drop_data(op);
            op.final_reply = Some(ReplyCode::OK);
            op.ended = Some((TransferEndReason::Successful, None));
            op.listing = Some(Vec::new());
        } else {
            let immediate = !op.got_preliminary;
            let retry_peer = immediate
                && reply.code == 425
                && !op.passive
                && self.may_switch_mode()
                && self.options.pasv_reply_fallback_mode == 0
                && op.tried_passive
                && !op.tried_peer
                && match (op.announced, self.peer_ip()) {
                    (Some(a), Some(p)) => a.ip() != p,
                    _ => false,
                };
            self.drop_data(op);
            if retry_peer {
                self.logger.status("Retrying passive mode with the server address");
                op.tried_peer = true;
                op.force_peer = true;
                op.passive = true;
                op.got_preliminary = false;
                op.ended = None;
                op.state = RawState::PortPasv;
                return Step::Continue;
            }
            op.final_reply = Some(ReplyCode::ERROR);
            if op.ended.is_none() {
                let reason = if immediate {
                    TransferEndReason::TransferCommandFailureImmediate
                } else {
                    TransferEndReason::TransferCommandFailure
                };
                op.ended = Some((reason, None));
            }
        }
        if op.ended.is_some() {
            return self.raw_finish(op);
        }
        op.state = RawState::WaitFinish;
        Step::Wait
    }

    pub(crate) fn raw_preliminary(&mut self, op: &mut RawTransferOp, _reply: &FtpReply) -> Step {
        if op.state == RawState::Transfer {
            op.got_preliminary = true;
        }
        Step::Wait
    }

    pub(crate) fn raw_data_event(&mut self, op: &mut RawTransferOp, event: FtpEvent) -> Step {
        match event {
            FtpEvent::DataConnected if op.state == RawState::WaitData && op.passive => {
                op.state = RawState::Rest;
                Step::Continue
            }
            FtpEvent::DataListening(addr) if op.state == RawState::WaitData && !op.passive => {
                op.target = Some(addr);
                op.state = RawState::Port;
                Step::Continue
            }
            FtpEvent::DataFailed(err) if op.state == RawState::WaitData => {
                op.data_open = false;
                self.transfer_active = false;
                self.logger.error(err.message.clone());
                self.raw_setup_failed(op)
            }
            FtpEvent::TransferEnded {
                reason,
                error,
                listing,
                transferred,
                tls_resumed,
            } => {
                op.data_open = false;
                self.last_transferred = transferred;
                if let Some(resumed) = tls_resumed {
                    self.set_capability(
                        Capability::TlsResumption,
                        if resumed { CapState::Yes } else { CapState::No },
                    );
                    if !resumed {
                        self.logger.debug("Data connection did not resume the TLS session");
                    }
                }
                if let Some(err) = &error {
                    if !reason.is_success() {
                        self.logger.error(err.message.clone());
                    }
                }
                if op.ended.is_none() {
                    op.ended = Some((reason, error));
                    op.listing = listing;
                }
                match op.state {
                    RawState::WaitFinish => self.raw_finish(op),
                    RawState::Transfer => Step::Wait,
                    // Data connection died before the command was sent.
                    _ => {
                        self.logger.error("Data connection closed before the transfer started");
                        self.raw_setup_failed(op)
                    }
                }
            }
            _ => Step::Wait,
        }
    }

    /// The data connection could not be set up; try the other mode.
    fn raw_setup_failed(&mut self, op: &mut RawTransferOp) -> Step {
        op.ended = None;
        if op.passive {
            if self.may_switch_mode() && !op.tried_active {
                self.logger.status("Passive data connection failed, trying active mode");
                op.passive = false;
                op.state = RawState::PortPasv;
                return Step::Continue;
            }
            let differs = match (op.announced, self.peer_ip()) {
                (Some(a), Some(p)) => a.ip() != p,
                _ => false,
            };
            if self.options.pasv_reply_fallback_mode == 0 && !op.tried_peer && differs {
                self.logger.status("Retrying passive mode with the server address");
                op.tried_peer = true;
                op.force_peer = true;
                op.state = RawState::PortPasv;
                return Step::Continue;
            }
        } else if self.may_switch_mode() && !op.tried_passive {
            self.logger.status("Active data connection failed, trying passive mode");
            op.passive = true;
            op.state = RawState::PortPasv;
            return Step::Continue;
        }
        Step::Done(ReplyCode::ERROR)
    }

    fn raw_finish(&mut self, op: &mut RawTransferOp) -> Step {
        let (reason, _) = op.ended.take().unwrap_or((TransferEndReason::Failure, None));
        self.last_end_reason = reason;
        if matches!(op.setup.mode, TransferMode::List { .. }) {
            self.transfer_listing = op.listing.take();
        }
        self.drop_data(op);
        self.transfer_active = false;
        match op.final_reply {
            Some(code) if code.is_ok() && reason.is_success() => Step::Done(ReplyCode::OK),
            _ => {
                let mut code = ReplyCode::ERROR;
                if reason.is_critical() {
                    code |= ReplyCode::CRITICALERROR;
                }
                Step::Done(code)
            }
        }
    }
}
