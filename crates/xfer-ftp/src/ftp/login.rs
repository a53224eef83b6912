//! Login command sequence.
//!
//! The sequence is generated up front from the server and the optional
//! FTP-level proxy, then walked one reply at a time. A 2xx reply skips the
//! optional steps that follow it (PASS after a USER that already logged
//! in); any 4xx/5xx aborts the login.

use crate::ftp::reply::FtpReply;
use std::collections::VecDeque;
use xfer_core::reply::ReplyCode;
use xfer_core::server::{FtpProxy, FtpProxyType, Server};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginStepKind {
    User,
    Pass,
    Account,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginStep {
    pub command: String,
    pub optional: bool,
    /// Log only the verb, never the argument.
    pub hide_arguments: bool,
    pub kind: LoginStepKind,
}

impl LoginStep {
    fn new(command: impl Into<String>, kind: LoginStepKind) -> Self {
        Self {
            command: command.into(),
            optional: false,
            hide_arguments: false,
            kind,
        }
    }

    fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    fn hidden(mut self) -> Self {
        self.hide_arguments = true;
        self
    }

    /// What goes into the log for this step.
    pub fn display(&self) -> String {
        if !self.hide_arguments {
            return self.command.clone();
        }
        match self.command.split_once(' ') {
            Some((verb, _)) => format!("{} ****", verb),
            None => self.command.clone(),
        }
    }
}

fn user_pass(user: &str, pass: &str) -> [LoginStep; 2] {
    [
        LoginStep::new(format!("USER {}", user), LoginStepKind::User),
        LoginStep::new(format!("PASS {}", pass), LoginStepKind::Pass)
            .optional()
            .hidden(),
    ]
}

/// Build the login sequence for `server`, optionally through an FTP proxy.
pub fn login_sequence(server: &Server, proxy: Option<&FtpProxy>) -> Vec<LoginStep> {
    let user = server.effective_user();
    let pass = server.effective_password();
    let mut steps = Vec::new();

    let proxy = proxy.filter(|p| p.proxy_type != FtpProxyType::None);
    match proxy {
        None => steps.extend(user_pass(user, pass)),
        Some(p) => match &p.proxy_type {
            FtpProxyType::Custom(template) => return custom_sequence(template, server, p),
            FtpProxyType::UserAtHost => {
                proxy_login(&mut steps, p);
                steps.extend(user_pass(&format!("{}@{}", user, server.format_host()), pass));
            }
            FtpProxyType::Site => {
                proxy_login(&mut steps, p);
                steps.push(LoginStep::new(format!("SITE {}", server.format_host()), LoginStepKind::Other));
                steps.extend(user_pass(user, pass));
            }
            FtpProxyType::Open => {
                proxy_login(&mut steps, p);
                steps.push(LoginStep::new(format!("OPEN {}", server.format_host()), LoginStepKind::Other));
                steps.extend(user_pass(user, pass));
            }
            FtpProxyType::None => steps.extend(user_pass(user, pass)),
        },
    }

    if !server.account.is_empty() {
        steps.push(LoginStep::new(format!("ACCT {}", server.account), LoginStepKind::Account).optional());
    }
    steps
}

fn proxy_login(steps: &mut Vec<LoginStep>, proxy: &FtpProxy) {
    if !proxy.user.is_empty() {
        steps.extend(user_pass(&proxy.user, &proxy.password));
    }
}

/// One command per template line. Lines that need a value the server or
/// proxy does not have (`%a`, `%s`, `%w`) are left out. Password lines are
/// optional, so a USER answered with 230 skips them.
fn custom_sequence(template: &str, server: &Server, proxy: &FtpProxy) -> Vec<LoginStep> {
    let mut steps = Vec::new();
    for line in template.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if (line.contains("%a") && server.account.is_empty())
            || (line.contains("%s") && proxy.user.is_empty())
            || (line.contains("%w") && proxy.password.is_empty())
        {
            continue;
        }
        let kind = if line.contains("%p") {
            LoginStepKind::Pass
        } else if line.contains("%u") {
            LoginStepKind::User
        } else if line.contains("%a") {
            LoginStepKind::Account
        } else {
            LoginStepKind::Other
        };
        let password = line.contains("%p") || line.contains("%w");
        let mut step = LoginStep::new(expand(line, server, proxy), kind);
        if password {
            step = step.optional().hidden();
        }
        steps.push(step);
    }
    steps
}

fn expand(line: &str, server: &Server, proxy: &FtpProxy) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('h') => out.push_str(&server.format_host()),
            Some('u') => out.push_str(server.effective_user()),
            Some('p') => out.push_str(server.effective_password()),
            Some('a') => out.push_str(&server.account),
            Some('s') => out.push_str(&proxy.user),
            Some('w') => out.push_str(&proxy.password),
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginProgress {
    /// Send the next step.
    Continue,
    LoggedIn,
    /// Reply was 3xx to the last step: the server wants more than we have.
    Incomplete,
    Failed(ReplyCode),
}

/// Walks a login sequence reply by reply.
#[derive(Debug, Clone)]
pub struct LoginSequence {
    steps: VecDeque<LoginStep>,
    current: Option<LoginStep>,
}

impl LoginSequence {
    pub fn new(steps: Vec<LoginStep>) -> Self {
        Self {
            steps: steps.into(),
            current: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Take the next step to send.
    pub fn next_step(&mut self) -> Option<&LoginStep> {
        self.current = self.steps.pop_front();
        self.current.as_ref()
    }

    pub fn current(&self) -> Option<&LoginStep> {
        self.current.as_ref()
    }

    /// Replace the argument of the step about to be sent, used when a
    /// password is supplied interactively.
    pub fn set_current_argument(&mut self, argument: &str) {
        if let Some(step) = self.current.as_mut() {
            let verb = step.command.split(' ').next().unwrap_or_default().to_string();
            step.command = format!("{} {}", verb, argument);
        }
    }

    pub fn on_reply(&mut self, reply: &FtpReply) -> LoginProgress {
        let kind = self.current.as_ref().map(|s| s.kind);
        if !reply.is_success() {
            let mut code = ReplyCode::ERROR;
            if reply.class() == 5 {
                code |= ReplyCode::CRITICALERROR;
                if kind == Some(LoginStepKind::Pass) || (kind == Some(LoginStepKind::User) && reply.code == 530) {
                    code |= ReplyCode::PASSWORDFAILED;
                }
            }
            return LoginProgress::Failed(code);
        }

        if reply.is_completion() {
            while self.steps.front().map_or(false, |s| s.optional) {
                self.steps.pop_front();
            }
        }
        match (self.steps.is_empty(), reply.is_completion()) {
            (false, _) => LoginProgress::Continue,
            (true, true) => LoginProgress::LoggedIn,
            (true, false) => LoginProgress::Incomplete,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xfer_core::server::{LogonType, Protocol};

    fn server() -> Server {
        Server::new(Protocol::Ftp, "ftp.example.com", 2121).with_credentials("bob", "secret")
    }

    fn commands(steps: &[LoginStep]) -> Vec<String> {
        steps.iter().map(|s| s.command.clone()).collect()
    }

    #[test]
    fn plain_sequence() {
        let steps = login_sequence(&server(), None);
        assert_eq!(commands(&steps), vec!["USER bob", "PASS secret"]);
        assert_eq!(steps[1].display(), "PASS ****");
        assert!(steps[1].optional);
    }

    #[test]
    fn anonymous_uses_conventional_credentials() {
        let mut s = server();
        s.logon_type = LogonType::Anonymous;
        let steps = login_sequence(&s, None);
        assert_eq!(steps[0].command, "USER anonymous");
    }

    #[test]
    fn user_at_host_proxy() {
        let proxy = FtpProxy {
            proxy_type: FtpProxyType::UserAtHost,
            host: "proxy".into(),
            port: 21,
            user: "pu".into(),
            password: "pp".into(),
        };
        let mut s = server();
        s.account = "acc".into();
        let steps = login_sequence(&s, Some(&proxy));
        assert_eq!(
            commands(&steps),
            vec![
                "USER pu",
                "PASS pp",
                "USER bob@ftp.example.com:2121",
                "PASS secret",
                "ACCT acc"
            ]
        );
    }

    #[test]
    fn custom_template_expands_and_skips_missing_values() {
        let proxy = FtpProxy {
            proxy_type: FtpProxyType::Custom("USER %s\nPASS %w\nUSER %u@%h\nPASS %p\nACCT %a\nSITE 100%%".into()),
            host: "proxy".into(),
            port: 21,
            user: String::new(),
            password: String::new(),
        };
        let steps = login_sequence(&server(), Some(&proxy));
        assert_eq!(
            commands(&steps),
            vec!["USER bob@ftp.example.com:2121", "PASS secret", "SITE 100%"]
        );
        assert_eq!(steps[1].kind, LoginStepKind::Pass);
        assert!(steps[1].hide_arguments);
        assert!(steps[1].optional);
        assert!(!steps[0].optional);
        assert!(!steps[2].optional);
    }

    #[test]
    fn custom_template_skips_passwords_after_immediate_login() {
        let proxy = FtpProxy {
            proxy_type: FtpProxyType::Custom("USER %s\nPASS %w\nUSER %u\nPASS %p".into()),
            host: "proxy".into(),
            port: 21,
            user: "pu".into(),
            password: "pp".into(),
        };
        let mut seq = LoginSequence::new(login_sequence(&server(), Some(&proxy)));
        assert_eq!(seq.next_step().map(|s| s.command.clone()), Some("USER pu".to_string()));
        assert_eq!(seq.on_reply(&FtpReply::new(230, "230 proxy ok")), LoginProgress::Continue);
        assert_eq!(seq.next_step().map(|s| s.command.clone()), Some("USER bob".to_string()));
        assert_eq!(seq.on_reply(&FtpReply::new(230, "230 in")), LoginProgress::LoggedIn);
        assert!(seq.is_empty());
    }

    #[test]
    fn success_after_user_skips_optional_pass() {
        let mut seq = LoginSequence::new(login_sequence(&server(), None));
        seq.next_step();
        assert_eq!(seq.on_reply(&FtpReply::new(230, "230 ok")), LoginProgress::LoggedIn);
        assert!(seq.is_empty());
    }

    #[test]
    fn intermediate_reply_continues() {
        let mut seq = LoginSequence::new(login_sequence(&server(), None));
        seq.next_step();
        assert_eq!(seq.on_reply(&FtpReply::new(331, "331 pass")), LoginProgress::Continue);
        assert_eq!(seq.next_step().map(|s| s.kind), Some(LoginStepKind::Pass));
        assert_eq!(seq.on_reply(&FtpReply::new(230, "230 in")), LoginProgress::LoggedIn);
    }

    #[test]
    fn rejected_password_flags_password_failure() {
        let mut seq = LoginSequence::new(login_sequence(&server(), None));
        seq.next_step();
        seq.on_reply(&FtpReply::new(331, "331 pass"));
        seq.next_step();
        match seq.on_reply(&FtpReply::new(530, "530 no")) {
            LoginProgress::Failed(code) => {
                assert!(code.contains(ReplyCode::PASSWORDFAILED));
                assert!(code.contains(ReplyCode::CRITICALERROR));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn temporary_failure_is_not_critical() {
        let mut seq = LoginSequence::new(login_sequence(&server(), None));
        seq.next_step();
        assert_eq!(seq.on_reply(&FtpReply::new(421, "421 busy")), LoginProgress::Failed(ReplyCode::ERROR));
    }

    #[test]
    fn pass_wanted_but_sequence_exhausted() {
        let mut seq = LoginSequence::new(vec![LoginStep::new("USER x", LoginStepKind::User)]);
        seq.next_step();
        assert_eq!(seq.on_reply(&FtpReply::new(331, "331 pass")), LoginProgress::Incomplete);
    }
}
