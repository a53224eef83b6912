//! FEAT / SYST interpretation (RFC 2389).

use crate::ftp::reply::FtpReply;
use xfer_core::capabilities::{CapState, Capability, CapabilityCache};
use xfer_core::server::{ServerKey, ServerType};

/// What a FEAT reply advertised.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureSet {
    pub utf8: bool,
    pub clnt: bool,
    pub mlsd: bool,
    /// Raw MLST fact list, `*` marks enabled facts.
    pub mlst_facts: Option<String>,
    pub size: bool,
    pub mdtm: bool,
    pub mfmt: bool,
    pub rest_stream: bool,
    pub epsv: bool,
    pub tvfs: bool,
    pub auth_tls: bool,
    pub auth_ssl: bool,
}

impl FeatureSet {
    pub fn parse(reply: &FtpReply) -> Self {
        let mut set = FeatureSet::default();
        if !reply.is_completion() {
            return set;
        }
        let body = if reply.lines.len() > 2 {
            &reply.lines[1..reply.lines.len() - 1]
        } else {
            &reply.lines[..0]
        };
        for line in body {
            let line = line.trim();
            let (name, args) = match line.split_once(' ') {
                Some((n, a)) => (n.to_uppercase(), a.trim()),
                None => (line.to_uppercase(), ""),
            };
            match name.as_str() {
                "UTF8" => set.utf8 = true,
                "CLNT" => set.clnt = true,
                "MLST" | "MLSD" => {
                    set.mlsd = true;
                    if !args.is_empty() {
                        set.mlst_facts = Some(args.to_string());
                    }
                }
                "SIZE" => set.size = true,
                "MDTM" => set.mdtm = true,
                "MFMT" => set.mfmt = true,
                "REST" if args.eq_ignore_ascii_case("STREAM") => set.rest_stream = true,
                "EPSV" => set.epsv = true,
                "TVFS" => set.tvfs = true,
                "AUTH" => {
                    for mech in args.split(|c| c == ';' || c == ' ').map(str::trim) {
                        match mech.to_uppercase().as_str() {
                            "TLS" | "TLS-C" => set.auth_tls = true,
                            "SSL" => set.auth_ssl = true,
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }
        set
    }

    /// Record the result for `server`. Features a FEAT reply did not list are
    /// recorded as absent; a failed FEAT leaves them unknown.
    pub fn store(&self, caps: &mut CapabilityCache, server: &ServerKey, feat_ok: bool) {
        if !feat_ok {
            caps.set(server, Capability::FeatCommand, CapState::No);
            return;
        }
        let state = |b: bool| if b { CapState::Yes } else { CapState::No };
        caps.set(server, Capability::FeatCommand, CapState::Yes);
        caps.set(server, Capability::Utf8Command, state(self.utf8));
        caps.set(server, Capability::ClntCommand, state(self.clnt));
        caps.set(server, Capability::MlsdCommand, state(self.mlsd));
        match &self.mlst_facts {
            Some(facts) => caps.set_text(server, Capability::MlstFacts, CapState::Yes, facts.clone()),
            None => caps.set(server, Capability::MlstFacts, CapState::No),
        }
        caps.set(server, Capability::SizeCommand, state(self.size));
        caps.set(server, Capability::MdtmCommand, state(self.mdtm));
        caps.set(server, Capability::MfmtCommand, state(self.mfmt));
        caps.set(server, Capability::RestStream, state(self.rest_stream));
        caps.set(server, Capability::EpsvCommand, state(self.epsv));
        caps.set(server, Capability::TvfsSupport, state(self.tvfs));
        if self.auth_tls {
            caps.set(server, Capability::AuthTls, CapState::Yes);
        }
        if self.auth_ssl {
            caps.set(server, Capability::AuthSsl, CapState::Yes);
        }
    }
}

/// Directory dialect implied by a SYST reply, if it is not Unix-like.
pub fn server_type_from_syst(reply: &str) -> Option<ServerType> {
    let upper = reply.to_uppercase();
    let text = upper.get(4..).unwrap_or(&upper);
    if text.starts_with("MVS") || text.contains("OS/390") {
        Some(ServerType::Mvs)
    } else if text.starts_with("VMS") || text.contains("OPENVMS") {
        Some(ServerType::Vms)
    } else if text.contains("Z/VM") {
        Some(ServerType::Zvm)
    } else if text.starts_with("NONSTOP") || text.contains("HP NONSTOP") {
        Some(ServerType::HpNonstop)
    } else if text.contains("VXWORKS") {
        Some(ServerType::VxWorks)
    } else {
        None
    }
}

/// `OPTS MLST` command selecting the wanted facts the server supports, or
/// `None` if the server already has exactly that selection enabled.
pub fn mlst_opts(server_facts: &str, wanted: &str) -> Option<String> {
    let wanted: Vec<String> = wanted
        .split(';')
        .map(|f| f.trim().to_lowercase())
        .filter(|f| !f.is_empty())
        .collect();
    let mut supported = Vec::new();
    let mut enabled = Vec::new();
    for fact in server_facts.split(';').map(str::trim).filter(|f| !f.is_empty()) {
        let on = fact.ends_with('*');
        let name = fact.trim_end_matches('*').to_lowercase();
        if on {
            enabled.push(name.clone());
        }
        supported.push(name);
    }

    let selection: Vec<&String> = wanted.iter().filter(|w| supported.contains(w)).collect();
    if selection.is_empty() {
        return None;
    }
    let same = selection.len() == enabled.len() && selection.iter().all(|s| enabled.contains(s));
    if same {
        return None;
    }
    let mut cmd = String::from("OPTS MLST ");
    for fact in selection {
        cmd.push_str(fact);
        cmd.push(';');
    }
    Some(cmd)
}
