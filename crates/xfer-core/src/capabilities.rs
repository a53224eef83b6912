//! Per-server capability facts learned at runtime.

use crate::server::ServerKey;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    SystCommand,
    FeatCommand,
    Utf8Command,
    ClntCommand,
    MlsdCommand,
    /// Value: the supported fact list.
    MlstFacts,
    SizeCommand,
    MdtmCommand,
    MfmtCommand,
    RestStream,
    EpsvCommand,
    TvfsSupport,
    ListHidden,
    /// Number: offset in minutes.
    TimezoneOffset,
    Resume2GbBug,
    Resume4GbBug,
    TlsResumption,
    AuthTls,
    AuthSsl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CapState {
    #[default]
    Unknown,
    Yes,
    No,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Fact {
    state: CapState,
    text: Option<String>,
    number: Option<i64>,
}

#[derive(Debug, Default)]
pub struct CapabilityCache {
    servers: HashMap<ServerKey, HashMap<Capability, Fact>>,
}

impl CapabilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, server: &ServerKey, cap: Capability) -> CapState {
        self.fact(server, cap).map_or(CapState::Unknown, |f| f.state)
    }

    pub fn get_text(&self, server: &ServerKey, cap: Capability) -> Option<String> {
        self.fact(server, cap).and_then(|f| f.text.clone())
    }

    pub fn get_number(&self, server: &ServerKey, cap: Capability) -> Option<i64> {
        self.fact(server, cap).and_then(|f| f.number)
    }

    fn fact(&self, server: &ServerKey, cap: Capability) -> Option<&Fact> {
        self.servers.get(server)?.get(&cap)
    }

    pub fn set(&mut self, server: &ServerKey, cap: Capability, state: CapState) {
        let fact = self.entry(server, cap);
        fact.state = state;
    }

    pub fn set_text(&mut self, server: &ServerKey, cap: Capability, state: CapState, text: impl Into<String>) {
        let fact = self.entry(server, cap);
        fact.state = state;
        fact.text = Some(text.into());
    }

    pub fn set_number(&mut self, server: &ServerKey, cap: Capability, number: i64) {
        let fact = self.entry(server, cap);
        fact.state = CapState::Yes;
        fact.number = Some(number);
    }

    fn entry(&mut self, server: &ServerKey, cap: Capability) -> &mut Fact {
        self.servers
            .entry(server.clone())
            .or_default()
            .entry(cap)
            .or_default()
    }

    pub fn clear(&mut self, server: &ServerKey) {
        self.servers.remove(server);
    }
}
