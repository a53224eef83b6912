//! Reply bitmask returned by every command.
//!
//! A terminal result is a base code (`OK` or `ERROR`) combined with
//! orthogonal flags. `WOULDBLOCK` is only ever returned on its own.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ReplyCode: u32 {
        const WOULDBLOCK = 0x0001;
        const ERROR = 0x0002;
        const CRITICALERROR = 0x0004 | Self::ERROR.bits();
        const CANCELED = 0x0008 | Self::ERROR.bits();
        const SYNTAXERROR = 0x0010 | Self::ERROR.bits();
        const NOTCONNECTED = 0x0020 | Self::ERROR.bits();
        const DISCONNECTED = 0x0040;
        const INTERNALERROR = 0x0080 | Self::ERROR.bits();
        const BUSY = 0x0100 | Self::ERROR.bits();
        const ALREADYCONNECTED = 0x0200 | Self::ERROR.bits();
        const PASSWORDFAILED = 0x0400;
        const TIMEOUT = 0x0800 | Self::ERROR.bits();
        const NOTSUPPORTED = 0x1000 | Self::ERROR.bits();
        const WRITEFAILED = 0x2000 | Self::ERROR.bits();
        const LINKNOTDIR = 0x4000;
        /// Internal: the state machine should keep going.
        const CONTINUE = 0x8000;
    }
}

impl ReplyCode {
    pub const OK: ReplyCode = ReplyCode::empty();

    pub fn is_ok(self) -> bool {
        self == Self::OK
    }

    pub fn is_error(self) -> bool {
        self.contains(Self::ERROR)
    }

    pub fn would_block(self) -> bool {
        self == Self::WOULDBLOCK
    }

    pub fn is_continue(self) -> bool {
        self == Self::CONTINUE
    }

    pub fn is_disconnected(self) -> bool {
        self.contains(Self::DISCONNECTED)
    }
}

impl Default for ReplyCode {
    fn default() -> Self {
        Self::OK
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_codes_include_error() {
        assert!(ReplyCode::CRITICALERROR.is_error());
        assert!(ReplyCode::CANCELED.is_error());
        assert!(!ReplyCode::DISCONNECTED.is_error());
        assert!(ReplyCode::OK.is_ok());
        assert!(!ReplyCode::OK.is_error());
    }

    #[test]
    fn flags_combine_orthogonally() {
        let code = ReplyCode::ERROR | ReplyCode::DISCONNECTED | ReplyCode::PASSWORDFAILED;
        assert!(code.is_disconnected());
        assert!(code.contains(ReplyCode::PASSWORDFAILED));
        assert!(!code.would_block());
    }
}
