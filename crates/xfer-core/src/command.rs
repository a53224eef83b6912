//! Commands accepted by an engine.

use crate::path::ServerPath;
use crate::server::Server;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
    pub struct ListFlags: u8 {
        /// Skip the cache and always ask the server.
        const REFRESH = 0x01;
        /// Accept an outdated cache entry rather than listing.
        const AVOID = 0x02;
        /// If the directory cannot be entered, list the current one.
        const FALLBACK_CURRENT = 0x04;
        /// The target is a link; a non-directory reply is `LINKNOTDIR`.
        const LINK = 0x08;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandId {
    Connect,
    Disconnect,
    List,
    Transfer,
    Mkdir,
    Delete,
    RemoveDir,
    Rename,
    Chmod,
    Raw,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransferSettings {
    pub binary: bool,
    /// Resume requested up front rather than via the file-exists prompt.
    #[serde(default)]
    pub resume: bool,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self { binary: true, resume: false }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileTransferCommand {
    pub local_file: PathBuf,
    pub remote_path: ServerPath,
    pub remote_file: String,
    pub download: bool,
    #[serde(default)]
    pub settings: TransferSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Command {
    Connect {
        server: Server,
    },
    Disconnect,
    List {
        path: ServerPath,
        #[serde(default)]
        subdir: String,
        #[serde(default)]
        flags: ListFlags,
    },
    FileTransfer(FileTransferCommand),
    Mkdir {
        path: ServerPath,
    },
    Delete {
        path: ServerPath,
        files: Vec<String>,
    },
    RemoveDir {
        path: ServerPath,
        subdir: String,
    },
    Rename {
        from_path: ServerPath,
        from_file: String,
        to_path: ServerPath,
        to_file: String,
    },
    Chmod {
        path: ServerPath,
        file: String,
        permission: String,
    },
    Raw {
        command: String,
    },
}

impl Command {
    pub fn id(&self) -> CommandId {
        match self {
            Command::Connect { .. } => CommandId::Connect,
            Command::Disconnect => CommandId::Disconnect,
            Command::List { .. } => CommandId::List,
            Command::FileTransfer(_) => CommandId::Transfer,
            Command::Mkdir { .. } => CommandId::Mkdir,
            Command::Delete { .. } => CommandId::Delete,
            Command::RemoveDir { .. } => CommandId::RemoveDir,
            Command::Rename { .. } => CommandId::Rename,
            Command::Chmod { .. } => CommandId::Chmod,
            Command::Raw { .. } => CommandId::Raw,
        }
    }

    pub fn requires_connection(&self) -> bool {
        !matches!(self, Command::Connect { .. })
    }

    /// Cheap argument validation done before anything is sent.
    pub fn is_valid(&self) -> bool {
        match self {
            Command::Connect { server } => !server.host.is_empty() && server.port != 0,
            Command::Disconnect => true,
            Command::List { path, subdir, .. } => !path.is_empty() || subdir.is_empty(),
            Command::FileTransfer(t) => {
                !t.local_file.as_os_str().is_empty() && !t.remote_file.is_empty() && !t.remote_path.is_empty()
            }
            Command::Mkdir { path } => !path.is_empty() && path.has_parent(),
            Command::Delete { path, files } => {
                !path.is_empty() && !files.is_empty() && files.iter().all(|f| !f.is_empty())
            }
            Command::RemoveDir { path, subdir } => !path.is_empty() && !subdir.is_empty(),
            Command::Rename { from_path, from_file, to_path, to_file } => {
                !from_path.is_empty() && !from_file.is_empty() && !to_path.is_empty() && !to_file.is_empty()
            }
            Command::Chmod { path, file, permission } => {
                !path.is_empty() && !file.is_empty() && !permission.is_empty()
            }
            Command::Raw { command } => !command.trim().is_empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{Protocol, ServerType};

    #[test]
    fn validation() {
        let root = ServerPath::root(ServerType::Unix);
        assert!(!Command::Mkdir { path: root.clone() }.is_valid());
        assert!(Command::Mkdir { path: root.with_segment("a") }.is_valid());
        assert!(!Command::Raw { command: "  ".into() }.is_valid());
        assert!(!Command::Connect { server: Server::new(Protocol::Ftp, "", 21) }.is_valid());
        assert!(Command::List { path: ServerPath::empty(), subdir: String::new(), flags: ListFlags::empty() }.is_valid());
        assert!(!Command::Delete { path: root, files: vec![] }.is_valid());
    }

    #[test]
    fn only_connect_works_offline() {
        assert!(!Command::Connect { server: Server::new(Protocol::Ftp, "h", 21) }.requires_connection());
        assert!(Command::Disconnect.requires_connection());
        assert_eq!(Command::Raw { command: "NOOP".into() }.id(), CommandId::Raw);
    }
}
