//! SFTP sessions driven through a scripted stand-in for the helper process.
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use xfer::model::command::{FileTransferCommand, ListFlags, TransferSettings};
use xfer::model::server::ServerType;
use xfer::{Command, Engine, EngineContext, EngineOptions, Protocol, ReplyCode, Server, ServerPath};

/// Speaks just enough of the helper protocol: one `/home` directory with
/// `a.txt` in it, and `get` writes "sftp data" to the local path.
const HELPER: &str = r#"#!/bin/sh
printf '0fzSftp started, protocol_version=11\n'
while IFS= read -r line; do
  case "$line" in
    open*) printf '11\n' ;;
    pwd) printf '0/home\n11\n' ;;
    cd*) printf '0/home\n11\n' ;;
    ls) printf '9-rw-r--r-- 1 u g 9 Jan 1 2020 a.txt\n1577836800\na.txt\n11\n' ;;
    mtime*) printf '01577836800\n11\n' ;;
    get*)
      local_path=$(printf '%s' "$line" | sed 's/.*"\([^"]*\)"$/\1/')
      printf 'sftp data' > "$local_path"
      printf '11\n' ;;
    *) printf '2unsupported: %s\n10\n' "$line" ;;
  esac
done
"#;

fn install_helper(dir: &Path) -> PathBuf {
    let path = dir.join("fake-helper.sh");
    std::fs::write(&path, HELPER).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

async fn completion(engine: &mut Engine) -> ReplyCode {
    tokio::time::timeout(Duration::from_secs(15), engine.wait_for_completion())
        .await
        .expect("command did not complete")
        .expect("engine went away")
}

async fn connected(helper: PathBuf) -> Engine {
    let options = EngineOptions {
        sftp_helper: helper,
        ..EngineOptions::default()
    };
    let mut engine = Engine::new(EngineContext::shared(options));
    let mut server = Server::new(Protocol::Sftp, "sftp.example.com", 22);
    server.server_type = ServerType::Unix;
    assert_eq!(engine.execute(Command::Connect { server }), ReplyCode::WOULDBLOCK);
    assert_eq!(completion(&mut engine).await, ReplyCode::OK);
    engine
}

fn home() -> ServerPath {
    ServerPath::parse("/home", ServerType::Unix).unwrap()
}

#[tokio::test]
async fn lists_through_the_helper() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = connected(install_helper(dir.path())).await;
    let list = Command::List {
        path: home(),
        subdir: String::new(),
        flags: ListFlags::empty(),
    };
    assert_eq!(engine.execute(list), ReplyCode::WOULDBLOCK);
    assert_eq!(completion(&mut engine).await, ReplyCode::OK);
    let listing = engine.cache_lookup(&home()).unwrap().unwrap();
    assert_eq!(listing.entries.len(), 1);
    assert_eq!(listing.entries[0].name, "a.txt");
}

#[tokio::test]
async fn downloads_through_the_helper() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = connected(install_helper(dir.path())).await;
    let local = dir.path().join("a.txt");
    let transfer = Command::FileTransfer(FileTransferCommand {
        local_file: local.clone(),
        remote_path: home(),
        remote_file: "a.txt".into(),
        download: true,
        settings: TransferSettings::default(),
    });
    assert_eq!(engine.execute(transfer), ReplyCode::WOULDBLOCK);
    assert_eq!(completion(&mut engine).await, ReplyCode::OK);
    assert_eq!(std::fs::read_to_string(&local).unwrap(), "sftp data");
}

#[tokio::test]
async fn failing_requests_keep_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = connected(install_helper(dir.path())).await;
    let chmod = Command::Chmod {
        path: home(),
        file: "a.txt".into(),
        permission: "644".into(),
    };
    assert_eq!(engine.execute(chmod), ReplyCode::WOULDBLOCK);
    assert_eq!(completion(&mut engine).await, ReplyCode::ERROR);
    assert!(engine.is_connected());
}
