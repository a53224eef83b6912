//! End-to-end FTP sessions against a scripted server on 127.0.0.1.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use xfer::model::command::{FileTransferCommand, ListFlags, TransferSettings};
use xfer::model::server::ServerType;
use xfer::{Command, Engine, EngineContext, EngineOptions, Protocol, ReplyCode, Server, ServerPath};

const LISTING: &str = "-rw-r--r--    1 ftp      ftp            11 Jan 01 12:00 hello.txt\r\n\
                       drwxr-xr-x    2 ftp      ftp          4096 Jan 01 12:00 sub\r\n";

/// What the server does after `RETR`: bytes sent on the data connection,
/// then the final reply.
#[derive(Clone)]
struct Retr {
    payload: Vec<u8>,
    final_reply: &'static str,
}

#[derive(Clone)]
struct Script {
    files: HashMap<String, Retr>,
}

impl Script {
    fn serving(name: &str, payload: &[u8], final_reply: &'static str) -> Self {
        let mut files = HashMap::new();
        files.insert(
            name.to_string(),
            Retr {
                payload: payload.to_vec(),
                final_reply,
            },
        );
        Self { files }
    }
}

async fn serve(listener: TcpListener, script: Script) {
    while let Ok((stream, _)) = listener.accept().await {
        let script = script.clone();
        tokio::spawn(async move {
            let _ = session(stream, script).await;
        });
    }
}

async fn send(writer: &mut (impl AsyncWriteExt + Unpin), line: &str) -> std::io::Result<()> {
    writer.write_all(format!("{}\r\n", line).as_bytes()).await
}

async fn session(stream: TcpStream, script: Script) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut cwd = "/".to_string();
    let mut passive: Option<TcpListener> = None;
    send(&mut writer, "220 Scripted server ready").await?;
    while let Some(line) = lines.next_line().await? {
        let (verb, arg) = match line.split_once(' ') {
            Some((v, a)) => (v.to_uppercase(), a.trim().to_string()),
            None => (line.trim().to_uppercase(), String::new()),
        };
        match verb.as_str() {
            "USER" => send(&mut writer, "331 Password required").await?,
            "PASS" => send(&mut writer, "230 Logged in").await?,
            "SYST" => send(&mut writer, "215 UNIX Type: L8").await?,
            "FEAT" => send(&mut writer, "211-Features:\r\n SIZE\r\n211 End").await?,
            "PWD" => send(&mut writer, &format!("257 \"{}\" is the current directory", cwd)).await?,
            "CWD" => {
                cwd = if arg.starts_with('/') {
                    arg
                } else {
                    format!("{}/{}", cwd.trim_end_matches('/'), arg)
                };
                send(&mut writer, "250 Directory changed").await?
            }
            "TYPE" => send(&mut writer, "200 Type set").await?,
            "SIZE" => {
                let name = arg.rsplit('/').next().unwrap_or_default();
                match script.files.get(name) {
                    Some(retr) => send(&mut writer, &format!("213 {}", retr.payload.len())).await?,
                    None => send(&mut writer, "550 No such file").await?,
                }
            }
            "PASV" => {
                let listener = TcpListener::bind("127.0.0.1:0").await?;
                let port = listener.local_addr()?.port();
                passive = Some(listener);
                let reply = format!(
                    "227 Entering Passive Mode (127,0,0,1,{},{})",
                    port >> 8,
                    port & 0xff
                );
                send(&mut writer, &reply).await?
            }
            "LIST" | "NLST" => {
                let Some(listener) = passive.take() else {
                    send(&mut writer, "425 Use PASV first").await?;
                    continue;
                };
                send(&mut writer, "150 Here comes the listing").await?;
                let (mut data, _) = listener.accept().await?;
                data.write_all(LISTING.as_bytes()).await?;
                data.shutdown().await?;
                drop(data);
                send(&mut writer, "226 Transfer complete").await?
            }
            "RETR" => {
                let name = arg.rsplit('/').next().unwrap_or_default().to_string();
                let Some(retr) = script.files.get(&name).cloned() else {
                    send(&mut writer, "550 No such file").await?;
                    continue;
                };
                let Some(listener) = passive.take() else {
                    send(&mut writer, "425 Use PASV first").await?;
                    continue;
                };
                send(&mut writer, "150 Opening data connection").await?;
                let (mut data, _) = listener.accept().await?;
                data.write_all(&retr.payload).await?;
                data.shutdown().await?;
                drop(data);
                // Let the client drain the data connection first.
                tokio::time::sleep(Duration::from_millis(100)).await;
                send(&mut writer, retr.final_reply).await?
            }
            "QUIT" => {
                send(&mut writer, "221 Goodbye").await?;
                break;
            }
            _ => send(&mut writer, "502 Command not implemented").await?,
        }
    }
    Ok(())
}

async fn start(script: Script) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(serve(listener, script));
    port
}

async fn completion(engine: &mut Engine) -> ReplyCode {
    tokio::time::timeout(Duration::from_secs(15), engine.wait_for_completion())
        .await
        .expect("command did not complete")
        .expect("engine went away")
}

async fn connected(port: u16) -> Engine {
    let mut engine = Engine::new(Arc::new(EngineContext::new(EngineOptions::default())));
    let mut server = Server::new(Protocol::InsecureFtp, "127.0.0.1", port);
    server.server_type = ServerType::Unix;
    assert_eq!(engine.execute(Command::Connect { server }), ReplyCode::WOULDBLOCK);
    assert_eq!(completion(&mut engine).await, ReplyCode::OK);
    assert!(engine.is_connected());
    engine
}

fn pub_dir() -> ServerPath {
    ServerPath::parse("/pub", ServerType::Unix).unwrap()
}

fn download(local: &Path, name: &str) -> Command {
    Command::FileTransfer(FileTransferCommand {
        local_file: local.to_path_buf(),
        remote_path: pub_dir(),
        remote_file: name.to_string(),
        download: true,
        settings: TransferSettings::default(),
    })
}

#[tokio::test]
async fn listing_is_cached() {
    let port = start(Script::serving("hello.txt", b"hello world", "226 Done")).await;
    let mut engine = connected(port).await;
    let list = Command::List {
        path: pub_dir(),
        subdir: String::new(),
        flags: ListFlags::empty(),
    };
    assert_eq!(engine.execute(list), ReplyCode::WOULDBLOCK);
    assert_eq!(completion(&mut engine).await, ReplyCode::OK);

    let listing = engine.cache_lookup(&pub_dir()).unwrap().unwrap();
    let names: Vec<_> = listing.entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["hello.txt", "sub"]);
    assert!(listing.entries[1].is_dir());
}

#[tokio::test]
async fn download_writes_the_file() {
    let port = start(Script::serving("hello.txt", b"hello world", "226 Transfer complete")).await;
    let mut engine = connected(port).await;
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("hello.txt");
    assert_eq!(engine.execute(download(&local, "hello.txt")), ReplyCode::WOULDBLOCK);
    assert_eq!(completion(&mut engine).await, ReplyCode::OK);
    assert_eq!(std::fs::read(&local).unwrap(), b"hello world");
}

#[tokio::test]
async fn failed_fresh_download_leaves_no_empty_file() {
    let port = start(Script::serving("broken.bin", b"", "451 Read error on server")).await;
    let mut engine = connected(port).await;
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("broken.bin");
    assert_eq!(engine.execute(download(&local, "broken.bin")), ReplyCode::WOULDBLOCK);
    let code = completion(&mut engine).await;
    assert!(code.is_error());
    assert!(!local.exists());
}

#[tokio::test]
async fn failed_download_keeps_partial_data() {
    let port = start(Script::serving("big.bin", b"partial", "451 Connection lost")).await;
    let mut engine = connected(port).await;
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("big.bin");
    assert_eq!(engine.execute(download(&local, "big.bin")), ReplyCode::WOULDBLOCK);
    let code = completion(&mut engine).await;
    assert!(code.is_error());
    assert_eq!(std::fs::read(&local).unwrap(), b"partial");
}

#[tokio::test]
async fn missing_remote_file_fails_cleanly() {
    let port = start(Script::serving("hello.txt", b"hello world", "226 Done")).await;
    let mut engine = connected(port).await;
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("nothing.txt");
    assert_eq!(engine.execute(download(&local, "nothing.txt")), ReplyCode::WOULDBLOCK);
    let code = completion(&mut engine).await;
    assert!(code.is_error());
    assert!(!local.exists());
    assert!(engine.is_connected());
}
