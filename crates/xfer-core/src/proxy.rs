//! Generic proxy handshakes run on a freshly connected stream before the
//! protocol greeting: HTTP CONNECT, SOCKS4 and SOCKS5.

use crate::error::{EngineError, EngineResult};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ProxyType {
    #[default]
    None,
    Http,
    Socks4,
    Socks5,
}

impl ProxyType {
    /// Keyword used by the SFTP helper's `proxy` request.
    pub fn keyword(self) -> &'static str {
        match self {
            ProxyType::None => "NONE",
            ProxyType::Http => "HTTP",
            ProxyType::Socks4 => "SOCKS4",
            ProxyType::Socks5 => "SOCKS5",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    #[serde(default)]
    pub proxy_type: ProxyType,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

impl ProxyConfig {
    pub fn is_enabled(&self) -> bool {
        self.proxy_type != ProxyType::None && !self.host.is_empty()
    }
}

/// Longest HTTP CONNECT response header we accept.
const MAX_HTTP_HEADER: usize = 16 * 1024;

/// Ask the proxy on `stream` to connect us through to `host:port`.
pub async fn handshake<S>(stream: &mut S, proxy: &ProxyConfig, host: &str, port: u16) -> EngineResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match proxy.proxy_type {
        ProxyType::None => Ok(()),
        ProxyType::Http => http_connect(stream, proxy, host, port).await,
        ProxyType::Socks4 => socks4_connect(stream, proxy, host, port).await,
        ProxyType::Socks5 => socks5_connect(stream, proxy, host, port).await,
    }
}

// ─── HTTP CONNECT ────────────────────────────────────────────────────

async fn http_connect<S>(stream: &mut S, proxy: &ProxyConfig, host: &str, port: u16) -> EngineResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let target = if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    };
    let mut request = format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\nUser-Agent: xfer\r\n", target);
    if !proxy.user.is_empty() {
        let auth = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", proxy.user, proxy.password));
        request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", auth));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    // Byte-wise so nothing past the header is consumed.
    let mut header = Vec::new();
    while !header.ends_with(b"\r\n\r\n") {
        if header.len() >= MAX_HTTP_HEADER {
            return Err(EngineError::proxy_failed("HTTP proxy response header too long"));
        }
        let b = stream.read_u8().await?;
        header.push(b);
    }
    let text = String::from_utf8_lossy(&header);
    let status_line = text.lines().next().unwrap_or_default();
    let code = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|c| c.parse::<u16>().ok())
        .ok_or_else(|| EngineError::proxy_failed(format!("Malformed HTTP proxy reply: {}", status_line)))?;
    if !(200..300).contains(&code) {
        return Err(EngineError::proxy_failed(format!("Proxy CONNECT failed: {}", status_line)).with_code(code));
    }
    Ok(())
}

// ─── SOCKS4 ──────────────────────────────────────────────────────────

async fn socks4_connect<S>(stream: &mut S, proxy: &ProxyConfig, host: &str, port: u16) -> EngineResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ip = match host.parse::<std::net::IpAddr>() {
        Ok(ip) => ip,
        Err(_) => tokio::net::lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| EngineError::proxy_failed(format!("Could not resolve {}", host)))?
            .ip(),
    };
    let std::net::IpAddr::V4(ipv4) = ip else {
        return Err(EngineError::proxy_failed("SOCKS4 does not support IPv6"));
    };

    let mut request = vec![0x04, 0x01];
    request.extend_from_slice(&port.to_be_bytes());
    request.extend_from_slice(&ipv4.octets());
    request.extend_from_slice(proxy.user.as_bytes());
    request.push(0x00);
    stream.write_all(&request).await?;

    let mut response = [0u8; 8];
    stream.read_exact(&mut response).await?;
    if response[1] != 0x5A {
        return Err(EngineError::proxy_failed(format!(
            "SOCKS4 connection failed: reply code {}",
            response[1]
        )));
    }
    Ok(())
}

// ─── SOCKS5 ──────────────────────────────────────────────────────────

async fn socks5_connect<S>(stream: &mut S, proxy: &ProxyConfig, host: &str, port: u16) -> EngineResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut greeting = vec![0x05];
    if proxy.user.is_empty() {
        greeting.extend_from_slice(&[0x01, 0x00]);
    } else {
        greeting.extend_from_slice(&[0x02, 0x00, 0x02]);
    }
    stream.write_all(&greeting).await?;

    let mut response = [0u8; 2];
    stream.read_exact(&mut response).await?;
    if response[0] != 0x05 {
        return Err(EngineError::proxy_failed("Invalid SOCKS5 response"));
    }
    match response[1] {
        0x00 => {}
        0x02 => {
            let user = proxy.user.as_bytes();
            let pass = proxy.password.as_bytes();
            if user.len() > 255 || pass.len() > 255 {
                return Err(EngineError::proxy_failed("SOCKS5 credentials too long"));
            }
            let mut auth = vec![0x01, user.len() as u8];
            auth.extend_from_slice(user);
            auth.push(pass.len() as u8);
            auth.extend_from_slice(pass);
            stream.write_all(&auth).await?;
            let mut auth_response = [0u8; 2];
            stream.read_exact(&mut auth_response).await?;
            if auth_response[1] != 0x00 {
                return Err(EngineError::proxy_failed("SOCKS5 authentication failed"));
            }
        }
        0xFF => return Err(EngineError::proxy_failed("No acceptable SOCKS5 authentication methods")),
        other => {
            return Err(EngineError::proxy_failed(format!("Unsupported SOCKS5 auth method: {}", other)))
        }
    }

    let mut request = vec![0x05, 0x01, 0x00];
    match host.parse::<std::net::IpAddr>() {
        Ok(std::net::IpAddr::V4(ip)) => {
            request.push(0x01);
            request.extend_from_slice(&ip.octets());
        }
        Ok(std::net::IpAddr::V6(ip)) => {
            request.push(0x04);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            if host.len() > 255 {
                return Err(EngineError::proxy_failed("Host name too long for SOCKS5"));
            }
            request.push(0x03);
            request.push(host.len() as u8);
            request.extend_from_slice(host.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[1] != 0x00 {
        return Err(EngineError::proxy_failed(format!("SOCKS5 CONNECT failed: reply code {}", head[1])));
    }
    let skip = match head[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => stream.read_u8().await? as usize,
        other => return Err(EngineError::proxy_failed(format!("Unknown address type: {}", other))),
    };
    let mut rest = vec![0u8; skip + 2];
    stream.read_exact(&mut rest).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn cfg(t: ProxyType, user: &str) -> ProxyConfig {
        ProxyConfig {
            proxy_type: t,
            host: "proxy".into(),
            port: 1080,
            user: user.into(),
            password: "pw".into(),
        }
    }

    #[tokio::test]
    async fn http_connect_stops_at_header_end() {
        let (mut client, mut server) = duplex(4096);
        let srv = tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let n = server.read(&mut buf).await.unwrap();
            let req = String::from_utf8_lossy(&buf[..n]).to_string();
            server
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n220 hello\r\n")
                .await
                .unwrap();
            req
        });
        handshake(&mut client, &cfg(ProxyType::Http, "u"), "ftp.example.com", 21)
            .await
            .unwrap();
        let req = srv.await.unwrap();
        assert!(req.starts_with("CONNECT ftp.example.com:21 HTTP/1.1\r\n"));
        assert!(req.contains("Proxy-Authorization: Basic dTpwdw==\r\n"));
        let mut rest = [0u8; 11];
        client.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"220 hello\r\n");
    }

    #[tokio::test]
    async fn http_connect_rejection() {
        let (mut client, mut server) = duplex(4096);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let _ = server.read(&mut buf).await;
            let _ = server.write_all(b"HTTP/1.1 407 Auth required\r\n\r\n").await;
        });
        let err = handshake(&mut client, &cfg(ProxyType::Http, ""), "h", 21).await.unwrap_err();
        assert_eq!(err.code, Some(407));
    }

    #[tokio::test]
    async fn socks5_with_password() {
        let (mut client, mut server) = duplex(4096);
        let srv = tokio::spawn(async move {
            let mut greet = [0u8; 4];
            server.read_exact(&mut greet).await.unwrap();
            assert_eq!(greet, [5, 2, 0, 2]);
            server.write_all(&[5, 2]).await.unwrap();
            let mut auth = [0u8; 6];
            server.read_exact(&mut auth).await.unwrap();
            assert_eq!(&auth, &[1, 1, b'u', 2, b'p', b'w']);
            server.write_all(&[1, 0]).await.unwrap();
            let mut req = [0u8; 4 + 1 + 4 + 2];
            server.read_exact(&mut req).await.unwrap();
            assert_eq!(req[3], 0x03);
            assert_eq!(&req[5..9], b"host");
            server.write_all(&[5, 0, 0, 1, 10, 0, 0, 1, 0, 21]).await.unwrap();
        });
        handshake(&mut client, &cfg(ProxyType::Socks5, "u"), "host", 21).await.unwrap();
        srv.await.unwrap();
    }

    #[tokio::test]
    async fn socks4_reply_code_checked() {
        let mut mock = tokio_test::io::Builder::new()
            .write(&[4, 1, 0, 21, 127, 0, 0, 1, 0])
            .read(&[0, 0x5B, 0, 0, 0, 0, 0, 0])
            .build();
        let err = handshake(&mut mock, &cfg(ProxyType::Socks4, ""), "127.0.0.1", 21)
            .await
            .unwrap_err();
        assert!(err.message.contains("91"));
    }

    #[tokio::test]
    async fn socks4_granted() {
        let mut mock = tokio_test::io::Builder::new()
            .write(&[4, 1, 0, 21, 10, 1, 2, 3, b'u', 0])
            .read(&[0, 0x5A, 0, 0, 0, 0, 0, 0])
            .build();
        handshake(&mut mock, &cfg(ProxyType::Socks4, "u"), "10.1.2.3", 21)
            .await
            .unwrap();
    }
}
