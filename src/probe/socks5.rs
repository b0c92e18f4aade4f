//! SOCKS5 proxy client with optional username/password authentication.
//!
//! The whole probe runs under one global timeout; individual socket
//! operations carry their own deadlines as well.

use std::{future::Future, io::Cursor, pin::Pin};

use byteorder::BigEndian;
use byteorder_pack::PackTo;
use hyper::{header, Uri};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};

use super::{
    dial, get_over_tunnel, rtsp, tls_upgrade, BoxTunnel, HeaderSet, ProbeOutcome, TargetAddr,
};
use crate::{config::ScanConfig, validator};

pub async fn visit(
    cfg: &ScanConfig,
    host: &str,
    port: u16,
    url: &str,
    headers: &HeaderSet,
    validate: bool,
    raw: bool,
) -> ProbeOutcome {
    let t = cfg.timeout();
    let probe = async {
        if url.starts_with("rtsp://") {
            visit_rtsp(cfg, host, port, url).await
        } else {
            visit_inner(cfg, host, port, url, headers, validate, raw, true).await
        }
    };
    match timeout(t, probe).await {
        Ok(outcome) => outcome,
        Err(_) => ProbeOutcome::fail("request timed out, connection aborted"),
    }
}

#[allow(clippy::too_many_arguments)]
fn visit_inner<'a>(
    cfg: &'a ScanConfig,
    host: &'a str,
    port: u16,
    url: &'a str,
    headers: &'a HeaderSet,
    validate: bool,
    raw: bool,
    follow: bool,
) -> Pin<Box<dyn Future<Output = ProbeOutcome> + Send + 'a>> {
    Box::pin(async move {
        let uri: Uri = match url.parse() {
            Ok(uri) => uri,
            Err(e) => return ProbeOutcome::fail(format!("invalid URL {}: {}", url, e)),
        };
        let target = match TargetAddr::from_uri(&uri) {
            Ok(target) => target,
            Err(e) => return ProbeOutcome::fail(format!("invalid URL {}: {}", url, e)),
        };
        let t = cfg.timeout();

        let proxy_addr = format!("{}:{}", host, port);
        let mut stream = match dial(&proxy_addr, t).await {
            Ok(stream) => stream,
            Err(e) => return ProbeOutcome::fail(format!("SOCKS5 proxy connect failed: {}", e)),
        };
        if let Err(e) = open_tunnel(cfg, &mut stream, &target.host, target.port).await {
            return ProbeOutcome::fail(format!("SOCKS5 proxy request failed: {}", e));
        }

        let tunnel: BoxTunnel = if target.is_tls {
            match tls_upgrade(stream, &target.host, t).await {
                Ok(tls) => Box::new(tls),
                Err(e) => return ProbeOutcome::fail(format!("target TLS failed: {}", e)),
            }
        } else {
            Box::new(stream)
        };

        let request_uri: Uri = {
            let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
            match path.parse() {
                Ok(uri) => uri,
                Err(e) => return ProbeOutcome::fail(format!("invalid request path: {}", e)),
            }
        };
        let response =
            match get_over_tunnel(tunnel, request_uri, &target.host_header(), headers, None, t).await
            {
                Ok(response) => response,
                Err(e) => return ProbeOutcome::fail(format!("SOCKS5 proxy request failed: {}", e)),
            };

        let status = response.status.as_u16();
        let upgrade = response
            .headers
            .get(header::UPGRADE)
            .and_then(|v| v.to_str().ok());
        if validator::is_disguised_upgrade(status, upgrade) {
            response.finish();
            return ProbeOutcome::fail("disguised proxy: WebSocket upgrade response");
        }

        if !validate || validator::is_media_url(url) {
            response.finish();
            if status == 200 || status == 302 {
                return ProbeOutcome::ok(format!("status {} (content not validated)", status));
            }
            return ProbeOutcome::fail(format!("status {} (content not validated)", status));
        }

        if follow && (300..400).contains(&status) {
            let location = response
                .headers
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            if let Some(location) = location {
                response.finish();
                return visit_inner(cfg, host, port, &location, headers, validate, raw, false)
                    .await;
            }
        }

        let body = match response.into_body(t).await {
            Ok(body) => body,
            Err(e) => return ProbeOutcome::fail(e.to_string()),
        };
        validator::check_response(status, &body, validate, raw)
    })
}

/// Performs the SOCKS5 method negotiation and CONNECT on an open stream,
/// leaving it as a raw tunnel to `target_host:target_port`.
pub(crate) async fn open_tunnel(
    cfg: &ScanConfig,
    stream: &mut TcpStream,
    target_host: &str,
    target_port: u16,
) -> anyhow::Result<()> {
    stream.write_all(&greeting(cfg.proxy_auth_enabled)).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[0] != 0x05 {
        anyhow::bail!("invalid response version");
    }
    match reply[1] {
        0x00 => {}
        0x02 => {
            let request = auth_request(&cfg.proxy_username, &cfg.proxy_password)?;
            stream.write_all(&request).await?;
            let mut auth_reply = [0u8; 2];
            stream.read_exact(&mut auth_reply).await?;
            if auth_reply[1] != 0x00 {
                anyhow::bail!("authentication rejected");
            }
        }
        0xff => anyhow::bail!("no acceptable authentication method"),
        other => anyhow::bail!("unexpected authentication method {}", other),
    }

    stream
        .write_all(&connect_request(target_host, target_port)?)
        .await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != 0x05 {
        anyhow::bail!("invalid response version");
    }
    if head[1] != 0x00 {
        anyhow::bail!("connect rejected, reply code {}", head[1]);
    }
    // Drain the bound address so the tunnel starts clean.
    let addr_len = match head[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => anyhow::bail!("invalid bound address type {}", other),
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;
    Ok(())
}

fn greeting(with_auth: bool) -> Vec<u8> {
    if with_auth {
        vec![0x05, 0x02, 0x00, 0x02]
    } else {
        vec![0x05, 0x01, 0x00]
    }
}

fn auth_request(username: &str, password: &str) -> anyhow::Result<Vec<u8>> {
    if username.len() > 255 || password.len() > 255 {
        anyhow::bail!("credentials exceed 255 bytes");
    }
    let mut packet = vec![0x01, username.len() as u8];
    packet.extend_from_slice(username.as_bytes());
    packet.push(password.len() as u8);
    packet.extend_from_slice(password.as_bytes());
    Ok(packet)
}

/// CONNECT request with domain addressing; name resolution happens at the
/// proxy, which is the whole point of probing through it.
fn connect_request(host: &str, port: u16) -> anyhow::Result<Vec<u8>> {
    if host.len() > 255 {
        anyhow::bail!("hostname exceeds 255 bytes");
    }
    let data = (0x05u8, 0x01u8, 0x00u8, 0x03u8, host.len() as u8);
    let mut cursor = Cursor::new(Vec::new());
    data.pack_to::<BigEndian, _>(&mut cursor)?;
    let mut packet = cursor.into_inner();
    packet.extend_from_slice(host.as_bytes());
    packet.extend_from_slice(&port.to_be_bytes());
    Ok(packet)
}

async fn visit_rtsp(cfg: &ScanConfig, host: &str, port: u16, url: &str) -> ProbeOutcome {
    let t = cfg.timeout();
    let uri: Uri = match url.parse() {
        Ok(uri) => uri,
        Err(e) => return ProbeOutcome::fail(format!("invalid RTSP URL: {}", e)),
    };
    let target = match TargetAddr::from_uri(&uri) {
        Ok(target) => target,
        Err(e) => return ProbeOutcome::fail(format!("invalid RTSP URL: {}", e)),
    };
    let proxy_addr = format!("{}:{}", host, port);
    let mut stream = match dial(&proxy_addr, t).await {
        Ok(stream) => stream,
        Err(e) => return ProbeOutcome::fail(format!("SOCKS5 proxy connect failed: {}", e)),
    };
    if let Err(e) = open_tunnel(cfg, &mut stream, &target.host, target.port).await {
        return ProbeOutcome::fail(format!("SOCKS5 proxy request failed: {}", e));
    }
    rtsp::probe(stream, url, t).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_offers_auth_method_when_enabled() {
        assert_eq!(greeting(false), vec![0x05, 0x01, 0x00]);
        assert_eq!(greeting(true), vec![0x05, 0x02, 0x00, 0x02]);
    }

    #[test]
    fn auth_request_layout() {
        let packet = auth_request("ab", "c").unwrap();
        assert_eq!(packet, vec![0x01, 2, b'a', b'b', 1, b'c']);
    }

    #[test]
    fn connect_request_uses_domain_addressing() {
        let packet = connect_request("example.com", 8080).unwrap();
        assert_eq!(&packet[..5], &[0x05, 0x01, 0x00, 0x03, 11]);
        assert_eq!(&packet[5..16], b"example.com");
        assert_eq!(&packet[16..], &8080u16.to_be_bytes());
    }

    #[test]
    fn connect_request_rejects_oversized_hostname() {
        let long = "a".repeat(256);
        assert!(connect_request(&long, 80).is_err());
    }
}
