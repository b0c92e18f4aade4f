//! SOCKS4/4A proxy client.
//!
//! Works the raw socket end to end: 9-byte CONNECT with the 0.0.0.1 marker
//! for domain addressing, fixed 8-byte reply, optional TLS layering, then a
//! hand-written GET. Unlike the other clients this one never follows a 302
//! itself; the redirect target is handed back to the retry controller.

use std::io::Cursor;

use byteorder::BigEndian;
use byteorder_pack::PackTo;
use hyper::Uri;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};

use super::{
    dial, header_value, parse_head, read_head, rtsp, tls_upgrade, BoxTunnel, HeaderSet,
    ProbeOutcome, TargetAddr,
};
use crate::{config::ScanConfig, validator};

/// The grant code a SOCKS4 server answers with on success.
const REPLY_GRANTED: u8 = 0x5a;

#[allow(clippy::too_many_arguments)]
pub async fn visit(
    cfg: &ScanConfig,
    host: &str,
    port: u16,
    url: &str,
    headers: &HeaderSet,
    validate: bool,
    raw: bool,
) -> ProbeOutcome {
    if url.starts_with("rtsp://") {
        return visit_rtsp(cfg, host, port, url).await;
    }

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
        Err(e) => return ProbeOutcome::fail(format!("SOCKS4A proxy connect failed: {}", e)),
    };
    if let Err(e) = open_tunnel(&mut stream, &target.host, target.port, t).await {
        return ProbeOutcome::fail(e.to_string());
    }

    let mut tunnel: BoxTunnel = if target.is_tls {
        match tls_upgrade(stream, &target.host, t).await {
            Ok(tls) => Box::new(tls),
            Err(e) => return ProbeOutcome::fail(format!("TLS handshake failed: {}", e)),
        }
    } else {
        Box::new(stream)
    };

    // Hand-written origin-form GET; Connection: close keeps the body
    // readable to EOF without HTTP framing machinery.
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut request = format!("GET {} HTTP/1.1\r\nHost: {}\r\n", path, target.host_header());
    for (name, values) in headers {
        for value in values {
            request.push_str(&format!("{}: {}\r\n", name, value));
        }
    }
    request.push_str("Connection: close\r\n\r\n");

    match timeout(t, tunnel.write_all(request.as_bytes())).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return ProbeOutcome::fail(format!("failed to write request: {}", e)),
        Err(_) => return ProbeOutcome::fail("timed out writing request"),
    }

    let head_buf = match read_head(&mut tunnel, t).await {
        Ok(buf) => buf,
        Err(e) => return ProbeOutcome::fail(format!("failed to read response: {}", e)),
    };
    let head = match parse_head(&head_buf) {
        Ok(head) => head,
        Err(e) => return ProbeOutcome::fail(format!("failed to parse response: {}", e)),
    };
    let status = head.code;

    if !validate || validator::is_media_url(url) {
        if status == 200 || status == 302 {
            return ProbeOutcome::ok(format!("status {} (content not validated)", status));
        }
        return ProbeOutcome::fail(format!("status {} (content not validated)", status));
    }

    // 302 goes back to the caller; the retry controller owns the loop.
    if status == 302 {
        if let Some(location) = header_value(&head.headers, "location") {
            return ProbeOutcome::redirect(
                format!("status 302, redirected to {}", location),
                location,
            );
        }
    }

    let mut body = head_buf[head.body_offset..].to_vec();
    let content_length = header_value(&head.headers, "content-length")
        .and_then(|v| v.trim().parse::<usize>().ok());
    let read_result = match content_length {
        Some(length) if body.len() >= length => {
            body.truncate(length);
            Ok(())
        }
        Some(length) => {
            let mut rest = vec![0u8; length - body.len()];
            match timeout(t, tunnel.read_exact(&mut rest)).await {
                Ok(Ok(_)) => {
                    body.extend_from_slice(&rest);
                    Ok(())
                }
                Ok(Err(e)) => Err(anyhow::anyhow!(e)),
                Err(_) => Err(anyhow::anyhow!("timed out reading response body")),
            }
        }
        None => match timeout(t, tunnel.read_to_end(&mut body)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(anyhow::anyhow!(e)),
            Err(_) => Err(anyhow::anyhow!("timed out reading response body")),
        },
    };
    if let Err(e) = read_result {
        return ProbeOutcome::fail(format!("failed to read response body: {}", e));
    }

    validator::check_response(status, &body, validate, raw)
}

/// SOCKS4A handshake on an open stream: send the CONNECT request, read the
/// 8-byte reply, require the grant code.
pub(crate) async fn open_tunnel(
    stream: &mut TcpStream,
    target_host: &str,
    target_port: u16,
    t: std::time::Duration,
) -> anyhow::Result<()> {
    let request = connect_request(target_host, target_port)?;
    match timeout(t, stream.write_all(&request)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => anyhow::bail!("failed to send SOCKS4A request: {}", e),
        Err(_) => anyhow::bail!("timed out sending SOCKS4A request"),
    }

    let mut reply = [0u8; 8];
    match timeout(t, stream.read_exact(&mut reply)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => anyhow::bail!("failed to read SOCKS4A reply: {}", e),
        Err(_) => anyhow::bail!("timed out reading SOCKS4A reply"),
    }
    check_reply(&reply)
}

/// CONNECT request: command 0x04/0x01, big-endian port, the 0.0.0.1 address
/// marking domain-based addressing, empty user id, hostname, NUL.
fn connect_request(host: &str, port: u16) -> anyhow::Result<Vec<u8>> {
    let data = (0x04u8, 0x01u8, port, [0u8, 0, 0, 1], 0x00u8);
    let mut cursor = Cursor::new(Vec::new());
    data.pack_to::<BigEndian, _>(&mut cursor)?;
    let mut packet = cursor.into_inner();
    packet.extend_from_slice(host.as_bytes());
    packet.push(0x00);
    Ok(packet)
}

fn check_reply(reply: &[u8; 8]) -> anyhow::Result<()> {
    if reply[1] != REPLY_GRANTED {
        anyhow::bail!("SOCKS4A connect failed, reply code: {}", reply[1]);
    }
    Ok(())
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
        Err(e) => return ProbeOutcome::fail(format!("SOCKS4A proxy connect failed: {}", e)),
    };
    if let Err(e) = open_tunnel(&mut stream, &target.host, target.port, t).await {
        return ProbeOutcome::fail(e.to_string());
    }
    rtsp::probe(stream, url, t).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_request_layout() {
        let packet = connect_request("example.com", 554).unwrap();
        assert_eq!(packet[0], 0x04);
        assert_eq!(packet[1], 0x01);
        assert_eq!(&packet[2..4], &554u16.to_be_bytes());
        // 0.0.0.1 marker, then the empty user id terminator.
        assert_eq!(&packet[4..8], &[0, 0, 0, 1]);
        assert_eq!(packet[8], 0x00);
        assert_eq!(&packet[9..20], b"example.com");
        assert_eq!(*packet.last().unwrap(), 0x00);
        assert_eq!(packet.len(), 9 + "example.com".len() + 1);
    }

    #[test]
    fn grant_code_accepted() {
        assert!(check_reply(&[0, 0x5a, 0, 0, 0, 0, 0, 0]).is_ok());
    }

    #[test]
    fn other_reply_codes_fail_with_number() {
        let err = check_reply(&[0, 0x5b, 0, 0, 0, 0, 0, 0]).unwrap_err();
        assert!(err.to_string().contains("91"));
    }
}
