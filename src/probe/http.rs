//! HTTP and HTTPS CONNECT proxy client.
//!
//! Plain http targets are fetched with an absolute-form GET sent straight to
//! the proxy; https targets get a CONNECT tunnel plus TLS first. When the
//! upstream gateway override is active the CONNECT request is written by
//! hand so its custom headers can be injected.

use std::{collections::BTreeMap, future::Future, pin::Pin, time::Duration};

use hyper::{header, Uri};
use tokio::{io::AsyncWriteExt, time::timeout};

use super::{
    dial, get_over_tunnel, parse_head, read_head, rtsp, tls_upgrade, BoxTunnel, HeaderSet,
    ProbeOutcome, ProxyKind, TargetAddr,
};
use crate::{config::ScanConfig, validator};

#[allow(clippy::too_many_arguments)]
pub async fn visit(
    cfg: &ScanConfig,
    kind: ProxyKind,
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
    visit_inner(cfg, kind, host, port, url, headers, None, validate, raw, true).await
}

/// One GET through the proxy. `follow` permits a single hop to a 3xx
/// Location; the redirected request runs with `follow = false`.
#[allow(clippy::too_many_arguments)]
fn visit_inner<'a>(
    cfg: &'a ScanConfig,
    kind: ProxyKind,
    host: &'a str,
    port: u16,
    url: &'a str,
    headers: &'a HeaderSet,
    host_override: Option<&'a str>,
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

        let stream = match dial(&proxy_addr, t).await {
            Ok(stream) => stream,
            Err(e) => return ProbeOutcome::fail(format!("proxy connect failed: {}", e)),
        };

        // An "https" proxy kind speaks TLS to the proxy itself.
        let mut tunnel: BoxTunnel = if kind == ProxyKind::Https {
            let sni = host.trim_matches(|c| c == '[' || c == ']');
            match tls_upgrade(stream, sni, t).await {
                Ok(tls) => Box::new(tls),
                Err(e) => return ProbeOutcome::fail(format!("proxy TLS failed: {}", e)),
            }
        } else {
            Box::new(stream)
        };

        let override_headers = cfg
            .http_proxy
            .as_ref()
            .filter(|p| p.is_active())
            .map(|p| &p.headers);

        // Tunneled unless this is a plain http target reached through a
        // regular proxy URL, which takes the absolute-form GET instead.
        let tunneled = override_headers.is_some() || target.is_tls;
        if tunneled {
            let auth = if override_headers.is_some() {
                cfg.basic_auth()
            } else {
                None
            };
            tunnel =
                match connect_tunnel(tunnel, &target.authority(), override_headers, auth, t).await {
                    Ok(tunnel) => tunnel,
                    Err(e) => return ProbeOutcome::fail(e.to_string()),
                };
            if target.is_tls {
                tunnel = match tls_upgrade(tunnel, &target.host, t).await {
                    Ok(tls) => Box::new(tls),
                    Err(e) => return ProbeOutcome::fail(format!("target TLS failed: {}", e)),
                };
            }
        }

        let request_uri: Uri = if tunneled {
            let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
            match path.parse() {
                Ok(uri) => uri,
                Err(e) => return ProbeOutcome::fail(format!("invalid request path: {}", e)),
            }
        } else {
            uri.clone()
        };
        let host_value = target.host_header();
        let host_header = host_override.unwrap_or(&host_value);

        let response = match get_over_tunnel(
            tunnel,
            request_uri,
            host_header,
            headers,
            cfg.basic_auth(),
            t,
        )
        .await
        {
            Ok(response) => response,
            Err(e) => return ProbeOutcome::fail(format!("HTTP proxy request failed: {}", e)),
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
                // Propagate probe headers plus any gateway override; an
                // overridden Host replaces the synthesized one.
                let mut merged = headers.clone();
                let mut redirect_host = None;
                if let Some(extra) = override_headers {
                    for (name, value) in extra {
                        if name.eq_ignore_ascii_case("host") {
                            redirect_host = Some(value.clone());
                        } else {
                            merged.insert(name.clone(), vec![value.clone()]);
                        }
                    }
                }
                return visit_inner(
                    cfg,
                    kind,
                    host,
                    port,
                    &location,
                    &merged,
                    redirect_host.as_deref(),
                    validate,
                    raw,
                    false,
                )
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

/// Establishes a CONNECT tunnel to `target` over an open proxy connection.
///
/// Override headers are written verbatim when present; otherwise a Host
/// header is synthesized from the target. A non-200 reply fails the dial.
pub(crate) async fn connect_tunnel(
    mut tunnel: BoxTunnel,
    target: &str,
    extra_headers: Option<&BTreeMap<String, String>>,
    auth: Option<String>,
    t: Duration,
) -> anyhow::Result<BoxTunnel> {
    let mut request = format!("CONNECT {} HTTP/1.1\r\n", target);
    let has_extra = extra_headers.map(|h| !h.is_empty()).unwrap_or(false);
    if let Some(headers) = extra_headers {
        for (name, value) in headers {
            request.push_str(&format!("{}: {}\r\n", name, value));
        }
    }
    if let Some(auth) = auth {
        request.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
    }
    if !has_extra {
        request.push_str(&format!("Host: {}\r\n", target));
    }
    request.push_str("\r\n");

    match timeout(t, tunnel.write_all(request.as_bytes())).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => anyhow::bail!("failed to send CONNECT request: {}", e),
        Err(_) => anyhow::bail!("timed out sending CONNECT request"),
    }

    let head = read_head(&mut tunnel, t).await?;
    let parsed = parse_head(&head)?;
    if parsed.code != 200 {
        anyhow::bail!("CONNECT failed, proxy returned status {}", parsed.code);
    }
    Ok(tunnel)
}

/// RTSP targets ride a plain CONNECT tunnel regardless of proxy kind.
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
    let stream = match dial(&proxy_addr, t).await {
        Ok(stream) => stream,
        Err(e) => return ProbeOutcome::fail(format!("proxy connect failed: {}", e)),
    };
    let tunnel =
        match connect_tunnel(Box::new(stream), &target.authority(), None, cfg.basic_auth(), t)
            .await
        {
            Ok(tunnel) => tunnel,
            Err(e) => return ProbeOutcome::fail(e.to_string()),
        };
    rtsp::probe(tunnel, url, t).await
}
