pub mod http;
pub mod rtsp;
pub mod socks4;
pub mod socks5;

use std::{collections::BTreeMap, fmt::Display, str::FromStr, time::Duration};

use http_body_util::{BodyExt, Empty};
use hyper::{body::Bytes, body::Incoming, header, HeaderMap, Request, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite},
    net::TcpStream,
    time::timeout,
};

use crate::config::ScanConfig;

/// The closed set of proxy flavors this scanner can drive. Dispatch over the
/// kind is always an exhaustive match, never a string comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Http,
    Https,
    Socks5,
    Socks4,
    Socks4a,
}

impl ProxyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Socks5 => "socks5",
            Self::Socks4 => "socks4",
            Self::Socks4a => "socks4a",
        }
    }

    /// Uppercased form used in success records.
    pub fn label(&self) -> String {
        self.as_str().to_uppercase()
    }
}

impl Display for ProxyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProxyKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            "socks5" => Ok(Self::Socks5),
            "socks4" => Ok(Self::Socks4),
            "socks4a" => Ok(Self::Socks4a),
            other => anyhow::bail!("unsupported proxy type: {}", other),
        }
    }
}

/// Result of one probe attempt. `detail` is always populated, success or
/// failure. `redirect` is only ever set by the SOCKS4/4A client, which hands
/// 302 targets back to its caller instead of following them.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub ok: bool,
    pub detail: String,
    pub redirect: Option<String>,
}

impl ProbeOutcome {
    pub fn ok(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: detail.into(),
            redirect: None,
        }
    }

    pub fn fail(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: detail.into(),
            redirect: None,
        }
    }

    pub fn redirect(detail: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: detail.into(),
            redirect: Some(location.into()),
        }
    }
}

/// Key -> values header map shaped like the configuration's `uaHeaders`.
pub type HeaderSet = BTreeMap<String, Vec<String>>;

/// Issues a single probe of `url` through the candidate proxy `host:port`.
///
/// `validate` enables playlist content classification, `raw` returns the
/// body verbatim on 200/302 (used for egress-IP discovery). Retries and
/// redirect budgets live one layer up, in [`crate::retry`].
pub async fn visit_once(
    cfg: &ScanConfig,
    kind: ProxyKind,
    host: &str,
    port: u16,
    url: &str,
    headers: &HeaderSet,
    validate: bool,
    raw: bool,
) -> ProbeOutcome {
    match kind {
        ProxyKind::Http | ProxyKind::Https => {
            http::visit(cfg, kind, host, port, url, headers, validate, raw).await
        }
        ProxyKind::Socks5 => socks5::visit(cfg, host, port, url, headers, validate, raw).await,
        ProxyKind::Socks4 | ProxyKind::Socks4a => {
            socks4::visit(cfg, host, port, url, headers, validate, raw).await
        }
    }
}

/// Byte pipe to a target, possibly wrapped in one or more TLS layers.
pub(crate) trait Tunnel: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Tunnel for T {}

pub(crate) type BoxTunnel = Box<dyn Tunnel>;

/// TCP dial with an explicit deadline.
pub(crate) async fn dial(addr: &str, t: Duration) -> anyhow::Result<TcpStream> {
    match timeout(t, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => anyhow::bail!("connect to {} timed out", addr),
    }
}

/// TLS client handshake with verification disabled; this tool measures
/// reachability, not certificate trust.
pub(crate) async fn tls_upgrade<S>(
    stream: S,
    domain: &str,
    t: Duration,
) -> anyhow::Result<tokio_native_tls::TlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()?;
    let connector = tokio_native_tls::TlsConnector::from(connector);
    match timeout(t, connector.connect(domain, stream)).await {
        Ok(Ok(tls)) => Ok(tls),
        Ok(Err(e)) => anyhow::bail!("TLS handshake failed: {}", e),
        Err(_) => anyhow::bail!("TLS handshake timed out"),
    }
}

/// Reads from `stream` until a blank line terminates the response head.
/// Returns everything read, which may include the start of the body.
pub(crate) async fn read_head<S: AsyncRead + Unpin>(
    stream: &mut S,
    t: Duration,
) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = match timeout(t, stream.read(&mut chunk)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => anyhow::bail!("timed out reading response head"),
        };
        if n == 0 {
            if buf.is_empty() {
                anyhow::bail!("connection closed before any response");
            }
            return Ok(buf);
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            return Ok(buf);
        }
        if buf.len() > 16 * 1024 {
            anyhow::bail!("response head exceeds 16 KiB");
        }
    }
}

/// Parsed head of a hand-framed HTTP response.
pub(crate) struct ParsedHead {
    pub code: u16,
    pub headers: Vec<(String, String)>,
    /// Offset where the body starts within the buffer passed to `parse_head`.
    pub body_offset: usize,
}

pub(crate) fn parse_head(buf: &[u8]) -> anyhow::Result<ParsedHead> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut response = httparse::Response::new(&mut headers);
    let body_offset = match response.parse(buf)? {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => anyhow::bail!("incomplete response head"),
    };
    let code = response
        .code
        .ok_or_else(|| anyhow::anyhow!("response missing status code"))?;
    let headers = response
        .headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).into_owned(),
            )
        })
        .collect();
    Ok(ParsedHead {
        code,
        headers,
        body_offset,
    })
}

pub(crate) fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Target coordinates extracted from a probe URL.
pub(crate) struct TargetAddr {
    pub host: String,
    pub port: u16,
    pub is_tls: bool,
    port_explicit: bool,
}

impl TargetAddr {
    pub fn from_uri(uri: &Uri) -> anyhow::Result<Self> {
        let host = uri
            .host()
            .ok_or_else(|| anyhow::anyhow!("URL has no host"))?
            .to_string();
        let scheme = uri.scheme_str().unwrap_or("http");
        let explicit = uri.port_u16();
        let port = explicit.unwrap_or(match scheme {
            "https" => 443,
            "rtsp" => 554,
            _ => 80,
        });
        Ok(Self {
            host,
            port,
            is_tls: scheme == "https",
            port_explicit: explicit.is_some(),
        })
    }

    /// Dial/CONNECT form: always host:port.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Host header value: the authority as written in the URL, so a default
    /// port the URL never spelled out stays off the wire.
    pub fn host_header(&self) -> String {
        if self.port_explicit {
            self.authority()
        } else if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }
}

/// An in-flight response over a raw tunnel; the hyper connection task keeps
/// driving the socket until the body is collected or the response dropped.
pub(crate) struct TunnelResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    body: Incoming,
    driver: tokio::task::JoinHandle<()>,
}

impl TunnelResponse {
    pub async fn into_body(self, t: Duration) -> anyhow::Result<Vec<u8>> {
        let collected = timeout(t, self.body.collect()).await;
        self.driver.abort();
        match collected {
            Ok(Ok(body)) => Ok(body.to_bytes().to_vec()),
            Ok(Err(e)) => anyhow::bail!("failed to read response body: {}", e),
            Err(_) => anyhow::bail!("timed out reading response body"),
        }
    }

    /// Tears the connection down without reading the body. Status-only
    /// classification must never drain a potentially endless media stream.
    pub fn finish(self) {
        self.driver.abort();
    }
}

/// Sends a GET over an established tunnel and waits for the response head.
///
/// `request_uri` controls the request target form: an absolute URI produces
/// the absolute-form line used when talking directly to an HTTP proxy, a
/// path-only URI the origin-form used inside tunnels.
pub(crate) async fn get_over_tunnel(
    tunnel: BoxTunnel,
    request_uri: Uri,
    host_header: &str,
    headers: &HeaderSet,
    proxy_auth: Option<String>,
    t: Duration,
) -> anyhow::Result<TunnelResponse> {
    let io = TokioIo::new(tunnel);
    let (mut sender, conn) = match timeout(t, hyper::client::conn::http1::handshake(io)).await {
        Ok(result) => result?,
        Err(_) => anyhow::bail!("HTTP handshake timed out"),
    };
    let driver = tokio::spawn(async move {
        let _ = conn.await;
    });

    let mut builder = Request::get(request_uri).header(header::HOST, host_header);
    for (name, values) in headers {
        for value in values {
            builder = builder.header(name.as_str(), value.as_str());
        }
    }
    if let Some(auth) = proxy_auth {
        builder = builder.header(header::PROXY_AUTHORIZATION, auth);
    }
    let request = builder.body(Empty::<Bytes>::new())?;

    let response = match timeout(t, sender.send_request(request)).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            driver.abort();
            anyhow::bail!("request failed: {}", e);
        }
        Err(_) => {
            driver.abort();
            anyhow::bail!("request timed out");
        }
    };
    let (parts, body) = response.into_parts();
    Ok(TunnelResponse {
        status: parts.status,
        headers: parts.headers,
        body,
        driver,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_strings() {
        for raw in ["http", "HTTPS", "socks5", "Socks4", "SOCKS4A"] {
            let kind: ProxyKind = raw.parse().unwrap();
            assert_eq!(kind.as_str(), raw.to_ascii_lowercase());
        }
        assert!("socks6".parse::<ProxyKind>().is_err());
        assert_eq!(ProxyKind::Socks4a.label(), "SOCKS4A");
    }

    #[test]
    fn target_addr_defaults_ports_by_scheme() {
        let http = TargetAddr::from_uri(&"http://example.com/x".parse().unwrap()).unwrap();
        assert_eq!((http.port, http.is_tls), (80, false));
        let https = TargetAddr::from_uri(&"https://example.com/".parse().unwrap()).unwrap();
        assert_eq!((https.port, https.is_tls), (443, true));
        let rtsp = TargetAddr::from_uri(&"rtsp://cam.local/stream".parse().unwrap()).unwrap();
        assert_eq!(rtsp.port, 554);
        let explicit = TargetAddr::from_uri(&"http://example.com:8080/".parse().unwrap()).unwrap();
        assert_eq!(explicit.authority(), "example.com:8080");
    }

    #[test]
    fn host_header_omits_unwritten_default_ports() {
        let plain = TargetAddr::from_uri(&"http://example.com/x".parse().unwrap()).unwrap();
        assert_eq!(plain.host_header(), "example.com");
        assert_eq!(plain.authority(), "example.com:80");
        let tls = TargetAddr::from_uri(&"https://example.com/".parse().unwrap()).unwrap();
        assert_eq!(tls.host_header(), "example.com");
        let explicit = TargetAddr::from_uri(&"http://example.com:8080/".parse().unwrap()).unwrap();
        assert_eq!(explicit.host_header(), "example.com:8080");
        let v6 = TargetAddr::from_uri(&"http://[2001:db8::1]/".parse().unwrap()).unwrap();
        assert_eq!(v6.host_header(), "[2001:db8::1]");
    }

    #[test]
    fn parse_head_extracts_status_and_headers() {
        let raw = b"HTTP/1.1 302 Found\r\nLocation: http://next.example/\r\n\r\nbody";
        let head = parse_head(raw).unwrap();
        assert_eq!(head.code, 302);
        assert_eq!(
            header_value(&head.headers, "location"),
            Some("http://next.example/")
        );
        assert_eq!(&raw[head.body_offset..], b"body");
    }
}
