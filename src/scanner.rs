//! Per-candidate probe orchestration: liveness check, one task per proxy
//! kind, geolocation enrichment, and success-record emission.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::{net::TcpStream, time::timeout};

use crate::{
    config::ScanConfig,
    expander::Candidate,
    geo::{self, UNKNOWN},
    probe::{HeaderSet, ProxyKind},
    retry,
};

static IPV4_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").unwrap());
static IPV6_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:[0-9a-f]{1,4}:){1,7}[0-9a-f]{1,4}\b").unwrap());

struct KindOutcome {
    kind: ProxyKind,
    url: String,
    ok: bool,
    detail: String,
    elapsed: Duration,
}

/// Probes a single host:port candidate across every configured proxy kind
/// and target URL, pushing success records into `records`.
pub async fn probe_candidate(
    cfg: Arc<ScanConfig>,
    candidate: Candidate,
    records: kanal::AsyncSender<String>,
) {
    if !is_alive(&candidate, cfg.timeout()).await {
        log::debug!("{} is not accepting connections", candidate);
        return;
    }

    let capacity = (cfg.kinds.len() * cfg.url_paths.len()).max(1);
    let (tx, rx) = kanal::bounded_async::<KindOutcome>(capacity);
    let mut tasks = Vec::with_capacity(cfg.kinds.len());
    for &kind in &cfg.kinds {
        let cfg = Arc::clone(&cfg);
        let candidate = candidate.clone();
        let tx = tx.clone();
        tasks.push(tokio::spawn(async move {
            let started = Instant::now();
            for url in &cfg.url_paths {
                let (ok, detail) = retry::visit(
                    &cfg,
                    kind,
                    &candidate.host,
                    candidate.port,
                    url,
                    &cfg.ua_headers,
                )
                .await;
                let outcome = KindOutcome {
                    kind,
                    url: url.clone(),
                    ok,
                    detail,
                    elapsed: started.elapsed(),
                };
                if tx.send(outcome).await.is_err() {
                    return;
                }
            }
        }));
    }
    drop(tx);

    while let Ok(outcome) = rx.recv().await {
        let addr = candidate.addr();
        if !outcome.ok {
            log::info!(
                "{} proxy {} failed for {}: {}",
                outcome.kind.label(),
                addr,
                outcome.url,
                outcome.detail
            );
            continue;
        }
        let (province, isp) = geo::ip_info(&cfg, &candidate.host).await;
        let egress = discover_egress_ip(&cfg, outcome.kind, &candidate).await;
        let (egress_province, egress_isp) = if egress == UNKNOWN {
            (UNKNOWN.to_string(), UNKNOWN.to_string())
        } else {
            geo::ip_info(&cfg, &egress).await
        };
        let record = format!(
            "可用{}代理: {} {} {} 出口IP: {} {} {} 成功访问: {} 耗时: {}\n",
            outcome.kind.label(),
            addr,
            province,
            isp,
            egress,
            egress_province,
            egress_isp,
            outcome.url,
            format_elapsed(outcome.elapsed),
        );
        log::info!("{}", record.trim_end());
        if records.send(record).await.is_err() {
            log::warn!("record sink closed early, dropping result for {}", addr);
        }
    }

    for task in tasks {
        if let Err(err) = task.await {
            log::error!("probe task for {} panicked: {}", candidate, err);
        }
    }
}

async fn is_alive(candidate: &Candidate, t: Duration) -> bool {
    matches!(
        timeout(t, TcpStream::connect(candidate.addr())).await,
        Ok(Ok(_))
    )
}

/// Asks the configured IP-echo endpoints, through the proxy itself, what
/// address the proxy egresses from.
async fn discover_egress_ip(cfg: &ScanConfig, kind: ProxyKind, candidate: &Candidate) -> String {
    let mut headers = HeaderSet::new();
    headers.insert("User-Agent".to_string(), vec!["curl/7.76.1".to_string()]);
    for url in &cfg.real_ip_api_urls {
        let (ok, body) =
            retry::visit_raw(cfg, kind, &candidate.host, candidate.port, url, &headers).await;
        if !ok {
            log::debug!("egress lookup via {} failed: {}", url, body);
            continue;
        }
        if let Some(m) = IPV4_RE.find(&body) {
            return m.as_str().to_string();
        }
        if let Some(m) = IPV6_RE.find(&body) {
            return m.as_str().to_string();
        }
    }
    UNKNOWN.to_string()
}

/// Sub-second durations render in milliseconds, longer ones in seconds,
/// both with up to six fractional digits and no trailing zeros.
pub fn format_elapsed(elapsed: Duration) -> String {
    let (value, unit) = if elapsed < Duration::from_secs(1) {
        (elapsed.as_secs_f64() * 1000.0, "ms")
    } else {
        (elapsed.as_secs_f64(), "s")
    };
    let mut text = format!("{:.6}", value);
    while text.ends_with('0') {
        text.pop();
    }
    if text.ends_with('.') {
        text.pop();
    }
    text.push_str(unit);
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_switches_units_at_one_second() {
        assert_eq!(format_elapsed(Duration::from_millis(250)), "250ms");
        assert_eq!(format_elapsed(Duration::from_micros(1500)), "1.5ms");
        assert_eq!(format_elapsed(Duration::from_secs(2)), "2s");
        assert_eq!(format_elapsed(Duration::from_millis(1250)), "1.25s");
    }

    #[test]
    fn egress_regexes_pick_first_address() {
        assert_eq!(IPV4_RE.find("ip: 203.0.113.9\n").unwrap().as_str(), "203.0.113.9");
        assert_eq!(
            IPV6_RE.find("2001:db8:0:1:1:1:1:1").unwrap().as_str(),
            "2001:db8:0:1:1:1:1:1"
        );
        assert!(IPV4_RE.find("no address here").is_none());
    }

    #[test]
    fn record_line_matches_report_parsers() {
        let line = format!(
            "可用{}代理: {} {} {} 出口IP: {} {} {} 成功访问: {} 耗时: {}",
            ProxyKind::Socks5.label(),
            "1.2.3.4:1080",
            "广东",
            "电信",
            "5.6.7.8",
            "未知",
            "未知",
            "http://example.com/live.m3u8",
            format_elapsed(Duration::from_millis(321)),
        );
        let entry = crate::report::parse_line(&line).unwrap();
        assert_eq!(entry.kind, "socks5");
        assert_eq!(entry.server, "1.2.3.4");
        assert_eq!(entry.port, 1080);
        assert!((entry.elapsed_secs - 0.321).abs() < 1e-9);
    }
}
