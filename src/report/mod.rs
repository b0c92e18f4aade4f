//! Turns the success-record file into proxy subscription YAML for
//! downstream players.

pub mod clash;
pub mod tvgate;

use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::config::ScanConfig;

static ADDR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"可用(\w+)代理:\s*([0-9.]+):(\d+)").unwrap());
static ELAPSED_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"耗时:\s*([0-9.]+)(ms|s)").unwrap());

pub const DEFAULT_OUTPUT: &str = "filtered_proxies.yaml";

#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub kind: String,
    pub server: String,
    pub port: u16,
    pub elapsed_secs: f64,
}

/// Parses one success-record line; anything that doesn't carry both an
/// address and an elapsed time is skipped.
pub fn parse_line(line: &str) -> Option<LogEntry> {
    let addr = ADDR_RE.captures(line)?;
    let elapsed = ELAPSED_RE.captures(line)?;
    let value: f64 = elapsed.get(1)?.as_str().parse().ok()?;
    let elapsed_secs = if elapsed.get(2)?.as_str() == "ms" {
        value / 1000.0
    } else {
        value
    };
    Some(LogEntry {
        kind: addr.get(1)?.as_str().to_lowercase(),
        server: addr.get(2)?.as_str().to_string(),
        port: addr.get(3)?.as_str().parse().ok()?,
        elapsed_secs,
    })
}

/// Reads and filters the record file. `max_elapsed_secs <= 0` disables the
/// latency cut-off.
pub fn collect_entries<P: AsRef<Path>>(input: P, max_elapsed_secs: f64) -> Result<Vec<LogEntry>> {
    let input = input.as_ref();
    let file = File::open(input)
        .with_context(|| format!("cannot open record file {}", input.display()))?;
    let mut entries = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.context("failed reading record file")?;
        let Some(entry) = parse_line(&line) else {
            continue;
        };
        if max_elapsed_secs > 0.0 && entry.elapsed_secs >= max_elapsed_secs {
            continue;
        }
        entries.push(entry);
    }
    Ok(entries)
}

/// One proxy node in either output format.
#[derive(Debug, Serialize)]
pub struct ProxyNode {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub server: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub udp: Option<bool>,
}

impl ProxyNode {
    pub fn from_entry(entry: &LogEntry, name: String, cfg: &ScanConfig) -> Self {
        let with_auth = cfg.proxy_auth_enabled
            && !cfg.proxy_username.is_empty()
            && !cfg.proxy_password.is_empty();
        // UDP relay only makes sense for the SOCKS family.
        let udp = matches!(entry.kind.as_str(), "socks5" | "socks4" | "socks4a");
        Self {
            name,
            kind: entry.kind.clone(),
            server: entry.server.clone(),
            port: entry.port,
            username: with_auth.then(|| cfg.proxy_username.clone()),
            password: with_auth.then(|| cfg.proxy_password.clone()),
            udp: udp.then_some(true),
        }
    }
}

/// Runs the requested generators; both run, clash first, when both are
/// asked for.
#[allow(clippy::too_many_arguments)]
pub fn generate_selected(
    cfg: &ScanConfig,
    clash: bool,
    tvgate: bool,
    input: Option<&str>,
    output: Option<&str>,
    name: &str,
    max_elapsed_secs: f64,
) -> Result<()> {
    if clash {
        self::clash::generate(cfg, input, output, name, max_elapsed_secs)?;
    }
    if tvgate {
        self::tvgate::generate(cfg, input, output, name, max_elapsed_secs)?;
    }
    Ok(())
}

fn resolve_io<'a>(
    cfg: &'a ScanConfig,
    input: Option<&'a str>,
    output: Option<&'a str>,
) -> (&'a str, &'a str) {
    (
        input.filter(|s| !s.is_empty()).unwrap_or(&cfg.successful_ips_file),
        output.filter(|s| !s.is_empty()).unwrap_or(DEFAULT_OUTPUT),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_record_line() {
        let line = "可用SOCKS5代理: 1.2.3.4:1080 广东 电信 出口IP: 5.6.7.8 未知 未知 成功访问: http://x/ 耗时: 456.5ms";
        let entry = parse_line(line).unwrap();
        assert_eq!(entry.kind, "socks5");
        assert_eq!(entry.server, "1.2.3.4");
        assert_eq!(entry.port, 1080);
        assert!((entry.elapsed_secs - 0.4565).abs() < 1e-9);
    }

    #[test]
    fn seconds_unit_passes_through() {
        let entry = parse_line("可用HTTP代理: 9.9.9.9:80 耗时: 1.25s").unwrap();
        assert_eq!(entry.kind, "http");
        assert!((entry.elapsed_secs - 1.25).abs() < 1e-9);
    }

    #[test]
    fn rejects_unrelated_lines() {
        assert!(parse_line("scan finished in 3s").is_none());
        assert!(parse_line("可用HTTP代理: 9.9.9.9:80").is_none());
    }

    #[test]
    fn both_generators_run_when_both_requested() {
        let dir = std::env::temp_dir().join(format!("relayscan-report-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let input = dir.join("records.txt");
        std::fs::write(
            &input,
            "可用SOCKS5代理: 1.2.3.4:1080 广东 电信 出口IP: 5.6.7.8 未知 未知 成功访问: http://x/ 耗时: 300ms\n",
        )
        .unwrap();
        let clash_out = dir.join("clash.yaml");
        let tvgate_out = dir.join("tvgate.yaml");
        let cfg = ScanConfig::default();

        generate_selected(
            &cfg,
            true,
            false,
            Some(input.to_str().unwrap()),
            Some(clash_out.to_str().unwrap()),
            "gd",
            0.0,
        )
        .unwrap();
        generate_selected(
            &cfg,
            true,
            true,
            Some(input.to_str().unwrap()),
            Some(tvgate_out.to_str().unwrap()),
            "gd",
            0.0,
        )
        .unwrap();

        assert!(std::fs::read_to_string(&clash_out)
            .unwrap()
            .starts_with("proxies:"));
        // Second run wrote clash first, then tvgate over the same path.
        assert!(std::fs::read_to_string(&tvgate_out)
            .unwrap()
            .starts_with("proxygroups:"));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
