//! Turns the seed file's lines (CIDR blocks, host:port pairs, bare hosts)
//! into a lazy stream of scan candidates.

use std::{
    io::BufRead,
    net::{Ipv4Addr, Ipv6Addr},
};

use anyhow::{anyhow, bail, Context, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub host: String,
    pub port: u16,
}

impl Candidate {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Dialable form, IPv6 hosts bracketed.
    pub fn addr(&self) -> String {
        format!("{}:{}", format_host(&self.host), self.port)
    }
}

impl std::fmt::Display for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.addr())
    }
}

pub fn format_host(host: &str) -> String {
    if host.contains(':') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

/// Parses the configured port list. Each entry is a single port or an
/// inclusive `low-high` range; any malformed entry is fatal.
pub fn expand_ports(specs: &[String]) -> Result<Vec<u16>> {
    let mut ports = Vec::new();
    for spec in specs {
        let spec = spec.trim();
        if spec.is_empty() {
            continue;
        }
        if let Some((lo, hi)) = spec.split_once('-') {
            let lo: u16 = lo
                .trim()
                .parse()
                .with_context(|| format!("bad port range start in {:?}", spec))?;
            let hi: u16 = hi
                .trim()
                .parse()
                .with_context(|| format!("bad port range end in {:?}", spec))?;
            if lo == 0 || lo > hi {
                bail!("invalid port range {:?}", spec);
            }
            ports.extend(lo..=hi);
        } else {
            let port: u16 = spec
                .parse()
                .with_context(|| format!("bad port entry {:?}", spec))?;
            if port == 0 {
                bail!("invalid port entry {:?}", spec);
            }
            ports.push(port);
        }
    }
    Ok(ports)
}

/// Splits `"host:port"` or `"[v6]:port"`. Lines with more than one colon
/// and no brackets are not treated as host:port pairs.
fn split_host_port(line: &str) -> Option<(String, u16)> {
    if let Some(rest) = line.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port: u16 = tail.strip_prefix(':')?.parse().ok()?;
        if port == 0 {
            return None;
        }
        return Some((host.to_string(), port));
    }
    if line.matches(':').count() == 1 {
        let (host, port) = line.split_once(':')?;
        let port: u16 = port.parse().ok()?;
        if host.is_empty() || port == 0 {
            return None;
        }
        return Some((host.to_string(), port));
    }
    None
}

/// Last-resort reading of `v6addr:port` without brackets: everything up to
/// the final colon must itself parse as an IPv6 address.
fn try_bare_ipv6_with_port(line: &str) -> Option<(String, u16)> {
    let (host, port) = line.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    if port == 0 {
        return None;
    }
    let addr: Ipv6Addr = host.parse().ok()?;
    if addr.to_ipv4_mapped().is_some() {
        return None;
    }
    Some((host.to_string(), port))
}

/// Lazy walk over every address in a CIDR block, base through broadcast.
enum CidrRange {
    V4 { cur: Option<u32>, last: u32 },
    V6 { cur: Option<u128>, last: u128 },
}

impl CidrRange {
    fn parse(spec: &str) -> Result<Self> {
        let (addr, prefix) = spec
            .split_once('/')
            .ok_or_else(|| anyhow!("not a CIDR block: {:?}", spec))?;
        let prefix: u32 = prefix
            .parse()
            .with_context(|| format!("bad prefix length in {:?}", spec))?;
        if let Ok(v4) = addr.parse::<Ipv4Addr>() {
            if prefix > 32 {
                bail!("prefix length out of range in {:?}", spec);
            }
            let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
            let base = u32::from(v4) & mask;
            Ok(CidrRange::V4 {
                cur: Some(base),
                last: base | !mask,
            })
        } else if let Ok(v6) = addr.parse::<Ipv6Addr>() {
            if prefix > 128 {
                bail!("prefix length out of range in {:?}", spec);
            }
            let mask = if prefix == 0 {
                0
            } else {
                u128::MAX << (128 - prefix)
            };
            let base = u128::from(v6) & mask;
            Ok(CidrRange::V6 {
                cur: Some(base),
                last: base | !mask,
            })
        } else {
            bail!("bad CIDR address in {:?}", spec)
        }
    }
}

impl Iterator for CidrRange {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        match self {
            CidrRange::V4 { cur, last } => {
                let n = (*cur)?;
                *cur = if n == *last { None } else { Some(n + 1) };
                Some(Ipv4Addr::from(n).to_string())
            }
            CidrRange::V6 { cur, last } => {
                let n = (*cur)?;
                *cur = if n == *last { None } else { Some(n + 1) };
                Some(Ipv6Addr::from(n).to_string())
            }
        }
    }
}

/// What one seed line expands to.
enum Expansion {
    /// A CIDR block crossed with the configured port list.
    Range {
        range: CidrRange,
        current: Option<String>,
        port_idx: usize,
    },
    /// A single host crossed with the configured port list.
    Host { host: String, port_idx: usize },
    /// An explicit host:port pair, emitted once.
    Fixed(Option<Candidate>),
}

/// Streams candidates out of a seed reader without materializing the full
/// cross product. Unrecognized lines are logged and skipped.
pub struct CandidateSource<R: BufRead> {
    lines: std::io::Lines<R>,
    ports: Vec<u16>,
    pending: Option<Expansion>,
}

impl<R: BufRead> CandidateSource<R> {
    pub fn new(reader: R, ports: Vec<u16>) -> Self {
        Self {
            lines: reader.lines(),
            ports,
            pending: None,
        }
    }

    fn classify(&self, line: &str) -> Option<Expansion> {
        if line.contains('/') {
            match CidrRange::parse(line) {
                Ok(mut range) => {
                    let current = range.next();
                    return Some(Expansion::Range {
                        range,
                        current,
                        port_idx: 0,
                    });
                }
                Err(err) => {
                    log::warn!("skipping seed line {:?}: {}", line, err);
                    return None;
                }
            }
        }
        if let Some((host, port)) = split_host_port(line) {
            return Some(Expansion::Fixed(Some(Candidate::new(host, port))));
        }
        if let Some((host, port)) = try_bare_ipv6_with_port(line) {
            return Some(Expansion::Fixed(Some(Candidate::new(host, port))));
        }
        if line.parse::<Ipv4Addr>().is_ok() || line.parse::<Ipv6Addr>().is_ok() {
            return Some(Expansion::Host {
                host: line.to_string(),
                port_idx: 0,
            });
        }
        log::warn!("skipping unrecognized seed line {:?}", line);
        None
    }

    fn advance_pending(&mut self) -> Option<Candidate> {
        let expansion = self.pending.as_mut()?;
        match expansion {
            Expansion::Fixed(slot) => {
                let out = slot.take();
                self.pending = None;
                out
            }
            Expansion::Host { host, port_idx } => {
                if *port_idx >= self.ports.len() {
                    self.pending = None;
                    return None;
                }
                let out = Candidate::new(host.clone(), self.ports[*port_idx]);
                *port_idx += 1;
                if *port_idx >= self.ports.len() {
                    self.pending = None;
                }
                Some(out)
            }
            Expansion::Range {
                range,
                current,
                port_idx,
            } => {
                let host = current.clone()?;
                if *port_idx >= self.ports.len() {
                    self.pending = None;
                    return None;
                }
                let out = Candidate::new(host, self.ports[*port_idx]);
                *port_idx += 1;
                if *port_idx >= self.ports.len() {
                    *port_idx = 0;
                    *current = range.next();
                    if current.is_none() {
                        self.pending = None;
                    }
                }
                Some(out)
            }
        }
    }
}

impl<R: BufRead> Iterator for CandidateSource<R> {
    type Item = Candidate;

    fn next(&mut self) -> Option<Candidate> {
        loop {
            if let Some(candidate) = self.advance_pending() {
                return Some(candidate);
            }
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(err) => {
                    log::warn!("failed reading seed file: {}", err);
                    return None;
                }
            };
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            self.pending = self.classify(line);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn collect(input: &str, ports: &[u16]) -> Vec<String> {
        CandidateSource::new(Cursor::new(input.to_string()), ports.to_vec())
            .map(|c| c.addr())
            .collect()
    }

    #[test]
    fn expands_port_ranges() {
        let specs = vec!["80".to_string(), "8000-8002".to_string(), " ".to_string()];
        assert_eq!(expand_ports(&specs).unwrap(), vec![80, 8000, 8001, 8002]);
        assert!(expand_ports(&["0".to_string()]).is_err());
        assert!(expand_ports(&["90-80".to_string()]).is_err());
        assert!(expand_ports(&["eighty".to_string()]).is_err());
    }

    #[test]
    fn cidr_crosses_every_port() {
        let got = collect("10.0.0.0/30\n", &[80, 8080]);
        assert_eq!(
            got,
            vec![
                "10.0.0.0:80",
                "10.0.0.0:8080",
                "10.0.0.1:80",
                "10.0.0.1:8080",
                "10.0.0.2:80",
                "10.0.0.2:8080",
                "10.0.0.3:80",
                "10.0.0.3:8080",
            ]
        );
    }

    #[test]
    fn host_port_pair_ignores_port_list() {
        assert_eq!(collect("1.2.3.4:9999\n", &[80, 443]), vec!["1.2.3.4:9999"]);
        assert_eq!(
            collect("[2001:db8::1]:8080\n", &[80]),
            vec!["[2001:db8::1]:8080"]
        );
    }

    #[test]
    fn bare_ipv6_with_trailing_port() {
        assert_eq!(
            collect("2001:db8::1:8080\n", &[80]),
            vec!["[2001:db8::1]:8080"]
        );
    }

    #[test]
    fn bare_host_uses_port_list() {
        assert_eq!(
            collect("192.168.1.5\n", &[80, 443]),
            vec!["192.168.1.5:80", "192.168.1.5:443"]
        );
    }

    #[test]
    fn bad_lines_do_not_stop_expansion() {
        let got = collect("garbage\n\n# comment\n10.0.0.4/31\n", &[80]);
        assert_eq!(got, vec!["10.0.0.4:80", "10.0.0.5:80"]);
    }

    #[test]
    fn small_ipv6_block() {
        let got = collect("2001:db8::/127\n", &[80]);
        assert_eq!(got, vec!["[2001:db8::]:80", "[2001:db8::1]:80"]);
    }
}
