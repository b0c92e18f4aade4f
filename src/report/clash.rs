//! Clash subscription output: a flat `proxies:` list.

use anyhow::{Context, Result};
use serde::Serialize;

use crate::config::ScanConfig;

use super::{collect_entries, resolve_io, ProxyNode};

#[derive(Debug, Serialize)]
struct ClashDocument {
    proxies: Vec<ProxyNode>,
}

pub fn generate(
    cfg: &ScanConfig,
    input: Option<&str>,
    output: Option<&str>,
    name_prefix: &str,
    max_elapsed_secs: f64,
) -> Result<()> {
    let (input, output) = resolve_io(cfg, input, output);
    let proxies = collect_entries(input, max_elapsed_secs)?
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            ProxyNode::from_entry(entry, format!("{}-{}", name_prefix, i + 1), cfg)
        })
        .collect();
    let document = ClashDocument { proxies };
    let yaml = serde_yaml::to_string(&document).context("cannot serialize clash document")?;
    std::fs::write(output, yaml).with_context(|| format!("cannot write {}", output))?;
    println!("筛选完成，已输出到 {}", output);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::LogEntry;

    fn auth_config() -> ScanConfig {
        ScanConfig {
            proxy_auth_enabled: true,
            proxy_username: "user".to_string(),
            proxy_password: "pass".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn socks_nodes_carry_udp_and_auth() {
        let entry = LogEntry {
            kind: "socks5".to_string(),
            server: "1.2.3.4".to_string(),
            port: 1080,
            elapsed_secs: 0.5,
        };
        let node = ProxyNode::from_entry(&entry, "gd-1".to_string(), &auth_config());
        let yaml = serde_yaml::to_string(&ClashDocument { proxies: vec![node] }).unwrap();
        assert!(yaml.starts_with("proxies:\n"));
        assert!(yaml.contains("name: gd-1"));
        assert!(yaml.contains("type: socks5"));
        assert!(yaml.contains("udp: true"));
        assert!(yaml.contains("username: user"));
    }

    #[test]
    fn http_nodes_skip_udp() {
        let entry = LogEntry {
            kind: "http".to_string(),
            server: "1.2.3.4".to_string(),
            port: 8080,
            elapsed_secs: 0.5,
        };
        let node = ProxyNode::from_entry(&entry, "gd-1".to_string(), &ScanConfig::default());
        let yaml = serde_yaml::to_string(&ClashDocument { proxies: vec![node] }).unwrap();
        assert!(!yaml.contains("udp"));
        assert!(!yaml.contains("username"));
    }
}
