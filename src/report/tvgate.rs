//! TVGate subscription output: proxies nested under a named group.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::config::ScanConfig;

use super::{collect_entries, resolve_io, ProxyNode};

pub const DEFAULT_GROUP: &str = "shuxiaoguo";

#[derive(Debug, Serialize)]
struct ProxyGroup {
    proxies: Vec<ProxyNode>,
}

#[derive(Debug, Serialize)]
struct TvGateDocument {
    proxygroups: BTreeMap<String, ProxyGroup>,
}

pub fn generate(
    cfg: &ScanConfig,
    input: Option<&str>,
    output: Option<&str>,
    group_name: &str,
    max_elapsed_secs: f64,
) -> Result<()> {
    let (input, output) = resolve_io(cfg, input, output);
    let group = if group_name.is_empty() {
        DEFAULT_GROUP
    } else {
        group_name
    };
    let proxies = collect_entries(input, max_elapsed_secs)?
        .iter()
        .enumerate()
        .map(|(i, entry)| ProxyNode::from_entry(entry, format!("{}{}", group, i + 1), cfg))
        .collect();
    let mut proxygroups = BTreeMap::new();
    proxygroups.insert(group.to_string(), ProxyGroup { proxies });
    let document = TvGateDocument { proxygroups };
    let yaml = serde_yaml::to_string(&document).context("cannot serialize tvgate document")?;
    std::fs::write(output, yaml).with_context(|| format!("cannot write {}", output))?;
    println!("筛选完成，已输出到 {}", output);
    Ok(())
}
