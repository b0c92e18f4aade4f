//! Province/ISP lookup for an IP through the configured info APIs.
//!
//! Lookups go out directly, not through the candidate proxy, and are best
//! effort: every failure falls through to the next API, and exhaustion
//! yields the unknown marker used in success records.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper_tls::HttpsConnector;
use hyper_util::{client::legacy::Client, rt::TokioExecutor};
use serde_json::Value;
use tokio::time::timeout;

use crate::config::{IpInfoApi, ScanConfig};

pub const UNKNOWN: &str = "未知";

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(3);

/// Resolves `(province, isp)` for `ip`, or `(未知, 未知)`.
pub async fn ip_info(cfg: &ScanConfig, ip: &str) -> (String, String) {
    for api in &cfg.ip_info_apis {
        match query_api(api, ip).await {
            Ok((province, isp)) => return (province, isp),
            Err(err) => log::debug!("ip info lookup via {} failed: {}", api.url, err),
        }
    }
    (UNKNOWN.to_string(), UNKNOWN.to_string())
}

async fn query_api(api: &IpInfoApi, ip: &str) -> Result<(String, String)> {
    let url = api.url.replacen("{ip}", ip, 1);
    let body = fetch_json(&url).await?;
    let value: Value = serde_json::from_slice(&body).context("response is not JSON")?;

    if !api.code_key.is_empty() {
        let code = json_path_str(&value, &api.code_key);
        if code != api.expected_code {
            bail!("unexpected status code {:?}", code);
        }
    }
    let province = json_path_str(&value, &api.province_key);
    let isp = json_path_str(&value, &api.isp_key);
    if province.is_empty() && isp.is_empty() {
        bail!("response carries neither province nor isp");
    }
    Ok((
        if province.is_empty() { UNKNOWN.to_string() } else { province },
        if isp.is_empty() { UNKNOWN.to_string() } else { isp },
    ))
}

async fn fetch_json(url: &str) -> Result<Bytes> {
    let client: Client<_, Empty<Bytes>> =
        Client::builder(TokioExecutor::new()).build(HttpsConnector::new());
    let uri: hyper::Uri = url.parse().with_context(|| format!("bad url {:?}", url))?;
    let response = timeout(LOOKUP_TIMEOUT, client.get(uri))
        .await
        .context("lookup timed out")??;
    if !response.status().is_success() {
        bail!("lookup returned status {}", response.status().as_u16());
    }
    let body = timeout(LOOKUP_TIMEOUT, response.into_body().collect())
        .await
        .context("lookup body timed out")??;
    Ok(body.to_bytes())
}

/// Resolves a dotted path (`data.province`, `addrs.0.name`) against a JSON
/// value. Strings come back bare, null as empty, anything else in its JSON
/// rendering.
pub fn json_path_str(value: &Value, path: &str) -> String {
    if path.is_empty() {
        return String::new();
    }
    let mut cursor = value;
    for segment in path.split('.') {
        cursor = match cursor {
            Value::Object(map) => match map.get(segment) {
                Some(next) => next,
                None => return String::new(),
            },
            Value::Array(list) => match segment.parse::<usize>().ok().and_then(|i| list.get(i)) {
                Some(next) => next,
                None => return String::new(),
            },
            _ => return String::new(),
        };
    }
    match cursor {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn walks_nested_paths() {
        let value = json!({
            "code": 0,
            "data": { "province": "广东", "isp": "电信" },
            "addrs": [ { "name": "first" } ],
        });
        assert_eq!(json_path_str(&value, "data.province"), "广东");
        assert_eq!(json_path_str(&value, "data.isp"), "电信");
        assert_eq!(json_path_str(&value, "addrs.0.name"), "first");
        assert_eq!(json_path_str(&value, "code"), "0");
        assert_eq!(json_path_str(&value, "data.missing"), "");
        assert_eq!(json_path_str(&value, ""), "");
    }

    #[test]
    fn null_reads_as_empty() {
        let value = json!({ "isp": null });
        assert_eq!(json_path_str(&value, "isp"), "");
    }
}
