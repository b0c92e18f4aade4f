use std::{collections::BTreeMap, path::Path, time::Duration};

use serde::Deserialize;

use crate::probe::ProxyKind;

/// Optional upstream CONNECT gateway sitting in front of every scanned proxy.
///
/// When enabled with a non-empty header set, HTTP-family probes stop dialing
/// the candidate as a regular proxy URL and instead issue a hand-written
/// CONNECT request carrying these headers.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HttpProxyOverride {
    #[serde(rename = "Enabled", default)]
    pub enabled: bool,
    #[serde(rename = "headers", default)]
    pub headers: BTreeMap<String, String>,
}

impl HttpProxyOverride {
    /// The override only takes effect when enabled and carrying headers,
    /// mirroring how it is consumed by the HTTP client.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.headers.is_empty()
    }
}

/// One IP-information API endpoint. `url` contains an `{ip}` placeholder;
/// the `*_key` fields are dotted paths into the JSON response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IpInfoApi {
    pub url: String,
    #[serde(default)]
    pub code_key: String,
    #[serde(default)]
    pub expected_code: String,
    #[serde(default)]
    pub province_key: String,
    #[serde(default)]
    pub isp_key: String,
}

/// Immutable scan configuration, loaded once from YAML and shared by
/// reference with every component. No part of the scanner reads ambient
/// global state.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Port specs: either `"N"` or an inclusive `"N-M"` range.
    pub ports: Vec<String>,
    #[serde(rename = "urlPaths")]
    pub url_paths: Vec<String>,
    #[serde(rename = "maxConcurrentRequests")]
    pub max_concurrent_requests: usize,
    #[serde(rename = "successfulIPsFile")]
    pub successful_ips_file: String,
    #[serde(rename = "cidrFile")]
    pub cidr_file: String,
    #[serde(rename = "filebufferSize")]
    pub file_buffer_size: usize,
    #[serde(rename = "logEnabled")]
    pub log_enabled: bool,
    #[serde(rename = "proxyTypes")]
    pub proxy_types: Vec<String>,
    #[serde(rename = "proxyAuthEnabled")]
    pub proxy_auth_enabled: bool,
    #[serde(rename = "proxyUsername")]
    pub proxy_username: String,
    #[serde(rename = "proxyPassword")]
    pub proxy_password: String,
    /// Per-operation timeout budget in seconds; values <= 0 fall back to 5.
    #[serde(rename = "proxyTimeout")]
    pub proxy_timeout: i64,
    #[serde(rename = "HttpProxy")]
    pub http_proxy: Option<HttpProxyOverride>,
    #[serde(rename = "uaHeaders")]
    pub ua_headers: BTreeMap<String, Vec<String>>,
    #[serde(rename = "validateContent")]
    pub validate_content: bool,
    /// IP-echo endpoints used to discover the egress address of a working proxy.
    #[serde(rename = "RealIPApiURLs")]
    pub real_ip_api_urls: Vec<String>,
    #[serde(rename = "ip_info_apis")]
    pub ip_info_apis: Vec<IpInfoApi>,
    #[serde(rename = "retryTimes")]
    pub retry_times: i64,
    #[serde(rename = "retryIntervalSeconds")]
    pub retry_interval_seconds: i64,

    /// Parsed form of `proxy_types`; populated by [`ScanConfig::load`].
    #[serde(skip)]
    pub kinds: Vec<ProxyKind>,
}

impl ScanConfig {
    /// Loads and validates the configuration. Unknown proxy types and a
    /// missing file are fatal here, before any task runs.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        let mut config: ScanConfig = serde_yaml::from_str(&data)?;
        config.kinds = config
            .proxy_types
            .iter()
            .map(|raw| raw.parse())
            .collect::<anyhow::Result<Vec<ProxyKind>>>()?;
        if config.max_concurrent_requests == 0 {
            config.max_concurrent_requests = 1;
        }
        Ok(config)
    }

    pub fn timeout(&self) -> Duration {
        if self.proxy_timeout <= 0 {
            Duration::from_secs(5)
        } else {
            Duration::from_secs(self.proxy_timeout as u64)
        }
    }

    pub fn max_attempts(&self) -> usize {
        if self.retry_times <= 0 {
            1
        } else {
            self.retry_times as usize
        }
    }

    pub fn retry_delay(&self) -> Duration {
        if self.retry_interval_seconds <= 0 {
            Duration::from_secs(1)
        } else {
            Duration::from_secs(self.retry_interval_seconds as u64)
        }
    }

    /// Value for `Proxy-Authorization: Basic`, when authentication is on.
    pub fn basic_auth(&self) -> Option<String> {
        use base64::{engine::general_purpose, Engine};
        if !self.proxy_auth_enabled {
            return None;
        }
        let raw = format!("{}:{}", self.proxy_username, self.proxy_password);
        Some(format!("Basic {}", general_purpose::STANDARD.encode(raw)))
    }
}
