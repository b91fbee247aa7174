use std::time::Duration;

use reqwest::ClientBuilder;

fn has_proxy_env() -> bool {
    [
        "HTTPS_PROXY",
        "https_proxy",
        "HTTP_PROXY",
        "http_proxy",
        "ALL_PROXY",
        "all_proxy",
    ]
    .iter()
    .any(|k| std::env::var(k).is_ok_and(|v| !v.trim().is_empty()))
}

fn host_matches(host: &str, pattern: &str) -> bool {
    let pattern = pattern.trim().to_ascii_lowercase();
    if pattern.is_empty() {
        return false;
    }
    let host = host.to_ascii_lowercase();
    match pattern.strip_prefix('.') {
        Some(suffix) => host == suffix || host.ends_with(&pattern),
        None => host == pattern,
    }
}

fn should_bypass_proxy_impl(url: &str, no_proxy_hosts: &[String], proxy_env_present: bool) -> bool {
    if !proxy_env_present || no_proxy_hosts.is_empty() {
        return false;
    }

    let Ok(u) = reqwest::Url::parse(url) else {
        return false;
    };
    let Some(host) = u.host_str() else {
        return false;
    };

    no_proxy_hosts.iter().any(|p| host_matches(host, p))
}

pub fn should_bypass_proxy_for_url(url: &str, no_proxy_hosts: &[String]) -> bool {
    should_bypass_proxy_impl(url, no_proxy_hosts, has_proxy_env())
}

pub fn maybe_disable_proxy(builder: ClientBuilder, url: &str, no_proxy_hosts: &[String]) -> ClientBuilder {
    if should_bypass_proxy_for_url(url, no_proxy_hosts) {
        tracing::info!("Bypassing proxy for upstream {}", host_for_log(url));
        builder.no_proxy()
    } else {
        builder
    }
}

/// Client for one upstream base URL. Streaming responses can run for a long
/// time, so the timeout applies to connecting and to idle reads only.
pub fn client_for_url_with_timeout(
    url: &str,
    timeout: Duration,
    no_proxy_hosts: &[String],
) -> Result<reqwest::Client, reqwest::Error> {
    let builder = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .read_timeout(timeout);
    maybe_disable_proxy(builder, url, no_proxy_hosts).build()
}

// URL 可能带有 key 查询参数，日志中只输出主机名
fn host_for_log(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| "<invalid url>".to_string())
}
