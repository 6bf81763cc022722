use std::time::{SystemTime, UNIX_EPOCH};

/// Extract domain from URL
pub fn extract_domain(url: &str) -> anyhow::Result<String> {
    url::Url::parse(url)?
        .host_str()
        .map(|h| h.to_string())
        .ok_or_else(|| anyhow::anyhow!("No host in URL"))
}

/// Canonical form of a worker address used for worker lookup.
///
/// Parses as a URL (lowercases scheme and host, drops default ports, adds the
/// root path) and strips the fragment. Strings that are not URLs are only
/// trimmed.
pub fn normalize_address(address: &str) -> String {
    let trimmed = address.trim();
    match url::Url::parse(trimmed) {
        Ok(mut url) => {
            url.set_fragment(None);
            url.to_string()
        }
        Err(_) => trimmed.to_string(),
    }
}

/// Wall clock time in milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
