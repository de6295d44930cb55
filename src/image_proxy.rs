//! Image URL fallback for ad creatives that browser ad-blockers tend to drop.
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;

/// Hosts serving ad creatives that filter lists commonly block.
static BLOCKED_HOST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(^|\.)(googlesyndication\.com|doubleclick\.net|googleadservices\.com|adservice\.google\.[a-z.]+|2mdn\.net|adnxs\.com|fbcdn\.net|tpc\.googlesyndication\.com)$",
    )
    .expect("valid blocked-host regex")
});

/// Path fragments that trip generic `/ads/`-style filter rules.
static BLOCKED_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)/(ads?|adimg|adview|pagead|simgad|banners?)(/|[._-])")
        .expect("valid blocked-path regex")
});

/// Whether an image URL is likely to be blocked when loaded directly.
pub fn is_likely_blocked(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    if !matches!(parsed.scheme(), "http" | "https") {
        return false;
    }
    let host_blocked = parsed
        .host_str()
        .map(|host| BLOCKED_HOST.is_match(host))
        .unwrap_or(false);
    host_blocked || BLOCKED_PATH.is_match(parsed.path())
}

/// Build the proxy URL for `url`: `{proxy_base}?url=<encoded>`.
/// Returns `None` for non-http(s) or unparsable inputs.
pub fn proxy_url(url: &str, proxy_base: &Url) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    let mut proxied = proxy_base.clone();
    proxied.query_pairs_mut().append_pair("url", parsed.as_str());
    Some(proxied.into())
}

/// URL to render: the proxy for likely-blocked images, the original otherwise.
pub fn proxied_image_url(url: &str, proxy_base: &Url) -> String {
    if is_likely_blocked(url) {
        if let Some(proxied) = proxy_url(url, proxy_base) {
            return proxied;
        }
    }
    url.to_string()
}

/// Ordered load attempts for one image: try the first, fall back to the next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSource {
    candidates: Vec<String>,
}

impl ImageSource {
    pub fn new(url: &str, proxy_base: Option<&Url>) -> Self {
        let proxied = proxy_base.and_then(|base| proxy_url(url, base));
        let candidates = match proxied {
            Some(proxied) if is_likely_blocked(url) => vec![proxied, url.to_string()],
            Some(proxied) => vec![url.to_string(), proxied],
            None => vec![url.to_string()],
        };
        Self { candidates }
    }

    pub fn primary(&self) -> &str {
        &self.candidates[0]
    }

    /// Candidate to try after `failed` could not be loaded.
    pub fn fallback_after(&self, failed: &str) -> Option<&str> {
        let pos = self.candidates.iter().position(|c| c == failed)?;
        self.candidates.get(pos + 1).map(String::as_str)
    }

    pub fn candidates(&self) -> &[String] {
        &self.candidates
    }
}
