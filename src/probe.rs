use reqwest::header::{self, HeaderMap};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

/// What a metadata request taught us about a URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeInfo {
    /// URL after redirects.
    pub final_url: String,
    /// 0 when unknown.
    pub total_size: u64,
    pub accepts_ranges: bool,
    pub content_disposition: Option<String>,
    pub content_type: Option<String>,
}

impl ProbeInfo {
    fn unknown(url: &str) -> Self {
        Self {
            final_url: url.to_string(),
            ..Self::default()
        }
    }

    /// A size-bearing HTML reply is a web page, not the file itself.
    pub fn is_html(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| ct.to_ascii_lowercase().contains("text/html"))
            .unwrap_or(false)
    }

    pub fn is_downloadable(&self) -> bool {
        self.total_size > 0 && !self.is_html()
    }
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// HEAD the URL following redirects. Never fails: timeouts and bad replies
/// degrade to "unknown size, no range support".
pub async fn probe(client: &Client, url: &str, headers: &HeaderMap, timeout: Duration) -> ProbeInfo {
    let response = match client
        .head(url)
        .headers(headers.clone())
        .timeout(timeout)
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => {
            warn!(url, error = %e, "probe failed, assuming unknown size");
            return ProbeInfo::unknown(url);
        }
    };

    if !response.status().is_success() {
        warn!(url, status = %response.status(), "probe rejected, assuming unknown size");
        return ProbeInfo::unknown(response.url().as_str());
    }

    let headers = response.headers();
    // Read the header directly: the body of a HEAD reply is always empty.
    let total_size = header_str(headers, header::CONTENT_LENGTH)
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    let accepts_ranges = header_str(headers, header::ACCEPT_RANGES)
        .map(|v| v.eq_ignore_ascii_case("bytes"))
        .unwrap_or(false);

    let info = ProbeInfo {
        final_url: response.url().to_string(),
        total_size,
        accepts_ranges,
        content_disposition: header_str(headers, header::CONTENT_DISPOSITION),
        content_type: header_str(headers, header::CONTENT_TYPE),
    };
    debug!(
        url,
        final_url = %info.final_url,
        size = info.total_size,
        ranges = info.accepts_ranges,
        "probe complete"
    );
    info
}
