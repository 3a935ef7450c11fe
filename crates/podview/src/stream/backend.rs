//! Backend monitoring endpoints
//!
//! Warmup hints and relay-status queries against the server that relays the
//! camera streams. Both are advisory: failures are reported to the caller,
//! which logs and ignores them.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::Url;
use serde::Deserialize;

use crate::config::network::{CONNECT_TIMEOUT_SECS, MONITOR_TIMEOUT_SECS, READ_TIMEOUT_SECS, USER_AGENT};
use crate::error::{Result, ViewerError};

/// One upstream relay as reported by the server's diagnostics endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RelayInfo {
    #[serde(default)]
    pub clients: u32,
    #[serde(default)]
    pub has_frame: bool,
    #[serde(default)]
    pub running: bool,
}

/// Relay-status response.
///
/// Servers either report a plain count or a map of relays keyed by their
/// upstream URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RelayStatus {
    #[serde(default, alias = "relay_count", alias = "active")]
    pub active_relays: Option<u32>,
    #[serde(default)]
    pub relays: BTreeMap<String, RelayInfo>,
}

impl RelayStatus {
    /// Number of active upstream relays; the explicit count wins
    pub fn active_count(&self) -> u32 {
        self.active_relays.unwrap_or_else(|| {
            self.relays.values().filter(|r| r.running).count() as u32
        })
    }
}

/// HTTP client for stream and monitoring requests, with relative URLs
/// resolved against an optional base
#[derive(Clone)]
pub struct BackendClient {
    inner: reqwest::blocking::Client,
    base_url: Option<Url>,
}

impl BackendClient {
    pub fn new(base_url: Option<&str>) -> Result<Self> {
        let base_url = base_url
            .map(|b| Url::parse(b).map_err(|e| ViewerError::Url(format!("{b}: {e}"))))
            .transpose()?;
        let inner = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(READ_TIMEOUT_SECS))
            .build()?;
        Ok(Self { inner, base_url })
    }

    pub fn base_url(&self) -> Option<&Url> {
        self.base_url.as_ref()
    }

    /// Access the underlying reqwest client
    pub fn inner(&self) -> &reqwest::blocking::Client {
        &self.inner
    }

    /// Turn a possibly relative URL into an absolute one
    pub fn resolve(&self, url: &str) -> Result<Url> {
        if let Ok(abs) = Url::parse(url) {
            return Ok(abs);
        }
        match &self.base_url {
            Some(base) => base
                .join(url)
                .map_err(|e| ViewerError::Url(format!("{url}: {e}"))),
            None => Err(ViewerError::Url(format!(
                "{url}: relative URL needs a base URL"
            ))),
        }
    }

    /// GET the warmup endpoint with `params` forwarded as query parameters.
    /// Only the status is checked; the body is ignored.
    pub fn warmup(&self, url: &str, params: &[(String, String)]) -> Result<()> {
        let mut target = self.resolve(url)?;
        if !params.is_empty() {
            let mut query = target.query_pairs_mut();
            for (k, v) in params {
                query.append_pair(k, v);
            }
        }
        let resp = self
            .inner
            .get(target)
            .timeout(Duration::from_secs(MONITOR_TIMEOUT_SECS))
            .send()?;
        if !resp.status().is_success() {
            return Err(ViewerError::Http(resp.status()));
        }
        Ok(())
    }

    /// Query the relay-status endpoint
    pub fn relay_status(&self, url: &str) -> Result<RelayStatus> {
        let target = self.resolve(url)?;
        let resp = self
            .inner
            .get(target)
            .timeout(Duration::from_secs(MONITOR_TIMEOUT_SECS))
            .send()?;
        if !resp.status().is_success() {
            return Err(ViewerError::Http(resp.status()));
        }
        let status = resp.json::<RelayStatus>()?;
        Ok(status)
    }
}

/// Query parameters of `url`, for forwarding to the warmup endpoint
pub fn query_params(url: &Url) -> Vec<(String, String)> {
    url.query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::test_server;

    // --- RelayStatus ---

    #[test]
    fn relay_status_plain_count() {
        let status: RelayStatus = serde_json::from_str(r#"{"active_relays": 3}"#).unwrap();
        assert_eq!(status.active_count(), 3);
    }

    #[test]
    fn relay_status_aliases() {
        let a: RelayStatus = serde_json::from_str(r#"{"relay_count": 2}"#).unwrap();
        let b: RelayStatus = serde_json::from_str(r#"{"active": 0}"#).unwrap();
        assert_eq!(a.active_count(), 2);
        assert_eq!(b.active_count(), 0);
    }

    #[test]
    fn relay_status_map_counts_running() {
        let json = r#"{
            "status": "running",
            "relays": {
                "http://cam1/stream": {"clients": 2, "has_frame": true, "running": true},
                "http://cam2/stream": {"clients": 0, "has_frame": false, "running": false}
            }
        }"#;
        let status: RelayStatus = serde_json::from_str(json).unwrap();
        assert_eq!(status.relays.len(), 2);
        assert_eq!(status.active_count(), 1);
    }

    #[test]
    fn relay_status_empty_object_is_zero() {
        let status: RelayStatus = serde_json::from_str("{}").unwrap();
        assert_eq!(status.active_count(), 0);
    }

    // --- URL handling ---

    #[test]
    fn resolve_relative_against_base() {
        let client = BackendClient::new(Some("http://pods.local:8080/app/")).unwrap();
        let url = client.resolve("/podsinspace/warmup").unwrap();
        assert_eq!(url.as_str(), "http://pods.local:8080/podsinspace/warmup");
        let url = client.resolve("feed?x=1").unwrap();
        assert_eq!(url.as_str(), "http://pods.local:8080/app/feed?x=1");
    }

    #[test]
    fn resolve_absolute_ignores_base() {
        let client = BackendClient::new(Some("http://pods.local/")).unwrap();
        let url = client.resolve("http://cam/stream").unwrap();
        assert_eq!(url.as_str(), "http://cam/stream");
    }

    #[test]
    fn resolve_relative_without_base_fails() {
        let client = BackendClient::new(None).unwrap();
        assert!(matches!(client.resolve("/feed"), Err(ViewerError::Url(_))));
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        assert!(matches!(BackendClient::new(Some("not a url")), Err(ViewerError::Url(_))));
    }

    #[test]
    fn query_params_are_extracted() {
        let url = Url::parse("http://h/feed?camera=2&size=hd").unwrap();
        assert_eq!(
            query_params(&url),
            vec![
                ("camera".to_string(), "2".to_string()),
                ("size".to_string(), "hd".to_string())
            ]
        );
    }

    // --- HTTP ---

    #[test]
    fn relay_status_over_http() {
        let server = test_server::serve_once(
            "200 OK",
            "application/json",
            br#"{"active_relays": 0}"#.to_vec(),
        );
        let client = BackendClient::new(Some(&server.base_url)).unwrap();
        let status = client.relay_status("/relay_status").unwrap();
        assert_eq!(status.active_count(), 0);
        assert!(server.request_line().starts_with("GET /relay_status "));
    }

    #[test]
    fn warmup_forwards_params() {
        let server = test_server::serve_once("200 OK", "text/plain", b"ok".to_vec());
        let client = BackendClient::new(Some(&server.base_url)).unwrap();
        let params = vec![("camera".to_string(), "2".to_string())];
        client.warmup("/warmup", &params).unwrap();
        assert!(server
            .request_line()
            .starts_with("GET /warmup?camera=2 "));
    }

    #[test]
    fn warmup_reports_http_errors() {
        let server = test_server::serve_once("503 Service Unavailable", "text/plain", Vec::new());
        let client = BackendClient::new(Some(&server.base_url)).unwrap();
        let result = client.warmup("/warmup", &[]);
        assert!(matches!(result, Err(ViewerError::Http(s)) if s.as_u16() == 503));
    }
}
