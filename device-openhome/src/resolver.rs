//! DUT identifier resolution for OpenHome renderers
//!
//! Identifiers are either a full base URL (`http://10.0.0.12:55178/`) or a
//! bare `host[:port]`, which is taken to be plain HTTP.

use async_trait::async_trait;
use bridge_traits::{BridgeError, DeviceControl, DeviceResolver, DeviceRole, HttpClient};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::device::{OpenHomeDevice, DEFAULT_PATH_TEMPLATE};
use crate::error::{OpenHomeError, Result};

pub struct OpenHomeResolver {
    http: Arc<dyn HttpClient>,
    path_template: String,
    timeout: Option<Duration>,
}

impl OpenHomeResolver {
    pub fn new(http: Arc<dyn HttpClient>) -> Self {
        Self {
            http,
            path_template: DEFAULT_PATH_TEMPLATE.to_string(),
            timeout: None,
        }
    }

    /// Control URL layout, `{service}` is replaced by the service name.
    pub fn with_path_template(mut self, template: impl Into<String>) -> Self {
        self.path_template = template.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Parse a DUT identifier into the device base URL.
pub fn parse_address(identifier: &str) -> Result<Url> {
    let trimmed = identifier.trim();
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{}/", trimmed)
    };

    let url = Url::parse(&candidate)
        .map_err(|e| OpenHomeError::InvalidAddress(format!("{}: {}", identifier, e)))?;

    match (url.scheme(), url.host_str()) {
        ("http" | "https", Some(host)) if !host.is_empty() => Ok(url),
        _ => Err(OpenHomeError::InvalidAddress(identifier.to_string())),
    }
}

#[async_trait]
impl DeviceResolver for OpenHomeResolver {
    async fn resolve(
        &self,
        identifier: &str,
        role: DeviceRole,
    ) -> bridge_traits::Result<Arc<dyn DeviceControl>> {
        let base = parse_address(identifier).map_err(BridgeError::from)?;
        debug!(%identifier, %role, base = %base, "Resolved OpenHome device");

        let mut device = OpenHomeDevice::new(identifier.trim(), base, self.http.clone())
            .with_path_template(self.path_template.clone());
        if let Some(timeout) = self.timeout {
            device = device.with_timeout(timeout);
        }
        Ok(Arc::new(device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        let url = parse_address("10.0.0.12:55178").unwrap();
        assert_eq!(url.as_str(), "http://10.0.0.12:55178/");

        let url = parse_address("https://renderer.local/dev/").unwrap();
        assert_eq!(url.host_str(), Some("renderer.local"));

        assert!(matches!(
            parse_address("ftp://renderer.local"),
            Err(OpenHomeError::InvalidAddress(_))
        ));
        assert!(parse_address("not a host").is_err());
    }
}
