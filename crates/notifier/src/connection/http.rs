//! Pooled HTTP client shared by every HTTP provider dispatcher.

use std::time::Duration;

use pushgate_common::config::HttpConfig;

use crate::error::DispatchError;

const USER_AGENT: &str = concat!("pushgate/", env!("CARGO_PKG_VERSION"));

/// Build the keep-alive client. Connect and request timeouts bound every call
/// so a dead peer never blocks a worker indefinitely.
pub fn build_client(config: &HttpConfig) -> Result<reqwest::Client, DispatchError> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(config.connect_timeout)
        .timeout(config.read_timeout)
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(16)
        .tcp_keepalive(Duration::from_secs(60))
        .build()
        .map_err(|e| DispatchError::Configuration(format!("Failed to build HTTP client: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_client() {
        assert!(build_client(&HttpConfig::default()).is_ok());
    }
}
