use std::collections::HashMap;
use std::time::Duration;

use crate::retry::RetryBackoff;

/// Configuration for the [`Engine`](crate::Engine).
///
/// The concurrency budget adapts to reachability: the WAN limit applies on
/// cellular connections, the WiFi limit otherwise.
///
/// # Examples
///
/// ```
/// use courier_engine::EngineConfig;
///
/// let config = EngineConfig::default();
/// assert_eq!(config.wifi_concurrency, 6);
/// assert_eq!(config.wan_concurrency, 2);
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Concurrent executions allowed on WiFi or wired connectivity.
    pub wifi_concurrency: usize,
    /// Concurrent executions allowed on cellular WAN.
    pub wan_concurrency: usize,
    /// Default per-attempt timeout applied to newly built operations.
    pub default_timeout: Duration,
    /// Backoff curve between network-error retries.
    pub backoff: RetryBackoff,
    /// Headers applied to every request unless overridden by an
    /// operation-level header of the same name.
    pub custom_headers: HashMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            wifi_concurrency: 6,
            wan_concurrency: 2,
            default_timeout: Duration::from_secs(180),
            backoff: RetryBackoff::default(),
            custom_headers: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.wifi_concurrency, 6);
        assert_eq!(config.wan_concurrency, 2);
        assert_eq!(config.default_timeout, Duration::from_secs(180));
        assert!(config.custom_headers.is_empty());
    }
}
