//! Broker configuration.
//!
//! All tunables of the broker live here as one plain struct with defaults,
//! so embedding servers construct it directly or from their own config
//! layer. The option set is closed; anything not listed is not configurable.
use std::{collections::HashMap, fmt, time::Duration};

use crate::{groups, Error, Result};

/// How the broker credentials the two discovery/secret sub-steps.
///
/// Fixed at broker construction from the shape of the providers passed in;
/// see [`Broker::new`](crate::Broker::new).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialMode {
    /// Caller credentials for both CAPI discovery and secret access.
    User,
    /// Caller credentials for discovery, server credentials for secret access.
    PrivilegedSecretsOnly,
    /// Server credentials for both.
    FullPrivileged,
}

impl fmt::Display for CredentialMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CredentialMode::User => "user",
            CredentialMode::PrivilegedSecretsOnly => "privileged-secrets-only",
            CredentialMode::FullPrivileged => "full-privileged",
        };
        f.write_str(s)
    }
}

/// Tunables for a [`Broker`](crate::Broker).
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Lifetime of a cached client. Must not exceed the lifetime of the
    /// bearer tokens baked into the cached clients.
    pub cache_ttl: Duration,
    /// Maximum number of cached clients before LRU eviction.
    pub cache_max_entries: usize,
    /// Deadline for the optional connection health check.
    pub validation_timeout: Duration,
    /// Source→target group mapping table. Empty disables mapping.
    pub group_mappings: HashMap<String, String>,
    /// Cap on the mapping table size.
    pub max_group_mappings: usize,
    /// Privileged-access token refill rate per user, tokens per second.
    pub rate_limit_per_second: f64,
    /// Privileged-access burst ceiling per user.
    pub rate_limit_burst: u32,
    /// How often idle rate-limiter entries are reaped.
    pub rate_cleanup_interval: Duration,
    /// How long a rate-limiter entry may idle before it is reaped.
    pub rate_idle_expiry: Duration,
    /// Refuse caller-credential fallback when the privileged path fails.
    pub strict_privileged: bool,
    /// Suffix of the per-cluster CA ConfigMap for SSO passthrough
    /// deployments. `None` disables the passthrough resolution path.
    pub ca_configmap_suffix: Option<String>,
    /// Requests per second budget for per-caller management cluster clients.
    /// Zero disables client-side rate limiting.
    pub client_qps: u32,
    /// Burst budget for per-caller management cluster clients.
    pub client_burst: u32,
    /// Connect/read timeout for per-caller management cluster clients.
    pub client_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(600),
            cache_max_entries: 1000,
            validation_timeout: Duration::from_secs(10),
            group_mappings: HashMap::new(),
            max_group_mappings: groups::DEFAULT_MAX_MAPPINGS,
            rate_limit_per_second: 10.0,
            rate_limit_burst: 20,
            rate_cleanup_interval: Duration::from_secs(300),
            rate_idle_expiry: Duration::from_secs(600),
            strict_privileged: false,
            ca_configmap_suffix: None,
            client_qps: 50,
            client_burst: 100,
            client_timeout: Duration::from_secs(30),
        }
    }
}

impl BrokerConfig {
    /// Replace the group mapping table with one parsed from a JSON object
    /// string (`{"source": "target", ...}`), the form it usually arrives in
    /// from a flag or environment variable.
    pub fn with_group_mappings_json(mut self, json: &str) -> Result<Self> {
        let mappings: HashMap<String, String> =
            serde_json::from_str(json).map_err(|e| Error::ValidationFailed {
                field: "group mapping",
                preview: crate::identity::safe_preview(json),
                reason: format!("not a JSON object of strings: {e}"),
            })?;
        self.group_mappings = mappings;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = BrokerConfig::default();
        assert_eq!(cfg.cache_ttl, Duration::from_secs(600));
        assert_eq!(cfg.validation_timeout, Duration::from_secs(10));
        assert_eq!(cfg.rate_limit_per_second, 10.0);
        assert_eq!(cfg.rate_limit_burst, 20);
        assert_eq!(cfg.rate_cleanup_interval, Duration::from_secs(300));
        assert_eq!(cfg.rate_idle_expiry, Duration::from_secs(600));
        assert!(!cfg.strict_privileged);
    }

    #[test]
    fn group_mappings_parse_from_json() {
        let cfg = BrokerConfig::default()
            .with_group_mappings_json(r#"{"customer:GroupA": "tenant-a"}"#)
            .unwrap();
        assert_eq!(cfg.group_mappings["customer:GroupA"], "tenant-a");
    }

    #[test]
    fn malformed_mapping_json_is_a_validation_failure() {
        let err = BrokerConfig::default()
            .with_group_mappings_json("not json")
            .unwrap_err();
        assert!(err.is_validation_failed());
    }

    #[test]
    fn credential_modes_render_their_wire_names() {
        assert_eq!(CredentialMode::User.to_string(), "user");
        assert_eq!(
            CredentialMode::PrivilegedSecretsOnly.to_string(),
            "privileged-secrets-only"
        );
        assert_eq!(CredentialMode::FullPrivileged.to_string(), "full-privileged");
    }
}
