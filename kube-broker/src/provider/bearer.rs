//! Per-caller clients from forwarded bearer tokens.
use std::time::Duration;

use async_trait::async_trait;
use kube::{client::ClientBuilder, config::AuthInfo, Config};
use tower::limit::RateLimitLayer;

use super::{bearer_token, ClientProvider, ProvidedClients};
use crate::{
    config::BrokerConfig, identity::UserIdentity, request::RequestContext,
    sanitize::sanitize_host, Error, Result,
};

/// Builds a management cluster client per caller from the caller's bearer
/// token (as extracted by the upstream OAuth middleware).
///
/// The base configuration supplies host and trust anchor; the caller's token
/// replaces whatever credential the base carried. Client-side QPS/burst are
/// enforced with a [`RateLimitLayer`] in the request stack.
pub struct BearerTokenProvider {
    base_config: Config,
    qps: u32,
    burst: u32,
    timeout: Duration,
}

impl BearerTokenProvider {
    /// Create a provider over the management cluster base configuration.
    ///
    /// `qps` of zero disables client-side rate limiting.
    pub fn new(base_config: Config, qps: u32, burst: u32, timeout: Duration) -> Self {
        Self {
            base_config,
            qps,
            burst,
            timeout,
        }
    }

    /// Create a provider using the client tunables of a [`BrokerConfig`].
    pub fn from_broker_config(base_config: Config, config: &BrokerConfig) -> Self {
        Self::new(
            base_config,
            config.client_qps,
            config.client_burst,
            config.client_timeout,
        )
    }

    fn build_error(&self, err: kube::Error) -> Error {
        Error::ConnectionFailed {
            cluster: "management".to_string(),
            host: sanitize_host(&self.base_config.cluster_url.to_string()),
            source: Some(err.into()),
        }
    }
}

#[async_trait]
impl ClientProvider for BearerTokenProvider {
    async fn clients_for(
        &self,
        ctx: &RequestContext,
        caller: &UserIdentity,
    ) -> Result<ProvidedClients> {
        let token = bearer_token(ctx, caller).ok_or_else(|| Error::ValidationFailed {
            field: "bearer token",
            preview: String::new(),
            reason: "no bearer token in request context or caller extras".to_string(),
        })?;

        let mut config = self.base_config.clone();
        config.auth_info = AuthInfo {
            token: Some(token),
            ..AuthInfo::default()
        };
        config.connect_timeout = Some(self.timeout);
        config.read_timeout = Some(self.timeout);

        let builder =
            ClientBuilder::try_from(config.clone()).map_err(|e| self.build_error(e))?;
        let client = if self.qps > 0 {
            let burst = self.burst.max(1);
            // A burst of requests is admitted per refill window.
            let window = Duration::from_secs_f64(f64::from(burst) / f64::from(self.qps));
            builder
                .with_layer(&RateLimitLayer::new(u64::from(burst), window))
                .build()
        } else {
            builder.build()
        };

        Ok(ProvidedClients { client, config })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Uri;

    trait UnwrapErrAny<E> {
        fn unwrap_err_any(self) -> E;
    }

    impl<T, E> UnwrapErrAny<E> for std::result::Result<T, E> {
        fn unwrap_err_any(self) -> E {
            match self {
                Ok(_) => panic!("expected Err, got Ok"),
                Err(e) => e,
            }
        }
    }

    fn provider() -> BearerTokenProvider {
        let mut config = Config::new(Uri::from_static("https://mc.example.com:6443"));
        // No trust anchor in unit tests; nothing here ever connects.
        config.accept_invalid_certs = true;
        BearerTokenProvider::new(config, 50, 100, Duration::from_secs(30))
    }

    #[tokio::test]
    async fn missing_token_is_a_validation_failure() {
        let err = provider()
            .clients_for(&RequestContext::new(), &UserIdentity::new("alice@example.com"))
            .await
            .unwrap_err_any();
        assert!(err.is_validation_failed());
        assert_eq!(err.user_message(), "invalid bearer token provided");
    }

    #[tokio::test]
    async fn token_replaces_the_base_credential() {
        let ctx = RequestContext::new().with_bearer_token("caller-token");
        let provided = provider()
            .clients_for(&ctx, &UserIdentity::new("alice@example.com"))
            .await
            .unwrap();
        assert!(provided.config.auth_info.token.is_some());
        assert_eq!(provided.config.connect_timeout, Some(Duration::from_secs(30)));
    }
}
