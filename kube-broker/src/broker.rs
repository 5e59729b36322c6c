//! The broker façade: cluster name + caller identity in, impersonating
//! client out.
//!
//! Per request the flow is validate → cache lookup → on miss: resolve the
//! cluster's base configuration through the credential dispatcher → wrap it
//! with the caller's impersonation block → insert into the cache → return.
//! Concurrent misses for the same key race independently; the last insert
//! wins, which costs a duplicate construction but never violates isolation
//! since the key carries the user hash.
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use kube::{Client, Config};

use crate::{
    access::{self, AccessCheckRequest, AccessDecision},
    cache::{CacheKey, ClientCache},
    config::{BrokerConfig, CredentialMode},
    dispatch::CredentialDispatcher,
    groups::GroupMapper,
    identity::{anonymize, validate_cluster_name, validate_identity, UserIdentity},
    impersonate::impersonated_client,
    provider::{ClientProvider, PrivilegedClientProvider},
    ratelimit::RateLimiterRegistry,
    request::RequestContext,
    resolver::KubeconfigResolver,
    Error, Result,
};

/// Brokers authenticated, impersonating clients for workload clusters
/// discovered through the management cluster.
pub struct Broker {
    dispatcher: Arc<CredentialDispatcher>,
    resolver: KubeconfigResolver,
    cache: ClientCache<Client>,
    limiter: Arc<RateLimiterRegistry>,
    mapper: Option<GroupMapper>,
    closed: AtomicBool,
}

impl Broker {
    /// Build a broker.
    ///
    /// The credential mode is frozen here from the provider shape: no
    /// privileged provider means `user` mode, otherwise the provider's
    /// `privileged_capi_discovery` answer selects `full-privileged` or
    /// `privileged-secrets-only`. A group mapping table that could assert a
    /// denied system group fails construction; no broker is returned.
    ///
    /// Must be called from within a tokio runtime (the rate limiter spawns
    /// its reaper task).
    pub fn new(
        config: BrokerConfig,
        caller_provider: Arc<dyn ClientProvider>,
        privileged_provider: Option<Arc<dyn PrivilegedClientProvider>>,
    ) -> Result<Self> {
        let mapper = if config.group_mappings.is_empty() {
            None
        } else {
            Some(GroupMapper::new(
                config.group_mappings.clone(),
                config.max_group_mappings,
            )?)
        };

        let limiter = RateLimiterRegistry::new(
            config.rate_limit_per_second,
            config.rate_limit_burst,
            config.rate_cleanup_interval,
            config.rate_idle_expiry,
        );
        let strict = config.strict_privileged;
        if let Some(p) = &privileged_provider {
            // The provider's own answer wins at dispatch time; a mismatch
            // with the configured flag is a deployment bug worth surfacing.
            if p.strict() != strict {
                tracing::warn!(
                    configured = strict,
                    provider = p.strict(),
                    "strict mode setting differs between configuration and provider"
                );
            }
        }
        let dispatcher = Arc::new(CredentialDispatcher::new(
            caller_provider,
            privileged_provider,
            limiter.clone(),
        ));
        let resolver = KubeconfigResolver::new(
            dispatcher.clone(),
            config.validation_timeout,
            config.ca_configmap_suffix.clone(),
        );
        let cache = ClientCache::new(config.cache_ttl, config.cache_max_entries);

        tracing::info!(
            mode = %dispatcher.mode(),
            strict,
            cache_ttl = ?config.cache_ttl,
            "cluster client broker initialized"
        );
        Ok(Self {
            dispatcher,
            resolver,
            cache,
            limiter,
            mapper,
            closed: AtomicBool::new(false),
        })
    }

    /// The frozen credential mode.
    pub fn credential_mode(&self) -> CredentialMode {
        self.dispatcher.mode()
    }

    /// An impersonating client for the caller on the named cluster.
    ///
    /// Served from the per-(cluster, user) cache when possible.
    pub async fn client_for(
        &self,
        ctx: &RequestContext,
        caller: &UserIdentity,
        cluster: &str,
    ) -> Result<Client> {
        self.ensure_open()?;
        validate_identity(caller)?;
        validate_cluster_name(cluster)?;

        let key = CacheKey::new(cluster, caller.user_hash());
        if let Some(client) = self.cache.get(&key) {
            return Ok(client);
        }

        let base = self.resolver.resolve(ctx, caller, cluster).await?;
        let client = impersonated_client(&base, cluster, caller, self.mapper.as_ref(), ctx.trace_id())?;
        self.cache.put(key, client.clone());
        Ok(client)
    }

    /// Like [`client_for`](Self::client_for), but probes the target API
    /// server's `/healthz` before handing the client out. Cache hits skip
    /// the probe.
    pub async fn validated_client_for(
        &self,
        ctx: &RequestContext,
        caller: &UserIdentity,
        cluster: &str,
    ) -> Result<Client> {
        self.ensure_open()?;
        validate_identity(caller)?;
        validate_cluster_name(cluster)?;

        let key = CacheKey::new(cluster, caller.user_hash());
        if let Some(client) = self.cache.get(&key) {
            return Ok(client);
        }

        let base = self.resolver.resolve_validated(ctx, caller, cluster).await?;
        let client = impersonated_client(&base, cluster, caller, self.mapper.as_ref(), ctx.trace_id())?;
        self.cache.put(key, client.clone());
        Ok(client)
    }

    /// A passthrough configuration for SSO deployments: the published CA as
    /// trust anchor and the caller's own bearer token as credential. Not
    /// cached; the credential is request-scoped.
    pub async fn sso_config_for(
        &self,
        ctx: &RequestContext,
        caller: &UserIdentity,
        cluster: &str,
    ) -> Result<Config> {
        self.ensure_open()?;
        self.resolver.resolve_sso(ctx, caller, cluster).await
    }

    /// Ask the target cluster whether the caller may perform an operation.
    pub async fn check_access(
        &self,
        ctx: &RequestContext,
        caller: &UserIdentity,
        cluster: &str,
        request: &AccessCheckRequest,
    ) -> Result<AccessDecision> {
        let client = self.client_for(ctx, caller, cluster).await?;
        access::check_access(&client, cluster, request).await
    }

    /// Like [`check_access`](Self::check_access), failing with
    /// [`Error::AccessDenied`] on a negative answer.
    pub async fn ensure_access(
        &self,
        ctx: &RequestContext,
        caller: &UserIdentity,
        cluster: &str,
        request: &AccessCheckRequest,
    ) -> Result<AccessDecision> {
        let client = self.client_for(ctx, caller, cluster).await?;
        access::ensure_allowed(&client, cluster, request).await
    }

    /// Drop one cached client. Returns whether it existed.
    pub fn invalidate_client(&self, cluster: &str, user: &str) -> bool {
        self.cache.invalidate(&CacheKey::new(cluster, anonymize(user)))
    }

    /// Drop every cached client for a cluster (credential rotation).
    /// Returns the number of dropped entries.
    pub fn invalidate_cluster(&self, cluster: &str) -> usize {
        self.cache.invalidate_cluster(cluster)
    }

    /// Number of currently cached clients.
    pub fn cached_clients(&self) -> usize {
        self.cache.len()
    }

    /// Close the broker: further operations fail with
    /// [`Error::BrokerClosed`], background workers are signalled and waited
    /// for. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::info!("cluster client broker shutting down");
        }
        self.limiter.shutdown().await;
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::BrokerClosed);
        }
        Ok(())
    }
}
