//! Client providers: how the broker obtains management cluster clients.
//!
//! A [`ClientProvider`] vends per-caller clients for the management cluster
//! using the caller's own bearer token. A [`PrivilegedClientProvider`]
//! additionally vends clients bound to the server's own identity for the two
//! privileged sub-steps (CAPI discovery and kubeconfig secret access); which
//! of those sub-steps actually runs privileged is decided by the broker's
//! credential mode, not by the provider.
use async_trait::async_trait;
use kube::{Client, Config};
use secrecy::SecretString;

use crate::{identity::UserIdentity, request::RequestContext, Result};

mod bearer;
mod service_account;

pub use bearer::BearerTokenProvider;
pub use service_account::ServiceAccountProvider;

/// Caller-extras key a bearer token may arrive under when the transport has
/// no request context of its own. The impersonation builder strips this key;
/// it is a credential, not an audit attribute.
pub const EXTRA_KEY_BEARER_TOKEN: &str = "bearer-token";

/// A management cluster client together with the configuration it was built
/// from. One kube [`Client`] serves both typed and dynamic API access.
#[derive(Clone)]
pub struct ProvidedClients {
    /// The authenticated client.
    pub client: Client,
    /// The configuration the client was built from (host, trust anchor,
    /// credential). Needed when a derived client has to be constructed.
    pub config: Config,
}

/// Vends per-caller clients for the management cluster.
#[async_trait]
pub trait ClientProvider: Send + Sync {
    /// Produce a client authenticated as the caller.
    async fn clients_for(
        &self,
        ctx: &RequestContext,
        caller: &UserIdentity,
    ) -> Result<ProvidedClients>;
}

/// Extends [`ClientProvider`] with server-identity clients for the
/// privileged sub-steps.
#[async_trait]
pub trait PrivilegedClientProvider: ClientProvider {
    /// Server-identity client for CAPI cluster discovery.
    async fn privileged_discovery_client(
        &self,
        ctx: &RequestContext,
        caller: &UserIdentity,
    ) -> Result<Client>;

    /// Server-identity client for kubeconfig secret access.
    async fn privileged_secret_client(
        &self,
        ctx: &RequestContext,
        caller: &UserIdentity,
    ) -> Result<Client>;

    /// Whether this provider's deployment uses server credentials for CAPI
    /// discovery too (`full-privileged`) or only for secrets.
    fn privileged_capi_discovery(&self) -> bool;

    /// Whether runtime failures of the privileged path must surface instead
    /// of falling back to caller credentials.
    fn strict(&self) -> bool;
}

/// Extract the caller's bearer token: request context wins, the caller-extras
/// field is the fallback.
pub(crate) fn bearer_token(ctx: &RequestContext, caller: &UserIdentity) -> Option<SecretString> {
    if let Some(token) = ctx.bearer_token() {
        return Some(token.clone());
    }
    caller
        .extra
        .get(EXTRA_KEY_BEARER_TOKEN)
        .and_then(|values| values.first())
        .map(|token| SecretString::from(token.clone()))
}

/// Provider returning one fixed client regardless of caller.
///
/// Useful for tests and for deployments where impersonation is the sole
/// authorization mechanism and every caller shares the broker's connection.
#[derive(Clone)]
pub struct StaticClientProvider {
    clients: ProvidedClients,
}

impl StaticClientProvider {
    /// Wrap a fixed client/config pair.
    pub fn new(client: Client, config: Config) -> Self {
        Self {
            clients: ProvidedClients { client, config },
        }
    }
}

#[async_trait]
impl ClientProvider for StaticClientProvider {
    async fn clients_for(
        &self,
        _ctx: &RequestContext,
        _caller: &UserIdentity,
    ) -> Result<ProvidedClients> {
        Ok(self.clients.clone())
    }
}
