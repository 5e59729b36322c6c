//! Server-identity provider backed by the in-cluster service account.
use std::sync::Arc;

use async_trait::async_trait;
use kube::Client;
use tokio::sync::OnceCell;

use super::{ClientProvider, PrivilegedClientProvider, ProvidedClients};
use crate::{identity::UserIdentity, request::RequestContext, Error, Result};

/// Privileged provider using the broker's own service account.
///
/// Caller-credential requests are delegated to the wrapped provider. The
/// server-scoped client is created lazily on first privileged use, so
/// running the broker outside a cluster does not abort startup; the outcome
/// of that first creation (success or error) is memoized and returned to
/// every subsequent call. Under concurrent first use exactly one
/// initialization runs and the others wait for it.
pub struct ServiceAccountProvider {
    delegate: Arc<dyn ClientProvider>,
    capi_discovery: bool,
    strict: bool,
    privileged: OnceCell<std::result::Result<Client, String>>,
}

impl ServiceAccountProvider {
    /// Wrap a caller provider with lazily initialized server-identity clients.
    ///
    /// `capi_discovery` selects whether discovery also runs with server
    /// credentials (`full-privileged`) or only secret access does; `strict`
    /// forbids caller-credential fallback when the privileged path fails at
    /// runtime.
    pub fn new(delegate: Arc<dyn ClientProvider>, capi_discovery: bool, strict: bool) -> Self {
        Self {
            delegate,
            capi_discovery,
            strict,
            privileged: OnceCell::new(),
        }
    }

    async fn privileged_client(&self) -> Result<Client> {
        let memo = self
            .privileged
            .get_or_init(|| async {
                match kube::Config::incluster() {
                    Ok(config) => Client::try_from(config)
                        .map_err(|e| format!("building the in-cluster client failed: {e}")),
                    Err(e) => Err(format!("in-cluster configuration unavailable: {e}")),
                }
            })
            .await;
        match memo {
            Ok(client) => Ok(client.clone()),
            Err(message) => Err(Error::ConnectionFailed {
                cluster: "management".to_string(),
                host: "<in-cluster>".to_string(),
                source: Some(message.clone().into()),
            }),
        }
    }
}

#[async_trait]
impl ClientProvider for ServiceAccountProvider {
    async fn clients_for(
        &self,
        ctx: &RequestContext,
        caller: &UserIdentity,
    ) -> Result<ProvidedClients> {
        self.delegate.clients_for(ctx, caller).await
    }
}

#[async_trait]
impl PrivilegedClientProvider for ServiceAccountProvider {
    async fn privileged_discovery_client(
        &self,
        _ctx: &RequestContext,
        _caller: &UserIdentity,
    ) -> Result<Client> {
        self.privileged_client().await
    }

    async fn privileged_secret_client(
        &self,
        _ctx: &RequestContext,
        _caller: &UserIdentity,
    ) -> Result<Client> {
        self.privileged_client().await
    }

    fn privileged_capi_discovery(&self) -> bool {
        self.capi_discovery
    }

    fn strict(&self) -> bool {
        self.strict
    }
}
