//! Credential dispatch: which identity serves each resolver sub-step.
//!
//! The mode is frozen when the broker is constructed and the policy per
//! sub-step is a fixed table:
//!
//! | mode                      | discovery  | secret access |
//! |---------------------------|------------|---------------|
//! | `user`                    | caller     | caller        |
//! | `privileged-secrets-only` | caller     | privileged    |
//! | `full-privileged`         | privileged | privileged    |
//!
//! A privileged sub-step that fails at runtime falls back to the caller's
//! credentials unless strict mode is set, in which case the failure surfaces
//! as [`Error::StrictPrivilegedRequired`]. Privileged secret access is also
//! rate limited per user before the provider is consulted.
use std::sync::Arc;

use kube::Client;

use crate::{
    config::CredentialMode,
    identity::UserIdentity,
    metrics,
    provider::{ClientProvider, PrivilegedClientProvider},
    ratelimit::RateLimiterRegistry,
    request::RequestContext,
    Error, Result,
};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Step {
    Discovery,
    Secret,
}

impl Step {
    fn operation(self) -> &'static str {
        match self {
            Step::Discovery => "capi discovery",
            Step::Secret => "kubeconfig secret access",
        }
    }
}

pub(crate) struct CredentialDispatcher {
    mode: CredentialMode,
    caller: Arc<dyn ClientProvider>,
    privileged: Option<Arc<dyn PrivilegedClientProvider>>,
    limiter: Arc<RateLimiterRegistry>,
}

impl CredentialDispatcher {
    /// Freeze the credential mode from the provider shape.
    pub(crate) fn new(
        caller: Arc<dyn ClientProvider>,
        privileged: Option<Arc<dyn PrivilegedClientProvider>>,
        limiter: Arc<RateLimiterRegistry>,
    ) -> Self {
        let mode = match &privileged {
            None => CredentialMode::User,
            Some(p) if p.privileged_capi_discovery() => CredentialMode::FullPrivileged,
            Some(_) => CredentialMode::PrivilegedSecretsOnly,
        };
        Self {
            mode,
            caller,
            privileged,
            limiter,
        }
    }

    pub(crate) fn mode(&self) -> CredentialMode {
        self.mode
    }

    /// Client for listing CAPI cluster resources.
    pub(crate) async fn discovery_client(
        &self,
        ctx: &RequestContext,
        caller: &UserIdentity,
    ) -> Result<Client> {
        match self.mode {
            CredentialMode::User | CredentialMode::PrivilegedSecretsOnly => {
                self.caller_client(ctx, caller).await
            }
            CredentialMode::FullPrivileged => {
                self.privileged_or_fallback(ctx, caller, Step::Discovery).await
            }
        }
    }

    /// Client for reading the kubeconfig secret.
    pub(crate) async fn secret_client(
        &self,
        ctx: &RequestContext,
        caller: &UserIdentity,
    ) -> Result<Client> {
        match self.mode {
            CredentialMode::User => self.caller_client(ctx, caller).await,
            CredentialMode::PrivilegedSecretsOnly | CredentialMode::FullPrivileged => {
                self.privileged_or_fallback(ctx, caller, Step::Secret).await
            }
        }
    }

    async fn caller_client(&self, ctx: &RequestContext, caller: &UserIdentity) -> Result<Client> {
        Ok(self.caller.clients_for(ctx, caller).await?.client)
    }

    async fn privileged_or_fallback(
        &self,
        ctx: &RequestContext,
        caller: &UserIdentity,
        step: Step,
    ) -> Result<Client> {
        let provider = self
            .privileged
            .as_ref()
            .expect("privileged modes imply a privileged provider");

        if step == Step::Secret && !self.limiter.admit(&caller.user) {
            metrics::record_privileged_access(&caller.user, "rate_limited");
            return Err(Error::RateLimited {
                user_hash: caller.user_hash(),
            });
        }

        let attempt = match step {
            Step::Discovery => provider.privileged_discovery_client(ctx, caller).await,
            Step::Secret => provider.privileged_secret_client(ctx, caller).await,
        };

        match attempt {
            Ok(client) => {
                if step == Step::Secret {
                    metrics::record_privileged_access(&caller.user, "success");
                }
                Ok(client)
            }
            // Rate limiting and an already-strict failure are final either way.
            Err(err @ (Error::RateLimited { .. } | Error::StrictPrivilegedRequired { .. })) => {
                Err(err)
            }
            Err(err) if provider.strict() => {
                if step == Step::Secret {
                    metrics::record_privileged_access(&caller.user, "error");
                }
                Err(Error::StrictPrivilegedRequired {
                    operation: step.operation(),
                    source: Some(err.into()),
                })
            }
            Err(err) => {
                tracing::warn!(
                    user = %caller.user_hash(),
                    operation = step.operation(),
                    error = %err,
                    "privileged client unavailable, falling back to caller credentials"
                );
                if step == Step::Secret {
                    metrics::record_privileged_access(&caller.user, "fallback");
                }
                self.caller_client(ctx, caller).await
            }
        }
    }
}
