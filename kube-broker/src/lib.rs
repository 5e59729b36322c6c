//! Broker for multi-cluster Kubernetes access with per-user impersonation.
//!
//! A tool server that operates against many workload clusters discovers them
//! through a central management cluster, where Cluster API stores one
//! `Cluster` resource and one `<cluster>-kubeconfig` secret per workload
//! cluster. This crate turns a caller identity plus a cluster name into an
//! authenticated [`kube::Client`] that impersonates the caller on the target
//! cluster:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use kube_broker::{Broker, BrokerConfig, RequestContext, UserIdentity};
//! use kube_broker::provider::BearerTokenProvider;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // The management cluster endpoint the broker itself runs against.
//!     let mc_config = kube::Config::incluster()?;
//!     let provider = Arc::new(BearerTokenProvider::new(
//!         mc_config,
//!         50,
//!         100,
//!         std::time::Duration::from_secs(30),
//!     ));
//!     let broker = Broker::new(BrokerConfig::default(), provider, None)?;
//!
//!     // Per request: caller identity from the auth middleware, cluster from
//!     // the tool arguments.
//!     let ctx = RequestContext::new().with_bearer_token("caller-token");
//!     let caller = UserIdentity::new("alice@example.com").with_groups(["customer:acme"]);
//!     let client = broker.client_for(&ctx, &caller, "prod-eu").await?;
//!
//!     // `client` impersonates alice on prod-eu; use it like any kube client.
//!     let _ = client;
//!     Ok(())
//! }
//! ```
//!
//! For more details, see:
//!
//! - [`Broker`] for the entry façade and the lookup→cache→build flow
//! - [`provider`] for how management cluster credentials are sourced
//! - [`Error`] for the error taxonomy and its user-facing sanitization
//! - [`impersonate`](crate::impersonate) for the wire-level impersonation headers

pub mod access;
mod broker;
pub mod cache;
pub mod config;
mod dispatch;
pub mod error;
pub mod groups;
pub mod identity;
pub mod impersonate;
pub mod metrics;
pub mod provider;
pub mod ratelimit;
mod request;
mod resolver;
pub mod sanitize;

pub use crate::{
    access::{AccessCheckRequest, AccessDecision},
    broker::Broker,
    cache::{CacheKey, ClientCache},
    config::{BrokerConfig, CredentialMode},
    error::Error,
    groups::GroupMapper,
    identity::{anonymize, UserIdentity},
    ratelimit::RateLimiterRegistry,
    request::RequestContext,
    sanitize::sanitize_host,
};

/// Convient alias for `Result<T, Error>`
pub type Result<T, E = Error> = std::result::Result<T, E>;
