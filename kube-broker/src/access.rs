//! Access checks against target clusters.
//!
//! A check runs a `SelfSubjectAccessReview` *through the impersonating
//! client*, so the target cluster evaluates exactly the identity the broker
//! would use for the real operation, mapped groups and all.
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use kube::{
    api::{Api, PostParams},
    Client,
};

use crate::{Error, Result};

/// Verbs a check may ask about. Anything else is rejected up front.
pub const ALLOWED_VERBS: [&str; 12] = [
    "get",
    "list",
    "watch",
    "create",
    "update",
    "patch",
    "delete",
    "deletecollection",
    "impersonate",
    "bind",
    "escalate",
    "*",
];

/// What to ask the target cluster about.
///
/// Empty strings mean "unset" for the optional attributes, matching the
/// Kubernetes review API. Deserializable so tool layers can take it as an
/// argument object directly.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AccessCheckRequest {
    /// Verb to check, from [`ALLOWED_VERBS`].
    pub verb: String,
    /// Resource, e.g. `pods`.
    pub resource: String,
    /// API group; empty for the core group.
    pub group: String,
    /// Namespace; empty for cluster-scoped checks.
    pub namespace: String,
    /// Object name; empty to check the resource collection.
    pub name: String,
    /// Subresource, e.g. `log`.
    pub subresource: String,
}

impl AccessCheckRequest {
    /// A verb+resource check with everything else unset.
    pub fn new(verb: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            verb: verb.into(),
            resource: resource.into(),
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if !ALLOWED_VERBS.contains(&self.verb.as_str()) {
            return Err(Error::InvalidAccessCheck {
                reason: format!("verb {:?} is not in the allowed set", self.verb),
            });
        }
        if self.resource.is_empty() {
            return Err(Error::InvalidAccessCheck {
                reason: "resource must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// The target cluster's answer.
#[derive(Clone, Debug, Default)]
pub struct AccessDecision {
    /// The request is allowed.
    pub allowed: bool,
    /// The request is explicitly denied (as opposed to merely not allowed).
    pub denied: bool,
    /// Why, when the authorizer volunteered a reason.
    pub reason: String,
    /// Error text from the authorizer's evaluation, if any.
    pub evaluation_error: String,
}

fn optional(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

/// Run a self-subject access review on the target cluster.
///
/// `client` must be the impersonating client for the caller being checked.
pub async fn check_access(
    client: &Client,
    cluster: &str,
    request: &AccessCheckRequest,
) -> Result<AccessDecision> {
    request.validate()?;

    let review = SelfSubjectAccessReview {
        spec: SelfSubjectAccessReviewSpec {
            resource_attributes: Some(ResourceAttributes {
                verb: Some(request.verb.clone()),
                resource: Some(request.resource.clone()),
                group: optional(&request.group),
                namespace: optional(&request.namespace),
                name: optional(&request.name),
                subresource: optional(&request.subresource),
                ..ResourceAttributes::default()
            }),
            non_resource_attributes: None,
        },
        ..SelfSubjectAccessReview::default()
    };

    let api: Api<SelfSubjectAccessReview> = Api::all(client.clone());
    let response = api
        .create(&PostParams::default(), &review)
        .await
        .map_err(|e| Error::AccessCheckFailed {
            cluster: cluster.to_string(),
            source: e.into(),
        })?;
    let status = response.status.ok_or_else(|| Error::AccessCheckFailed {
        cluster: cluster.to_string(),
        source: "review response carried no status".into(),
    })?;

    Ok(AccessDecision {
        allowed: status.allowed,
        denied: status.denied.unwrap_or(false),
        reason: status.reason.unwrap_or_default(),
        evaluation_error: status.evaluation_error.unwrap_or_default(),
    })
}

/// Like [`check_access`], but maps a negative answer to [`Error::AccessDenied`].
///
/// The authorizer's evaluation error, when present, is preserved in the
/// denial reason.
pub async fn ensure_allowed(
    client: &Client,
    cluster: &str,
    request: &AccessCheckRequest,
) -> Result<AccessDecision> {
    let decision = check_access(client, cluster, request).await?;
    if !decision.allowed {
        let mut reason = decision.reason.clone();
        if !decision.evaluation_error.is_empty() {
            if !reason.is_empty() {
                reason.push_str("; ");
            }
            reason.push_str("evaluation error: ");
            reason.push_str(&decision.evaluation_error);
        }
        return Err(Error::AccessDenied {
            cluster: cluster.to_string(),
            verb: request.verb.clone(),
            resource: request.resource.clone(),
            reason,
        });
    }
    Ok(decision)
}
