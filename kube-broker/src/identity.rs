//! Caller identity, structural validation, and the identity anonymizer.
//!
//! A [`UserIdentity`] is created by the upstream auth middleware and treated
//! as read-only here. Its primary identifier doubles as the impersonated user
//! on target clusters, so everything in it is validated structurally before
//! any client is built, and the identifier itself never appears in logs,
//! metric labels, or cache state: [`anonymize`] produces the stable
//! `user:<hex>` form used everywhere instead.
use std::{collections::BTreeMap, fmt, fmt::Write as _, sync::LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Maximum length of the primary identifier.
pub const MAX_USER_LEN: usize = 254;
/// Maximum number of groups on a caller.
pub const MAX_GROUPS: usize = 100;
/// Maximum length of a single group string.
pub const MAX_GROUP_LEN: usize = 256;
/// Maximum number of extra-attribute entries on a caller.
pub const MAX_EXTRA_ENTRIES: usize = 50;
/// Maximum length of an extra-attribute key.
pub const MAX_EXTRA_KEY_LEN: usize = 256;
/// Maximum length of a single extra-attribute value.
pub const MAX_EXTRA_VALUE_LEN: usize = 1024;
/// Maximum length of a cluster name.
pub const MAX_CLUSTER_NAME_LEN: usize = 253;

// Deliberately permissive: one non-empty local part, one non-empty domain
// part. Mail-grade strictness buys nothing here since the identifier is
// asserted by the auth middleware, not parsed as an address.
static ADDRESS_SHAPED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+$").expect("valid regex"));

static EXTRA_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("valid regex"));

static DNS_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?$").expect("valid regex"));

/// Identity of the caller a client is brokered for.
///
/// The primary identifier is what ends up in `Impersonate-User`; groups and
/// extras follow it onto the wire after validation and (for groups) mapping.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserIdentity {
    /// Primary identifier, typically an email-shaped string.
    pub user: String,
    /// Caller-asserted group strings.
    pub groups: Vec<String>,
    /// Extra attributes, key to ordered list of values.
    pub extra: BTreeMap<String, Vec<String>>,
}

impl UserIdentity {
    /// Construct an identity with the given primary identifier.
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            groups: Vec::new(),
            extra: BTreeMap::new(),
        }
    }

    /// Attach group strings.
    #[must_use]
    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    /// Attach one extra-attribute entry.
    #[must_use]
    pub fn with_extra<I, S>(mut self, key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra
            .insert(key.into(), values.into_iter().map(Into::into).collect());
        self
    }

    /// The anonymized form of the primary identifier.
    pub fn user_hash(&self) -> String {
        anonymize(&self.user)
    }
}

// The identifier is PII; logs and assertion failures only ever see the hash.
impl fmt::Debug for UserIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserIdentity")
            .field("user", &self.user_hash())
            .field("groups", &self.groups.len())
            .field("extra", &self.extra.len())
            .finish()
    }
}

/// Deterministic one-way hash of an identifier.
///
/// `"user:" + hex(first 8 bytes of sha256(identifier))`; the empty string maps
/// to the empty string. Used as log field, metric label, rate-limiter key,
/// and cache key component.
///
/// ```
/// use kube_broker::anonymize;
///
/// let hash = anonymize("alice@example.com");
/// assert!(hash.starts_with("user:"));
/// assert_eq!(hash, anonymize("alice@example.com"));
/// assert_ne!(hash, anonymize("bob@example.com"));
/// ```
pub fn anonymize(identifier: &str) -> String {
    if identifier.is_empty() {
        return String::new();
    }
    let digest = Sha256::digest(identifier.as_bytes());
    let mut out = String::with_capacity(5 + 16);
    out.push_str("user:");
    for byte in &digest[..8] {
        write!(out, "{byte:02x}").expect("writing to a String cannot fail");
    }
    out
}

/// Truncated, control-free preview of an offending value for error fields.
pub(crate) fn safe_preview(value: &str) -> String {
    const MAX_PREVIEW: usize = 24;
    let mut out: String = value
        .chars()
        .take(MAX_PREVIEW)
        .map(|c| if c.is_control() { '\u{fffd}' } else { c })
        .collect();
    if value.chars().count() > MAX_PREVIEW {
        out.push_str("...");
    }
    out
}

fn has_control(value: &str) -> bool {
    value.chars().any(char::is_control)
}

fn fail(field: &'static str, value: &str, reason: impl Into<String>) -> Error {
    Error::ValidationFailed {
        field,
        preview: safe_preview(value),
        reason: reason.into(),
    }
}

/// Structurally validate a caller identity.
///
/// Checks the primary identifier (length, control characters, address shape),
/// the groups (count, per-group length, control characters) and the extras
/// (entry count, key charset and length, value length, control characters).
pub fn validate_identity(identity: &UserIdentity) -> Result<()> {
    let user = &identity.user;
    if user.is_empty() {
        return Err(fail("user", user, "must not be empty"));
    }
    if user.len() > MAX_USER_LEN {
        return Err(fail(
            "user",
            user,
            format!("exceeds maximum length of {MAX_USER_LEN}"),
        ));
    }
    if has_control(user) {
        return Err(fail("user", user, "contains control characters"));
    }
    if !ADDRESS_SHAPED.is_match(user) {
        return Err(fail("user", user, "is not an address-shaped identifier"));
    }

    if identity.groups.len() > MAX_GROUPS {
        return Err(fail(
            "groups",
            "",
            format!("more than {MAX_GROUPS} groups"),
        ));
    }
    for group in &identity.groups {
        if group.len() > MAX_GROUP_LEN {
            return Err(fail(
                "groups",
                group,
                format!("group exceeds maximum length of {MAX_GROUP_LEN}"),
            ));
        }
        if has_control(group) {
            return Err(fail("groups", group, "group contains control characters"));
        }
    }

    if identity.extra.len() > MAX_EXTRA_ENTRIES {
        return Err(fail(
            "extras",
            "",
            format!("more than {MAX_EXTRA_ENTRIES} extra entries"),
        ));
    }
    for (key, values) in &identity.extra {
        if key.len() > MAX_EXTRA_KEY_LEN {
            return Err(fail(
                "extras",
                key,
                format!("key exceeds maximum length of {MAX_EXTRA_KEY_LEN}"),
            ));
        }
        if !EXTRA_KEY.is_match(key) {
            return Err(fail(
                "extras",
                key,
                "key must match [A-Za-z0-9_-]+",
            ));
        }
        for value in values {
            if value.len() > MAX_EXTRA_VALUE_LEN {
                return Err(fail(
                    "extras",
                    value,
                    format!("value exceeds maximum length of {MAX_EXTRA_VALUE_LEN}"),
                ));
            }
            if has_control(value) {
                return Err(fail("extras", value, "value contains control characters"));
            }
        }
    }

    Ok(())
}

/// Validate a caller-supplied cluster name.
///
/// Cluster names name Kubernetes objects and become part of a secret name,
/// so anything that is not a lowercase DNS-1123 label is rejected before it
/// reaches the management cluster.
pub fn validate_cluster_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(fail("cluster name", name, "must not be empty"));
    }
    if name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(fail(
            "cluster name",
            name,
            "must not contain path separators or traversal sequences",
        ));
    }
    if name.len() > MAX_CLUSTER_NAME_LEN {
        return Err(fail(
            "cluster name",
            name,
            format!("exceeds maximum length of {MAX_CLUSTER_NAME_LEN}"),
        ));
    }
    if !DNS_LABEL.is_match(name) {
        return Err(fail(
            "cluster name",
            name,
            "must be lowercase alphanumerics and '-', starting and ending alphanumeric",
        ));
    }
    Ok(())
}
