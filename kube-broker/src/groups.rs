//! Group mapping from caller-asserted groups to target-cluster groups.
//!
//! Mapping tables come from deployment configuration and are validated once,
//! at broker construction, fail-closed: a table that could ever assert a
//! privileged Kubernetes system group does not produce a mapper at all.
use std::{borrow::Cow, collections::HashMap};

use crate::{Error, Result};

/// Group names that are never valid mapping targets.
///
/// Asserting any of these on a target cluster grants cluster-admin or
/// node-level power regardless of RBAC, so a table naming one is rejected
/// at construction.
pub const DENIED_TARGET_GROUPS: [&str; 5] = [
    "system:masters",
    "system:nodes",
    "system:kube-controller-manager",
    "system:kube-scheduler",
    "system:kube-proxy",
];

/// Default cap on the number of mappings in one table.
pub const DEFAULT_MAX_MAPPINGS: usize = 100;

/// Pure, immutable transformation from caller group strings to
/// target-cluster group strings.
///
/// ```
/// use std::collections::HashMap;
/// use kube_broker::GroupMapper;
///
/// let table = HashMap::from([("customer:GroupA".to_string(), "tenant-a".to_string())]);
/// let mapper = GroupMapper::new(table, 100)?;
///
/// let groups = vec!["customer:GroupA".to_string(), "oidc:viewer".to_string()];
/// let mapped = mapper.map(&groups);
/// assert_eq!(mapped.as_ref(), ["tenant-a".to_string(), "oidc:viewer".to_string()]);
/// # Ok::<(), kube_broker::Error>(())
/// ```
#[derive(Clone, Debug, Default)]
pub struct GroupMapper {
    mappings: HashMap<String, String>,
}

impl GroupMapper {
    /// Build a mapper from a source→target table.
    ///
    /// Fails if any source or target is empty or whitespace-only, contains
    /// control characters, if two sources map to the same target, if a
    /// target is one of [`DENIED_TARGET_GROUPS`], or if the table exceeds
    /// `max_mappings`. Targets that look like `system:*` but are not denied
    /// produce a startup warning and are accepted.
    pub fn new(mappings: HashMap<String, String>, max_mappings: usize) -> Result<Self> {
        if mappings.len() > max_mappings {
            return Err(invalid(
                "",
                format!("mapping table exceeds maximum of {max_mappings} entries"),
            ));
        }

        let mut seen_targets: HashMap<&str, &str> = HashMap::with_capacity(mappings.len());
        for (source, target) in &mappings {
            for (what, value) in [("source", source), ("target", target)] {
                if value.trim().is_empty() {
                    return Err(invalid(value, format!("{what} group must not be empty")));
                }
                if value.chars().any(char::is_control) {
                    return Err(invalid(
                        value,
                        format!("{what} group contains control characters"),
                    ));
                }
            }
            if DENIED_TARGET_GROUPS.contains(&target.as_str()) {
                return Err(invalid(
                    target,
                    format!(
                        "target group {target:?} is denied: mapping to it would allow privilege escalation"
                    ),
                ));
            }
            if target.starts_with("system:") {
                tracing::warn!(target_group = %target, "group mapping targets a system: group");
            }
            if let Some(previous) = seen_targets.insert(target.as_str(), source.as_str()) {
                return Err(invalid(
                    target,
                    format!(
                        "sources {previous:?} and {source:?} both map to target {target:?}"
                    ),
                ));
            }
        }

        Ok(Self { mappings })
    }

    /// Number of mappings in the table.
    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    /// Whether the table is empty (mapping disabled).
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Apply the table to a group list.
    ///
    /// Unmapped groups pass through unchanged. When no input group is mapped
    /// the input slice itself is returned (no allocation); otherwise a new
    /// sequence of the same length is returned. The input is never mutated.
    pub fn map<'a>(&self, groups: &'a [String]) -> Cow<'a, [String]> {
        if !groups.iter().any(|g| self.mappings.contains_key(g)) {
            return Cow::Borrowed(groups);
        }
        Cow::Owned(
            groups
                .iter()
                .map(|g| self.mappings.get(g).unwrap_or(g).clone())
                .collect(),
        )
    }
}

fn invalid(value: &str, reason: String) -> Error {
    Error::ValidationFailed {
        field: "group mapping",
        preview: crate::identity::safe_preview(value),
        reason,
    }
}
