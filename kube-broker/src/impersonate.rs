//! Impersonation: deriving a caller-scoped client from a base configuration.
//!
//! Impersonation is expressed as a family of HTTP headers on every outbound
//! request to the target cluster. The headers are computed once per client
//! from the validated caller identity and injected by a [`tower`] layer
//! wrapped around the kube client stack, so nothing request-scoped can
//! change them afterwards.
//!
//! Composition order is load-bearing: caller-supplied extras are written
//! first and the fixed entries last, so a malicious caller claim can never
//! replace the `agent` audit marker.
use std::{borrow::Cow, sync::Arc};

use http::{header::HeaderName, HeaderValue, Request};
use kube::{client::ClientBuilder, Client, Config};
use tower::{Layer, Service};

use crate::{groups::GroupMapper, identity::UserIdentity, provider, Error, Result};

/// Fixed product identifier, always present as the `agent` impersonation extra.
pub const PRODUCT_IDENTIFIER: &str = "mcp-kubernetes";

/// Extra key carrying the product identifier.
pub const EXTRA_KEY_AGENT: &str = "agent";
/// Extra key carrying the trace correlator.
pub const EXTRA_KEY_TRACE_ID: &str = "trace-id";
/// Extra key preserving pre-mapping groups for the target's audit log.
pub const EXTRA_KEY_ORIGINAL_GROUPS: &str = "mcp.giantswarm.io/original-groups";

const IMPERSONATE_USER: HeaderName = HeaderName::from_static("impersonate-user");
const IMPERSONATE_GROUP: HeaderName = HeaderName::from_static("impersonate-group");
const IMPERSONATE_EXTRA_PREFIX: &str = "impersonate-extra-";

/// Percent-encode an extra key for use in a header name.
///
/// Mirrors the Kubernetes convention (Go's `url.PathEscape`) of keeping only
/// unreserved bytes, so `mcp.giantswarm.io/original-groups` becomes
/// `mcp.giantswarm.io%2Foriginal-groups`.
fn encode_extra_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for &byte in key.as_bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char);
            }
            _ => {
                out.push('%');
                out.push_str(&format!("{byte:02X}"));
            }
        }
    }
    out
}

fn bad_header(user_hash: &str, cluster: &str, what: &str) -> Error {
    Error::ImpersonationFailed {
        user_hash: user_hash.to_string(),
        cluster: cluster.to_string(),
        reason: format!("{what} is not encodable as an HTTP header"),
        source: None,
    }
}

/// Compute the impersonation header block for a caller.
///
/// Headers appear in the order the target cluster audits them: user, mapped
/// groups (input order), then extras with caller-supplied entries first and
/// the fixed `agent` / `trace-id` entries written last so they win over any
/// caller-supplied value for the same key. When the mapper changed any
/// group, the original groups are preserved under
/// [`EXTRA_KEY_ORIGINAL_GROUPS`]. The caller extra carrying the bearer token
/// is a credential, not an audit attribute, and is never forwarded.
///
/// # Panics
///
/// Panics when `caller` is `None`. A base configuration holds cluster-admin
/// credentials; silently returning it without an impersonation block would
/// hand the caller admin access, so a missing identity here is a programmer
/// error and aborts loudly.
pub fn impersonation_headers(
    caller: Option<&UserIdentity>,
    cluster: &str,
    mapper: Option<&GroupMapper>,
    trace_id: Option<&str>,
) -> Result<Vec<(HeaderName, HeaderValue)>> {
    let Some(caller) = caller else {
        panic!(
            "refusing to build an unimpersonated client for cluster {cluster}: \
             no caller identity was provided"
        );
    };
    let user_hash = caller.user_hash();

    let mut headers = Vec::with_capacity(2 + caller.groups.len() + caller.extra.len());
    headers.push((
        IMPERSONATE_USER,
        HeaderValue::from_str(&caller.user)
            .map_err(|_| bad_header(&user_hash, cluster, "user identifier"))?,
    ));

    let mapped = match mapper {
        Some(mapper) => mapper.map(&caller.groups),
        None => Cow::Borrowed(caller.groups.as_slice()),
    };
    for group in mapped.iter() {
        headers.push((
            IMPERSONATE_GROUP,
            HeaderValue::from_str(group).map_err(|_| bad_header(&user_hash, cluster, "group"))?,
        ));
    }

    // Caller extras first, fixed entries last: later inserts win.
    let mut extras = caller.extra.clone();
    extras.remove(provider::EXTRA_KEY_BEARER_TOKEN);
    if mapped.as_ref() != caller.groups.as_slice() {
        extras.insert(EXTRA_KEY_ORIGINAL_GROUPS.to_string(), caller.groups.clone());
    }
    extras.insert(
        EXTRA_KEY_AGENT.to_string(),
        vec![PRODUCT_IDENTIFIER.to_string()],
    );
    if let Some(trace) = trace_id.filter(|t| !t.is_empty()) {
        extras.insert(EXTRA_KEY_TRACE_ID.to_string(), vec![trace.to_string()]);
    }

    for (key, values) in &extras {
        let name = HeaderName::from_bytes(
            format!("{IMPERSONATE_EXTRA_PREFIX}{}", encode_extra_key(key)).as_bytes(),
        )
        .map_err(|_| bad_header(&user_hash, cluster, "extra key"))?;
        for value in values {
            headers.push((
                name.clone(),
                HeaderValue::from_str(value)
                    .map_err(|_| bad_header(&user_hash, cluster, "extra value"))?,
            ));
        }
    }

    Ok(headers)
}

/// Layer that stamps a fixed impersonation header block onto each request.
#[derive(Clone)]
pub struct ImpersonationLayer {
    headers: Arc<Vec<(HeaderName, HeaderValue)>>,
}

impl ImpersonationLayer {
    /// Wrap a precomputed header block from [`impersonation_headers`].
    pub fn new(headers: Vec<(HeaderName, HeaderValue)>) -> Self {
        Self {
            headers: Arc::new(headers),
        }
    }
}

impl<S> Layer<S> for ImpersonationLayer {
    type Service = Impersonation<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Impersonation {
            inner,
            headers: self.headers.clone(),
        }
    }
}

/// Service that stamps a fixed impersonation header block onto each request.
#[derive(Clone)]
pub struct Impersonation<S> {
    inner: S,
    headers: Arc<Vec<(HeaderName, HeaderValue)>>,
}

impl<S, ReqBody> Service<Request<ReqBody>> for Impersonation<S>
where
    S: Service<Request<ReqBody>>,
{
    type Error = S::Error;
    type Future = S::Future;
    type Response = S::Response;

    fn poll_ready(&mut self, cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        // Nothing upstream is allowed to smuggle its own impersonation in.
        let stale: Vec<HeaderName> = req
            .headers()
            .keys()
            .filter(|name| name.as_str().starts_with("impersonate-"))
            .cloned()
            .collect();
        for name in stale {
            req.headers_mut().remove(&name);
        }
        for (name, value) in self.headers.iter() {
            req.headers_mut().append(name.clone(), value.clone());
        }
        self.inner.call(req)
    }
}

/// Build an impersonating client for a caller from a base configuration.
///
/// The base configuration is cloned, never mutated; it retains the cluster
/// admin bearer credential, and the impersonation layer scopes every request
/// down to the caller's identity.
pub fn impersonated_client(
    config: &Config,
    cluster: &str,
    caller: &UserIdentity,
    mapper: Option<&GroupMapper>,
    trace_id: Option<&str>,
) -> Result<Client> {
    let headers = impersonation_headers(Some(caller), cluster, mapper, trace_id)?;
    let layer = ImpersonationLayer::new(headers);
    let builder = ClientBuilder::try_from(config.clone()).map_err(|e| Error::ImpersonationFailed {
        user_hash: caller.user_hash(),
        cluster: cluster.to_string(),
        reason: "building the client stack failed".to_string(),
        source: Some(e.into()),
    })?;
    Ok(builder.with_layer(&layer).build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use http::Response;
    use tokio_test::assert_ready_ok;
    use tower_test::mock;

    fn alice() -> UserIdentity {
        UserIdentity::new("alice@example.com").with_groups(["customer:GroupA", "oidc:viewer"])
    }

    fn values_of<'a>(headers: &'a [(HeaderName, HeaderValue)], name: &str) -> Vec<&'a str> {
        headers
            .iter()
            .filter(|(n, _)| n.as_str() == name)
            .map(|(_, v)| v.to_str().expect("test header values are ascii"))
            .collect()
    }

    #[test]
    fn user_and_groups_are_set_in_input_order() {
        let headers = impersonation_headers(Some(&alice()), "prod-eu", None, None).unwrap();
        assert_eq!(
            values_of(&headers, "impersonate-user"),
            vec!["alice@example.com"]
        );
        assert_eq!(
            values_of(&headers, "impersonate-group"),
            vec!["customer:GroupA", "oidc:viewer"]
        );
    }

    #[test]
    fn agent_extra_is_always_present_and_immutable() {
        let spoofing = alice().with_extra(EXTRA_KEY_AGENT, ["evil-agent"]);
        let headers = impersonation_headers(Some(&spoofing), "prod-eu", None, None).unwrap();
        assert_eq!(
            values_of(&headers, "impersonate-extra-agent"),
            vec![PRODUCT_IDENTIFIER]
        );
    }

    #[test]
    fn trace_id_extra_present_iff_supplied() {
        let with = impersonation_headers(Some(&alice()), "prod-eu", None, Some("trace-1")).unwrap();
        assert_eq!(
            values_of(&with, "impersonate-extra-trace-id"),
            vec!["trace-1"]
        );
        let without = impersonation_headers(Some(&alice()), "prod-eu", None, None).unwrap();
        assert!(values_of(&without, "impersonate-extra-trace-id").is_empty());
        let empty = impersonation_headers(Some(&alice()), "prod-eu", None, Some("")).unwrap();
        assert!(values_of(&empty, "impersonate-extra-trace-id").is_empty());
    }

    #[test]
    fn caller_extras_are_forwarded_one_header_per_value() {
        let caller = alice().with_extra("team", ["platform", "oncall"]);
        let headers = impersonation_headers(Some(&caller), "prod-eu", None, None).unwrap();
        assert_eq!(
            values_of(&headers, "impersonate-extra-team"),
            vec!["platform", "oncall"]
        );
    }

    #[test]
    fn bearer_token_extra_is_never_forwarded() {
        let caller = alice().with_extra(provider::EXTRA_KEY_BEARER_TOKEN, ["sekrit"]);
        let headers = impersonation_headers(Some(&caller), "prod-eu", None, None).unwrap();
        for (name, value) in &headers {
            assert!(
                !name.as_str().contains("bearer"),
                "token header leaked: {name}"
            );
            assert_ne!(value.to_str().unwrap(), "sekrit", "token value leaked under {name}");
        }
    }

    #[test]
    fn original_groups_preserved_only_when_mapping_changed() {
        let table: HashMap<String, String> =
            [("customer:GroupA".to_string(), "tenant-a".to_string())].into();
        let mapper = GroupMapper::new(table, 10).unwrap();

        let headers =
            impersonation_headers(Some(&alice()), "prod-eu", Some(&mapper), None).unwrap();
        assert_eq!(
            values_of(&headers, "impersonate-group"),
            vec!["tenant-a", "oidc:viewer"]
        );
        // Header names are canonicalized to lowercase; percent-encoding is
        // case-insensitive on the wire.
        assert_eq!(
            values_of(
                &headers,
                "impersonate-extra-mcp.giantswarm.io%2foriginal-groups"
            ),
            vec!["customer:GroupA", "oidc:viewer"]
        );

        // Same mapper, but no group of this caller is mapped.
        let bob = UserIdentity::new("bob@example.com").with_groups(["other"]);
        let headers = impersonation_headers(Some(&bob), "prod-eu", Some(&mapper), None).unwrap();
        assert!(values_of(
            &headers,
            "impersonate-extra-mcp.giantswarm.io%2foriginal-groups"
        )
        .is_empty());
    }

    #[test]
    fn extra_key_encoding_matches_the_wire_convention() {
        assert_eq!(
            encode_extra_key("mcp.giantswarm.io/original-groups"),
            "mcp.giantswarm.io%2Foriginal-groups"
        );
        assert_eq!(encode_extra_key("agent"), "agent");
        assert_eq!(encode_extra_key("trace-id"), "trace-id");
        assert_eq!(encode_extra_key("a b"), "a%20b");
    }

    #[test]
    #[should_panic(expected = "refusing to build an unimpersonated client")]
    fn missing_caller_identity_aborts_loudly() {
        let _ = impersonation_headers(None, "prod-eu", None, None);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn layer_stamps_headers_and_strips_smuggled_ones() {
        let headers = impersonation_headers(Some(&alice()), "prod-eu", None, None).unwrap();
        let (mut service, handle) = mock::spawn_layer::<Request<Vec<u8>>, Response<Vec<u8>>, _>(
            ImpersonationLayer::new(headers),
        );

        let spawned = tokio::spawn(async move {
            tokio::pin!(handle);
            let (request, send) = handle.next_request().await.expect("service not called");
            assert_eq!(
                request.headers().get("impersonate-user").unwrap().to_str().unwrap(),
                "alice@example.com"
            );
            let groups: Vec<_> = request
                .headers()
                .get_all("impersonate-group")
                .iter()
                .map(|v| v.to_str().unwrap())
                .collect();
            assert_eq!(groups, vec!["customer:GroupA", "oidc:viewer"]);
            assert_eq!(
                request
                    .headers()
                    .get("impersonate-extra-agent")
                    .unwrap()
                    .to_str()
                    .unwrap(),
                PRODUCT_IDENTIFIER
            );
            // The smuggled header from the request below must be gone.
            assert!(request.headers().get("impersonate-extra-evil").is_none());
            send.send_response(Response::builder().body(Vec::new()).unwrap());
        });

        assert_ready_ok!(service.poll_ready());
        let request = Request::builder()
            .uri("/api")
            .header("Impersonate-Extra-evil", "true")
            .body(Vec::new())
            .unwrap();
        service.call(request).await.unwrap();
        spawned.await.unwrap();
    }
}
