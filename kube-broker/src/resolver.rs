//! Resolving a cluster name to a validated base client configuration.
//!
//! The management cluster stores one CAPI `Cluster` resource per workload
//! cluster and, next to it, a `<cluster>-kubeconfig` secret containing the
//! admin kubeconfig. Resolution is: locate the cluster resource (cluster-wide
//! list, scan by name) to learn its namespace, fetch the secret with
//! whichever credentials the dispatcher selects, extract and parse the
//! payload, and optionally probe the target's `/healthz` under a deadline.
//!
//! Nothing in this module ever logs a kubeconfig payload, bearer token, or
//! client certificate; hosts are passed through the sanitizer first.
use std::{collections::BTreeMap, sync::Arc, time::Duration};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use k8s_openapi::{
    api::core::v1::{ConfigMap, Secret},
    ByteString,
};
use kube::{
    api::{Api, ApiResource, DynamicObject, ListParams},
    config::{AuthInfo, Cluster, Context, KubeConfigOptions, Kubeconfig, NamedAuthInfo, NamedCluster, NamedContext},
    core::GroupVersionKind,
    Client, Config, ResourceExt,
};

use crate::{
    dispatch::CredentialDispatcher,
    identity::{validate_cluster_name, validate_identity, UserIdentity},
    provider,
    request::RequestContext,
    sanitize::sanitize_host,
    Error, Result,
};

const CAPI_GROUP: &str = "cluster.x-k8s.io";
const CAPI_VERSION: &str = "v1beta2";
const CAPI_KIND: &str = "Cluster";

const KUBECONFIG_SECRET_SUFFIX: &str = "-kubeconfig";
const SECRET_KEY_VALUE: &str = "value";
const SECRET_KEY_KUBECONFIG: &str = "kubeconfig";
const CA_CONFIGMAP_KEY: &str = "ca.crt";

pub(crate) struct KubeconfigResolver {
    dispatcher: Arc<CredentialDispatcher>,
    validation_timeout: Duration,
    ca_configmap_suffix: Option<String>,
}

impl KubeconfigResolver {
    pub(crate) fn new(
        dispatcher: Arc<CredentialDispatcher>,
        validation_timeout: Duration,
        ca_configmap_suffix: Option<String>,
    ) -> Self {
        Self {
            dispatcher,
            validation_timeout,
            ca_configmap_suffix,
        }
    }

    /// Resolve a cluster name to a base configuration (no connection probe).
    pub(crate) async fn resolve(
        &self,
        ctx: &RequestContext,
        caller: &UserIdentity,
        cluster: &str,
    ) -> Result<Config> {
        validate_identity(caller)?;
        validate_cluster_name(cluster)?;
        if ctx.is_cancelled() {
            return Err(cancelled(cluster));
        }

        let discovery = self.dispatcher.discovery_client(ctx, caller).await?;
        let resource = self.locate_cluster(ctx, &discovery, cluster).await?;
        let namespace = resource.namespace().ok_or_else(|| Error::ClusterNotFound {
            cluster: cluster.to_string(),
            reason: "cluster resource has no namespace".to_string(),
        })?;

        let secrets = self.dispatcher.secret_client(ctx, caller).await?;
        let payload = self
            .fetch_kubeconfig(ctx, &secrets, &namespace, cluster)
            .await?;
        let config = parse_kubeconfig(cluster, &payload.0).await?;

        tracing::debug!(
            cluster,
            namespace = %namespace,
            host = %sanitize_host(&config.cluster_url.to_string()),
            "resolved workload cluster configuration"
        );
        Ok(config)
    }

    /// Resolve and additionally probe the target API server's `/healthz`.
    pub(crate) async fn resolve_validated(
        &self,
        ctx: &RequestContext,
        caller: &UserIdentity,
        cluster: &str,
    ) -> Result<Config> {
        let config = self.resolve(ctx, caller, cluster).await?;
        self.validate_connection(ctx, cluster, &config).await?;
        Ok(config)
    }

    /// Resolve for SSO passthrough: trust anchor from the published CA
    /// ConfigMap, the caller's own bearer token as the credential, no admin
    /// kubeconfig involved.
    pub(crate) async fn resolve_sso(
        &self,
        ctx: &RequestContext,
        caller: &UserIdentity,
        cluster: &str,
    ) -> Result<Config> {
        let Some(suffix) = self.ca_configmap_suffix.as_deref() else {
            return Err(Error::ValidationFailed {
                field: "sso passthrough",
                preview: String::new(),
                reason: "no CA ConfigMap suffix configured".to_string(),
            });
        };
        validate_identity(caller)?;
        validate_cluster_name(cluster)?;
        if ctx.is_cancelled() {
            return Err(cancelled(cluster));
        }
        let token = provider::bearer_token(ctx, caller).ok_or_else(|| Error::ValidationFailed {
            field: "bearer token",
            preview: String::new(),
            reason: "sso passthrough forwards the caller token, but none was supplied".to_string(),
        })?;

        let discovery = self.dispatcher.discovery_client(ctx, caller).await?;
        let resource = self.locate_cluster(ctx, &discovery, cluster).await?;
        let namespace = resource.namespace().ok_or_else(|| Error::ClusterNotFound {
            cluster: cluster.to_string(),
            reason: "cluster resource has no namespace".to_string(),
        })?;
        let (host, port) = control_plane_endpoint(&resource).ok_or_else(|| Error::ClusterNotFound {
            cluster: cluster.to_string(),
            reason: "control plane endpoint not published".to_string(),
        })?;

        let secrets = self.dispatcher.secret_client(ctx, caller).await?;
        let name = format!("{cluster}{suffix}");
        let api: Api<ConfigMap> = Api::namespaced(secrets, &namespace);
        let configmap = match cancellable(ctx, cluster, api.get(&name)).await? {
            Ok(configmap) => configmap,
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                return Err(Error::KubeconfigMissing {
                    cluster: cluster.to_string(),
                    namespace,
                })
            }
            Err(e) => {
                return Err(invalid(cluster, "reading the CA ConfigMap failed", Some(e.into())))
            }
        };
        let ca = configmap
            .data
            .as_ref()
            .and_then(|data| data.get(CA_CONFIGMAP_KEY))
            .filter(|ca| !ca.is_empty())
            .ok_or_else(|| {
                invalid(
                    cluster,
                    &format!("CA ConfigMap has no {CA_CONFIGMAP_KEY:?} key"),
                    None,
                )
            })?;

        // Synthesize a kubeconfig so certificate handling follows the same
        // path as secret-based resolution.
        let kubeconfig = Kubeconfig {
            clusters: vec![NamedCluster {
                name: cluster.to_string(),
                cluster: Some(Cluster {
                    server: Some(format!("https://{host}:{port}")),
                    certificate_authority_data: Some(BASE64.encode(ca.as_bytes())),
                    ..Cluster::default()
                }),
            }],
            auth_infos: vec![NamedAuthInfo {
                name: "sso".to_string(),
                auth_info: Some(AuthInfo {
                    token: Some(token),
                    ..AuthInfo::default()
                }),
            }],
            contexts: vec![NamedContext {
                name: cluster.to_string(),
                context: Some(Context {
                    cluster: cluster.to_string(),
                    user: Some("sso".to_string()),
                    namespace: None,
                    extensions: None,
                }),
            }],
            current_context: Some(cluster.to_string()),
            ..Kubeconfig::default()
        };
        Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| {
                invalid(
                    cluster,
                    "assembling the passthrough configuration failed",
                    Some(e.into()),
                )
            })
    }

    /// Bounded health check: `GET /healthz` on the target API server.
    pub(crate) async fn validate_connection(
        &self,
        ctx: &RequestContext,
        cluster: &str,
        config: &Config,
    ) -> Result<()> {
        probe_healthz(ctx, cluster, config, self.validation_timeout).await
    }

    async fn locate_cluster(
        &self,
        ctx: &RequestContext,
        client: &Client,
        cluster: &str,
    ) -> Result<DynamicObject> {
        let gvk = GroupVersionKind::gvk(CAPI_GROUP, CAPI_VERSION, CAPI_KIND);
        let resource = ApiResource::from_gvk(&gvk);
        let api: Api<DynamicObject> = Api::all_with(client.clone(), &resource);

        let clusters = cancellable(ctx, cluster, api.list(&ListParams::default()))
            .await?
            .map_err(|e| Error::ClusterNotFound {
                cluster: cluster.to_string(),
                reason: format!("listing CAPI clusters failed: {e}"),
            })?;
        clusters
            .items
            .into_iter()
            .find(|item| item.name_any() == cluster)
            .ok_or_else(|| Error::ClusterNotFound {
                cluster: cluster.to_string(),
                reason: "no CAPI cluster with that name".to_string(),
            })
    }

    async fn fetch_kubeconfig(
        &self,
        ctx: &RequestContext,
        client: &Client,
        namespace: &str,
        cluster: &str,
    ) -> Result<ByteString> {
        let name = format!("{cluster}{KUBECONFIG_SECRET_SUFFIX}");
        let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
        let secret = match cancellable(ctx, cluster, api.get(&name)).await? {
            Ok(secret) => secret,
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                return Err(Error::KubeconfigMissing {
                    cluster: cluster.to_string(),
                    namespace: namespace.to_string(),
                })
            }
            Err(e) => {
                return Err(invalid(
                    cluster,
                    "reading the kubeconfig secret failed",
                    Some(e.into()),
                ))
            }
        };
        kubeconfig_payload(cluster, &secret.data.unwrap_or_default()).cloned()
    }
}

/// `GET /healthz` on the target API server under a deadline.
///
/// The effective deadline is the configured validation timeout, cut short by
/// request cancellation. TLS failures are classified by their handshake
/// message, elapsed deadlines as [`Error::ConnectionTimeout`], and anything
/// else as [`Error::ConnectionFailed`].
async fn probe_healthz(
    ctx: &RequestContext,
    cluster: &str,
    config: &Config,
    timeout: Duration,
) -> Result<()> {
    let host = sanitize_host(&config.cluster_url.to_string());
    let mut probe_config = config.clone();
    probe_config.connect_timeout = Some(timeout);
    probe_config.read_timeout = Some(timeout);

    let client = Client::try_from(probe_config).map_err(|e| Error::ConnectionFailed {
        cluster: cluster.to_string(),
        host: host.clone(),
        source: Some(e.into()),
    })?;
    let request = http::Request::builder()
        .uri("/healthz")
        .body(Vec::new())
        .map_err(|e| Error::ConnectionFailed {
            cluster: cluster.to_string(),
            host: host.clone(),
            source: Some(e.into()),
        })?;

    let outcome = tokio::select! {
        _ = ctx.cancellation().cancelled() => return Err(cancelled(cluster)),
        outcome = tokio::time::timeout(timeout, client.request_text(request)) => outcome,
    };
    match outcome {
        Err(_) => Err(Error::ConnectionTimeout {
            cluster: cluster.to_string(),
            host,
            timeout,
        }),
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(classify_connection_error(cluster, &host, timeout, e)),
    }
}

/// Pick the kubeconfig payload out of the secret data: `value` preferred,
/// `kubeconfig` accepted. Empty payloads count as absent. The error lists
/// the available key names only; values are never logged.
fn kubeconfig_payload<'a>(
    cluster: &str,
    data: &'a BTreeMap<String, ByteString>,
) -> Result<&'a ByteString> {
    data.get(SECRET_KEY_VALUE)
        .filter(|payload| !payload.0.is_empty())
        .or_else(|| {
            data.get(SECRET_KEY_KUBECONFIG)
                .filter(|payload| !payload.0.is_empty())
        })
        .ok_or_else(|| {
            let keys: Vec<&str> = data.keys().map(String::as_str).collect();
            invalid(
                cluster,
                &format!(
                    "no kubeconfig payload under {SECRET_KEY_VALUE:?} or {SECRET_KEY_KUBECONFIG:?}; available keys: [{}]",
                    keys.join(", ")
                ),
                None,
            )
        })
}

async fn parse_kubeconfig(cluster: &str, payload: &[u8]) -> Result<Config> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| invalid(cluster, "kubeconfig payload is not UTF-8", Some(e.into())))?;
    let kubeconfig = Kubeconfig::from_yaml(text)
        .map_err(|e| invalid(cluster, "kubeconfig payload failed to parse", Some(e.into())))?;
    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            invalid(
                cluster,
                "kubeconfig could not be converted to a client configuration",
                Some(e.into()),
            )
        })
}

/// `spec.controlPlaneEndpoint` of a CAPI cluster resource, when published.
fn control_plane_endpoint(resource: &DynamicObject) -> Option<(String, i64)> {
    let endpoint = resource.data.get("spec")?.get("controlPlaneEndpoint")?;
    let host = endpoint.get("host")?.as_str()?.to_string();
    let port = endpoint.get("port")?.as_i64()?;
    if host.is_empty() || port == 0 {
        return None;
    }
    Some((host, port))
}

fn classify_connection_error(
    cluster: &str,
    host: &str,
    timeout: Duration,
    err: kube::Error,
) -> Error {
    const TLS_SUBKINDS: [&str; 3] = [
        "certificate has expired",
        "signed by unknown authority",
        "hostname mismatch",
    ];
    let chain = error_chain(&err);
    if let Some(kind) = TLS_SUBKINDS.iter().find(|kind| chain.contains(*kind)) {
        return Error::TlsFailed {
            cluster: cluster.to_string(),
            host: host.to_string(),
            reason: (*kind).to_string(),
            source: Some(err.into()),
        };
    }
    if chain.contains("tls") || chain.contains("certificate") {
        return Error::TlsFailed {
            cluster: cluster.to_string(),
            host: host.to_string(),
            reason: "tls handshake failed".to_string(),
            source: Some(err.into()),
        };
    }
    if chain.contains("timed out") || chain.contains("deadline") {
        return Error::ConnectionTimeout {
            cluster: cluster.to_string(),
            host: host.to_string(),
            timeout,
        };
    }
    Error::ConnectionFailed {
        cluster: cluster.to_string(),
        host: host.to_string(),
        source: Some(err.into()),
    }
}

fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut current = err.source();
    while let Some(cause) = current {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        current = cause.source();
    }
    out.to_lowercase()
}

fn cancelled(cluster: &str) -> Error {
    Error::ClusterNotFound {
        cluster: cluster.to_string(),
        reason: "context cancelled".to_string(),
    }
}

fn invalid(cluster: &str, reason: &str, source: Option<tower::BoxError>) -> Error {
    Error::KubeconfigInvalid {
        cluster: cluster.to_string(),
        reason: reason.to_string(),
        source,
    }
}

/// Run a network future unless the request context is already done; a
/// cancellation aborts the in-flight operation.
async fn cancellable<T>(
    ctx: &RequestContext,
    cluster: &str,
    fut: impl std::future::Future<Output = T>,
) -> Result<T> {
    tokio::select! {
        _ = ctx.cancellation().cancelled() => Err(cancelled(cluster)),
        out = fut => Ok(out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KUBECONFIG_YAML: &str = r#"
apiVersion: v1
kind: Config
clusters:
- name: prod-eu
  cluster:
    server: https://api.prod-eu.example.com:6443
contexts:
- name: prod-eu
  context:
    cluster: prod-eu
    user: prod-eu-admin
current-context: prod-eu
users:
- name: prod-eu-admin
  user:
    token: admin-token
"#;

    fn data(entries: &[(&str, &[u8])]) -> BTreeMap<String, ByteString> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), ByteString(v.to_vec())))
            .collect()
    }

    #[tokio::test]
    async fn valid_payload_parses_to_a_configuration() {
        let config = parse_kubeconfig("prod-eu", KUBECONFIG_YAML.as_bytes())
            .await
            .unwrap();
        assert_eq!(
            config.cluster_url.to_string(),
            "https://api.prod-eu.example.com:6443/"
        );
        assert!(config.auth_info.token.is_some());
    }

    #[tokio::test]
    async fn garbage_payload_is_kubeconfig_invalid() {
        let err = parse_kubeconfig("prod-eu", b"{{{ not yaml")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::KubeconfigInvalid { .. }));
        assert_eq!(err.user_message(), crate::error::USER_MESSAGE_CLUSTER);
    }

    #[test]
    fn value_key_is_preferred() {
        let data = data(&[(SECRET_KEY_VALUE, b"from-value"), (SECRET_KEY_KUBECONFIG, b"other")]);
        let payload = kubeconfig_payload("prod-eu", &data).unwrap();
        assert_eq!(payload.0, b"from-value");
    }

    #[test]
    fn kubeconfig_key_is_the_fallback() {
        let data = data(&[(SECRET_KEY_KUBECONFIG, b"from-kubeconfig")]);
        let payload = kubeconfig_payload("prod-eu", &data).unwrap();
        assert_eq!(payload.0, b"from-kubeconfig");
    }

    #[test]
    fn empty_value_falls_back_to_kubeconfig_key() {
        let data = data(&[(SECRET_KEY_VALUE, b""), (SECRET_KEY_KUBECONFIG, b"fallback")]);
        let payload = kubeconfig_payload("prod-eu", &data).unwrap();
        assert_eq!(payload.0, b"fallback");
    }

    #[test]
    fn empty_payloads_are_invalid_not_missing() {
        let data = data(&[(SECRET_KEY_VALUE, b""), ("ca.crt", b"pem")]);
        let err = kubeconfig_payload("prod-eu", &data).unwrap_err();
        match err {
            Error::KubeconfigInvalid { reason, .. } => {
                // Key names only; never payload bytes.
                assert!(reason.contains("ca.crt"), "{reason}");
                assert!(reason.contains("value"), "{reason}");
                assert!(!reason.contains("pem"), "{reason}");
            }
            other => panic!("expected KubeconfigInvalid, got {other}"),
        }
    }

    #[test]
    fn control_plane_endpoint_extraction() {
        let mut resource = DynamicObject::new(
            "prod-eu",
            &ApiResource::from_gvk(&GroupVersionKind::gvk(CAPI_GROUP, CAPI_VERSION, CAPI_KIND)),
        );
        assert!(control_plane_endpoint(&resource).is_none());

        resource.data = serde_json::json!({
            "spec": { "controlPlaneEndpoint": { "host": "api.prod-eu.example.com", "port": 6443 } }
        });
        assert_eq!(
            control_plane_endpoint(&resource),
            Some(("api.prod-eu.example.com".to_string(), 6443))
        );
    }

    #[test]
    fn tls_subkinds_are_matched_from_the_cause_chain() {
        for subkind in [
            "certificate has expired",
            "signed by unknown authority",
            "hostname mismatch",
        ] {
            let err = classify_connection_error(
                "prod-eu",
                "https://api.example.com:6443",
                Duration::from_secs(10),
                kube::Error::Service(format!("handshake failure: {subkind}").into()),
            );
            match err {
                Error::TlsFailed { reason, .. } => assert_eq!(reason, subkind),
                other => panic!("expected TlsFailed, got {other}"),
            }
        }
    }

    #[tokio::test]
    async fn health_check_returns_within_its_deadline() {
        let mut config = Config::new(http::Uri::from_static("https://10.255.255.1:6443"));
        config.accept_invalid_certs = true;

        let started = std::time::Instant::now();
        let err = probe_healthz(
            &RequestContext::new(),
            "prod-eu",
            &config,
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
        // Unroutable target: either the deadline elapses or the stack fails
        // fast; both stay within the observable bound and both collapse to
        // the opaque user message.
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(err.is_cluster_related(), "unexpected kind: {err}");
        assert_eq!(err.user_message(), crate::error::USER_MESSAGE_CLUSTER);
    }

    #[tokio::test]
    async fn cancelled_context_aborts_the_health_check() {
        let mut config = Config::new(http::Uri::from_static("https://10.255.255.1:6443"));
        config.accept_invalid_certs = true;

        let ctx = RequestContext::new();
        ctx.cancellation().cancel();
        let err = probe_healthz(&ctx, "prod-eu", &config, Duration::from_secs(10))
            .await
            .unwrap_err();
        match err {
            Error::ClusterNotFound { reason, .. } => assert_eq!(reason, "context cancelled"),
            other => panic!("expected ClusterNotFound, got {other}"),
        }
    }

    #[test]
    fn timeouts_and_plain_failures_classify_separately() {
        let timeout = classify_connection_error(
            "prod-eu",
            "host",
            Duration::from_secs(10),
            kube::Error::Service("operation timed out".into()),
        );
        assert!(matches!(timeout, Error::ConnectionTimeout { .. }));

        let refused = classify_connection_error(
            "prod-eu",
            "host",
            Duration::from_secs(10),
            kube::Error::Service("connection refused".into()),
        );
        assert!(matches!(refused, Error::ConnectionFailed { .. }));
    }
}
