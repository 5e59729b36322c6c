//! Host sanitization for log lines and error messages.
//!
//! Cluster API servers are frequently addressed by bare IP, and IPs are
//! treated as infrastructure-identifying data. Every host that ends up in a
//! log field or an [`Error`](crate::Error) goes through [`sanitize_host`]
//! first: literal IPv4/IPv6 addresses are redacted, hostnames pass through.
use std::{
    net::{IpAddr, Ipv6Addr},
    sync::LazyLock,
};

use regex::{Captures, Regex};

/// Replacement for a redacted literal IP address.
pub const REDACTED_IP: &str = "[redacted-ip]";

/// Placeholder for an empty host.
pub const EMPTY_HOST: &str = "<empty>";

// Dotted quad with non-hostname characters (or string edges) on both sides,
// so `10.0.0.1.nip.io` style hostnames survive intact.
static IPV4: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(^|[^0-9A-Za-z.])((?:\d{1,3}\.){3}\d{1,3})($|[^0-9A-Za-z.])").expect("valid regex")
});

// Candidate bracketed IPv6 (URL authority form). Inner text is verified with
// a real address parse before anything is replaced.
static IPV6_BRACKETED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[0-9A-Fa-f:.]+\]").expect("valid regex"));

// Candidate bare IPv6: at least two colon-separated hex groups. Verified with
// a real address parse, which keeps timestamps like `12:34:56` intact.
static IPV6_BARE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[0-9A-Fa-f]{0,4}(?::[0-9A-Fa-f]{0,4}){2,}").expect("valid regex"));

/// Redact literal IP addresses in a URL-like string.
///
/// Scheme and port are preserved, hostnames pass through unchanged, and the
/// empty string maps to [`EMPTY_HOST`]. The function is idempotent:
/// `sanitize_host(sanitize_host(h)) == sanitize_host(h)`.
///
/// ```
/// use kube_broker::sanitize_host;
///
/// assert_eq!(sanitize_host("https://10.0.0.1:6443"), "https://[redacted-ip]:6443");
/// assert_eq!(sanitize_host("https://api.example.com:6443"), "https://api.example.com:6443");
/// ```
pub fn sanitize_host(input: &str) -> String {
    if input.is_empty() {
        return EMPTY_HOST.to_string();
    }

    // URL-shaped input: redact exactly the host component when it is an IP.
    if let Ok(uri) = input.parse::<http::Uri>() {
        if let Some(host) = uri.host() {
            let bare = host.trim_start_matches('[').trim_end_matches(']');
            if bare.parse::<IpAddr>().is_ok() {
                let mut out = String::new();
                if let Some(scheme) = uri.scheme_str() {
                    out.push_str(scheme);
                    out.push_str("://");
                }
                out.push_str(REDACTED_IP);
                if let Some(port) = uri.port_u16() {
                    out.push(':');
                    out.push_str(&port.to_string());
                }
                if let Some(pq) = uri.path_and_query() {
                    if pq.as_str() != "/" {
                        out.push_str(pq.as_str());
                    }
                }
                return out;
            }
        }
    }

    // Anything else (log fragments, authority-less strings): pattern passes.
    let out = IPV6_BRACKETED.replace_all(input, |caps: &Captures| {
        let inner = &caps[0][1..caps[0].len() - 1];
        if inner.parse::<Ipv6Addr>().is_ok() {
            REDACTED_IP.to_string()
        } else {
            caps[0].to_string()
        }
    });
    let out = IPV6_BARE.replace_all(&out, |caps: &Captures| {
        if caps[0].parse::<Ipv6Addr>().is_ok() {
            REDACTED_IP.to_string()
        } else {
            caps[0].to_string()
        }
    });
    let out = IPV4.replace_all(&out, |caps: &Captures| {
        format!("{}{}{}", &caps[1], REDACTED_IP, &caps[3])
    });
    out.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostnames_pass_through() {
        for host in [
            "https://api.prod-eu.example.com:6443",
            "api.example.com",
            "https://kubernetes.default.svc",
        ] {
            assert_eq!(sanitize_host(host), host);
        }
    }

    #[test]
    fn ipv4_hosts_are_redacted_with_scheme_and_port() {
        assert_eq!(
            sanitize_host("https://10.0.0.1:6443"),
            "https://[redacted-ip]:6443"
        );
        assert_eq!(sanitize_host("10.0.0.1:6443"), "[redacted-ip]:6443");
        assert_eq!(sanitize_host("10.0.0.1"), "[redacted-ip]");
    }

    #[test]
    fn ipv6_hosts_are_redacted() {
        assert_eq!(
            sanitize_host("https://[2001:db8::1]:6443"),
            "https://[redacted-ip]:6443"
        );
        assert_eq!(sanitize_host("2001:db8::1"), "[redacted-ip]");
        assert_eq!(sanitize_host("::1"), "[redacted-ip]");
    }

    #[test]
    fn ip_like_hostnames_survive() {
        assert_eq!(
            sanitize_host("https://10.0.0.1.nip.io:6443"),
            "https://10.0.0.1.nip.io:6443"
        );
    }

    #[test]
    fn embedded_ips_in_log_fragments_are_redacted() {
        assert_eq!(
            sanitize_host("dial tcp 192.168.1.10: connection refused"),
            "dial tcp [redacted-ip]: connection refused"
        );
    }

    #[test]
    fn timestamps_are_not_mistaken_for_ipv6() {
        assert_eq!(sanitize_host("failed at 12:34:56"), "failed at 12:34:56");
    }

    #[test]
    fn empty_input_maps_to_placeholder() {
        assert_eq!(sanitize_host(""), EMPTY_HOST);
    }

    #[test]
    fn sanitization_is_idempotent() {
        for host in [
            "https://10.0.0.1:6443",
            "https://[2001:db8::1]:6443",
            "https://api.example.com",
            "",
        ] {
            let once = sanitize_host(host);
            assert_eq!(sanitize_host(&once), once);
        }
    }
}
