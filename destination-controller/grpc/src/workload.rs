use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Identifies the pod a proxy serves, as encoded in the inbound policy API's
/// workload strings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Workload {
    #[serde(rename = "ns")]
    pub namespace: String,
    pub pod: String,
}

/// The optional context token a proxy sends with destination lookups. Either
/// a JSON document or the legacy `ns:<namespace>` form.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct ContextToken {
    #[serde(rename = "ns")]
    pub namespace: Option<String>,
    #[serde(rename = "nodeName")]
    pub node_name: Option<String>,
}

impl FromStr for Workload {
    type Err = tonic::Status;

    fn from_str(s: &str) -> Result<Self, tonic::Status> {
        if s.starts_with('{') {
            return serde_json::from_str(s).map_err(|error| {
                tracing::warn!(%error, "Invalid {s} workload string");
                tonic::Status::invalid_argument(format!("Invalid workload: {s}"))
            });
        }

        match s.split_once(':') {
            None => Err(tonic::Status::invalid_argument(format!(
                "Invalid workload: {s}"
            ))),
            Some((ns, pod)) if ns.is_empty() || pod.is_empty() => Err(
                tonic::Status::invalid_argument(format!("Invalid workload: {s}")),
            ),
            Some((ns, pod)) => Ok(Workload {
                namespace: ns.to_string(),
                pod: pod.to_string(),
            }),
        }
    }
}

impl ContextToken {
    /// Parses a context token leniently: proxies may send nothing, the legacy
    /// prefix form, or JSON. A malformed token is treated as absent rather
    /// than failing the stream.
    pub fn parse(s: &str) -> Self {
        if s.is_empty() {
            return Self::default();
        }
        if s.starts_with('{') {
            return serde_json::from_str(s).unwrap_or_else(|error| {
                tracing::debug!(%error, "Invalid context token");
                Self::default()
            });
        }
        if let Some(ns) = s.strip_prefix("ns:") {
            return Self {
                namespace: Some(ns.to_string()),
                node_name: None,
            };
        }
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_workload_forms() {
        let expected = Workload {
            namespace: "my-namespace".to_string(),
            pod: "my-pod".to_string(),
        };
        assert_eq!(
            expected,
            Workload::from_str("my-namespace:my-pod").expect("should parse")
        );
        assert_eq!(
            expected,
            Workload::from_str(r#"{"ns":"my-namespace", "pod":"my-pod"}"#).expect("should parse")
        );
        assert!(Workload::from_str("no-pod").is_err());
        assert!(Workload::from_str(":").is_err());
    }

    #[test]
    fn parses_context_tokens() {
        assert_eq!(ContextToken::parse(""), ContextToken::default());
        assert_eq!(
            ContextToken::parse("ns:emojivoto").namespace.as_deref(),
            Some("emojivoto")
        );
        let token = ContextToken::parse(r#"{"ns":"emojivoto","nodeName":"node-1"}"#);
        assert_eq!(token.namespace.as_deref(), Some("emojivoto"));
        assert_eq!(token.node_name.as_deref(), Some("node-1"));
        assert_eq!(ContextToken::parse("{not json"), ContextToken::default());
    }
}
