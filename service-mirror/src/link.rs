use anyhow::{Context, Result};
use linkerd_destination_controller_k8s_api::{self as k8s, multicluster, ResourceExt};
use std::{num::NonZeroU16, time::Duration};

pub(crate) const MIRRORED_SERVICE_LABEL: &str = "mirror.linkerd.io/mirrored-service";
pub(crate) const CLUSTER_NAME_LABEL: &str = "mirror.linkerd.io/cluster-name";
pub(crate) const REMOTE_CLUSTER_ANNOTATION: &str = "mirror.linkerd.io/remote-cluster";
pub(crate) const REMOTE_RESOURCE_VERSION_ANNOTATION: &str =
    "mirror.linkerd.io/remote-resource-version";
pub(crate) const REMOTE_GATEWAY_IDENTITY_ANNOTATION: &str =
    "mirror.linkerd.io/remote-gateway-identity";

pub(crate) const DEFAULT_EXPORT_SELECTOR: &str = "mirror.linkerd.io/exported=true";

/// Probe settings applied when a `Link` leaves them unspecified.
#[derive(Clone, Debug)]
pub(crate) struct ProbeDefaults {
    pub path: String,
    pub port: NonZeroU16,
    pub period: Duration,
}

/// The runtime view of a `Link` resource: validated fields plus the probe
/// schedule, ready for workers to consume.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Link {
    pub name: String,
    pub namespace: String,
    pub target_cluster_name: String,
    pub credentials_secret: String,
    pub gateway_address: String,
    pub gateway_port: NonZeroU16,
    pub gateway_identity: String,
    pub probe_path: String,
    pub probe_port: NonZeroU16,
    pub probe_period: Duration,

    /// The label selector for exported remote services, in list-params form.
    pub export_selector: String,
}

impl Link {
    pub(crate) fn from_resource(
        link: multicluster::Link,
        probe_defaults: &ProbeDefaults,
    ) -> Result<Self> {
        let name = link.name_unchecked();
        let namespace = link.namespace().context("Link must be namespaced")?;
        let spec = link.spec;

        if spec.gateway_address.is_empty() {
            anyhow::bail!("link {name} has no gateway address");
        }
        if spec.gateway_identity.is_empty() {
            anyhow::bail!("link {name} has no gateway identity");
        }

        let export_selector = spec
            .selector
            .as_ref()
            .map(|selector| selector.to_listparams_selector())
            .filter(|selector| !selector.is_empty())
            .unwrap_or_else(|| DEFAULT_EXPORT_SELECTOR.to_string());

        Ok(Self {
            name,
            namespace,
            target_cluster_name: spec.target_cluster_name,
            credentials_secret: spec.cluster_credentials_secret,
            gateway_address: spec.gateway_address,
            gateway_port: spec.gateway_port,
            gateway_identity: spec.gateway_identity,
            probe_path: spec
                .probe_spec
                .path
                .unwrap_or_else(|| probe_defaults.path.clone()),
            probe_port: spec.probe_spec.port.unwrap_or(probe_defaults.port),
            probe_period: spec
                .probe_spec
                .period
                .map(Into::into)
                .unwrap_or(probe_defaults.period),
            export_selector,
        })
    }

    /// Builds a client for the remote API server from the link's credentials
    /// secret.
    pub(crate) async fn remote_client(&self, local: k8s::Client) -> Result<k8s::Client> {
        let secret = k8s::Api::<k8s::Secret>::namespaced(local, &self.namespace)
            .get(&self.credentials_secret)
            .await
            .with_context(|| format!("failed to fetch secret {}", self.credentials_secret))?;

        let kubeconfig = secret
            .data
            .as_ref()
            .and_then(|data| data.get("kubeconfig"))
            .with_context(|| {
                format!("secret {} has no kubeconfig key", self.credentials_secret)
            })?;
        let kubeconfig = std::str::from_utf8(&kubeconfig.0).context("kubeconfig is not UTF-8")?;

        let kubeconfig =
            kube::config::Kubeconfig::from_yaml(kubeconfig).context("invalid kubeconfig")?;
        let config = kube::Config::from_custom_kubeconfig(
            kubeconfig,
            &kube::config::KubeConfigOptions::default(),
        )
        .await
        .context("invalid kubeconfig")?;

        k8s::Client::try_from(config).context("failed to build remote client")
    }
}
