//! Sekret kube integration: the cluster-facing client behind the session
//! controller. Contexts come from the merged kubeconfig; everything else
//! goes through a fresh kube client so a context switch is observed by the
//! next call.

#![forbid(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Secret};
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::config::Kubeconfig;
use kube::Client;
use tracing::{debug, info, warn};

use sekret_core::Mapping;

/// Kubeconfig-shaped failures callers may want to distinguish from plain
/// transport errors.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("no kubeconfig found (KUBECONFIG unset and no ~/.kube/config)")]
    NoKubeconfig,
    #[error("kubeconfig is not a YAML mapping: {0}")]
    MalformedKubeconfig(String),
}

/// The cluster operations the session controller depends on.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn list_contexts(&self) -> Result<Vec<String>>;
    async fn get_context(&self) -> Result<String>;
    async fn set_context(&self, context: &str) -> Result<()>;
    async fn list_namespaces(&self) -> Result<Vec<String>>;
    async fn list_secrets(&self, namespace: &str) -> Result<Vec<String>>;
    /// Rejects when the secret does not exist.
    async fn load_secret(&self, namespace: &str, name: &str) -> Result<Mapping>;
    /// Create-or-replace with the given mapping as the full payload.
    async fn save_secret(&self, namespace: &str, name: &str, mapping: Mapping) -> Result<()>;
    /// Rolling restart of the deployments that consume the secret.
    async fn patch_deployments(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Default implementation using kube-rs.
pub struct KubeClient;

impl KubeClient {
    pub fn new() -> Self {
        Self
    }
}

impl Default for KubeClient {
    fn default() -> Self {
        Self::new()
    }
}

/// First kubeconfig file path to use for writes. Respects KUBECONFIG
/// (`:` on Unix, `;` on Windows), then `$HOME/.kube/config`.
fn primary_kubeconfig_path() -> Option<PathBuf> {
    let sep = if cfg!(windows) { ';' } else { ':' };
    if let Ok(list) = std::env::var("KUBECONFIG") {
        if let Some(first) = list.split(sep).next() {
            let first = first.trim();
            if !first.is_empty() {
                return Some(PathBuf::from(first));
            }
        }
    }
    std::env::var_os("HOME").map(|home| {
        let mut p = PathBuf::from(home);
        p.push(".kube");
        p.push("config");
        p
    })
}

#[async_trait]
impl ClusterClient for KubeClient {
    async fn list_contexts(&self) -> Result<Vec<String>> {
        // Kubeconfig::read() merges every KUBECONFIG entry with kubectl
        // semantics. A missing kubeconfig yields an empty list, not an
        // error: the UI shows no contexts instead of failing to start.
        match Kubeconfig::read() {
            Ok(cfg) => {
                let mut names: Vec<String> =
                    cfg.contexts.into_iter().map(|c| c.name).collect();
                names.sort();
                debug!(count = names.len(), "kubeconfig contexts merged");
                Ok(names)
            }
            Err(e) => {
                warn!(error = %e, "kubeconfig could not be read; no contexts");
                Ok(Vec::new())
            }
        }
    }

    async fn get_context(&self) -> Result<String> {
        let cfg = Kubeconfig::read().context("reading kubeconfig")?;
        Ok(cfg.current_context.unwrap_or_default())
    }

    async fn set_context(&self, context: &str) -> Result<()> {
        let path = primary_kubeconfig_path().ok_or(HubError::NoKubeconfig)?;
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading kubeconfig at {}", path.display()))?;
        let mut doc: serde_yaml::Value =
            serde_yaml::from_str(&raw).context("parsing kubeconfig")?;
        // Patch current-context in place; every other field stays verbatim.
        match doc {
            serde_yaml::Value::Mapping(ref mut mapping) => {
                mapping.insert(
                    serde_yaml::Value::String("current-context".into()),
                    serde_yaml::Value::String(context.to_string()),
                );
            }
            _ => return Err(HubError::MalformedKubeconfig(path.display().to_string()).into()),
        }
        let updated = serde_yaml::to_string(&doc).context("serializing kubeconfig")?;
        std::fs::write(&path, updated)
            .with_context(|| format!("writing kubeconfig at {}", path.display()))?;
        info!(context = %context, path = %path.display(), "kubeconfig current-context updated");
        Ok(())
    }

    async fn list_namespaces(&self) -> Result<Vec<String>> {
        let client = Client::try_default().await?;
        let api: Api<Namespace> = Api::all(client);
        let list = api.list(&ListParams::default()).await?;
        let mut names: Vec<String> =
            list.items.into_iter().filter_map(|ns| ns.metadata.name).collect();
        // Stable order for display
        names.sort();
        Ok(names)
    }

    async fn list_secrets(&self, namespace: &str) -> Result<Vec<String>> {
        let client = Client::try_default().await?;
        let api: Api<Secret> = Api::namespaced(client, namespace);
        let list = api.list(&ListParams::default()).await?;
        let mut names: Vec<String> =
            list.items.into_iter().filter_map(|s| s.metadata.name).collect();
        names.sort();
        Ok(names)
    }

    async fn load_secret(&self, namespace: &str, name: &str) -> Result<Mapping> {
        let client = Client::try_default().await?;
        let api: Api<Secret> = Api::namespaced(client, namespace);
        let secret = api.get(name).await?;
        let mut out = Mapping::new();
        for (key, bytes) in secret.data.unwrap_or_default() {
            out.insert(key, String::from_utf8_lossy(&bytes.0).into_owned());
        }
        debug!(ns = %namespace, name = %name, fields = out.len(), "secret loaded");
        Ok(out)
    }

    async fn save_secret(&self, namespace: &str, name: &str, mapping: Mapping) -> Result<()> {
        let client = Client::try_default().await?;
        let api: Api<Secret> = Api::namespaced(client, namespace);

        let mut desired = Secret::default();
        desired.metadata.name = Some(name.to_string());
        desired.metadata.namespace = Some(namespace.to_string());
        desired.type_ = Some("Opaque".to_string());
        desired.string_data = Some(mapping);

        // Replace so removed keys actually disappear from `data`; the
        // server folds string_data into data on write.
        match api.get_opt(name).await? {
            Some(existing) => {
                desired.metadata.resource_version = existing.metadata.resource_version;
                api.replace(name, &PostParams::default(), &desired).await?;
                info!(ns = %namespace, name = %name, "secret replaced");
            }
            None => {
                api.create(&PostParams::default(), &desired).await?;
                info!(ns = %namespace, name = %name, "secret created");
            }
        }
        Ok(())
    }

    async fn patch_deployments(&self, namespace: &str, name: &str) -> Result<()> {
        let client = Client::try_default().await?;
        let api: Api<Deployment> = Api::namespaced(client, namespace);
        let list = api.list(&ListParams::default()).await?;
        let targets: Vec<String> = list
            .items
            .iter()
            .filter(|d| references_secret(d, name))
            .filter_map(|d| d.metadata.name.clone())
            .collect();
        if targets.is_empty() {
            warn!(ns = %namespace, secret = %name, "no deployments reference the secret");
            return Ok(());
        }

        let ts = chrono::Utc::now().to_rfc3339();
        let patch = serde_json::json!({
            "spec": {"template": {"metadata": {"annotations": {"kubectl.kubernetes.io/restartedAt": ts}}}}
        });
        let pp = PatchParams::default();
        for deployment in &targets {
            api.patch(deployment, &pp, &Patch::Merge(&patch)).await?;
            info!(ns = %namespace, deployment = %deployment, "rollout restart patched");
        }
        Ok(())
    }
}

/// Whether a deployment's pod template consumes the named secret via
/// envFrom, a secretKeyRef, or a secret volume.
fn references_secret(deployment: &Deployment, name: &str) -> bool {
    let Some(pod) = deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
    else {
        return false;
    };

    let containers = pod
        .containers
        .iter()
        .chain(pod.init_containers.iter().flatten());
    for container in containers {
        for env_from in container.env_from.iter().flatten() {
            if env_from
                .secret_ref
                .as_ref()
                .and_then(|r| r.name.as_deref())
                == Some(name)
            {
                return true;
            }
        }
        for env in container.env.iter().flatten() {
            if env
                .value_from
                .as_ref()
                .and_then(|v| v.secret_key_ref.as_ref())
                .and_then(|r| r.name.as_deref())
                == Some(name)
            {
                return true;
            }
        }
    }
    pod.volumes.iter().flatten().any(|v| {
        v.secret.as_ref().and_then(|s| s.secret_name.as_deref()) == Some(name)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment(json: serde_json::Value) -> Deployment {
        serde_json::from_value(json).expect("deployment fixture")
    }

    #[test]
    fn env_from_secret_ref_matches() {
        let d = deployment(serde_json::json!({
            "metadata": {"name": "web"},
            "spec": {
                "selector": {},
                "template": {"spec": {"containers": [
                    {"name": "app", "envFrom": [{"secretRef": {"name": "cool-app"}}]}
                ]}}
            }
        }));
        assert!(references_secret(&d, "cool-app"));
        assert!(!references_secret(&d, "other-app"));
    }

    #[test]
    fn secret_key_ref_matches() {
        let d = deployment(serde_json::json!({
            "metadata": {"name": "worker"},
            "spec": {
                "selector": {},
                "template": {"spec": {"containers": [
                    {"name": "app", "env": [
                        {"name": "TOKEN", "valueFrom": {"secretKeyRef": {"name": "cool-app", "key": "TOKEN"}}}
                    ]}
                ]}}
            }
        }));
        assert!(references_secret(&d, "cool-app"));
    }

    #[test]
    fn secret_volume_matches() {
        let d = deployment(serde_json::json!({
            "metadata": {"name": "web"},
            "spec": {
                "selector": {},
                "template": {"spec": {
                    "containers": [{"name": "app"}],
                    "volumes": [{"name": "creds", "secret": {"secretName": "cool-app"}}]
                }}
            }
        }));
        assert!(references_secret(&d, "cool-app"));
    }

    #[test]
    fn init_container_env_from_matches() {
        let d = deployment(serde_json::json!({
            "metadata": {"name": "web"},
            "spec": {
                "selector": {},
                "template": {"spec": {
                    "containers": [{"name": "app"}],
                    "initContainers": [
                        {"name": "migrate", "envFrom": [{"secretRef": {"name": "cool-app"}}]}
                    ]
                }}
            }
        }));
        assert!(references_secret(&d, "cool-app"));
    }

    #[test]
    fn unrelated_deployment_does_not_match() {
        let d = deployment(serde_json::json!({
            "metadata": {"name": "web"},
            "spec": {
                "selector": {},
                "template": {"spec": {"containers": [{"name": "app"}]}}
            }
        }));
        assert!(!references_secret(&d, "cool-app"));
    }
}
