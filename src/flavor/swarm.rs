//! Swarm worker flavor.
//!
//! Prepares instances to join a container swarm as workers and, on drain,
//! removes the matching node from the swarm. The swarm API is reached through
//! a [`SwarmClient`] produced by a caller-supplied [`Connector`], so tests
//! and alternative transports plug in without touching global state.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{AllocationMethod, Attachment, Flavor, InstanceDescription, InstanceSpec, Link};

/// Default worker init script.
pub const DEFAULT_WORKER_INIT: &str = "#!/bin/sh
set -o errexit
set -o nounset
set -o xtrace

docker swarm join --token {{JOIN_TOKEN}} {{MANAGER_ADDR}}
";

/// Flavor configuration, decoded from the group's flavor properties.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SwarmSpec {
    /// How to reach the swarm API.
    #[serde(default)]
    pub docker: ConnectInfo,
    /// Attachments per logical ID.
    #[serde(default)]
    pub attachments: BTreeMap<String, Vec<Attachment>>,
}

/// Swarm API endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConnectInfo {
    /// e.g. `unix:///var/run/docker.sock` or `tcp://10.0.0.5:2376`.
    #[serde(default)]
    pub host: String,
    /// TLS material, if the endpoint requires it.
    #[serde(default, rename = "TLS")]
    pub tls: Option<TlsInfo>,
}

/// TLS client settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TlsInfo {
    /// CA bundle path.
    #[serde(default)]
    pub ca_file: String,
    /// Client certificate path.
    #[serde(default)]
    pub cert_file: String,
    /// Client key path.
    #[serde(default)]
    pub key_file: String,
    /// Skip server certificate verification.
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

/// What a joining node needs to know about the swarm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwarmInfo {
    /// Swarm cluster ID.
    pub id: String,
    /// Join token for workers.
    pub worker_token: String,
    /// Join token for managers.
    pub manager_token: String,
    /// Address of a reachable manager.
    pub manager_addr: String,
}

/// A swarm node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Node ID.
    pub id: String,
    /// Node labels.
    pub labels: BTreeMap<String, String>,
}

/// The subset of the swarm API the flavor uses.
#[async_trait]
pub trait SwarmClient: Send + Sync {
    /// Cluster identity, join tokens and a manager address.
    async fn swarm_info(&self) -> Result<SwarmInfo>;

    /// Nodes carrying `label=value`.
    async fn node_list(&self, label: &str, value: &str) -> Result<Vec<Node>>;

    /// Remove a node from the swarm.
    async fn node_remove(&self, id: &str, force: bool) -> Result<()>;
}

/// Builds a client for the endpoint described in a [`SwarmSpec`].
pub type Connector = Arc<dyn Fn(&SwarmSpec) -> Result<Arc<dyn SwarmClient>> + Send + Sync>;

/// Init script template with `{{KEY}}` placeholders.
///
/// Known keys: `ROLE`, `SWARM_ID`, `JOIN_TOKEN`, `MANAGER_ADDR`, `LINK`,
/// `LOGICAL_ID`, `SIZE`. Unknown placeholders are left as they are.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitTemplate(String);

impl InitTemplate {
    /// Template from source text.
    pub fn new(source: impl Into<String>) -> Self {
        Self(source.into())
    }

    fn render(&self, vars: &BTreeMap<&str, String>) -> String {
        vars.iter().fold(self.0.clone(), |text, (key, value)| {
            text.replace(&format!("{{{{{key}}}}}"), value)
        })
    }
}

impl Default for InitTemplate {
    fn default() -> Self {
        Self::new(DEFAULT_WORKER_INIT)
    }
}

/// Behaviour shared by swarm roles.
struct BaseFlavor {
    init: InitTemplate,
    connect: Connector,
}

impl std::fmt::Debug for BaseFlavor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseFlavor").field("init", &self.init).finish_non_exhaustive()
    }
}

impl BaseFlavor {
    fn decode(config: Option<&serde_json::Value>) -> Result<SwarmSpec> {
        let config = config.ok_or_else(|| anyhow!("missing config"))?;
        serde_json::from_value(config.clone()).context("invalid swarm flavor config")
    }

    async fn prepare(
        &self,
        role: &str,
        config: Option<&serde_json::Value>,
        mut spec: InstanceSpec,
        allocation: &AllocationMethod,
    ) -> Result<InstanceSpec> {
        let swarm_spec = Self::decode(config)?;
        let client = (self.connect)(&swarm_spec)?;
        let info = client.swarm_info().await.context("querying swarm state")?;

        let join_token = match role {
            "manager" => &info.manager_token,
            _ => &info.worker_token,
        };
        let link = Link::new(format!("swarm/{}/{role}", info.id));

        let vars = BTreeMap::from([
            ("ROLE", role.to_string()),
            ("SWARM_ID", info.id.clone()),
            ("JOIN_TOKEN", join_token.clone()),
            ("MANAGER_ADDR", info.manager_addr.clone()),
            ("LINK", link.value().to_string()),
            ("LOGICAL_ID", spec.logical_id.clone().unwrap_or_default()),
            ("SIZE", allocation.size.to_string()),
        ]);
        spec.init = self.init.render(&vars);

        if let Some(logical_id) = &spec.logical_id {
            if let Some(attachments) = swarm_spec.attachments.get(logical_id) {
                spec.attachments.extend(attachments.iter().cloned());
            }
        }

        spec.tags.extend(link.tags());
        Ok(spec)
    }
}

/// Flavor for swarm worker nodes.
#[derive(Debug)]
pub struct WorkerFlavor {
    base: BaseFlavor,
}

impl WorkerFlavor {
    /// Worker flavor that reaches the swarm through `connect`.
    pub fn new(connect: Connector, init: InitTemplate) -> Self {
        Self {
            base: BaseFlavor { init, connect },
        }
    }
}

#[async_trait]
impl Flavor for WorkerFlavor {
    async fn prepare(
        &self,
        config: Option<&serde_json::Value>,
        spec: InstanceSpec,
        allocation: &AllocationMethod,
    ) -> Result<InstanceSpec> {
        self.base.prepare("worker", config, spec, allocation).await
    }

    /// Force-removes the node linked to `instance` from the swarm.
    async fn drain(&self, config: Option<&serde_json::Value>, instance: &InstanceDescription) -> Result<()> {
        let swarm_spec = BaseFlavor::decode(config)?;
        let client = (self.base.connect)(&swarm_spec)?;

        let link = Link::from_tags(&instance.tags);
        if !link.is_valid() {
            bail!("Unable to drain {} without an association tag", instance.id);
        }

        let nodes = client.node_list(link.label(), link.value()).await?;
        match nodes.as_slice() {
            [] => bail!("Unable to drain {}, not found in swarm", instance.id),
            [node] => {
                log::debug!("Swarm node remove {}", node.id);
                client.node_remove(&node.id, true).await
            }
            many => {
                let ids: Vec<&str> = many.iter().map(|n| n.id.as_str()).collect();
                bail!(
                    "Expected at most one node with label {}, but found {:?}",
                    link.value(),
                    ids
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flavor::{LINK_CONTEXT_TAG, LINK_TAG};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeSwarm {
        nodes: Vec<Node>,
        removed: Mutex<Vec<(String, bool)>>,
    }

    #[async_trait]
    impl SwarmClient for FakeSwarm {
        async fn swarm_info(&self) -> Result<SwarmInfo> {
            Ok(SwarmInfo {
                id: "swarm-1".to_string(),
                worker_token: "SWMTKN-worker".to_string(),
                manager_token: "SWMTKN-manager".to_string(),
                manager_addr: "10.0.0.2:2377".to_string(),
            })
        }

        async fn node_list(&self, label: &str, value: &str) -> Result<Vec<Node>> {
            Ok(self
                .nodes
                .iter()
                .filter(|n| n.labels.get(label).map(String::as_str) == Some(value))
                .cloned()
                .collect())
        }

        async fn node_remove(&self, id: &str, force: bool) -> Result<()> {
            self.removed.lock().unwrap().push((id.to_string(), force));
            Ok(())
        }
    }

    fn node(id: &str, link: &str) -> Node {
        Node {
            id: id.to_string(),
            labels: BTreeMap::from([(LINK_TAG.to_string(), link.to_string())]),
        }
    }

    fn flavor_with(swarm: Arc<FakeSwarm>) -> WorkerFlavor {
        let connect: Connector = Arc::new(move |_spec: &SwarmSpec| -> Result<Arc<dyn SwarmClient>> {
            let client: Arc<FakeSwarm> = Arc::clone(&swarm);
            Ok(client)
        });
        WorkerFlavor::new(connect, InitTemplate::default())
    }

    fn config() -> serde_json::Value {
        serde_json::json!({
            "Docker": {"Host": "unix:///var/run/docker.sock"},
            "Attachments": {"w1": [{"ID": "vol-7", "Type": "ebs"}]}
        })
    }

    fn linked_instance(link: &str) -> InstanceDescription {
        InstanceDescription {
            id: "i-123".to_string(),
            logical_id: None,
            tags: BTreeMap::from([(LINK_TAG.to_string(), link.to_string())]),
        }
    }

    #[tokio::test]
    async fn test_prepare_renders_join_and_links() {
        let flavor = flavor_with(Arc::new(FakeSwarm::default()));
        let spec = InstanceSpec {
            tags: BTreeMap::from([("group".to_string(), "workers".to_string())]),
            ..InstanceSpec::default()
        };

        let prepared = flavor
            .prepare(Some(&config()), spec, &AllocationMethod { size: 3, logical_ids: vec![] })
            .await
            .unwrap();

        assert!(prepared.init.contains("docker swarm join --token SWMTKN-worker 10.0.0.2:2377"));
        assert_eq!(prepared.tags["group"], "workers");
        assert!(!prepared.tags[LINK_TAG].is_empty());
        assert_eq!(prepared.tags[LINK_CONTEXT_TAG], "swarm/swarm-1/worker");
    }

    #[tokio::test]
    async fn test_prepare_adds_attachments_for_logical_id() {
        let flavor = flavor_with(Arc::new(FakeSwarm::default()));
        let spec = InstanceSpec {
            logical_id: Some("w1".to_string()),
            ..InstanceSpec::default()
        };

        let prepared = flavor
            .prepare(Some(&config()), spec, &AllocationMethod::default())
            .await
            .unwrap();
        assert_eq!(
            prepared.attachments,
            vec![Attachment { id: "vol-7".to_string(), kind: "ebs".to_string() }]
        );
    }

    #[tokio::test]
    async fn test_prepare_custom_template() {
        let swarm = Arc::new(FakeSwarm::default());
        let connect: Connector = Arc::new(move |_: &SwarmSpec| -> Result<Arc<dyn SwarmClient>> {
            let client: Arc<FakeSwarm> = Arc::clone(&swarm);
            Ok(client)
        });
        let flavor = WorkerFlavor::new(connect, InitTemplate::new("{{ROLE}} {{SWARM_ID}} {{UNKNOWN}}"));

        let prepared = flavor
            .prepare(Some(&config()), InstanceSpec::default(), &AllocationMethod::default())
            .await
            .unwrap();
        assert_eq!(prepared.init, "worker swarm-1 {{UNKNOWN}}");
    }

    #[tokio::test]
    async fn test_prepare_connector_failure_propagates() {
        let connect: Connector = Arc::new(|spec: &SwarmSpec| -> Result<Arc<dyn SwarmClient>> {
            Err(anyhow!("cannot reach {}", spec.docker.host))
        });
        let flavor = WorkerFlavor::new(connect, InitTemplate::default());

        let err = flavor
            .prepare(Some(&config()), InstanceSpec::default(), &AllocationMethod::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unix:///var/run/docker.sock"), "got: {err}");
    }

    #[tokio::test]
    async fn test_drain_removes_single_node() {
        let swarm = Arc::new(FakeSwarm {
            nodes: vec![node("n1", "abc"), node("n2", "other")],
            ..FakeSwarm::default()
        });
        let flavor = flavor_with(Arc::clone(&swarm));

        flavor.drain(Some(&config()), &linked_instance("abc")).await.unwrap();
        assert_eq!(*swarm.removed.lock().unwrap(), vec![("n1".to_string(), true)]);
    }

    #[tokio::test]
    async fn test_drain_missing_config() {
        let flavor = flavor_with(Arc::new(FakeSwarm::default()));
        let err = flavor.drain(None, &linked_instance("abc")).await.unwrap_err();
        assert_eq!(err.to_string(), "missing config");
    }

    #[tokio::test]
    async fn test_drain_without_link_tag() {
        let flavor = flavor_with(Arc::new(FakeSwarm::default()));
        let instance = InstanceDescription {
            id: "i-9".to_string(),
            ..InstanceDescription::default()
        };

        let err = flavor.drain(Some(&config()), &instance).await.unwrap_err();
        assert!(err.to_string().contains("without an association tag"), "got: {err}");
    }

    #[tokio::test]
    async fn test_drain_node_not_in_swarm() {
        let flavor = flavor_with(Arc::new(FakeSwarm::default()));
        let err = flavor.drain(Some(&config()), &linked_instance("abc")).await.unwrap_err();
        assert!(err.to_string().contains("not found in swarm"), "got: {err}");
    }

    #[tokio::test]
    async fn test_drain_ambiguous_link() {
        let swarm = Arc::new(FakeSwarm {
            nodes: vec![node("n1", "abc"), node("n2", "abc")],
            ..FakeSwarm::default()
        });
        let flavor = flavor_with(Arc::clone(&swarm));

        let err = flavor.drain(Some(&config()), &linked_instance("abc")).await.unwrap_err();
        assert!(err.to_string().contains("Expected at most one node"), "got: {err}");
        assert!(swarm.removed.lock().unwrap().is_empty());
    }
}
