//! Flavor plugin SPI.
//!
//! A flavor customises instances for a workload topology: it enriches an
//! instance spec before provisioning ([`Flavor::prepare`]) and cleans up
//! after the workload before an instance is destroyed ([`Flavor::drain`]).
//! Flavors are served by plugin processes and reached through discovery; the
//! reconciliation loop that decides when to call them lives elsewhere.
//!
//! Instances are associated with workload-side objects (e.g. swarm nodes)
//! through a [`Link`]: a random value stored both in the instance's tags and
//! in the workload object's labels.

pub mod swarm;

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Tag key holding the link value.
pub const LINK_TAG: &str = "plugdir-link";

/// Tag key holding the link context.
pub const LINK_CONTEXT_TAG: &str = "plugdir-link-context";

/// A volume, NIC or similar resource attached to an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Provider-side identifier.
    #[serde(rename = "ID")]
    pub id: String,
    /// Resource kind, e.g. `ebs`.
    #[serde(rename = "Type")]
    pub kind: String,
}

/// Everything an instance plugin needs to provision one instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InstanceSpec {
    /// Provider-specific properties, passed through opaquely.
    #[serde(default)]
    pub properties: serde_json::Value,
    /// Tags to set on the instance.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Init script run on first boot.
    #[serde(default)]
    pub init: String,
    /// Stable identity for pets (e.g. managers with fixed IPs).
    #[serde(default, rename = "LogicalID")]
    pub logical_id: Option<String>,
    /// Resources to attach.
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// A provisioned instance as reported by an instance plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InstanceDescription {
    /// Provider-assigned instance ID.
    #[serde(rename = "ID")]
    pub id: String,
    /// Logical ID, if the instance has one.
    #[serde(default, rename = "LogicalID")]
    pub logical_id: Option<String>,
    /// Tags on the instance.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// How a group sizes itself: a count, or a fixed set of logical IDs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AllocationMethod {
    /// Desired number of instances.
    #[serde(default)]
    pub size: u32,
    /// Fixed logical IDs, for pet groups.
    #[serde(default, rename = "LogicalIDs")]
    pub logical_ids: Vec<String>,
}

/// Association between an instance and the workload object it became.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    value: String,
    context: String,
}

impl Link {
    /// A fresh link with a random value.
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            value: uuid::Uuid::new_v4().simple().to_string(),
            context: context.into(),
        }
    }

    /// Recover a link from instance tags. The result may be invalid.
    pub fn from_tags(tags: &BTreeMap<String, String>) -> Self {
        Self {
            value: tags.get(LINK_TAG).cloned().unwrap_or_default(),
            context: tags.get(LINK_CONTEXT_TAG).cloned().unwrap_or_default(),
        }
    }

    /// Whether the link carries a value.
    pub fn is_valid(&self) -> bool {
        !self.value.is_empty()
    }

    /// Label key under which the value is stored on workload objects.
    pub fn label(&self) -> &'static str {
        LINK_TAG
    }

    /// The link value.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Free-form context, e.g. `swarm/<id>/worker`.
    pub fn context(&self) -> &str {
        &self.context
    }

    /// The link as instance tags.
    pub fn tags(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LINK_TAG.to_string(), self.value.clone()),
            (LINK_CONTEXT_TAG.to_string(), self.context.clone()),
        ])
    }
}

/// The flavor plugin interface.
#[async_trait]
pub trait Flavor: Send + Sync {
    /// Enrich `spec` before the instance is provisioned.
    async fn prepare(
        &self,
        config: Option<&serde_json::Value>,
        spec: InstanceSpec,
        allocation: &AllocationMethod,
    ) -> Result<InstanceSpec>;

    /// Clean up workload state before `instance` is destroyed.
    async fn drain(&self, config: Option<&serde_json::Value>, instance: &InstanceDescription) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_round_trips_through_tags() {
        let link = Link::new("swarm/abc/worker");
        assert!(link.is_valid());
        assert_eq!(Link::from_tags(&link.tags()), link);
    }

    #[test]
    fn test_link_from_untagged_instance_is_invalid() {
        let link = Link::from_tags(&BTreeMap::from([("env".to_string(), "prod".to_string())]));
        assert!(!link.is_valid());
    }

    #[test]
    fn test_links_are_unique() {
        assert_ne!(Link::new("c").value(), Link::new("c").value());
    }

    #[test]
    fn test_instance_spec_wire_names() {
        let spec: InstanceSpec = serde_json::from_value(serde_json::json!({
            "Tags": {"role": "worker"},
            "LogicalID": "m1",
            "Attachments": [{"ID": "vol-1", "Type": "ebs"}]
        }))
        .unwrap();
        assert_eq!(spec.logical_id.as_deref(), Some("m1"));
        assert_eq!(spec.attachments[0].kind, "ebs");
        assert_eq!(spec.tags["role"], "worker");
    }
}
