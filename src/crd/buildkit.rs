//! Buildkit Custom Resource Definition
//!
//! A Buildkit is a request for one running buildkitd built from a named
//! BuildkitTemplate in the same namespace. Its spec is fixed once created; the
//! controller reports progress and the daemon endpoint through the status.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{set_condition, Condition, ResourceKind, ResourceRef};
use crate::resources::{ResourceList, ResourceRequirements};

/// Specification for a Buildkit instance
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "buildkit.dev",
    version = "v1alpha1",
    kind = "Buildkit",
    plural = "buildkits",
    shortname = "bk",
    status = "BuildkitStatus",
    namespaced,
    printcolumn = r#"{"name":"Template","type":"string","jsonPath":".spec.template"}"#,
    printcolumn = r#"{"name":"Endpoint","type":"string","jsonPath":".status.endpoint"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BuildkitSpec {
    /// Name of the BuildkitTemplate to build from
    pub template: String,

    /// Resource override; limits above the template default are ignored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Ceiling override; can only lower the template ceiling
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub maximum: ResourceList,

    /// Extra labels for the pod
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Extra annotations for the pod
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Status for a Buildkit instance
///
/// Every field is always serialized so a merge patch clears stale values.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildkitStatus {
    /// Conditions representing the instance state
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Objects managed for this instance
    #[serde(default)]
    pub resource_refs: Vec<ResourceRef>,

    /// buildkitd address, `tcp://<ip>:<port>`, set only while the pod is ready
    #[serde(default)]
    pub endpoint: String,
}

impl BuildkitStatus {
    /// Add a condition and return self for chaining
    pub fn condition(mut self, condition: Condition) -> Self {
        set_condition(&mut self.conditions, condition);
        self
    }

    /// Set the endpoint and return self for chaining
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Replace the managed references and return self for chaining
    pub fn resource_refs(mut self, refs: Vec<ResourceRef>) -> Self {
        self.resource_refs = refs;
        self
    }

    /// Managed references of the given kind
    pub fn refs_of(&self, kind: ResourceKind) -> impl Iterator<Item = &ResourceRef> {
        self.resource_refs.iter().filter(move |r| r.kind == kind)
    }
}
