//! BuildkitTemplate Custom Resource Definition
//!
//! A BuildkitTemplate is the administrator-authored shape of a Buildkit daemon:
//! image, port, daemon config, execution mode, scheduling, lifecycle and the
//! resource defaults and ceiling that every instance built from it inherits.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, ResourceRef};
use crate::resources::{ResourceList, ResourceRequirements};
use crate::workload::{
    preserve_unknown_fields, preserve_unknown_list, FreeForm, Pod, Toleration,
    TopologySpreadConstraint,
};

/// Longest allowed template name; derived ConfigMap names add a prefix and suffix
pub const TEMPLATE_NAME_MAX_LENGTH: usize = 57;

/// Specification for a BuildkitTemplate
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "buildkit.dev",
    version = "v1alpha1",
    kind = "BuildkitTemplate",
    plural = "buildkittemplates",
    shortname = "bkt",
    status = "BuildkitTemplateStatus",
    namespaced,
    printcolumn = r#"{"name":"Port","type":"integer","jsonPath":".spec.port"}"#,
    printcolumn = r#"{"name":"Rootless","type":"boolean","jsonPath":".spec.rootless"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BuildkitTemplateSpec {
    /// Extra labels applied to every Buildkit pod
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pod_labels: BTreeMap<String, String>,

    /// Extra annotations applied to every Buildkit pod
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pod_annotations: BTreeMap<String, String>,

    /// Run buildkitd without privileges
    #[serde(default)]
    pub rootless: bool,

    /// TCP port buildkitd listens on
    #[serde(default = "default_port")]
    pub port: i32,

    /// buildkitd.toml contents
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub buildkitd_toml: String,

    /// Container image for buildkitd
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,

    /// Image pull policy for buildkitd
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_pull_policy: String,

    /// Resource defaults and ceiling
    #[serde(default)]
    pub resources: TemplateResources,

    /// Entrypoint override for buildkitd
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    /// Service account the pods run as
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_account_name: String,

    /// Scheduling constraints
    #[serde(default)]
    pub scheduling: TemplateScheduling,

    /// Lifecycle settings
    #[serde(default)]
    pub lifecycle: TemplateLifecycle,

    /// Logging and tracing settings
    #[serde(default)]
    pub observability: TemplateObservability,

    /// Share the host user namespace; false runs the pod in its own user namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_users: Option<bool>,

    /// Partial pod merged over everything above
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub pod_template: Option<Pod>,
}

fn default_port() -> i32 {
    i32::from(crate::DEFAULT_PORT)
}

impl Default for BuildkitTemplateSpec {
    fn default() -> Self {
        Self {
            pod_labels: BTreeMap::new(),
            pod_annotations: BTreeMap::new(),
            rootless: false,
            port: default_port(),
            buildkitd_toml: String::new(),
            image: String::new(),
            image_pull_policy: String::new(),
            resources: TemplateResources::default(),
            command: Vec::new(),
            service_account_name: String::new(),
            scheduling: TemplateScheduling::default(),
            lifecycle: TemplateLifecycle::default(),
            observability: TemplateObservability::default(),
            host_users: None,
            pod_template: None,
        }
    }
}

/// Resource defaults and ceiling for instances of a template
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct TemplateResources {
    /// Requirements used when an instance asks for nothing else
    #[serde(default)]
    pub default: ResourceRequirements,

    /// Largest limit any instance may receive
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub maximum: ResourceList,
}

/// Scheduling constraints for Buildkit pods
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateScheduling {
    /// Node selector
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Tolerations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "preserve_unknown_list")]
    pub tolerations: Vec<Toleration>,

    /// Affinity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub affinity: Option<FreeForm>,

    /// Priority class name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub priority_class_name: String,

    /// Topology spread constraints
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "preserve_unknown_list")]
    pub topology_spread_constraints: Vec<TopologySpreadConstraint>,
}

/// Lifecycle settings for Buildkit pods
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateLifecycle {
    /// Instances must carry an owner reference
    #[serde(default)]
    pub require_owner: bool,

    /// Restart policy override
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub restart_policy: String,

    /// Termination grace period override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_grace_period_seconds: Option<i64>,

    /// Hard deadline for the pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_deadline_seconds: Option<i64>,

    /// Install a pre-stop hook that waits for in-flight builds
    #[serde(default)]
    pub pre_stop_script: bool,
}

/// Logging and tracing settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateObservability {
    /// Run buildkitd with `--debug`
    #[serde(default)]
    pub debug_logging: bool,

    /// OpenTelemetry export settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub otlp: Option<OtlpSettings>,
}

/// OpenTelemetry settings passed to buildkitd through its environment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OtlpSettings {
    /// Service name reported by buildkitd
    pub service_name: String,

    /// Extra resource attributes
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resource_attributes: BTreeMap<String, String>,
}

impl OtlpSettings {
    /// Resource attributes in `OTEL_RESOURCE_ATTRIBUTES` form
    pub fn resource_attributes_env(&self) -> String {
        self.resource_attributes
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Status for a BuildkitTemplate
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildkitTemplateStatus {
    /// Conditions representing the template state
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// ConfigMaps published for this template
    #[serde(default)]
    pub resource_refs: Vec<ResourceRef>,

    /// Generation the status was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl BuildkitTemplateStatus {
    /// Add a condition and return self for chaining
    pub fn condition(mut self, condition: Condition) -> Self {
        super::types::set_condition(&mut self.conditions, condition);
        self
    }
}
