//! ConfigMaps derived from a BuildkitTemplate
//!
//! A template yields up to two artifacts:
//! - `buildkit-<template>-toml` holding `buildkitd.toml`, when the template carries
//!   daemon config
//! - `buildkit-<template>-scripts` holding the pre-stop hook, when the template
//!   asks for one
//!
//! Names depend only on the template name, so an artifact that is no longer
//! derived can be deleted without materialising it first.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::ResourceExt;

use crate::crd::BuildkitTemplate;

/// Prefix shared by every derived artifact name
pub const ARTIFACT_PREFIX: &str = "buildkit";

/// Placeholder in the bundled script that receives the template port
const PORT_PLACEHOLDER: &str = "BUILDKITD_PORT=1234";

const PRESTOP_SOURCE: &str = include_str!("buildkit-prestop.sh");

/// The artifacts a template can produce
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArtifactKind {
    /// buildkitd configuration
    DaemonConfig,
    /// Lifecycle scripts
    Scripts,
}

impl ArtifactKind {
    /// Every artifact kind, in publish order
    pub const ALL: [ArtifactKind; 2] = [ArtifactKind::DaemonConfig, ArtifactKind::Scripts];

    /// Suffix appended to the artifact name
    pub fn suffix(self) -> &'static str {
        match self {
            Self::DaemonConfig => "toml",
            Self::Scripts => "scripts",
        }
    }

    /// Key of the single file inside the artifact
    pub fn file_name(self) -> &'static str {
        match self {
            Self::DaemonConfig => "buildkitd.toml",
            Self::Scripts => "buildkit-prestop.sh",
        }
    }
}

/// Name of the artifact of `kind` for the named template
pub fn artifact_name(template_name: &str, kind: ArtifactKind) -> String {
    format!("{ARTIFACT_PREFIX}-{template_name}-{}", kind.suffix())
}

/// The pre-stop script with the template port substituted
pub fn prestop_script(port: i32) -> String {
    PRESTOP_SOURCE.replacen(PORT_PLACEHOLDER, &format!("BUILDKITD_PORT={port}"), 1)
}

/// A derived ConfigMap before it is sent to the API server
#[derive(Clone, Debug, PartialEq)]
pub struct ConfigArtifact {
    /// Which artifact this is
    pub kind: ArtifactKind,
    /// ConfigMap name
    pub name: String,
    /// ConfigMap namespace
    pub namespace: String,
    /// File contents keyed by file name
    pub data: BTreeMap<String, String>,
}

impl ConfigArtifact {
    fn new(template: &BuildkitTemplate, kind: ArtifactKind, contents: String) -> Self {
        Self {
            kind,
            name: artifact_name(&template.name_any(), kind),
            namespace: template.namespace().unwrap_or_default(),
            data: BTreeMap::from([(kind.file_name().to_string(), contents)]),
        }
    }

    /// Build the ConfigMap, owned by the template when an owner is given
    pub fn to_config_map(&self, owner: Option<OwnerReference>) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(BTreeMap::from([
                    (
                        "app.kubernetes.io/managed-by".to_string(),
                        crate::FIELD_MANAGER.to_string(),
                    ),
                    (
                        "app.kubernetes.io/component".to_string(),
                        self.kind.suffix().to_string(),
                    ),
                ])),
                owner_references: owner.map(|o| vec![o]),
                ..Default::default()
            },
            data: Some(self.data.clone()),
            ..Default::default()
        }
    }
}

/// The daemon-config artifact, present when the template has config text
pub fn daemon_config(template: &BuildkitTemplate) -> Option<ConfigArtifact> {
    let toml = &template.spec.buildkitd_toml;
    if toml.is_empty() {
        return None;
    }
    Some(ConfigArtifact::new(
        template,
        ArtifactKind::DaemonConfig,
        toml.clone(),
    ))
}

/// The lifecycle-script artifact, present when the template asks for a pre-stop hook
pub fn scripts(template: &BuildkitTemplate) -> Option<ConfigArtifact> {
    if !template.spec.lifecycle.pre_stop_script {
        return None;
    }
    Some(ConfigArtifact::new(
        template,
        ArtifactKind::Scripts,
        prestop_script(template.spec.port),
    ))
}

/// The artifact of `kind`, if the template produces it
pub fn derive(template: &BuildkitTemplate, kind: ArtifactKind) -> Option<ConfigArtifact> {
    match kind {
        ArtifactKind::DaemonConfig => daemon_config(template),
        ArtifactKind::Scripts => scripts(template),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::BuildkitTemplateSpec;

    fn template(spec: BuildkitTemplateSpec) -> BuildkitTemplate {
        let mut template = BuildkitTemplate::new("default", spec);
        template.metadata.namespace = Some("ci".to_string());
        template
    }

    /// Story: A template without daemon config publishes no config artifact
    #[test]
    fn story_empty_config_produces_no_artifact() {
        let tpl = template(BuildkitTemplateSpec::default());

        assert!(daemon_config(&tpl).is_none());
        assert!(scripts(&tpl).is_none());
    }

    /// Story: Daemon config is published verbatim under buildkitd.toml
    #[test]
    fn story_config_blob_is_published_verbatim() {
        let toml = "debug = true\n[worker.oci]\n  gc = false\n";
        let tpl = template(BuildkitTemplateSpec {
            buildkitd_toml: toml.to_string(),
            ..Default::default()
        });

        let artifact = daemon_config(&tpl).unwrap();

        assert_eq!(artifact.name, "buildkit-default-toml");
        assert_eq!(artifact.namespace, "ci");
        assert_eq!(artifact.data.len(), 1);
        assert_eq!(artifact.data["buildkitd.toml"], toml);
    }

    #[test]
    fn test_prestop_script_uses_template_port() {
        let mut spec = BuildkitTemplateSpec {
            port: 8372,
            ..Default::default()
        };
        spec.lifecycle.pre_stop_script = true;
        let tpl = template(spec);

        let artifact = scripts(&tpl).unwrap();
        let script = &artifact.data["buildkit-prestop.sh"];

        assert_eq!(artifact.name, "buildkit-default-scripts");
        assert!(script.starts_with("#!/bin/sh"));
        assert!(script.contains("BUILDKITD_PORT=8372"));
        assert!(!script.contains("BUILDKITD_PORT=1234"));
    }

    #[test]
    fn test_default_port_script_is_unchanged() {
        assert_eq!(prestop_script(1234), PRESTOP_SOURCE);
    }

    #[test]
    fn test_names_are_computable_without_template() {
        assert_eq!(
            artifact_name("gpu", ArtifactKind::DaemonConfig),
            "buildkit-gpu-toml"
        );
        assert_eq!(
            artifact_name("gpu", ArtifactKind::Scripts),
            "buildkit-gpu-scripts"
        );
    }

    #[test]
    fn test_config_map_carries_owner_and_data() {
        let tpl = template(BuildkitTemplateSpec {
            buildkitd_toml: "debug = true".to_string(),
            ..Default::default()
        });
        let owner = OwnerReference {
            name: "default".to_string(),
            kind: "BuildkitTemplate".to_string(),
            ..Default::default()
        };

        let cm = derive(&tpl, ArtifactKind::DaemonConfig)
            .unwrap()
            .to_config_map(Some(owner));

        assert_eq!(cm.metadata.name.as_deref(), Some("buildkit-default-toml"));
        assert_eq!(cm.metadata.owner_references.unwrap()[0].name, "default");
        assert_eq!(cm.data.unwrap()["buildkitd.toml"], "debug = true");
    }
}
