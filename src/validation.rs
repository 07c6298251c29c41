//! Admission rules for Buildkit and BuildkitTemplate objects
//!
//! The rules are plain functions returning a [`Validation`] report so they can
//! back an admission webhook or be run by the controllers themselves. Templates
//! are checked on their own; instances need a [`TemplateLookup`] because most
//! of their rules depend on the template they name.

use std::fmt;

use kube::ResourceExt;

use crate::builder::TemplateLookup;
use crate::crd::{Buildkit, BuildkitTemplate, BuildkitTemplateSpec, TEMPLATE_NAME_MAX_LENGTH};
use crate::resources::{self, ResourceList};
use crate::{Error, DEFAULT_IMAGE, DEFAULT_PORT};

/// A rule violation on one field
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldError {
    /// Dotted path of the offending field
    pub path: String,
    /// What is wrong with it
    pub message: String,
}

impl FieldError {
    fn new(path: &str, message: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Outcome of validating one object
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Validation {
    /// Violations that make the object unacceptable
    pub errors: Vec<FieldError>,
    /// Accepted, but worth telling the author about
    pub warnings: Vec<String>,
}

impl Validation {
    /// Returns true if no rule was violated
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Every violation on one line
    pub fn summary(&self) -> String {
        self.errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Convert into the warnings on success or a validation error listing every violation
    pub fn into_result(self) -> Result<Vec<String>, Error> {
        if self.errors.is_empty() {
            return Ok(self.warnings);
        }
        Err(Error::validation(self.summary()))
    }

    fn error(&mut self, path: &str, message: impl Into<String>) {
        self.errors.push(FieldError::new(path, message));
    }
}

/// Fill in template fields left at their zero value
pub fn default_template(spec: &mut BuildkitTemplateSpec) {
    if spec.port == 0 {
        spec.port = i32::from(DEFAULT_PORT);
    }
    if spec.image.is_empty() {
        spec.image = DEFAULT_IMAGE.to_string();
    }
}

/// Check a template on create or update
pub fn validate_template(template: &BuildkitTemplate) -> Validation {
    let mut report = Validation::default();
    let name = template.name_any();
    let spec = &template.spec;

    if name.len() > TEMPLATE_NAME_MAX_LENGTH {
        report.error(
            "metadata.name",
            format!(
                "must be no more than {TEMPLATE_NAME_MAX_LENGTH} characters, got {}",
                name.len()
            ),
        );
    }

    if !(1..=65535).contains(&spec.port) {
        report.error(
            "spec.port",
            format!("must be between 1 and 65535, got {}", spec.port),
        );
    }

    if let Some(pod) = &spec.pod_template {
        if !pod.metadata.name.is_empty() {
            report.error(
                "spec.podTemplate.metadata.name",
                "must not be set, as pod names are automatically generated",
            );
        }
    }

    if let Err(e) = spec.buildkitd_toml.parse::<toml::Table>() {
        report.error("spec.buildkitdToml", format!("invalid TOML: {e}"));
    }

    report
}

/// Check an instance on create
///
/// A template that cannot be found is [`Error::TemplateNotFound`] rather than
/// a violation, because creating the template later makes the instance valid
/// without any change to it.
pub async fn validate_instance(
    buildkit: &Buildkit,
    templates: &dyn TemplateLookup,
) -> Result<Validation, Error> {
    let mut report = Validation::default();
    let template_name = &buildkit.spec.template;

    if template_name.is_empty() {
        report.error("spec.template", "BuildkitTemplate name must be specified");
        return Ok(report);
    }

    let namespace = buildkit.namespace().ok_or(Error::MissingNamespace)?;
    let template = templates
        .get_template(&namespace, template_name)
        .await?
        .ok_or_else(|| Error::template_not_found(&namespace, template_name))?;

    if template.spec.lifecycle.require_owner && buildkit.owner_references().is_empty() {
        report.error(
            "metadata.ownerReferences",
            format!(
                "BuildkitTemplate '{template_name}' requires owner references but none are present"
            ),
        );
    }

    if exceeds_ceiling(buildkit, &template) {
        report.warnings.push(format!(
            "requested resources exceed the maximum allowed by BuildkitTemplate '{template_name}' and will be capped"
        ));
    }

    Ok(report)
}

/// Check an instance on update; its spec is fixed once created
pub fn validate_instance_update(old: &Buildkit, new: &Buildkit) -> Validation {
    let mut report = Validation::default();
    if old.spec != new.spec {
        report.error(
            "spec",
            "spec changes are not allowed for existing Buildkit objects",
        );
    }
    report
}

/// Whether the instance's effective limits would be capped
///
/// Only resources the effective requirements already limit are checked, so a
/// ceiling entry merely filling in a missing limit does not warn.
pub fn exceeds_ceiling(buildkit: &Buildkit, template: &BuildkitTemplate) -> bool {
    let effective = resources::merge(
        buildkit.spec.resources.as_ref(),
        &template.spec.resources.default,
    );
    let ceiling: ResourceList =
        resources::tighten_ceiling(&template.spec.resources.maximum, &buildkit.spec.maximum)
            .into_iter()
            .filter(|(resource, _)| effective.limits.contains_key(resource))
            .collect();

    resources::exceeds_maximums(&ceiling, [&effective])
}
