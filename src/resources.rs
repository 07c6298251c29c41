//! Resource requirements and the ceiling solver
//!
//! Instances may ask for different CPU and memory than their template provides, and
//! administrators may cap what any instance can get. The functions here reconcile
//! those three inputs without ever failing and without mutating their arguments.
//!
//! Two operations cover the policy:
//! - [`merge`] layers an instance override onto template defaults, refusing limits
//!   that would raise a default limit
//! - [`apply_maximums`] layers any number of requirements and caps the result at a
//!   ceiling, reporting whether anything had to change

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::merge::{merge_field, Merge, MergeError};
use crate::quantity::Quantity;

/// Quantities keyed by resource name (`cpu`, `memory`, ...)
pub type ResourceList = BTreeMap<String, Quantity>;

/// Compute resources requested by and limited for a container
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ResourceRequirements {
    /// Maximum amount of each resource the container may use
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: ResourceList,

    /// Amount of each resource reserved for the container
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: ResourceList,
}

impl ResourceRequirements {
    /// Returns true if neither limits nor requests are set
    pub fn is_empty(&self) -> bool {
        self.limits.is_empty() && self.requests.is_empty()
    }

    /// Set a limit and return self for chaining
    pub fn limit(mut self, resource: impl Into<String>, quantity: impl Into<Quantity>) -> Self {
        self.limits.insert(resource.into(), quantity.into());
        self
    }

    /// Set a request and return self for chaining
    pub fn request(mut self, resource: impl Into<String>, quantity: impl Into<Quantity>) -> Self {
        self.requests.insert(resource.into(), quantity.into());
        self
    }
}

impl Merge for ResourceRequirements {
    fn merge_from(&mut self, other: &Self) -> Result<(), MergeError> {
        merge_field(&mut self.limits, &other.limits, "limits")?;
        merge_field(&mut self.requests, &other.requests, "requests")
    }
}

/// Merge an instance's resource override onto the template defaults
///
/// A limit from `desired` is accepted only when the default has no limit for that
/// resource or the desired limit does not exceed it; otherwise the default stands.
/// Requests from `desired` are accepted but clamped to the resulting limit. Resources
/// only present in the defaults carry through unchanged.
pub fn merge(
    desired: Option<&ResourceRequirements>,
    defaults: &ResourceRequirements,
) -> ResourceRequirements {
    let Some(desired) = desired else {
        return defaults.clone();
    };

    let mut result = defaults.clone();

    for (resource, limit) in &desired.limits {
        match defaults.limits.get(resource) {
            Some(default_limit) if limit.exceeds(default_limit) => {}
            _ => {
                result.limits.insert(resource.clone(), limit.clone());
            }
        }
    }

    for (resource, request) in &desired.requests {
        let clamped = match result.limits.get(resource) {
            Some(limit) if request.exceeds(limit) => limit.clone(),
            _ => request.clone(),
        };
        result.requests.insert(resource.clone(), clamped);
    }

    result
}

/// Layer resource requirements and cap the result at `maximum`
///
/// Later layers replace earlier values key by key. Afterwards every resource in
/// `maximum` without a limit gets the maximum as its limit, every limit above the
/// maximum is lowered to it, and every request above its own limit is lowered to
/// that limit. The flag reports whether any of those corrections happened.
pub fn apply_maximums<'a>(
    maximum: &ResourceList,
    layers: impl IntoIterator<Item = &'a ResourceRequirements>,
) -> (ResourceRequirements, bool) {
    let mut result = ResourceRequirements::default();
    for layer in layers {
        result.limits.extend(layer.limits.clone());
        result.requests.extend(layer.requests.clone());
    }

    let mut modified = false;

    for (resource, max) in maximum {
        match result.limits.get_mut(resource) {
            None => {
                result.limits.insert(resource.clone(), max.clone());
                modified = true;
            }
            Some(limit) if limit.exceeds(max) => {
                *limit = max.clone();
                modified = true;
            }
            Some(_) => {}
        }
    }

    // Limits are already capped, so this also keeps requests under the maximum
    for (resource, request) in result.requests.iter_mut() {
        if let Some(limit) = result.limits.get(resource) {
            if request.exceeds(limit) {
                *request = limit.clone();
                modified = true;
            }
        }
    }

    (result, modified)
}

/// Like [`apply_maximums`], returning only the capped requirements
pub fn with_maximums<'a>(
    maximum: &ResourceList,
    layers: impl IntoIterator<Item = &'a ResourceRequirements>,
) -> ResourceRequirements {
    apply_maximums(maximum, layers).0
}

/// Like [`apply_maximums`], returning only whether a correction was needed
pub fn exceeds_maximums<'a>(
    maximum: &ResourceList,
    layers: impl IntoIterator<Item = &'a ResourceRequirements>,
) -> bool {
    apply_maximums(maximum, layers).1
}

/// Combine a template ceiling with an instance's own ceiling
///
/// An instance may only lower the ceiling: entries above the template's value are
/// ignored, entries for resources the template leaves uncapped are added.
pub fn tighten_ceiling(template: &ResourceList, instance: &ResourceList) -> ResourceList {
    let mut result = template.clone();
    for (resource, max) in instance {
        match template.get(resource) {
            Some(template_max) if max.exceeds(template_max) => {}
            _ => {
                result.insert(resource.clone(), max.clone());
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(entries: &[(&str, &str)]) -> ResourceList {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), Quantity::from(*v)))
            .collect()
    }

    fn requirements(limits: &[(&str, &str)], requests: &[(&str, &str)]) -> ResourceRequirements {
        ResourceRequirements {
            limits: list(limits),
            requests: list(requests),
        }
    }

    mod instance_override {
        use super::*;

        /// Story: Without an override the template defaults are used as-is
        #[test]
        fn story_missing_override_returns_defaults() {
            let defaults = requirements(&[("cpu", "2")], &[("cpu", "1")]);
            assert_eq!(merge(None, &defaults), defaults);
        }

        /// Story: An instance cannot raise a limit above the template default
        ///
        /// The template author decides the largest limit an instance may ask for;
        /// a larger request silently falls back to the default.
        #[test]
        fn story_limit_above_default_is_rejected() {
            let desired = requirements(&[("cpu", "4")], &[]);
            let defaults = requirements(&[("cpu", "2"), ("memory", "4Gi")], &[]);

            let result = merge(Some(&desired), &defaults);

            assert_eq!(result, requirements(&[("cpu", "2"), ("memory", "4Gi")], &[]));
        }

        #[test]
        fn test_lower_limit_is_accepted() {
            let desired = requirements(&[("cpu", "500m")], &[]);
            let defaults = requirements(&[("cpu", "2")], &[]);

            let result = merge(Some(&desired), &defaults);

            assert_eq!(result.limits["cpu"], Quantity::from("500m"));
        }

        #[test]
        fn test_equal_limit_in_other_units_is_accepted() {
            let desired = requirements(&[("cpu", "2000m")], &[]);
            let defaults = requirements(&[("cpu", "2")], &[]);

            let result = merge(Some(&desired), &defaults);

            assert_eq!(result.limits["cpu"], Quantity::from("2000m"));
        }

        #[test]
        fn test_new_resource_limit_is_accepted() {
            let desired = requirements(&[("ephemeral-storage", "10Gi")], &[]);
            let defaults = requirements(&[("cpu", "2")], &[]);

            let result = merge(Some(&desired), &defaults);

            assert_eq!(result.limits.len(), 2);
            assert_eq!(result.limits["ephemeral-storage"], Quantity::from("10Gi"));
        }

        /// Story: Requests are clamped to the effective limit
        #[test]
        fn story_request_above_effective_limit_is_clamped() {
            let desired = requirements(&[("cpu", "8")], &[("cpu", "3"), ("memory", "1Gi")]);
            let defaults = requirements(&[("cpu", "2")], &[("cpu", "1")]);

            let result = merge(Some(&desired), &defaults);

            assert_eq!(result.limits["cpu"], Quantity::from("2"));
            assert_eq!(result.requests["cpu"], Quantity::from("2"));
            assert_eq!(result.requests["memory"], Quantity::from("1Gi"));
        }

        #[test]
        fn test_inputs_are_not_mutated() {
            let desired = requirements(&[("cpu", "4")], &[("cpu", "3")]);
            let defaults = requirements(&[("cpu", "2")], &[]);
            let (desired_before, defaults_before) = (desired.clone(), defaults.clone());

            let _ = merge(Some(&desired), &defaults);

            assert_eq!(desired, desired_before);
            assert_eq!(defaults, defaults_before);
        }
    }

    mod ceilings {
        use super::*;

        /// Story: Limits above the ceiling are lowered and reported
        #[test]
        fn story_limits_above_ceiling_are_capped() {
            let maximum = list(&[("cpu", "2"), ("memory", "4Gi")]);
            let layer = requirements(
                &[("cpu", "4"), ("memory", "8Gi")],
                &[("cpu", "500m"), ("memory", "1Gi")],
            );

            let (result, modified) = apply_maximums(&maximum, [&layer]);

            assert!(modified);
            assert_eq!(
                result,
                requirements(
                    &[("cpu", "2"), ("memory", "4Gi")],
                    &[("cpu", "500m"), ("memory", "1Gi")]
                )
            );
        }

        #[test]
        fn test_missing_limits_are_filled_from_ceiling() {
            let maximum = list(&[("cpu", "2"), ("memory", "4Gi")]);
            let layer = requirements(&[("cpu", "1")], &[]);

            let (result, modified) = apply_maximums(&maximum, [&layer]);

            assert!(modified);
            assert_eq!(result.limits, list(&[("cpu", "1"), ("memory", "4Gi")]));
        }

        #[test]
        fn test_compliant_requirements_are_unmodified() {
            let maximum = list(&[("cpu", "2")]);
            let layer = requirements(&[("cpu", "2000m")], &[("cpu", "1")]);

            let (result, modified) = apply_maximums(&maximum, [&layer]);

            assert!(!modified);
            assert_eq!(result, layer);
        }

        #[test]
        fn test_later_layers_replace_earlier_values() {
            let first = requirements(&[("cpu", "1")], &[("cpu", "1")]);
            let second = requirements(&[("cpu", "3")], &[]);

            let (result, modified) = apply_maximums(&ResourceList::new(), [&first, &second]);

            assert!(!modified);
            assert_eq!(result, requirements(&[("cpu", "3")], &[("cpu", "1")]));
        }

        /// Story: Lowering the ceiling also lowers a request that was within its
        /// original limit
        ///
        /// The request is compared against the already-capped limit, so a request
        /// of 3 cores under a limit of 4 ends up at 2 when the ceiling is 2.
        #[test]
        fn story_request_follows_capped_limit() {
            let maximum = list(&[("cpu", "2")]);
            let layer = requirements(&[("cpu", "4")], &[("cpu", "3")]);

            let (result, modified) = apply_maximums(&maximum, [&layer]);

            assert!(modified);
            assert_eq!(result.requests["cpu"], Quantity::from("2"));
        }

        #[test]
        fn test_request_without_limit_is_capped_by_filled_limit() {
            let maximum = list(&[("memory", "1Gi")]);
            let layer = requirements(&[], &[("memory", "2Gi")]);

            let result = with_maximums(&maximum, [&layer]);

            assert_eq!(result.requests["memory"], Quantity::from("1Gi"));
            assert_eq!(result.limits["memory"], Quantity::from("1Gi"));
        }

        /// Story: The solver output always satisfies request <= limit <= ceiling
        #[test]
        fn story_clamp_invariant_holds_for_mixed_inputs() {
            let maximum = list(&[("cpu", "1500m"), ("memory", "2Gi")]);
            let layers = [
                requirements(&[("cpu", "3")], &[("cpu", "4"), ("memory", "3Gi")]),
                requirements(&[("memory", "512Mi")], &[("cpu", "100m")]),
                requirements(&[], &[("memory", "1Gi")]),
            ];

            let (result, _) = apply_maximums(&maximum, &layers);

            for (resource, max) in &maximum {
                let limit = &result.limits[resource];
                assert!(!limit.exceeds(max), "{resource} limit above ceiling");
                if let Some(request) = result.requests.get(resource) {
                    assert!(!request.exceeds(limit), "{resource} request above limit");
                }
            }
        }

        #[test]
        fn test_apply_maximums_is_idempotent() {
            let maximum = list(&[("cpu", "2"), ("memory", "4Gi")]);
            let layer = requirements(&[("cpu", "4")], &[("cpu", "3"), ("memory", "8Gi")]);

            let (once, first_modified) = apply_maximums(&maximum, [&layer]);
            let (twice, second_modified) = apply_maximums(&maximum, [&once]);

            assert!(first_modified);
            assert!(!second_modified);
            assert_eq!(once, twice);
        }

        #[test]
        fn test_exceeds_maximums_reports_modification() {
            let maximum = list(&[("cpu", "2")]);
            assert!(exceeds_maximums(&maximum, [&requirements(&[("cpu", "3")], &[])]));
            assert!(!exceeds_maximums(&maximum, [&requirements(&[("cpu", "1")], &[])]));
        }
    }

    mod tightening {
        use super::*;

        #[test]
        fn test_instance_can_lower_template_ceiling() {
            let template = list(&[("cpu", "4"), ("memory", "8Gi")]);
            let instance = list(&[("cpu", "1")]);

            let result = tighten_ceiling(&template, &instance);

            assert_eq!(result, list(&[("cpu", "1"), ("memory", "8Gi")]));
        }

        #[test]
        fn test_instance_cannot_raise_template_ceiling() {
            let template = list(&[("cpu", "4")]);
            let instance = list(&[("cpu", "16"), ("memory", "1Gi")]);

            let result = tighten_ceiling(&template, &instance);

            assert_eq!(result, list(&[("cpu", "4"), ("memory", "1Gi")]));
        }
    }
}
