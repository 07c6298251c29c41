//! Additive layered merge for desired-state objects
//!
//! Objects are built up from layers: platform defaults, the template's pod fragment,
//! then identity overrides. Each layer is merged onto the accumulated result with
//! [`Merge::merge_from`], which only ever adds or overwrites. A field set by an
//! earlier layer is never removed by a later layer that leaves it out, so safety
//! settings expressed early cannot disappear.
//!
//! Rules by field shape:
//! - `String`: replaced when the override is non-empty
//! - `Option<T>`: adopted when absent, merged recursively when both are present
//! - scalars (`bool`, integers, [`Quantity`]): replaced
//! - maps: merged per key, keys absent from the override are retained
//! - keyed lists ([`merge_keyed`]): merged element-wise by [`MergeKey`], base-only
//!   elements are retained and new keys appended
//! - unkeyed lists ([`merge_atomic`]): replaced as a whole when the override is
//!   non-empty
//! - free-form JSON ([`json`]): objects merged recursively, shape changes rejected

pub mod json;

use std::collections::BTreeMap;

use thiserror::Error;

use crate::quantity::Quantity;

/// Errors raised while merging layers
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum MergeError {
    /// The base and override disagree on the shape of a field
    #[error("structural mismatch at '{path}': cannot merge {found} onto {expected}")]
    StructuralMismatch {
        /// Dotted path of the offending field
        path: String,
        /// Shape found in the base
        expected: &'static str,
        /// Shape found in the override
        found: &'static str,
    },
}

impl MergeError {
    /// Create a structural mismatch at the current field
    pub fn mismatch(expected: &'static str, found: &'static str) -> Self {
        Self::StructuralMismatch {
            path: String::new(),
            expected,
            found,
        }
    }

    /// Prefix the error path with the enclosing field
    pub fn within(self, segment: &str) -> Self {
        match self {
            Self::StructuralMismatch {
                path,
                expected,
                found,
            } => {
                let path = if path.is_empty() {
                    segment.to_string()
                } else if path.starts_with('[') {
                    format!("{segment}{path}")
                } else {
                    format!("{segment}.{path}")
                };
                Self::StructuralMismatch {
                    path,
                    expected,
                    found,
                }
            }
        }
    }
}

/// A value that can absorb an override layer
pub trait Merge {
    /// Merge `other` onto `self` in place
    ///
    /// On error `self` may be partially merged; use [`merge_objects`] when the base
    /// must stay untouched.
    fn merge_from(&mut self, other: &Self) -> Result<(), MergeError>;
}

/// Identifies list elements that merge with each other
pub trait MergeKey {
    /// Key shared by elements describing the same entity
    fn merge_key(&self) -> String;
}

/// Merge a named field, attributing any error to it
pub fn merge_field<T: Merge + ?Sized>(
    base: &mut T,
    other: &T,
    name: &str,
) -> Result<(), MergeError> {
    base.merge_from(other).map_err(|e| e.within(name))
}

/// Merge a list element-wise by key
///
/// Elements with a matching key are merged recursively, new keys are appended in
/// override order, and elements only present in the base are kept.
pub fn merge_keyed<T>(base: &mut Vec<T>, other: &[T], name: &str) -> Result<(), MergeError>
where
    T: Merge + MergeKey + Clone,
{
    for item in other {
        let key = item.merge_key();
        match base.iter_mut().find(|existing| existing.merge_key() == key) {
            Some(existing) => existing
                .merge_from(item)
                .map_err(|e| e.within(&format!("[{key}]")).within(name))?,
            None => base.push(item.clone()),
        }
    }
    Ok(())
}

/// Replace a list without merge semantics when the override has any elements
pub fn merge_atomic<T: Clone>(base: &mut Vec<T>, other: &[T]) {
    if !other.is_empty() {
        *base = other.to_vec();
    }
}

/// Merge each override onto a copy of `base`, left to right
///
/// `base` is only replaced once every layer merged cleanly, so a failure never
/// leaves a partially merged object behind.
pub fn merge_objects<T: Merge + Clone>(base: &mut T, overrides: &[T]) -> Result<(), MergeError> {
    let mut merged = base.clone();
    for layer in overrides {
        merged.merge_from(layer)?;
    }
    *base = merged;
    Ok(())
}

impl Merge for String {
    fn merge_from(&mut self, other: &Self) -> Result<(), MergeError> {
        if !other.is_empty() {
            self.clone_from(other);
        }
        Ok(())
    }
}

macro_rules! replace_merge {
    ($($ty:ty),*) => {
        $(
            impl Merge for $ty {
                fn merge_from(&mut self, other: &Self) -> Result<(), MergeError> {
                    self.clone_from(other);
                    Ok(())
                }
            }
        )*
    };
}

replace_merge!(bool, i32, i64, u16, u32, Quantity);

impl<T: Merge + Clone> Merge for Option<T> {
    fn merge_from(&mut self, other: &Self) -> Result<(), MergeError> {
        match (self.as_mut(), other) {
            (Some(existing), Some(incoming)) => existing.merge_from(incoming),
            (None, Some(incoming)) => {
                *self = Some(incoming.clone());
                Ok(())
            }
            (_, None) => Ok(()),
        }
    }
}

impl<V: Merge + Clone> Merge for BTreeMap<String, V> {
    fn merge_from(&mut self, other: &Self) -> Result<(), MergeError> {
        for (key, value) in other {
            match self.get_mut(key) {
                Some(existing) => existing.merge_from(value).map_err(|e| e.within(key))?,
                None => {
                    self.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(())
    }
}
