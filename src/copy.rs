//! Whole-dataset bulk operations (component C9): copying one backend's contents
//! into another, concatenating same-shaped datasets along a shared axis, and a
//! thin adapter trait for translating between external and internal naming
//! conventions (spec §4/§6: "wrapping of external annotated-data files where axis
//! names are fixed"). These are glue built entirely from C3/C4; they hold no
//! storage of their own.

use std::collections::BTreeSet;

use rayon::prelude::*;

use crate::{
    element::{MajorAxis, NumericArray, VectorData},
    error::{Error, Result},
    facade::Writers,
    format::{Format, FormatMut},
};

/// Copies every scalar, axis, vector, and matrix from `source` into `target`.
/// `overwrite` controls whether artifacts already present in `target` are
/// replaced; axes already present in `target` are required to match `source`'s
/// entries (a looser policy than a chain's, since copying is not an overlay).
///
/// # Errors
///
/// Propagates any [`Error`] from the underlying reads/writes, plus
/// [`Error::InconsistentAxis`] if `target` already has an axis of the same name
/// with different entries.
pub fn copy_dataset(source: &dyn Format, target: &(impl FormatMut + ?Sized), overwrite: bool) -> Result<()> {
    // Reads fan out across threads under `source`'s reentrant read lock (multiple
    // readers proceed concurrently); writes to `target` stay sequential since a
    // single write lock serializes them anyway.
    let scalars: Vec<(String, crate::element::ScalarValue)> = source
        .scalar_names()
        .into_par_iter()
        .map(|name| source.get_scalar(&name).map(|value| (name, value)))
        .collect::<Result<_>>()?;
    for (name, value) in scalars {
        target.set_scalar_checked(&name, value, overwrite)?;
    }

    for axis in source.axis_names() {
        let entries = source.axis_entries(&axis)?;
        if target.has_axis(&axis, false) {
            let existing = target.axis_entries(&axis)?;
            if *existing != *entries {
                return Err(Error::InconsistentAxis {
                    axis,
                    first: target.dataset_name().to_string(),
                    second: source.dataset_name().to_string(),
                });
            }
        } else {
            target.add_axis_checked(&axis, (*entries).clone())?;
        }

        let vectors: Vec<(String, VectorData)> = source
            .vector_names(&axis)?
            .into_par_iter()
            .map(|name| source.get_vector(&axis, &name).map(|value| (name, value)))
            .collect::<Result<_>>()?;
        for (name, value) in vectors {
            target.set_vector_checked(&axis, &name, crate::facade::VectorValueOrScalar::Value(value), overwrite)?;
        }
    }

    let axes = source.axis_names();
    for rows in &axes {
        for cols in &axes {
            for name in source.matrix_names(rows, cols)? {
                let value = source.get_matrix(rows, cols, &name, MajorAxis::Row)?;
                target.set_matrix_checked(rows, cols, &name, value, overwrite)?;
            }
        }
    }

    Ok(())
}

/// Concatenates `sources` along `axis` into `target`: `target`'s `axis` becomes
/// the ordered union of each source's entries on that axis (which must be
/// disjoint — spec §3 invariant 2: axis entries are unique), and each vector
/// defined on `axis` in any source is concatenated in source order, filling gaps
/// for sources that lack it with that element kind's zero value.
///
/// All other axes must match exactly across every source (same entries), mirroring
/// the chain engine's axis-consistency discipline (spec §4.5, invariant 5), and
/// their vectors/matrices are copied from the first source that defines them.
///
/// # Errors
///
/// [`Error::InconsistentAxis`] if a non-concatenated axis differs across sources,
/// or if `axis`'s entries are not disjoint across sources.
pub fn concat_datasets(
    sources: &[&dyn Format],
    axis: &str,
    target: &(impl FormatMut + ?Sized),
) -> Result<()> {
    if sources.is_empty() {
        return Err(Error::EmptyChain);
    }

    let mut combined_entries: Vec<String> = Vec::new();
    let mut seen: BTreeSet<String> = BTreeSet::new();
    for source in sources {
        for entry in source.axis_entries(axis)?.iter() {
            if !seen.insert(entry.clone()) {
                return Err(Error::InconsistentAxis {
                    axis: axis.to_string(),
                    first: "earlier source".to_string(),
                    second: source.dataset_name().to_string(),
                });
            }
            combined_entries.push(entry.clone());
        }
    }
    target.add_axis_checked(axis, combined_entries)?;

    let mut other_axes: BTreeSet<String> = BTreeSet::new();
    for source in sources {
        for name in source.axis_names() {
            if name != axis {
                other_axes.insert(name);
            }
        }
    }
    for other in &other_axes {
        let mut reference: Option<std::sync::Arc<Vec<String>>> = None;
        for source in sources {
            if !source.has_axis(other, false) {
                continue;
            }
            let entries = source.axis_entries(other)?;
            match &reference {
                None => reference = Some(entries),
                Some(existing) => {
                    if *existing != entries {
                        return Err(Error::InconsistentAxis {
                            axis: other.clone(),
                            first: "earlier source".to_string(),
                            second: source.dataset_name().to_string(),
                        });
                    }
                }
            }
        }
        if let Some(entries) = reference {
            if !target.has_axis(other, false) {
                target.add_axis_checked(other, (*entries).clone())?;
            }
        }
    }

    let mut vector_names: BTreeSet<String> = BTreeSet::new();
    for source in sources {
        vector_names.extend(source.vector_names(axis)?);
    }
    for name in &vector_names {
        let mut concatenated: Option<VectorData> = None;
        for source in sources {
            let len = source.axis_length(axis)?;
            let piece = if source.has_vector(axis, name) {
                source.get_vector(axis, name)?
            } else {
                VectorData::Numeric(NumericArray::Float64(vec![0.0; len]))
            };
            concatenated = Some(match concatenated {
                None => piece,
                Some(acc) => concat_vectors(acc, piece)?,
            });
        }
        if let Some(value) = concatenated {
            target.set_vector_checked(axis, name, crate::facade::VectorValueOrScalar::Value(value), false)?;
        }
    }

    for other in &other_axes {
        for source in sources {
            if !source.has_axis(other, false) {
                continue;
            }
            for name in source.vector_names(other)? {
                if !target.has_vector(other, &name) {
                    let value = source.get_vector(other, &name)?;
                    target.set_vector_checked(other, &name, crate::facade::VectorValueOrScalar::Value(value), false)?;
                }
            }
        }
    }

    Ok(())
}

fn concat_vectors(a: VectorData, b: VectorData) -> Result<VectorData> {
    macro_rules! cat {
        ($variant:ident, $a:expr, $b:expr) => {{
            let mut v = $a;
            v.extend($b);
            NumericArray::$variant(v)
        }};
    }
    match (a, b) {
        (VectorData::Str(mut a), VectorData::Str(b)) => {
            a.extend(b);
            Ok(VectorData::Str(a))
        }
        (VectorData::Numeric(NumericArray::Int8(a)), VectorData::Numeric(NumericArray::Int8(b))) => {
            Ok(VectorData::Numeric(cat!(Int8, a, b)))
        }
        (VectorData::Numeric(NumericArray::Int16(a)), VectorData::Numeric(NumericArray::Int16(b))) => {
            Ok(VectorData::Numeric(cat!(Int16, a, b)))
        }
        (VectorData::Numeric(NumericArray::Int32(a)), VectorData::Numeric(NumericArray::Int32(b))) => {
            Ok(VectorData::Numeric(cat!(Int32, a, b)))
        }
        (VectorData::Numeric(NumericArray::Int64(a)), VectorData::Numeric(NumericArray::Int64(b))) => {
            Ok(VectorData::Numeric(cat!(Int64, a, b)))
        }
        (VectorData::Numeric(NumericArray::UInt8(a)), VectorData::Numeric(NumericArray::UInt8(b))) => {
            Ok(VectorData::Numeric(cat!(UInt8, a, b)))
        }
        (VectorData::Numeric(NumericArray::UInt16(a)), VectorData::Numeric(NumericArray::UInt16(b))) => {
            Ok(VectorData::Numeric(cat!(UInt16, a, b)))
        }
        (VectorData::Numeric(NumericArray::UInt32(a)), VectorData::Numeric(NumericArray::UInt32(b))) => {
            Ok(VectorData::Numeric(cat!(UInt32, a, b)))
        }
        (VectorData::Numeric(NumericArray::UInt64(a)), VectorData::Numeric(NumericArray::UInt64(b))) => {
            Ok(VectorData::Numeric(cat!(UInt64, a, b)))
        }
        (VectorData::Numeric(NumericArray::Float32(a)), VectorData::Numeric(NumericArray::Float32(b))) => {
            Ok(VectorData::Numeric(cat!(Float32, a, b)))
        }
        (VectorData::Numeric(NumericArray::Float64(a)), VectorData::Numeric(NumericArray::Float64(b))) => {
            Ok(VectorData::Numeric(cat!(Float64, a, b)))
        }
        (VectorData::Numeric(NumericArray::Bool(a)), VectorData::Numeric(NumericArray::Bool(b))) => {
            Ok(VectorData::Numeric(cat!(Bool, a, b)))
        }
        (a, b) => Err(Error::TypeMismatch {
            expected: a.kind(),
            found: b.kind(),
        }),
    }
}

/// Translates between an external naming convention (e.g. an annotated-data
/// file's fixed `obs`/`var` axis names) and this crate's internal names. Backends
/// wrapping external formats implement this directly rather than going through
/// [`crate::view::View`], since the translation is typically static and known at
/// compile time rather than configured per-instance (spec §1: "adapters —
/// I/O translation between naming conventions").
pub trait NamingAdapter {
    /// Internal axis name for `external`, or `None` if unrecognized.
    fn axis_from_external(&self, external: &str) -> Option<String>;
    /// External axis name for `internal`, or `None` if unmapped.
    fn axis_to_external(&self, internal: &str) -> Option<String>;
}

/// A [`NamingAdapter`] fixing the two axes an annotated-data file always carries
/// (spec §6: "axis names are fixed (e.g., `obs`, `var`)").
pub struct AnnotatedDataAdapter {
    pub rows_axis: String,
    pub cols_axis: String,
}

impl NamingAdapter for AnnotatedDataAdapter {
    fn axis_from_external(&self, external: &str) -> Option<String> {
        match external {
            "obs" => Some(self.rows_axis.clone()),
            "var" => Some(self.cols_axis.clone()),
            _ => None,
        }
    }

    fn axis_to_external(&self, internal: &str) -> Option<String> {
        if internal == self.rows_axis {
            Some("obs".to_string())
        } else if internal == self.cols_axis {
            Some("var".to_string())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        element::{NumericScalar, ScalarValue},
        memory_backend::MemoryDatastore,
    };

    use super::*;

    #[test]
    fn copy_dataset_round_trips_scalars_axes_and_vectors() {
        let source = MemoryDatastore::new("source");
        source.add_axis("cell", vec!["c0".into(), "c1".into()]).unwrap();
        source
            .set_vector("cell", "age", VectorData::Numeric(NumericArray::Int64(vec![1, 2])))
            .unwrap();
        source
            .set_scalar("version", ScalarValue::Numeric(NumericScalar::Int64(9)))
            .unwrap();

        let target = MemoryDatastore::new("target");
        copy_dataset(&source, &target, false).unwrap();

        assert!(target.has_axis("cell", false));
        assert_eq!(
            target.get_vector("cell", "age").unwrap(),
            VectorData::Numeric(NumericArray::Int64(vec![1, 2]))
        );
        assert_eq!(
            target.get_scalar("version").unwrap(),
            ScalarValue::Numeric(NumericScalar::Int64(9))
        );
    }

    #[test]
    fn concat_combines_disjoint_axis_entries_and_vectors() {
        let a = MemoryDatastore::new("a");
        a.add_axis("cell", vec!["c0".into(), "c1".into()]).unwrap();
        a.set_vector("cell", "age", VectorData::Numeric(NumericArray::Int64(vec![1, 2])))
            .unwrap();

        let b = MemoryDatastore::new("b");
        b.add_axis("cell", vec!["c2".into(), "c3".into()]).unwrap();
        b.set_vector("cell", "age", VectorData::Numeric(NumericArray::Int64(vec![3, 4])))
            .unwrap();

        let target = MemoryDatastore::new("concatenated");
        let sources: Vec<&dyn Format> = vec![&a, &b];
        concat_datasets(&sources, "cell", &target).unwrap();

        assert_eq!(target.axis_length("cell").unwrap(), 4);
        assert_eq!(
            target.get_vector("cell", "age").unwrap(),
            VectorData::Numeric(NumericArray::Int64(vec![1, 2, 3, 4]))
        );
    }

    #[test]
    fn concat_rejects_overlapping_entries() {
        let a = MemoryDatastore::new("a");
        a.add_axis("cell", vec!["c0".into()]).unwrap();
        let b = MemoryDatastore::new("b");
        b.add_axis("cell", vec!["c0".into()]).unwrap();

        let target = MemoryDatastore::new("concatenated");
        let sources: Vec<&dyn Format> = vec![&a, &b];
        let err = concat_datasets(&sources, "cell", &target).unwrap_err();
        assert!(matches!(err, Error::InconsistentAxis { .. }));
    }

    #[test]
    fn annotated_data_adapter_maps_obs_var() {
        let adapter = AnnotatedDataAdapter {
            rows_axis: "cell".to_string(),
            cols_axis: "gene".to_string(),
        };
        assert_eq!(adapter.axis_from_external("obs"), Some("cell".to_string()));
        assert_eq!(adapter.axis_to_external("gene"), Some("var".to_string()));
        assert_eq!(adapter.axis_from_external("unknown"), None);
    }
}
