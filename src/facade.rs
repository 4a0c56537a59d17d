//! The readers/writers façade (component C4): argument validation and
//! error-message formatting layered on top of the raw backend contract (C3). These
//! are blanket-implemented for every [`Format`]/[`FormatMut`], so the same
//! validated entry points work uniformly over the in-memory backend, chains, and
//! views.

use crate::{
    element::{ElementKind, IndexKind, MajorAxis, MatrixData, ScalarValue, VectorData},
    error::{Error, Result},
    format::{Format, FormatMut},
};

/// Validated read operations (spec §4.4).
pub trait Readers: Format {
    /// Like [`Format::get_scalar`], but this is the public entry point callers are
    /// expected to use; kept for symmetry with [`Writers::set_scalar_checked`].
    fn get_scalar_checked(&self, name: &str) -> Result<ScalarValue> {
        self.get_scalar(name)
    }

    fn get_vector_checked(&self, axis: &str, name: &str) -> Result<VectorData> {
        self.get_vector(axis, name)
    }

    fn get_matrix_checked(&self, rows: &str, cols: &str, name: &str, layout: MajorAxis) -> Result<MatrixData> {
        self.get_matrix(rows, cols, name, layout)
    }
}

impl<T: Format + ?Sized> Readers for T {}

/// Validated write operations (spec §4.4): length checks, overwrite semantics, and
/// consistent error formatting, delegating to the raw [`FormatMut`] primitives.
pub trait Writers: FormatMut {
    /// Sets a scalar. If it already exists, fails with `AlreadyExists` unless
    /// `overwrite` is set, in which case the existing value is deleted first.
    fn set_scalar_checked(&self, name: &str, value: ScalarValue, overwrite: bool) -> Result<()> {
        if self.has_scalar(name) {
            if !overwrite {
                return Err(Error::ScalarAlreadyExists {
                    name: name.to_string(),
                    dataset: self.dataset_name().to_string(),
                });
            }
            self.delete_scalar(name, true)?;
        }
        self.set_scalar(name, value)
    }

    /// Deletes a scalar. `must_exist = false` maps `NotFound` to success (spec §7).
    fn delete_scalar_checked(&self, name: &str, must_exist: bool) -> Result<()> {
        match self.delete_scalar(name, false) {
            Err(Error::MissingScalar { .. }) if !must_exist => Ok(()),
            other => other,
        }
    }

    fn add_axis_checked(&self, name: &str, entries: Vec<String>) -> Result<()> {
        let mut seen = std::collections::HashSet::with_capacity(entries.len());
        for entry in &entries {
            if entry.is_empty() {
                return Err(Error::from(format!(
                    "axis: {name} entries must be nonempty strings"
                )));
            }
            if !seen.insert(entry.as_str()) {
                return Err(Error::from(format!(
                    "axis: {name} entries must be unique, duplicate: {entry}"
                )));
            }
        }
        self.add_axis(name, entries)
    }

    /// Sets a vector from a precomputed value or broadcasts a scalar to the axis's
    /// length (spec §4.3: "`set(value|scalar-broadcast)`").
    fn set_vector_checked(
        &self,
        axis: &str,
        name: &str,
        value: VectorValueOrScalar,
        overwrite: bool,
    ) -> Result<()> {
        let expected_len = self.axis_length(axis)?;
        let value = match value {
            VectorValueOrScalar::Value(v) => {
                if v.len() != expected_len {
                    return Err(Error::VectorLengthMismatch {
                        axis: axis.to_string(),
                        len: v.len(),
                        expected: expected_len,
                    });
                }
                v
            }
            VectorValueOrScalar::Scalar(scalar) => VectorData::broadcast(&scalar, expected_len),
        };
        if self.has_vector(axis, name) {
            if !overwrite {
                return Err(Error::VectorAlreadyExists {
                    axis: axis.to_string(),
                    name: name.to_string(),
                    dataset: self.dataset_name().to_string(),
                });
            }
            self.delete_vector(axis, name, true)?;
        }
        self.set_vector(axis, name, value)
    }

    fn delete_vector_checked(&self, axis: &str, name: &str, must_exist: bool) -> Result<()> {
        match self.delete_vector(axis, name, false) {
            Err(Error::MissingVector { .. }) if !must_exist => Ok(()),
            other => other,
        }
    }

    /// Sets a matrix. The stored layout is taken from the caller's value (spec
    /// §4.4: "the resulting stored layout is taken from the caller's value").
    fn set_matrix_checked(
        &self,
        rows: &str,
        cols: &str,
        name: &str,
        value: MatrixData,
        overwrite: bool,
    ) -> Result<()> {
        if !value.kind().is_matrix_eltype() {
            return Err(Error::TypeMismatch {
                expected: ElementKind::Float64,
                found: value.kind(),
            });
        }
        let expected_rows = self.axis_length(rows)?;
        let expected_cols = self.axis_length(cols)?;
        if value.rows != expected_rows || value.cols != expected_cols {
            return Err(Error::MatrixShapeMismatch {
                rows: value.rows,
                cols: value.cols,
                expected_rows,
                expected_cols,
            });
        }
        if self.has_matrix(rows, cols, name, value.major, false) {
            if !overwrite {
                return Err(Error::MatrixAlreadyExists {
                    rows: rows.to_string(),
                    cols: cols.to_string(),
                    name: name.to_string(),
                    dataset: self.dataset_name().to_string(),
                });
            }
            self.delete_matrix(rows, cols, name, true)?;
        }
        self.set_matrix(rows, cols, name, value)
    }

    fn delete_matrix_checked(&self, rows: &str, cols: &str, name: &str, must_exist: bool) -> Result<()> {
        match self.delete_matrix(rows, cols, name, false) {
            Err(Error::MissingMatrix { .. }) if !must_exist => Ok(()),
            other => other,
        }
    }

    /// Ensures the matrix is available in `layout`, relaying out from the other
    /// stored layout if necessary.
    fn ensure_matrix_layout(&self, rows: &str, cols: &str, name: &str, layout: MajorAxis) -> Result<()> {
        if self.has_matrix(rows, cols, name, layout, false) {
            return Ok(());
        }
        if self.has_matrix(rows, cols, name, layout, true) {
            return self.relayout_matrix(rows, cols, name, layout);
        }
        Err(Error::MissingMatrix {
            rows: rows.to_string(),
            cols: cols.to_string(),
            name: name.to_string(),
            dataset: self.dataset_name().to_string(),
        })
    }
}

impl<T: FormatMut + ?Sized> Writers for T {}

/// `set_vector_checked`'s argument: either a precomputed vector, or a scalar to
/// broadcast across the axis.
pub enum VectorValueOrScalar {
    Value(VectorData),
    Scalar(ScalarValue),
}

/// Parameters bundling element kind with sparsity/index-kind, used by the empty
/// allocator facade helpers.
#[derive(Clone, Copy, Debug)]
pub struct SparseParams {
    pub nnz: usize,
    pub index_kind: IndexKind,
}

#[cfg(test)]
mod tests {
    use crate::{
        element::{NumericArray, NumericScalar},
        memory_backend::MemoryDatastore,
    };

    use super::*;

    #[test]
    fn set_scalar_without_overwrite_conflicts() {
        let ds = MemoryDatastore::new("d");
        ds.set_scalar_checked("s", ScalarValue::Numeric(NumericScalar::Int64(1)), false)
            .unwrap();
        let err = ds
            .set_scalar_checked("s", ScalarValue::Numeric(NumericScalar::Int64(2)), false)
            .unwrap_err();
        assert!(matches!(err, Error::ScalarAlreadyExists { .. }));
        ds.set_scalar_checked("s", ScalarValue::Numeric(NumericScalar::Int64(2)), true)
            .unwrap();
        assert_eq!(
            ds.get_scalar_checked("s").unwrap(),
            ScalarValue::Numeric(NumericScalar::Int64(2))
        );
    }

    #[test]
    fn delete_scalar_not_must_exist_maps_not_found_to_success() {
        let ds = MemoryDatastore::new("d");
        ds.delete_scalar_checked("missing", false).unwrap();
        let err = ds.delete_scalar_checked("missing", true).unwrap_err();
        assert!(matches!(err, Error::MissingScalar { .. }));
    }

    #[test]
    fn set_vector_checked_rejects_length_mismatch() {
        let ds = MemoryDatastore::new("d");
        ds.add_axis_checked("cell", vec!["c0".into(), "c1".into(), "c2".into()])
            .unwrap();
        let err = ds
            .set_vector_checked(
                "cell",
                "age",
                VectorValueOrScalar::Value(VectorData::Numeric(NumericArray::Int64(vec![0, 1]))),
                false,
            )
            .unwrap_err();
        assert!(matches!(err, Error::VectorLengthMismatch { .. }));
    }

    #[test]
    fn set_vector_checked_broadcasts_scalar() {
        let ds = MemoryDatastore::new("d");
        ds.add_axis_checked("cell", vec!["c0".into(), "c1".into()]).unwrap();
        ds.set_vector_checked(
            "cell",
            "flag",
            VectorValueOrScalar::Scalar(ScalarValue::Numeric(NumericScalar::Bool(true))),
            false,
        )
        .unwrap();
        assert_eq!(
            ds.get_vector_checked("cell", "flag").unwrap(),
            VectorData::Numeric(NumericArray::Bool(vec![true, true]))
        );
    }
}
