//! The read-only wrapper (component C5): a newtype that forwards only the
//! non-mutating half of the backend contract. Enforcement is static — `ReadOnly<B>`
//! implements [`Format`] only, never [`FormatMut`], so there is no mutating method
//! to call in the first place (spec §3 invariant 6, Design Notes: "static, not
//! dynamic, enforcement is preferred").

use std::sync::Arc;

use crate::{
    cache::DataKey,
    element::{MajorAxis, MatrixData, ScalarValue, VectorData},
    error::Result,
    format::Format,
};

/// Borrows a backend for the wrapper's lifetime and exposes only reads.
pub struct ReadOnly<B> {
    inner: Arc<B>,
}

impl<B> ReadOnly<B> {
    #[must_use]
    pub fn new(inner: Arc<B>) -> Self {
        ReadOnly { inner }
    }

    #[must_use]
    pub fn inner(&self) -> &Arc<B> {
        &self.inner
    }
}

impl<B: Format> Format for ReadOnly<B> {
    fn dataset_name(&self) -> &str {
        self.inner.dataset_name()
    }

    fn has_scalar(&self, name: &str) -> bool {
        self.inner.has_scalar(name)
    }

    fn get_scalar(&self, name: &str) -> Result<ScalarValue> {
        self.inner.get_scalar(name)
    }

    fn scalar_names(&self) -> Vec<String> {
        self.inner.scalar_names()
    }

    fn has_axis(&self, name: &str, for_change: bool) -> bool {
        // A read-only wrapper can never honor a mutation intent.
        if for_change {
            return false;
        }
        self.inner.has_axis(name, false)
    }

    fn axis_length(&self, name: &str) -> Result<usize> {
        self.inner.axis_length(name)
    }

    fn axis_entries(&self, name: &str) -> Result<Arc<Vec<String>>> {
        self.inner.axis_entries(name)
    }

    fn axis_names(&self) -> Vec<String> {
        self.inner.axis_names()
    }

    fn has_vector(&self, axis: &str, name: &str) -> bool {
        self.inner.has_vector(axis, name)
    }

    fn get_vector(&self, axis: &str, name: &str) -> Result<VectorData> {
        self.inner.get_vector(axis, name)
    }

    fn vector_names(&self, axis: &str) -> Result<Vec<String>> {
        self.inner.vector_names(axis)
    }

    fn has_matrix(&self, rows: &str, cols: &str, name: &str, layout: MajorAxis, for_relayout: bool) -> bool {
        self.inner.has_matrix(rows, cols, name, layout, for_relayout)
    }

    fn get_matrix(&self, rows: &str, cols: &str, name: &str, layout: MajorAxis) -> Result<MatrixData> {
        self.inner.get_matrix(rows, cols, name, layout)
    }

    fn matrix_names(&self, rows: &str, cols: &str) -> Result<Vec<String>> {
        self.inner.matrix_names(rows, cols)
    }

    fn version_counter(&self, key: &DataKey) -> u32 {
        self.inner.version_counter(key)
    }

    fn description_header(&self) -> String {
        format!("read-only {}", self.inner.description_header())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{element::NumericScalar, format::FormatMut, memory_backend::MemoryDatastore};

    use super::*;

    #[test]
    fn forwards_reads_to_inner() {
        let ds = Arc::new(MemoryDatastore::new("d"));
        ds.set_scalar("s", ScalarValue::Numeric(NumericScalar::Int64(7))).unwrap();
        let view = ReadOnly::new(Arc::clone(&ds));
        assert!(view.has_scalar("s"));
        assert_eq!(
            view.get_scalar("s").unwrap(),
            ScalarValue::Numeric(NumericScalar::Int64(7))
        );
        assert_eq!(view.dataset_name(), "d");
    }
}
