//! The backend contract (component C3): the abstract operations every concrete
//! dataset implementation provides. Split into [`Format`] (the non-mutating
//! subset) and [`FormatMut`] (adds mutation) so that read-only wrapping (C5) can
//! be enforced statically — a type exposing only [`Format`] simply has no mutating
//! methods to call, rather than needing to panic or error on attempted writes.
//!
//! Chains (C6) and views (C7) are themselves implementations of these traits,
//! allowing uniform recursion: code written against `&dyn Format` works the same
//! whether the concrete backend is in memory, a chain, or a view.

use std::sync::Arc;

use crate::{
    cache::DataKey,
    element::{ElementKind, IndexKind, MajorAxis, MatrixData, ScalarValue, VectorData},
    error::Result,
};

/// The non-mutating half of the backend contract.
pub trait Format: Send + Sync {
    /// Name used in error messages (spec §6: `"...\nin the dataset: <dataset>"`).
    fn dataset_name(&self) -> &str;

    fn has_scalar(&self, name: &str) -> bool;
    fn get_scalar(&self, name: &str) -> Result<ScalarValue>;
    fn scalar_names(&self) -> Vec<String>;

    /// `for_change` signals the caller intends to mutate the axis; most backends
    /// ignore it, but a backend may refuse axes it cannot currently mutate.
    fn has_axis(&self, name: &str, for_change: bool) -> bool;
    fn axis_length(&self, name: &str) -> Result<usize>;
    fn axis_entries(&self, name: &str) -> Result<Arc<Vec<String>>>;
    fn axis_names(&self) -> Vec<String>;

    fn has_vector(&self, axis: &str, name: &str) -> bool;
    fn get_vector(&self, axis: &str, name: &str) -> Result<VectorData>;
    fn vector_names(&self, axis: &str) -> Result<Vec<String>>;

    /// `for_relayout` asks: does the matrix exist in some layout convertible to
    /// `layout` (i.e. `layout` or its transpose), rather than strictly in `layout`
    /// itself?
    fn has_matrix(&self, rows: &str, cols: &str, name: &str, layout: MajorAxis, for_relayout: bool) -> bool;
    fn get_matrix(&self, rows: &str, cols: &str, name: &str, layout: MajorAxis) -> Result<MatrixData>;
    fn matrix_names(&self, rows: &str, cols: &str) -> Result<Vec<String>>;

    fn version_counter(&self, key: &DataKey) -> u32;

    fn description_header(&self) -> String {
        format!("dataset: {}", self.dataset_name())
    }

    fn description_footer(&self) -> String {
        String::new()
    }
}

/// A scoped handle into storage for an as-yet-unfilled dense vector/matrix,
/// returned by `get_empty_*` and consumed by the caller filling it in place, then
/// sealing it. While outstanding, the dataset remains write-locked (spec §4.3: "the
/// empty allocator pattern").
pub struct EmptyDenseHandle {
    pub axis_or_rows: String,
    pub cols: Option<String>,
    pub name: String,
    pub kind: ElementKind,
    pub values: VectorData,
}

/// An opaque token returned alongside a sparse empty allocation, threaded back into
/// `filled_empty_sparse` to seal it.
pub struct EmptySparseHandle {
    pub axis_or_rows: String,
    pub cols: Option<String>,
    pub name: String,
    pub kind: ElementKind,
    pub index_kind: IndexKind,
    pub nnz: usize,
    pub indices: Vec<u64>,
    pub offsets: Vec<u64>,
    pub values: VectorData,
}

/// The mutating half of the backend contract. A backend implementing `FormatMut`
/// necessarily implements `Format` too (it IS a format, with extra powers).
pub trait FormatMut: Format {
    fn set_scalar(&self, name: &str, value: ScalarValue) -> Result<()>;
    /// `for_set` lets "set over existing" skip checks that only matter for user
    /// deletes (spec §4.3/§4.5).
    fn delete_scalar(&self, name: &str, for_set: bool) -> Result<()>;

    fn add_axis(&self, name: &str, entries: Vec<String>) -> Result<()>;
    fn delete_axis(&self, name: &str) -> Result<()>;

    fn set_vector(&self, axis: &str, name: &str, value: VectorData) -> Result<()>;
    fn delete_vector(&self, axis: &str, name: &str, for_set: bool) -> Result<()>;
    fn get_empty_dense_vector(&self, axis: &str, name: &str, kind: ElementKind) -> Result<EmptyDenseHandle>;
    /// Seals a dense vector handle: commits the caller's in-place fill to storage
    /// and releases the write lock [`FormatMut::get_empty_dense_vector`] acquired.
    fn filled_empty_dense_vector(&self, handle: EmptyDenseHandle) -> Result<()>;
    fn get_empty_sparse_vector(
        &self,
        axis: &str,
        name: &str,
        kind: ElementKind,
        nnz: usize,
        index_kind: IndexKind,
    ) -> Result<EmptySparseHandle>;
    fn filled_empty_sparse_vector(&self, handle: EmptySparseHandle) -> Result<()>;

    fn set_matrix(&self, rows: &str, cols: &str, name: &str, value: MatrixData) -> Result<()>;
    fn delete_matrix(&self, rows: &str, cols: &str, name: &str, for_set: bool) -> Result<()>;
    fn get_empty_dense_matrix(
        &self,
        rows: &str,
        cols: &str,
        name: &str,
        kind: ElementKind,
        major: MajorAxis,
    ) -> Result<EmptyDenseHandle>;
    /// Seals a dense matrix handle: commits the caller's in-place fill to storage
    /// under the given major axis and releases the write lock
    /// [`FormatMut::get_empty_dense_matrix`] acquired.
    fn filled_empty_dense_matrix(&self, handle: EmptyDenseHandle, major: MajorAxis) -> Result<()>;
    fn get_empty_sparse_matrix(
        &self,
        rows: &str,
        cols: &str,
        name: &str,
        kind: ElementKind,
        major: MajorAxis,
        nnz: usize,
        index_kind: IndexKind,
    ) -> Result<EmptySparseHandle>;
    fn filled_empty_sparse_matrix(&self, handle: EmptySparseHandle, major: MajorAxis) -> Result<()>;

    /// Materializes the transposed-layout stored copy of a matrix.
    fn relayout_matrix(&self, rows: &str, cols: &str, name: &str, to: MajorAxis) -> Result<()>;

    fn increment_version_counter(&self, key: &DataKey);
}
