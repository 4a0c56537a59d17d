//! The in-memory backend: the one concrete [`Format`]/[`FormatMut`] implementation
//! this crate owns outright. HDF5-like files, directories-of-files, and wrapped
//! annotated-data files are named as external collaborators (spec §1/§6) and are
//! not implemented here; anything conforming to [`Format`]/[`FormatMut`] plugs into
//! the rest of the stack (facade, chain, view, query) the same way this one does.

use std::{cell::UnsafeCell, collections::HashMap, sync::Arc};

use crate::{
    cache::{Cache, DataKey, MajorAxisKey},
    element::{ElementKind, IndexArray, IndexKind, MajorAxis, MatrixData, MatrixStorage, ScalarValue, VectorData},
    error::{Error, Result},
    format::{EmptyDenseHandle, EmptySparseHandle, Format, FormatMut},
    lock::DatasetLock,
};

struct AxisEntry {
    entries: Arc<Vec<String>>,
}

struct VectorEntry {
    data: VectorData,
}

struct MatrixEntry {
    by_layout: HashMap<MajorAxisKey, MatrixData>,
}

#[derive(Default)]
struct Storage {
    scalars: HashMap<String, ScalarValue>,
    axes: HashMap<String, AxisEntry>,
    vectors: HashMap<(String, String), VectorEntry>,
    matrices: HashMap<(String, String, String), MatrixEntry>,
    versions: HashMap<DataKey, u32>,
}

impl Storage {
    fn bump(&mut self, key: DataKey) {
        let counter = self.versions.entry(key.clone()).or_insert(1);
        *counter = counter.wrapping_add(1);
        tracing::trace!("version counter for {:?} bumped to {}", key, counter);
    }

    fn version_of(&self, key: &DataKey) -> u32 {
        self.versions.get(key).copied().unwrap_or(1)
    }

    fn vectors_on_axis(&self, axis: &str) -> impl Iterator<Item = &(String, String)> {
        self.vectors.keys().filter(move |(a, _)| a == axis)
    }

    fn matrices_on_axis<'a>(&'a self, axis: &'a str) -> impl Iterator<Item = &'a (String, String, String)> {
        self.matrices
            .keys()
            .filter(move |(rows, cols, _)| rows == axis || cols == axis)
    }
}

/// A dataset backed entirely by process memory.
pub struct MemoryDatastore {
    name: String,
    lock: DatasetLock,
    cache: Cache,
    storage: UnsafeCell<Storage>,
}

// SAFETY: every access to `storage` goes through `lock`, which provides the
// reentrant readers-writer discipline spec §4.2/§5 requires. No access bypasses it.
unsafe impl Sync for MemoryDatastore {}

impl MemoryDatastore {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        MemoryDatastore {
            name: name.into(),
            lock: DatasetLock::new(),
            cache: Cache::new(),
            storage: UnsafeCell::new(Storage::default()),
        }
    }

    #[must_use]
    pub fn lock(&self) -> &DatasetLock {
        &self.lock
    }

    #[must_use]
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// SAFETY precondition: caller holds at least a read lock on `self.lock`.
    #[allow(clippy::mut_from_ref)]
    fn storage(&self) -> &Storage {
        unsafe { &*self.storage.get() }
    }

    /// SAFETY precondition: caller holds the write lock on `self.lock`.
    #[allow(clippy::mut_from_ref)]
    fn storage_mut(&self) -> &mut Storage {
        unsafe { &mut *self.storage.get() }
    }

    fn missing_scalar(&self, name: &str) -> Error {
        Error::MissingScalar {
            name: name.to_string(),
            dataset: self.name.clone(),
        }
    }

    fn missing_axis(&self, name: &str) -> Error {
        Error::MissingAxis {
            name: name.to_string(),
            dataset: self.name.clone(),
        }
    }

    fn missing_vector(&self, axis: &str, name: &str) -> Error {
        Error::MissingVector {
            axis: axis.to_string(),
            name: name.to_string(),
            dataset: self.name.clone(),
        }
    }

    fn missing_matrix(&self, rows: &str, cols: &str, name: &str) -> Error {
        Error::MissingMatrix {
            rows: rows.to_string(),
            cols: cols.to_string(),
            name: name.to_string(),
            dataset: self.name.clone(),
        }
    }
}

impl Format for MemoryDatastore {
    fn dataset_name(&self) -> &str {
        &self.name
    }

    fn has_scalar(&self, name: &str) -> bool {
        self.lock.acquire_read();
        let result = self.storage().scalars.contains_key(name);
        self.lock.release_read().expect("read lock held above");
        result
    }

    fn get_scalar(&self, name: &str) -> Result<ScalarValue> {
        self.lock.with_read_lock(|| {
            self.storage()
                .scalars
                .get(name)
                .cloned()
                .ok_or_else(|| self.missing_scalar(name))
        })
    }

    fn scalar_names(&self) -> Vec<String> {
        self.lock.acquire_read();
        let storage = self.storage();
        let version = storage.version_of(&DataKey::ScalarNames);
        let names: Arc<Vec<String>> = self.cache.get_or_compute(DataKey::ScalarNames, version, || {
            let mut names: Vec<String> = storage.scalars.keys().cloned().collect();
            names.sort();
            names
        });
        self.lock.release_read().expect("read lock held above");
        (*names).clone()
    }

    fn has_axis(&self, name: &str, _for_change: bool) -> bool {
        self.lock.acquire_read();
        let result = self.storage().axes.contains_key(name);
        self.lock.release_read().expect("read lock held above");
        result
    }

    fn axis_length(&self, name: &str) -> Result<usize> {
        self.lock
            .with_read_lock(|| Ok(self.axis_entries(name)?.len()))
    }

    fn axis_entries(&self, name: &str) -> Result<Arc<Vec<String>>> {
        self.lock.with_read_lock(|| {
            self.storage()
                .axes
                .get(name)
                .map(|axis| Arc::clone(&axis.entries))
                .ok_or_else(|| self.missing_axis(name))
        })
    }

    fn axis_names(&self) -> Vec<String> {
        self.lock.acquire_read();
        let storage = self.storage();
        let version = storage.version_of(&DataKey::AxisNames);
        let names: Arc<Vec<String>> = self.cache.get_or_compute(DataKey::AxisNames, version, || {
            let mut names: Vec<String> = storage.axes.keys().cloned().collect();
            names.sort();
            names
        });
        self.lock.release_read().expect("read lock held above");
        (*names).clone()
    }

    fn has_vector(&self, axis: &str, name: &str) -> bool {
        self.lock.acquire_read();
        let result = self
            .storage()
            .vectors
            .contains_key(&(axis.to_string(), name.to_string()));
        self.lock.release_read().expect("read lock held above");
        result
    }

    fn get_vector(&self, axis: &str, name: &str) -> Result<VectorData> {
        self.lock.with_read_lock(|| {
            self.storage()
                .vectors
                .get(&(axis.to_string(), name.to_string()))
                .map(|entry| entry.data.clone())
                .ok_or_else(|| self.missing_vector(axis, name))
        })
    }

    fn vector_names(&self, axis: &str) -> Result<Vec<String>> {
        self.lock.with_read_lock(|| {
            if !self.storage().axes.contains_key(axis) {
                return Err(self.missing_axis(axis));
            }
            let storage = self.storage();
            let version = storage.version_of(&DataKey::VectorNames(axis.to_string()));
            let key = DataKey::VectorNames(axis.to_string());
            let names: Arc<Vec<String>> = self.cache.get_or_compute(key, version, || {
                let mut names: Vec<String> = storage
                    .vectors_on_axis(axis)
                    .map(|(_, name)| name.clone())
                    .collect();
                names.sort();
                names
            });
            Ok((*names).clone())
        })
    }

    fn has_matrix(&self, rows: &str, cols: &str, name: &str, layout: MajorAxis, for_relayout: bool) -> bool {
        self.lock.acquire_read();
        let key = (rows.to_string(), cols.to_string(), name.to_string());
        let result = self.storage().matrices.get(&key).is_some_and(|entry| {
            if for_relayout {
                !entry.by_layout.is_empty()
            } else {
                entry.by_layout.contains_key(&layout.into())
            }
        });
        self.lock.release_read().expect("read lock held above");
        result
    }

    fn get_matrix(&self, rows: &str, cols: &str, name: &str, layout: MajorAxis) -> Result<MatrixData> {
        self.lock.with_read_lock(|| {
            let key = (rows.to_string(), cols.to_string(), name.to_string());
            self.storage()
                .matrices
                .get(&key)
                .and_then(|entry| entry.by_layout.get(&layout.into()))
                .cloned()
                .ok_or_else(|| self.missing_matrix(rows, cols, name))
        })
    }

    fn matrix_names(&self, rows: &str, cols: &str) -> Result<Vec<String>> {
        self.lock.with_read_lock(|| {
            if !self.storage().axes.contains_key(rows) {
                return Err(self.missing_axis(rows));
            }
            if !self.storage().axes.contains_key(cols) {
                return Err(self.missing_axis(cols));
            }
            let storage = self.storage();
            let key = DataKey::MatrixNames(rows.to_string(), cols.to_string());
            let version = storage.version_of(&key);
            let names: Arc<Vec<String>> = self.cache.get_or_compute(key, version, || {
                let mut names: Vec<String> = storage
                    .matrices
                    .keys()
                    .filter(|(r, c, _)| r == rows && c == cols)
                    .map(|(_, _, name)| name.clone())
                    .collect();
                names.sort();
                names
            });
            Ok((*names).clone())
        })
    }

    fn version_counter(&self, key: &DataKey) -> u32 {
        self.lock.acquire_read();
        let result = self.storage().version_of(key);
        self.lock.release_read().expect("read lock held above");
        result
    }
}

impl FormatMut for MemoryDatastore {
    fn set_scalar(&self, name: &str, value: ScalarValue) -> Result<()> {
        self.lock.with_write_lock(|| {
            self.storage_mut().scalars.insert(name.to_string(), value);
            self.storage_mut().bump(DataKey::ScalarNames);
            Ok(())
        })
    }

    fn delete_scalar(&self, name: &str, for_set: bool) -> Result<()> {
        self.lock.with_write_lock(|| {
            let existed = self.storage_mut().scalars.remove(name).is_some();
            if !existed && !for_set {
                return Err(self.missing_scalar(name));
            }
            self.storage_mut().bump(DataKey::ScalarNames);
            Ok(())
        })
    }

    fn add_axis(&self, name: &str, entries: Vec<String>) -> Result<()> {
        self.lock.with_write_lock(|| {
            if self.storage().axes.contains_key(name) {
                return Err(Error::AxisAlreadyExists {
                    name: name.to_string(),
                    dataset: self.name.clone(),
                });
            }
            self.storage_mut().axes.insert(
                name.to_string(),
                AxisEntry {
                    entries: Arc::new(entries),
                },
            );
            self.storage_mut().bump(DataKey::AxisNames);
            Ok(())
        })
    }

    fn delete_axis(&self, name: &str) -> Result<()> {
        self.lock.with_write_lock(|| {
            if self.storage_mut().axes.remove(name).is_none() {
                return Err(self.missing_axis(name));
            }
            let vector_keys: Vec<(String, String)> =
                self.storage().vectors_on_axis(name).cloned().collect();
            for key in vector_keys {
                self.storage_mut().vectors.remove(&key);
                self.cache.invalidate(&DataKey::Vector(key.0, key.1));
            }
            let matrix_keys: Vec<(String, String, String)> =
                self.storage().matrices_on_axis(name).cloned().collect();
            for (rows, cols, matrix_name) in matrix_keys {
                self.storage_mut()
                    .matrices
                    .remove(&(rows.clone(), cols.clone(), matrix_name.clone()));
                for layout in [MajorAxisKey::Row, MajorAxisKey::Column] {
                    self.cache.invalidate(&DataKey::Matrix(
                        rows.clone(),
                        cols.clone(),
                        matrix_name.clone(),
                        layout,
                    ));
                }
            }
            self.storage_mut().bump(DataKey::AxisNames);
            self.cache.invalidate(&DataKey::AxisEntries(name.to_string()));
            Ok(())
        })
    }

    fn set_vector(&self, axis: &str, name: &str, value: VectorData) -> Result<()> {
        self.lock.with_write_lock(|| {
            let expected = self
                .storage()
                .axes
                .get(axis)
                .map(|a| a.entries.len())
                .ok_or_else(|| self.missing_axis(axis))?;
            if value.len() != expected {
                return Err(Error::VectorLengthMismatch {
                    axis: axis.to_string(),
                    len: value.len(),
                    expected,
                });
            }
            let key = (axis.to_string(), name.to_string());
            self.storage_mut().vectors.insert(key, VectorEntry { data: value });
            self.storage_mut()
                .bump(DataKey::Vector(axis.to_string(), name.to_string()));
            self.storage_mut().bump(DataKey::VectorNames(axis.to_string()));
            Ok(())
        })
    }

    fn delete_vector(&self, axis: &str, name: &str, for_set: bool) -> Result<()> {
        self.lock.with_write_lock(|| {
            let key = (axis.to_string(), name.to_string());
            let existed = self.storage_mut().vectors.remove(&key).is_some();
            if !existed && !for_set {
                return Err(self.missing_vector(axis, name));
            }
            self.storage_mut()
                .bump(DataKey::Vector(axis.to_string(), name.to_string()));
            self.storage_mut().bump(DataKey::VectorNames(axis.to_string()));
            Ok(())
        })
    }

    fn get_empty_dense_vector(&self, axis: &str, name: &str, kind: ElementKind) -> Result<EmptyDenseHandle> {
        self.lock.acquire_write()?;
        let len = match self.storage().axes.get(axis) {
            Some(a) => a.entries.len(),
            None => {
                self.lock.release_write()?;
                return Err(self.missing_axis(axis));
            }
        };
        Ok(EmptyDenseHandle {
            axis_or_rows: axis.to_string(),
            cols: None,
            name: name.to_string(),
            kind,
            values: empty_vector_of_kind(kind, len),
        })
    }

    fn filled_empty_dense_vector(&self, handle: EmptyDenseHandle) -> Result<()> {
        let result = (|| {
            let expected = self
                .storage()
                .axes
                .get(&handle.axis_or_rows)
                .map(|a| a.entries.len())
                .ok_or_else(|| self.missing_axis(&handle.axis_or_rows))?;
            if handle.values.len() != expected {
                return Err(Error::VectorLengthMismatch {
                    axis: handle.axis_or_rows.clone(),
                    len: handle.values.len(),
                    expected,
                });
            }
            let key = (handle.axis_or_rows.clone(), handle.name.clone());
            self.storage_mut().vectors.insert(key, VectorEntry { data: handle.values });
            self.storage_mut()
                .bump(DataKey::Vector(handle.axis_or_rows.clone(), handle.name.clone()));
            self.storage_mut().bump(DataKey::VectorNames(handle.axis_or_rows));
            Ok(())
        })();
        self.lock.release_write()?;
        result
    }

    fn get_empty_sparse_vector(
        &self,
        axis: &str,
        name: &str,
        kind: ElementKind,
        nnz: usize,
        index_kind: IndexKind,
    ) -> Result<EmptySparseHandle> {
        self.lock.acquire_write()?;
        if !self.storage().axes.contains_key(axis) {
            self.lock.release_write()?;
            return Err(self.missing_axis(axis));
        }
        Ok(EmptySparseHandle {
            axis_or_rows: axis.to_string(),
            cols: None,
            name: name.to_string(),
            kind,
            index_kind,
            nnz,
            indices: vec![0; nnz],
            offsets: Vec::new(),
            values: empty_vector_of_kind(kind, nnz),
        })
    }

    fn filled_empty_sparse_vector(&self, handle: EmptySparseHandle) -> Result<()> {
        // The write lock was taken by `get_empty_sparse_vector` and is still held by
        // this thread; release exactly the one level it acquired.
        let result = (|| {
            let values = match handle.values {
                VectorData::Numeric(n) => n,
                VectorData::Str(_) => {
                    return Err(Error::TypeMismatch {
                        expected: ElementKind::Float64,
                        found: ElementKind::Str,
                    })
                }
            };
            if values.len() != handle.nnz || handle.indices.len() != handle.nnz {
                return Err(Error::SparseLengthMismatch {
                    nnz: handle.nnz,
                    indices: handle.indices.len(),
                    offsets: handle.offsets.len(),
                    values: values.len(),
                });
            }
            let key = (handle.axis_or_rows.clone(), handle.name.clone());
            let expected = self
                .storage()
                .axes
                .get(&handle.axis_or_rows)
                .map(|a| a.entries.len())
                .ok_or_else(|| self.missing_axis(&handle.axis_or_rows))?;
            if handle.indices.iter().any(|&idx| idx as usize >= expected) {
                return Err(Error::VectorLengthMismatch {
                    axis: handle.axis_or_rows.clone(),
                    len: handle.nnz,
                    expected,
                });
            }
            let dense = scatter_sparse_numeric(expected, &handle.indices, values);
            self.storage_mut()
                .vectors
                .insert(key, VectorEntry { data: VectorData::Numeric(dense) });
            self.storage_mut()
                .bump(DataKey::Vector(handle.axis_or_rows.clone(), handle.name.clone()));
            self.storage_mut().bump(DataKey::VectorNames(handle.axis_or_rows));
            Ok(())
        })();
        self.lock.release_write()?;
        result
    }

    fn set_matrix(&self, rows: &str, cols: &str, name: &str, value: MatrixData) -> Result<()> {
        self.lock.with_write_lock(|| {
            let expected_rows = self
                .storage()
                .axes
                .get(rows)
                .map(|a| a.entries.len())
                .ok_or_else(|| self.missing_axis(rows))?;
            let expected_cols = self
                .storage()
                .axes
                .get(cols)
                .map(|a| a.entries.len())
                .ok_or_else(|| self.missing_axis(cols))?;
            if value.rows != expected_rows || value.cols != expected_cols {
                return Err(Error::MatrixShapeMismatch {
                    rows: value.rows,
                    cols: value.cols,
                    expected_rows,
                    expected_cols,
                });
            }
            if !value.kind().is_matrix_eltype() {
                return Err(Error::TypeMismatch {
                    expected: ElementKind::Float64,
                    found: value.kind(),
                });
            }
            let major = value.major;
            let map_key = (rows.to_string(), cols.to_string(), name.to_string());
            self.storage_mut()
                .matrices
                .entry(map_key)
                .or_insert_with(|| MatrixEntry {
                    by_layout: HashMap::new(),
                })
                .by_layout
                .insert(major.into(), value);
            self.storage_mut().bump(DataKey::Matrix(
                rows.to_string(),
                cols.to_string(),
                name.to_string(),
                major.into(),
            ));
            self.storage_mut()
                .bump(DataKey::MatrixNames(rows.to_string(), cols.to_string()));
            Ok(())
        })
    }

    fn delete_matrix(&self, rows: &str, cols: &str, name: &str, for_set: bool) -> Result<()> {
        self.lock.with_write_lock(|| {
            let key = (rows.to_string(), cols.to_string(), name.to_string());
            let existed = self.storage_mut().matrices.remove(&key).is_some();
            if !existed && !for_set {
                return Err(self.missing_matrix(rows, cols, name));
            }
            for layout in [MajorAxisKey::Row, MajorAxisKey::Column] {
                self.cache.invalidate(&DataKey::Matrix(
                    rows.to_string(),
                    cols.to_string(),
                    name.to_string(),
                    layout,
                ));
            }
            self.storage_mut()
                .bump(DataKey::MatrixNames(rows.to_string(), cols.to_string()));
            Ok(())
        })
    }

    fn get_empty_dense_matrix(
        &self,
        rows: &str,
        cols: &str,
        name: &str,
        kind: ElementKind,
        major: MajorAxis,
    ) -> Result<EmptyDenseHandle> {
        self.lock.acquire_write()?;
        let shape = match (self.storage().axes.get(rows), self.storage().axes.get(cols)) {
            (Some(r), Some(c)) => (r.entries.len(), c.entries.len()),
            (None, _) => {
                self.lock.release_write()?;
                return Err(self.missing_axis(rows));
            }
            (_, None) => {
                self.lock.release_write()?;
                return Err(self.missing_axis(cols));
            }
        };
        let _ = major;
        Ok(EmptyDenseHandle {
            axis_or_rows: rows.to_string(),
            cols: Some(cols.to_string()),
            name: name.to_string(),
            kind,
            values: empty_vector_of_kind(kind, shape.0 * shape.1),
        })
    }

    fn filled_empty_dense_matrix(&self, handle: EmptyDenseHandle, major: MajorAxis) -> Result<()> {
        let result = (|| {
            let cols_axis = handle
                .cols
                .clone()
                .ok_or_else(|| Error::from("dense matrix handle missing columns axis"))?;
            let rows_len = self
                .storage()
                .axes
                .get(&handle.axis_or_rows)
                .map(|a| a.entries.len())
                .ok_or_else(|| self.missing_axis(&handle.axis_or_rows))?;
            let cols_len = self
                .storage()
                .axes
                .get(&cols_axis)
                .map(|a| a.entries.len())
                .ok_or_else(|| self.missing_axis(&cols_axis))?;
            let values = match handle.values {
                VectorData::Numeric(n) => n,
                VectorData::Str(_) => {
                    return Err(Error::TypeMismatch {
                        expected: ElementKind::Float64,
                        found: ElementKind::Str,
                    })
                }
            };
            if values.len() != rows_len * cols_len {
                return Err(Error::MatrixShapeMismatch {
                    rows: values.len(),
                    cols: 1,
                    expected_rows: rows_len,
                    expected_cols: cols_len,
                });
            }
            let matrix = MatrixData {
                rows: rows_len,
                cols: cols_len,
                major,
                storage: MatrixStorage::Dense(values),
            };
            let map_key = (handle.axis_or_rows.clone(), cols_axis.clone(), handle.name.clone());
            self.storage_mut()
                .matrices
                .entry(map_key)
                .or_insert_with(|| MatrixEntry {
                    by_layout: HashMap::new(),
                })
                .by_layout
                .insert(major.into(), matrix);
            self.storage_mut().bump(DataKey::Matrix(
                handle.axis_or_rows.clone(),
                cols_axis.clone(),
                handle.name.clone(),
                major.into(),
            ));
            self.storage_mut()
                .bump(DataKey::MatrixNames(handle.axis_or_rows, cols_axis));
            Ok(())
        })();
        self.lock.release_write()?;
        result
    }

    fn get_empty_sparse_matrix(
        &self,
        rows: &str,
        cols: &str,
        name: &str,
        kind: ElementKind,
        major: MajorAxis,
        nnz: usize,
        index_kind: IndexKind,
    ) -> Result<EmptySparseHandle> {
        self.lock.acquire_write()?;
        let major_count = match (self.storage().axes.get(rows), self.storage().axes.get(cols)) {
            (Some(r), Some(c)) => match major {
                MajorAxis::Row => r.entries.len(),
                MajorAxis::Column => c.entries.len(),
            },
            (None, _) => {
                self.lock.release_write()?;
                return Err(self.missing_axis(rows));
            }
            (_, None) => {
                self.lock.release_write()?;
                return Err(self.missing_axis(cols));
            }
        };
        Ok(EmptySparseHandle {
            axis_or_rows: rows.to_string(),
            cols: Some(cols.to_string()),
            name: name.to_string(),
            kind,
            index_kind,
            nnz,
            indices: vec![0; nnz],
            // Pre-sized indptr (major_count + 1); the caller fills it in place,
            // same as `indices`/`values`, before sealing with `filled_empty_sparse_matrix`.
            offsets: vec![0; major_count + 1],
            values: empty_vector_of_kind(kind, nnz),
        })
    }

    fn filled_empty_sparse_matrix(&self, handle: EmptySparseHandle, major: MajorAxis) -> Result<()> {
        let result = (|| {
            let cols_axis = handle
                .cols
                .clone()
                .ok_or_else(|| Error::from("sparse matrix handle missing columns axis"))?;
            let rows_len = self
                .storage()
                .axes
                .get(&handle.axis_or_rows)
                .map(|a| a.entries.len())
                .ok_or_else(|| self.missing_axis(&handle.axis_or_rows))?;
            let cols_len = self
                .storage()
                .axes
                .get(&cols_axis)
                .map(|a| a.entries.len())
                .ok_or_else(|| self.missing_axis(&cols_axis))?;
            let values = match handle.values {
                VectorData::Numeric(n) => n,
                VectorData::Str(_) => {
                    return Err(Error::TypeMismatch {
                        expected: ElementKind::Float64,
                        found: ElementKind::Str,
                    })
                }
            };
            let major_count = match major {
                MajorAxis::Row => rows_len,
                MajorAxis::Column => cols_len,
            };
            if values.len() != handle.nnz
                || handle.indices.len() != handle.nnz
                || handle.offsets.len() != major_count + 1
            {
                return Err(Error::SparseLengthMismatch {
                    nnz: handle.nnz,
                    indices: handle.indices.len(),
                    offsets: handle.offsets.len(),
                    values: values.len(),
                });
            }
            let matrix = MatrixData {
                rows: rows_len,
                cols: cols_len,
                major,
                storage: MatrixStorage::Sparse(crate::element::SparseMatrixData {
                    index_kind: handle.index_kind,
                    nnz: handle.nnz,
                    indices: to_index_array(handle.index_kind, handle.indices),
                    offsets: to_index_array(handle.index_kind, handle.offsets),
                    values,
                }),
            };
            let map_key = (handle.axis_or_rows.clone(), cols_axis.clone(), handle.name.clone());
            self.storage_mut()
                .matrices
                .entry(map_key)
                .or_insert_with(|| MatrixEntry {
                    by_layout: HashMap::new(),
                })
                .by_layout
                .insert(major.into(), matrix);
            self.storage_mut().bump(DataKey::Matrix(
                handle.axis_or_rows.clone(),
                cols_axis.clone(),
                handle.name.clone(),
                major.into(),
            ));
            self.storage_mut()
                .bump(DataKey::MatrixNames(handle.axis_or_rows, cols_axis));
            Ok(())
        })();
        self.lock.release_write()?;
        result
    }

    fn relayout_matrix(&self, rows: &str, cols: &str, name: &str, to: MajorAxis) -> Result<()> {
        self.lock.with_write_lock(|| {
            let key = (rows.to_string(), cols.to_string(), name.to_string());
            let from = to.transpose();
            let source = self
                .storage()
                .matrices
                .get(&key)
                .and_then(|entry| entry.by_layout.get(&from.into()))
                .cloned()
                .ok_or_else(|| self.missing_matrix(rows, cols, name))?;

            let transposed = transpose_matrix(&source, to)?;
            self.storage_mut()
                .matrices
                .get_mut(&key)
                .expect("checked above")
                .by_layout
                .insert(to.into(), transposed);
            self.storage_mut()
                .bump(DataKey::Matrix(rows.to_string(), cols.to_string(), name.to_string(), to.into()));
            Ok(())
        })
    }

    fn increment_version_counter(&self, key: &DataKey) {
        self.lock.acquire_write().expect("caller already holds no conflicting lock");
        self.storage_mut().bump(key.clone());
        self.lock.release_write().expect("write lock held above");
    }
}

fn empty_vector_of_kind(kind: ElementKind, len: usize) -> VectorData {
    use crate::element::NumericArray as N;
    match kind {
        ElementKind::Int8 => VectorData::Numeric(N::Int8(vec![0; len])),
        ElementKind::Int16 => VectorData::Numeric(N::Int16(vec![0; len])),
        ElementKind::Int32 => VectorData::Numeric(N::Int32(vec![0; len])),
        ElementKind::Int64 => VectorData::Numeric(N::Int64(vec![0; len])),
        ElementKind::UInt8 => VectorData::Numeric(N::UInt8(vec![0; len])),
        ElementKind::UInt16 => VectorData::Numeric(N::UInt16(vec![0; len])),
        ElementKind::UInt32 => VectorData::Numeric(N::UInt32(vec![0; len])),
        ElementKind::UInt64 => VectorData::Numeric(N::UInt64(vec![0; len])),
        ElementKind::Float32 => VectorData::Numeric(N::Float32(vec![0.0; len])),
        ElementKind::Float64 => VectorData::Numeric(N::Float64(vec![0.0; len])),
        ElementKind::Bool => VectorData::Numeric(N::Bool(vec![false; len])),
        ElementKind::Str => VectorData::Str(vec![String::new(); len]),
    }
}

/// Scatters a sparse vector's `nnz` (index, value) pairs into a dense array of
/// length `len`, used to seal [`FormatMut::filled_empty_sparse_vector`] (spec §4.3:
/// vectors are a single-axis artifact, so unlike sparse matrices they need no
/// offsets array — each index is simply the position in the dense vector).
fn scatter_sparse_numeric(len: usize, indices: &[u64], values: crate::element::NumericArray) -> crate::element::NumericArray {
    use crate::element::NumericArray as N;

    macro_rules! scatter_as {
        ($variant:ident, $default:expr) => {{
            let mut out = vec![$default; len];
            if let N::$variant(vals) = &values {
                for (idx, val) in indices.iter().zip(vals.iter()) {
                    out[*idx as usize] = *val;
                }
            }
            N::$variant(out)
        }};
    }

    match values.kind() {
        ElementKind::Int8 => scatter_as!(Int8, 0),
        ElementKind::Int16 => scatter_as!(Int16, 0),
        ElementKind::Int32 => scatter_as!(Int32, 0),
        ElementKind::Int64 => scatter_as!(Int64, 0),
        ElementKind::UInt8 => scatter_as!(UInt8, 0),
        ElementKind::UInt16 => scatter_as!(UInt16, 0),
        ElementKind::UInt32 => scatter_as!(UInt32, 0),
        ElementKind::UInt64 => scatter_as!(UInt64, 0),
        ElementKind::Float32 => scatter_as!(Float32, 0.0),
        ElementKind::Float64 => scatter_as!(Float64, 0.0),
        ElementKind::Bool => scatter_as!(Bool, false),
        ElementKind::Str => unreachable!("NumericArray never carries the Str kind"),
    }
}

fn to_index_array(kind: IndexKind, values: Vec<u64>) -> IndexArray {
    match kind {
        IndexKind::UInt32 => IndexArray::UInt32(values.into_iter().map(|v| v as u32).collect()),
        IndexKind::UInt64 => IndexArray::UInt64(values),
    }
}

/// Materializes a dense transpose of `source` in the `to` major axis. Sparse
/// matrices are densified for the transposed copy; a dedicated sparse transpose
/// kernel is out of scope for the core budget.
fn transpose_matrix(source: &MatrixData, to: MajorAxis) -> Result<MatrixData> {
    use crate::element::NumericArray as N;

    macro_rules! transpose_dense {
        ($variant:ident, $values:expr, $rows:expr, $cols:expr) => {{
            let mut out = vec![Default::default(); $values.len()];
            for r in 0..$rows {
                for c in 0..$cols {
                    out[c * $rows + r] = $values[r * $cols + c];
                }
            }
            N::$variant(out)
        }};
    }

    let (rows, cols) = (source.rows, source.cols);
    let dense = match &source.storage {
        MatrixStorage::Dense(values) => values.clone(),
        MatrixStorage::Sparse(sparse) => densify(sparse, rows, cols, source.major)?,
    };

    let transposed = match dense {
        N::Int8(v) => transpose_dense!(Int8, v, rows, cols),
        N::Int16(v) => transpose_dense!(Int16, v, rows, cols),
        N::Int32(v) => transpose_dense!(Int32, v, rows, cols),
        N::Int64(v) => transpose_dense!(Int64, v, rows, cols),
        N::UInt8(v) => transpose_dense!(UInt8, v, rows, cols),
        N::UInt16(v) => transpose_dense!(UInt16, v, rows, cols),
        N::UInt32(v) => transpose_dense!(UInt32, v, rows, cols),
        N::UInt64(v) => transpose_dense!(UInt64, v, rows, cols),
        N::Float32(v) => transpose_dense!(Float32, v, rows, cols),
        N::Float64(v) => transpose_dense!(Float64, v, rows, cols),
        N::Bool(v) => transpose_dense!(Bool, v, rows, cols),
    };

    Ok(MatrixData {
        rows: cols,
        cols: rows,
        major: to,
        storage: MatrixStorage::Dense(transposed),
    })
}

/// Densifies a sparse matrix's compressed-per-major-axis storage into a plain
/// array in logical (rows, cols) order, covering every numeric kind the way
/// `scatter_sparse_numeric`/`map_numeric!` do — there is no fallback arm, so a
/// kind added to [`ElementKind`] without a matching arm here fails to compile
/// rather than silently densifying through the wrong element type.
fn densify(
    sparse: &crate::element::SparseMatrixData,
    rows: usize,
    cols: usize,
    major: MajorAxis,
) -> Result<crate::element::NumericArray> {
    use crate::element::NumericArray as N;
    macro_rules! densify_as {
        ($variant:ident, $default:expr) => {{
            let mut out = vec![$default; rows * cols];
            let major_count = match major {
                MajorAxis::Row => rows,
                MajorAxis::Column => cols,
            };
            let offsets = index_array_as_usize(&sparse.offsets);
            let indices = index_array_as_usize(&sparse.indices);
            if let N::$variant(values) = &sparse.values {
                for major_idx in 0..major_count.min(offsets.len().saturating_sub(1)) {
                    let start = offsets[major_idx];
                    let end = offsets[major_idx + 1];
                    for p in start..end {
                        let minor_idx = indices[p];
                        let (r, c) = match major {
                            MajorAxis::Row => (major_idx, minor_idx),
                            MajorAxis::Column => (minor_idx, major_idx),
                        };
                        if r < rows && c < cols {
                            out[r * cols + c] = values[p];
                        }
                    }
                }
            }
            N::$variant(out)
        }};
    }
    Ok(match sparse.values.kind() {
        ElementKind::Int8 => densify_as!(Int8, 0),
        ElementKind::Int16 => densify_as!(Int16, 0),
        ElementKind::Int32 => densify_as!(Int32, 0),
        ElementKind::Int64 => densify_as!(Int64, 0),
        ElementKind::UInt8 => densify_as!(UInt8, 0),
        ElementKind::UInt16 => densify_as!(UInt16, 0),
        ElementKind::UInt32 => densify_as!(UInt32, 0),
        ElementKind::UInt64 => densify_as!(UInt64, 0),
        ElementKind::Float32 => densify_as!(Float32, 0.0),
        ElementKind::Float64 => densify_as!(Float64, 0.0),
        ElementKind::Bool => densify_as!(Bool, false),
        ElementKind::Str => {
            return Err(Error::TypeMismatch {
                expected: ElementKind::Float64,
                found: ElementKind::Str,
            })
        }
    })
}

fn index_array_as_usize(array: &IndexArray) -> Vec<usize> {
    match array {
        IndexArray::UInt32(v) => v.iter().map(|&x| x as usize).collect(),
        IndexArray::UInt64(v) => v.iter().map(|&x| x as usize).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::NumericArray;

    #[test]
    fn set_get_delete_scalar_round_trips() {
        let ds = MemoryDatastore::new("d");
        ds.set_scalar("version", ScalarValue::Numeric(crate::element::NumericScalar::Int64(1)))
            .unwrap();
        assert!(ds.has_scalar("version"));
        assert_eq!(
            ds.get_scalar("version").unwrap(),
            ScalarValue::Numeric(crate::element::NumericScalar::Int64(1))
        );
        ds.delete_scalar("version", false).unwrap();
        assert!(!ds.has_scalar("version"));
    }

    #[test]
    fn vector_length_must_match_axis() {
        let ds = MemoryDatastore::new("d");
        ds.add_axis("cell", vec!["c0".into(), "c1".into(), "c2".into()])
            .unwrap();
        ds.set_vector("cell", "age", VectorData::Numeric(NumericArray::Int64(vec![0, 1, 2])))
            .unwrap();
        assert_eq!(
            ds.get_vector("cell", "age").unwrap(),
            VectorData::Numeric(NumericArray::Int64(vec![0, 1, 2]))
        );

        let err = ds
            .set_vector("cell", "age2", VectorData::Numeric(NumericArray::Int64(vec![0, 1])))
            .unwrap_err();
        match err {
            Error::VectorLengthMismatch { axis, len, expected } => {
                assert_eq!(axis, "cell");
                assert_eq!(len, 2);
                assert_eq!(expected, 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn delete_axis_cascades_vectors_and_matrices() {
        let ds = MemoryDatastore::new("d");
        ds.add_axis("cell", vec!["c0".into(), "c1".into()]).unwrap();
        ds.add_axis("gene", vec!["g0".into()]).unwrap();
        ds.set_vector("cell", "age", VectorData::Numeric(NumericArray::Int64(vec![1, 2])))
            .unwrap();
        ds.set_matrix(
            "cell",
            "gene",
            "umi",
            MatrixData {
                rows: 2,
                cols: 1,
                major: MajorAxis::Row,
                storage: MatrixStorage::Dense(NumericArray::Float64(vec![1.0, 2.0])),
            },
        )
        .unwrap();

        ds.delete_axis("cell").unwrap();
        assert!(!ds.has_vector("cell", "age"));
        assert!(!ds.has_matrix("cell", "gene", "umi", MajorAxis::Row, true));
    }

    #[test]
    fn relayout_transposes_shape_and_values() {
        let ds = MemoryDatastore::new("d");
        ds.add_axis("r", vec!["r0".into(), "r1".into()]).unwrap();
        ds.add_axis("c", vec!["c0".into(), "c1".into(), "c2".into()])
            .unwrap();
        ds.set_matrix(
            "r",
            "c",
            "m",
            MatrixData {
                rows: 2,
                cols: 3,
                major: MajorAxis::Row,
                storage: MatrixStorage::Dense(NumericArray::Float64(vec![
                    1.0, 2.0, 3.0, 4.0, 5.0, 6.0,
                ])),
            },
        )
        .unwrap();
        ds.relayout_matrix("r", "c", "m", MajorAxis::Column).unwrap();
        let transposed = ds.get_matrix("r", "c", "m", MajorAxis::Column).unwrap();
        assert_eq!(transposed.shape(), (3, 2));
        match transposed.storage {
            MatrixStorage::Dense(NumericArray::Float64(values)) => {
                // source is row-major (rows=2, cols=3): source[i,j] == source_flat[i*3+j].
                // transposed is row-major (rows=3, cols=2): transposed[j,i] ==
                // transposed_flat[j*2+i]. Spec invariant 9: relayout(M)[j,i] == M[i,j].
                let source = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
                for i in 0..2 {
                    for j in 0..3 {
                        assert_eq!(values[j * 2 + i], source[i * 3 + j]);
                    }
                }
            }
            other => panic!("expected dense float64, got {other:?}"),
        }
    }

    #[test]
    fn version_counter_bumps_on_mutation() {
        let ds = MemoryDatastore::new("d");
        let key = DataKey::ScalarNames;
        let v0 = ds.version_counter(&key);
        ds.set_scalar("x", ScalarValue::Str("y".into())).unwrap();
        let v1 = ds.version_counter(&key);
        assert!(v1 != v0);
    }

    #[test]
    fn empty_dense_vector_fill_then_seal_round_trips_and_releases_lock() {
        let ds = MemoryDatastore::new("d");
        ds.add_axis("cell", vec!["c0".into(), "c1".into(), "c2".into()]).unwrap();

        let mut handle = ds.get_empty_dense_vector("cell", "age", ElementKind::Int64).unwrap();
        match &mut handle.values {
            VectorData::Numeric(NumericArray::Int64(v)) => {
                v[0] = 10;
                v[1] = 20;
                v[2] = 30;
            }
            other => panic!("expected Int64 vector, got {other:?}"),
        }
        ds.filled_empty_dense_vector(handle).unwrap();

        assert_eq!(
            ds.get_vector("cell", "age").unwrap(),
            VectorData::Numeric(NumericArray::Int64(vec![10, 20, 30]))
        );
        // The write lock acquired by get_empty_dense_vector must have been fully
        // released by the seal, leaving the dataset free for another writer.
        assert!(!ds.lock.has_write_lock());
        ds.set_scalar("probe", ScalarValue::Str("ok".into())).unwrap();
    }

    #[test]
    fn empty_sparse_vector_fill_then_seal_scatters_values_and_releases_lock() {
        let ds = MemoryDatastore::new("d");
        ds.add_axis("cell", vec!["c0".into(), "c1".into(), "c2".into(), "c3".into()])
            .unwrap();

        let mut handle = ds
            .get_empty_sparse_vector("cell", "count", ElementKind::Int64, 2, IndexKind::UInt32)
            .unwrap();
        handle.indices = vec![1, 3];
        match &mut handle.values {
            VectorData::Numeric(NumericArray::Int64(v)) => {
                v[0] = 7;
                v[1] = 9;
            }
            other => panic!("expected Int64 vector, got {other:?}"),
        }
        ds.filled_empty_sparse_vector(handle).unwrap();

        assert_eq!(
            ds.get_vector("cell", "count").unwrap(),
            VectorData::Numeric(NumericArray::Int64(vec![0, 7, 0, 9]))
        );
        assert!(!ds.lock.has_write_lock());
        ds.set_scalar("probe", ScalarValue::Str("ok".into())).unwrap();
    }

    #[test]
    fn empty_dense_matrix_fill_then_seal_round_trips_and_releases_lock() {
        let ds = MemoryDatastore::new("d");
        ds.add_axis("r", vec!["r0".into(), "r1".into()]).unwrap();
        ds.add_axis("c", vec!["c0".into(), "c1".into(), "c2".into()])
            .unwrap();

        let mut handle = ds
            .get_empty_dense_matrix("r", "c", "m", ElementKind::Float64, MajorAxis::Row)
            .unwrap();
        match &mut handle.values {
            VectorData::Numeric(NumericArray::Float64(v)) => {
                for (i, slot) in v.iter_mut().enumerate() {
                    *slot = i as f64;
                }
            }
            other => panic!("expected Float64 vector, got {other:?}"),
        }
        ds.filled_empty_dense_matrix(handle, MajorAxis::Row).unwrap();

        let matrix = ds.get_matrix("r", "c", "m", MajorAxis::Row).unwrap();
        assert_eq!(matrix.shape(), (2, 3));
        match matrix.storage {
            MatrixStorage::Dense(NumericArray::Float64(values)) => {
                assert_eq!(values, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
            }
            other => panic!("expected dense float64, got {other:?}"),
        }
        assert!(!ds.lock.has_write_lock());
    }
}
