//! Element kinds, scalar/vector/matrix value representations, and matrix layout
//! descriptors (component C1: storage primitives).
//!
//! Element kinds form a closed tagged union; values are stored one `Vec` per kind
//! rather than dispatched through a trait object, so kernels over them can be
//! matched and monomorphized per kind instead of dispatched virtually per element.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The closed set of element kinds usable in scalars, vector elements, and (all but
/// [`ElementKind::Str`]) matrix elements.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Bool,
    Str,
}

impl ElementKind {
    /// Matrices may not carry string-typed elements.
    #[must_use]
    pub fn is_matrix_eltype(self) -> bool {
        !matches!(self, ElementKind::Str)
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElementKind::Int8 => "int8",
            ElementKind::Int16 => "int16",
            ElementKind::Int32 => "int32",
            ElementKind::Int64 => "int64",
            ElementKind::UInt8 => "uint8",
            ElementKind::UInt16 => "uint16",
            ElementKind::UInt32 => "uint32",
            ElementKind::UInt64 => "uint64",
            ElementKind::Float32 => "float32",
            ElementKind::Float64 => "float64",
            ElementKind::Bool => "bool",
            ElementKind::Str => "str",
        };
        f.write_str(name)
    }
}

/// Index element kind for sparse matrices (row indices / column offsets).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    UInt32,
    UInt64,
}

/// Major axis of a stored matrix: which axis varies fastest in memory. Serializes
/// as the `"row_major"`/`"column_major"` tokens a manifest or HDF5-like `layout`
/// attribute would carry (spec §6).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MajorAxis {
    #[serde(rename = "row_major")]
    Row,
    #[serde(rename = "column_major")]
    Column,
}

impl MajorAxis {
    #[must_use]
    pub fn transpose(self) -> MajorAxis {
        match self {
            MajorAxis::Row => MajorAxis::Column,
            MajorAxis::Column => MajorAxis::Row,
        }
    }
}

/// Generates a per-kind `Vec<T>` tagged union plus shared accessors, avoiding
/// hand-written repetition across the ten numeric kinds.
macro_rules! numeric_array {
    ($name:ident, $( $variant:ident ( $ty:ty ) ),+ $(,)?) => {
        #[derive(Clone, Debug, PartialEq)]
        pub enum $name {
            $( $variant(Vec<$ty>), )+
        }

        impl $name {
            #[must_use]
            pub fn kind(&self) -> ElementKind {
                match self {
                    $( $name::$variant(_) => ElementKind::$variant, )+
                }
            }

            #[must_use]
            pub fn len(&self) -> usize {
                match self {
                    $( $name::$variant(v) => v.len(), )+
                }
            }

            #[must_use]
            pub fn is_empty(&self) -> bool {
                self.len() == 0
            }
        }
    };
}

numeric_array!(
    NumericArray,
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    Bool(bool),
);

/// A single scalar value.
#[derive(Clone, Debug, PartialEq)]
pub enum ScalarValue {
    Numeric(NumericScalar),
    Str(String),
}

/// Generates the scalar single-value counterpart of [`NumericArray`].
macro_rules! numeric_scalar {
    ($name:ident, $( $variant:ident ( $ty:ty ) ),+ $(,)?) => {
        #[derive(Clone, Copy, Debug, PartialEq)]
        pub enum $name {
            $( $variant($ty), )+
        }

        impl $name {
            #[must_use]
            pub fn kind(&self) -> ElementKind {
                match self {
                    $( $name::$variant(_) => ElementKind::$variant, )+
                }
            }
        }
    };
}

numeric_scalar!(
    NumericScalar,
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    Bool(bool),
);

impl ScalarValue {
    #[must_use]
    pub fn kind(&self) -> ElementKind {
        match self {
            ScalarValue::Numeric(n) => n.kind(),
            ScalarValue::Str(_) => ElementKind::Str,
        }
    }
}

/// A vector's elements: either the numeric/bool union or a string column.
#[derive(Clone, Debug, PartialEq)]
pub enum VectorData {
    Numeric(NumericArray),
    Str(Vec<String>),
}

impl VectorData {
    #[must_use]
    pub fn kind(&self) -> ElementKind {
        match self {
            VectorData::Numeric(n) => n.kind(),
            VectorData::Str(_) => ElementKind::Str,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            VectorData::Numeric(n) => n.len(),
            VectorData::Str(v) => v.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Broadcasts a scalar to a vector of the given length, used by `set_vector`'s
    /// scalar-broadcast form (spec §4.3).
    #[must_use]
    pub fn broadcast(scalar: &ScalarValue, len: usize) -> VectorData {
        match scalar {
            ScalarValue::Str(s) => VectorData::Str(vec![s.clone(); len]),
            ScalarValue::Numeric(n) => VectorData::Numeric(match n {
                NumericScalar::Int8(x) => NumericArray::Int8(vec![*x; len]),
                NumericScalar::Int16(x) => NumericArray::Int16(vec![*x; len]),
                NumericScalar::Int32(x) => NumericArray::Int32(vec![*x; len]),
                NumericScalar::Int64(x) => NumericArray::Int64(vec![*x; len]),
                NumericScalar::UInt8(x) => NumericArray::UInt8(vec![*x; len]),
                NumericScalar::UInt16(x) => NumericArray::UInt16(vec![*x; len]),
                NumericScalar::UInt32(x) => NumericArray::UInt32(vec![*x; len]),
                NumericScalar::UInt64(x) => NumericArray::UInt64(vec![*x; len]),
                NumericScalar::Float32(x) => NumericArray::Float32(vec![*x; len]),
                NumericScalar::Float64(x) => NumericArray::Float64(vec![*x; len]),
                NumericScalar::Bool(x) => NumericArray::Bool(vec![*x; len]),
            }),
        }
    }
}

/// Storage discipline of a matrix: contiguous, or compressed per major axis.
#[derive(Clone, Debug, PartialEq)]
pub enum MatrixStorage {
    Dense(NumericArray),
    Sparse(SparseMatrixData),
}

/// The three sibling arrays of a sparse matrix (spec §3 invariant 4).
#[derive(Clone, Debug, PartialEq)]
pub struct SparseMatrixData {
    pub index_kind: IndexKind,
    pub nnz: usize,
    /// Row indices (for row-major) or the analogous minor-axis indices.
    pub indices: IndexArray,
    /// Column offsets (for column-major layouts) / major-axis pointer array.
    pub offsets: IndexArray,
    pub values: NumericArray,
}

/// Index arrays backing a sparse matrix.
#[derive(Clone, Debug, PartialEq)]
pub enum IndexArray {
    UInt32(Vec<u32>),
    UInt64(Vec<u64>),
}

impl IndexArray {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            IndexArray::UInt32(v) => v.len(),
            IndexArray::UInt64(v) => v.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn kind(&self) -> IndexKind {
        match self {
            IndexArray::UInt32(_) => IndexKind::UInt32,
            IndexArray::UInt64(_) => IndexKind::UInt64,
        }
    }
}

/// A full matrix artifact: element kind, shape, major axis, and storage.
#[derive(Clone, Debug, PartialEq)]
pub struct MatrixData {
    pub rows: usize,
    pub cols: usize,
    pub major: MajorAxis,
    pub storage: MatrixStorage,
}

impl MatrixData {
    #[must_use]
    pub fn kind(&self) -> ElementKind {
        match &self.storage {
            MatrixStorage::Dense(values) => values.kind(),
            MatrixStorage::Sparse(sparse) => sparse.values.kind(),
        }
    }

    /// Shape as stored, i.e. (major-length, minor-length) is not implied here: this
    /// always reports logical (rows, cols) regardless of major axis. Layout is a
    /// separate, explicit field (spec §4.1: "callers must never infer layout from
    /// memory addresses").
    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Summarizes this matrix as the manifest entry a directory-of-files backend
    /// would write alongside the artifact itself (spec §6: "a small manifest ...
    /// recording layout/sparsity metadata").
    #[must_use]
    pub fn manifest_entry(&self) -> ManifestMatrixEntry {
        let (sparse, nnz, index_kind) = match &self.storage {
            MatrixStorage::Dense(_) => (false, None, None),
            MatrixStorage::Sparse(s) => (true, Some(s.nnz), Some(s.index_kind)),
        };
        ManifestMatrixEntry {
            kind: self.kind(),
            rows: self.rows,
            cols: self.cols,
            layout: self.major,
            sparse,
            nnz,
            index_kind,
        }
    }
}

/// The per-artifact metadata a directory-of-files backend's manifest records for a
/// matrix (spec §6): element kind, shape, declared layout, and — when sparse — the
/// nonzero count and index kind. Serializable so such a backend can write it as
/// JSON next to the artifact's own data file(s).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ManifestMatrixEntry {
    pub kind: ElementKind,
    pub rows: usize,
    pub cols: usize,
    pub layout: MajorAxis,
    pub sparse: bool,
    pub nnz: Option<usize>,
    pub index_kind: Option<IndexKind>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_numeric_scalar_to_vector() {
        let scalar = ScalarValue::Numeric(NumericScalar::Int32(7));
        let vector = VectorData::broadcast(&scalar, 3);
        assert_eq!(vector.len(), 3);
        match vector {
            VectorData::Numeric(NumericArray::Int32(v)) => assert_eq!(v, vec![7, 7, 7]),
            _ => panic!("expected Int32 vector"),
        }
    }

    #[test]
    fn broadcast_string_scalar_to_vector() {
        let scalar = ScalarValue::Str("x".to_string());
        let vector = VectorData::broadcast(&scalar, 2);
        assert_eq!(vector.len(), 2);
        assert_eq!(vector.kind(), ElementKind::Str);
    }

    #[test]
    fn matrix_not_allowed_for_str_kind() {
        assert!(!ElementKind::Str.is_matrix_eltype());
        assert!(ElementKind::Float64.is_matrix_eltype());
    }

    #[test]
    fn major_axis_transpose_is_involutive() {
        assert_eq!(MajorAxis::Row.transpose().transpose(), MajorAxis::Row);
    }

    #[test]
    fn manifest_entry_serializes_layout_with_fixed_tokens() {
        let matrix = MatrixData {
            rows: 2,
            cols: 3,
            major: MajorAxis::Column,
            storage: MatrixStorage::Dense(NumericArray::Float64(vec![0.0; 6])),
        };
        let json = serde_json::to_value(matrix.manifest_entry()).unwrap();
        assert_eq!(json["layout"], "column_major");
        assert_eq!(json["sparse"], false);

        let back: ManifestMatrixEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back.layout, MajorAxis::Column);
        assert_eq!(back.rows, 2);
    }
}
