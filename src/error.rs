use thiserror::Error as ThisError;

use crate::element::ElementKind;

/// Convenient alias, which defaults to [`Error`] as the `Err` variant.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error variants returned throughout this crate.
#[derive(ThisError, Debug)]
pub enum Error {
    #[error("{0}")]
    Unique(String),

    #[error("missing scalar: {name}\nin the dataset: {dataset}")]
    MissingScalar { name: String, dataset: String },

    #[error("missing axis: {name}\nin the dataset: {dataset}")]
    MissingAxis { name: String, dataset: String },

    #[error("missing vector: {name}\nfor the axis: {axis}\nin the dataset: {dataset}")]
    MissingVector {
        axis: String,
        name: String,
        dataset: String,
    },

    #[error(
        "missing matrix: {name}\nfor the rows axis: {rows}\nand the columns axis: {cols}\nin \
         the dataset: {dataset}"
    )]
    MissingMatrix {
        rows: String,
        cols: String,
        name: String,
        dataset: String,
    },

    #[error("scalar: {name} already exists in the dataset: {dataset}")]
    ScalarAlreadyExists { name: String, dataset: String },

    #[error("axis: {name} already exists in the dataset: {dataset}")]
    AxisAlreadyExists { name: String, dataset: String },

    #[error("vector: {name} for the axis: {axis} already exists in the dataset: {dataset}")]
    VectorAlreadyExists {
        axis: String,
        name: String,
        dataset: String,
    },

    #[error(
        "matrix: {name} for the rows axis: {rows} and the columns axis: {cols} already exists \
         in the dataset: {dataset}"
    )]
    MatrixAlreadyExists {
        rows: String,
        cols: String,
        name: String,
        dataset: String,
    },

    #[error("value length: {len} is different from axis: {axis} length: {expected}")]
    VectorLengthMismatch {
        axis: String,
        len: usize,
        expected: usize,
    },

    #[error("matrix shape: ({rows}, {cols}) is different from axes shape: ({expected_rows}, {expected_cols})")]
    MatrixShapeMismatch {
        rows: usize,
        cols: usize,
        expected_rows: usize,
        expected_cols: usize,
    },

    #[error(
        "sparse matrix arrays have inconsistent lengths for declared nnz: {nnz} (indices: \
         {indices}, offsets: {offsets}, values: {values})"
    )]
    SparseLengthMismatch {
        nnz: usize,
        indices: usize,
        offsets: usize,
        values: usize,
    },

    #[error("different entries for the axis: {axis}\nbetween member: {first} and member: {second}")]
    InconsistentAxis {
        axis: String,
        first: String,
        second: String,
    },

    #[error("empty chain is not a valid dataset")]
    EmptyChain,

    #[error("write chain's last member: {member} is not a writer")]
    ChainLastMemberNotWriter { member: String },

    #[error("cannot delete: {name} because it exists in the earlier: {earlier}")]
    ForbiddenDelete { name: String, earlier: String },

    #[error("attempted to acquire the write lock while already holding only the read lock")]
    LockUpgradeForbidden,

    #[error("unmatched unlock on a dataset lock")]
    LockUnmatchedUnlock,

    #[error("type mismatch: expected {expected} but found {found}")]
    TypeMismatch { expected: ElementKind, found: ElementKind },

    #[error("unknown alias: {alias}\nin the view: {view}")]
    UnknownAlias { alias: String, view: String },

    #[error("query parse error at position {position}: {message}")]
    QueryParseError { position: usize, message: String },

    #[error("unknown {kind} operation: {name}")]
    UnknownOperation { kind: &'static str, name: String },

    #[error(
        "conflicting registrations for the {kind} operation: {name} (already registered at \
         {existing_site}, now at {new_site})"
    )]
    ConflictingRegistration {
        kind: &'static str,
        name: String,
        existing_site: String,
        new_site: String,
    },

    #[error("axis: {axis} cannot be dropped because it is used by: {used_by}")]
    AxisInUse { axis: String, used_by: String },

    #[error("Serde error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Unique(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Unique(s)
    }
}
