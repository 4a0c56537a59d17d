//! The query language and operation registry (component C8): a small expression
//! language for selecting and transforming data, dispatching to a process-wide,
//! pluggable registry of element-wise and reduction operations (spec §4.7).
//!
//! Grammar (recursive descent, left to right):
//!
//! ```text
//! query      := selection (slice | projection)? ('|' application)*
//! selection  := 'scalar' '(' ident ')'
//!             | 'vec' '(' ident ',' ident ')'
//!             | 'mat' '(' ident ',' ident ',' ident ')'
//! projection := '[' ident ']'
//! slice      := '{' ident (',' ident)* '}'
//!             | '{' 'mask' '=' ident '}'
//! application:= ident ( '(' ident '=' ident (',' ident '=' ident)* ')' )?
//! ```

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, OnceLock},
};

use crate::{
    element::{MajorAxis, MatrixData, NumericArray, NumericScalar, ScalarValue, VectorData},
    error::{Error, Result},
    format::Format,
};

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// The result of evaluating a query: one of the three artifact shapes.
#[derive(Clone, Debug, PartialEq)]
pub enum QueryValue {
    Scalar(ScalarValue),
    Vector(VectorData),
    Matrix(MatrixData),
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
enum Selection {
    Scalar(String),
    Vector(String, String),
    Matrix(String, String, String),
}

#[derive(Clone, Debug, PartialEq)]
enum Postfix {
    Project(String),
    SliceEntries(Vec<String>),
    SliceMask(String),
    Apply(String, HashMap<String, String>),
}

#[derive(Clone, Debug, PartialEq)]
struct Query {
    selection: Selection,
    postfixes: Vec<Postfix>,
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Parser { src, pos: 0 }
    }

    fn err(&self, message: impl Into<String>) -> Error {
        Error::QueryParseError {
            position: self.pos,
            message: message.into(),
        }
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += self.peek_char_len();
        }
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn peek_char_len(&self) -> usize {
        self.peek().map_or(0, char::len_utf8)
    }

    fn expect(&mut self, c: char) -> Result<()> {
        self.skip_ws();
        if self.peek() == Some(c) {
            self.pos += c.len_utf8();
            Ok(())
        } else {
            Err(self.err(format!("expected '{c}'")))
        }
    }

    fn ident(&mut self) -> Result<String> {
        self.skip_ws();
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.')
        {
            self.pos += self.peek_char_len();
        }
        if self.pos == start {
            return Err(self.err("expected an identifier"));
        }
        Ok(self.src[start..self.pos].to_string())
    }

    fn consume_if(&mut self, c: char) -> bool {
        self.skip_ws();
        if self.peek() == Some(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn parse_selection(&mut self) -> Result<Selection> {
        let kind = self.ident()?;
        self.expect('(')?;
        let selection = match kind.as_str() {
            "scalar" => {
                let name = self.ident()?;
                Selection::Scalar(name)
            }
            "vec" => {
                let axis = self.ident()?;
                self.expect(',')?;
                let name = self.ident()?;
                Selection::Vector(axis, name)
            }
            "mat" => {
                let rows = self.ident()?;
                self.expect(',')?;
                let cols = self.ident()?;
                self.expect(',')?;
                let name = self.ident()?;
                Selection::Matrix(rows, cols, name)
            }
            other => return Err(self.err(format!("unknown selection kind: {other}"))),
        };
        self.expect(')')?;
        Ok(selection)
    }

    fn parse_postfixes(&mut self) -> Result<Vec<Postfix>> {
        let mut out = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                Some('[') => {
                    self.pos += 1;
                    let entry = self.ident()?;
                    self.expect(']')?;
                    out.push(Postfix::Project(entry));
                }
                Some('{') => {
                    self.pos += 1;
                    let first = self.ident()?;
                    if first == "mask" {
                        self.expect('=')?;
                        let name = self.ident()?;
                        self.expect('}')?;
                        out.push(Postfix::SliceMask(name));
                    } else {
                        let mut entries = vec![first];
                        while self.consume_if(',') {
                            entries.push(self.ident()?);
                        }
                        self.expect('}')?;
                        out.push(Postfix::SliceEntries(entries));
                    }
                }
                Some('|') => {
                    self.pos += 1;
                    let name = self.ident()?;
                    let mut params = HashMap::new();
                    self.skip_ws();
                    if self.peek() == Some('(') {
                        self.pos += 1;
                        loop {
                            self.skip_ws();
                            if self.peek() == Some(')') {
                                break;
                            }
                            let key = self.ident()?;
                            self.expect('=')?;
                            let value = self.ident()?;
                            params.insert(key, value);
                            if !self.consume_if(',') {
                                break;
                            }
                        }
                        self.expect(')')?;
                    }
                    out.push(Postfix::Apply(name, params));
                }
                _ => break,
            }
        }
        Ok(out)
    }

    fn parse(mut self) -> Result<Query> {
        let selection = self.parse_selection()?;
        let postfixes = self.parse_postfixes()?;
        self.skip_ws();
        if self.pos != self.src.len() {
            return Err(self.err("trailing input after query"));
        }
        Ok(Query { selection, postfixes })
    }
}

/// Parses `source` into a query, without evaluating it.
///
/// # Errors
///
/// Returns [`Error::QueryParseError`] on malformed input.
fn parse(source: &str) -> Result<Query> {
    Parser::new(source).parse()
}

// ---------------------------------------------------------------------------
// Operation traits
// ---------------------------------------------------------------------------

/// A shape-preserving, possibly type-changing transform (spec §4.7/§GLOSSARY).
/// Implementors only need to support the capabilities that make sense for them;
/// the defaults report [`Error::TypeMismatch`].
pub trait EltwiseOp: Send + Sync {
    fn apply_to_number(&self, value: &ScalarValue) -> Result<ScalarValue> {
        Err(unsupported_capability("number", value.kind().to_string()))
    }
    fn apply_to_vector(&self, value: &VectorData) -> Result<VectorData> {
        Err(unsupported_capability("vector", value.kind().to_string()))
    }
    fn apply_to_matrix(&self, value: &MatrixData) -> Result<MatrixData> {
        Err(unsupported_capability("matrix", value.kind().to_string()))
    }
}

/// Collapses one dimension: vector → scalar, or matrix → vector over the
/// non-reduced axis (per-column for column-major matrices, per-row for row-major).
pub trait ReductionOp: Send + Sync {
    fn apply_to_vector(&self, value: &VectorData) -> Result<ScalarValue> {
        Err(unsupported_capability("vector", value.kind().to_string()))
    }
    fn apply_to_matrix(&self, value: &MatrixData) -> Result<VectorData> {
        Err(unsupported_capability("matrix", value.kind().to_string()))
    }
}

fn unsupported_capability(capability: &str, kind: String) -> Error {
    Error::from(format!("operation does not support {capability} capability for element kind: {kind}"))
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

type EltwiseCtor = Arc<dyn Fn(&HashMap<String, String>) -> Result<Arc<dyn EltwiseOp>> + Send + Sync>;
type ReductionCtor = Arc<dyn Fn(&HashMap<String, String>) -> Result<Arc<dyn ReductionOp>> + Send + Sync>;

struct Registered<C> {
    site: String,
    constructor: C,
}

/// A process-wide dictionary mapping operation names to constructors, generic over
/// the operation kind so the eltwise and reduction registries share one
/// implementation (spec §4.7: "a process-wide dictionary per operation kind").
pub struct Registry<C> {
    kind: &'static str,
    entries: Mutex<HashMap<String, Registered<C>>>,
}

impl<C: Clone> Registry<C> {
    fn new(kind: &'static str) -> Self {
        Registry {
            kind,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Registers `constructor` under `name` from `site`. Idempotent for repeated
    /// registration from the same site; a conflicting site is a hard error (spec
    /// §4.7, scenario 5).
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConflictingRegistration`] if `name` is already registered
    /// from a different site.
    pub fn register(&self, name: impl Into<String>, site: impl Into<String>, constructor: C) -> Result<()> {
        let name = name.into();
        let site = site.into();
        let mut entries = self.entries.lock().expect("registry mutex poisoned");
        if let Some(existing) = entries.get(&name) {
            if existing.site == site {
                return Ok(());
            }
            return Err(Error::ConflictingRegistration {
                kind: self.kind,
                name,
                existing_site: existing.site.clone(),
                new_site: site,
            });
        }
        entries.insert(name, Registered { site, constructor });
        Ok(())
    }

    fn get(&self, name: &str) -> Option<C> {
        self.entries
            .lock()
            .expect("registry mutex poisoned")
            .get(name)
            .map(|r| r.constructor.clone())
    }

    fn has(&self, name: &str) -> bool {
        self.entries.lock().expect("registry mutex poisoned").contains_key(name)
    }
}

fn eltwise_registry() -> &'static Registry<EltwiseCtor> {
    static REGISTRY: OnceLock<Registry<EltwiseCtor>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let registry = Registry::new("eltwise");
        builtin::register_builtin_eltwise(&registry);
        registry
    })
}

fn reduction_registry() -> &'static Registry<ReductionCtor> {
    static REGISTRY: OnceLock<Registry<ReductionCtor>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let registry = Registry::new("reduction");
        builtin::register_builtin_reduction(&registry);
        registry
    })
}

/// Registers an element-wise operation under `name`, constructed fresh (ignoring
/// any query parameters) from `op`.
///
/// # Errors
///
/// See [`Registry::register`].
pub fn register_eltwise<F>(name: impl Into<String>, site: impl Into<String>, make: F) -> Result<()>
where
    F: Fn(&HashMap<String, String>) -> Result<Arc<dyn EltwiseOp>> + Send + Sync + 'static,
{
    eltwise_registry().register(name, site, Arc::new(make))
}

/// Registers a reduction operation. See [`register_eltwise`].
///
/// # Errors
///
/// See [`Registry::register`].
pub fn register_reduction<F>(name: impl Into<String>, site: impl Into<String>, make: F) -> Result<()>
where
    F: Fn(&HashMap<String, String>) -> Result<Arc<dyn ReductionOp>> + Send + Sync + 'static,
{
    reduction_registry().register(name, site, Arc::new(make))
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Parses and evaluates `source` against `dataset`.
///
/// # Errors
///
/// [`Error::QueryParseError`] for malformed queries, [`Error::UnknownOperation`]
/// for an unregistered pipe step's name, plus whatever the selection/slicing steps
/// themselves can raise (missing axis/vector/matrix, type mismatch).
pub fn evaluate(source: &str, dataset: &dyn Format) -> Result<QueryValue> {
    let query = parse(source)?;
    let mut evaluated = eval_selection(&query.selection, dataset)?;
    for postfix in &query.postfixes {
        evaluated = eval_postfix(evaluated, postfix, dataset)?;
    }
    Ok(evaluated.value)
}

/// A value plus the axis it (if a vector) or its non-reduced axis (if a matrix
/// reduced to a vector) is indexed by, so later postfixes can resolve entry names
/// to positions without re-parsing the selection.
struct Evaluated {
    value: QueryValue,
    axis: Option<String>,
}

impl Evaluated {
    fn shape_preserved(self, value: QueryValue) -> Self {
        Evaluated { value, axis: self.axis }
    }
}

fn eval_selection(selection: &Selection, dataset: &dyn Format) -> Result<Evaluated> {
    match selection {
        Selection::Scalar(name) => Ok(Evaluated {
            value: QueryValue::Scalar(dataset.get_scalar(name)?),
            axis: None,
        }),
        Selection::Vector(axis, name) => Ok(Evaluated {
            value: QueryValue::Vector(dataset.get_vector(axis, name)?),
            axis: Some(axis.clone()),
        }),
        Selection::Matrix(rows, cols, name) => Ok(Evaluated {
            value: QueryValue::Matrix(dataset.get_matrix(rows, cols, name, MajorAxis::Row)?),
            // The matrix itself isn't vector-shaped; `axis` here tracks the
            // columns axis, used if a later reduction collapses rows.
            axis: Some(cols.clone()),
        }),
    }
}

fn eval_postfix(evaluated: Evaluated, postfix: &Postfix, dataset: &dyn Format) -> Result<Evaluated> {
    match postfix {
        Postfix::Project(entry) => project(evaluated, entry, dataset),
        Postfix::SliceEntries(entries) => slice_by_entries(evaluated, entries, dataset),
        Postfix::SliceMask(mask_name) => slice_by_mask(evaluated, mask_name, dataset),
        Postfix::Apply(name, params) => apply(evaluated, name, params),
    }
}

/// Projects a vector to the single element at `entry` on its owning axis,
/// collapsing it to a scalar (spec §4.7: "projection along an axis").
fn project(evaluated: Evaluated, entry: &str, dataset: &dyn Format) -> Result<Evaluated> {
    let QueryValue::Vector(v) = evaluated.value else {
        return Err(Error::from("projection by entry name is only supported on vectors"));
    };
    let axis = evaluated
        .axis
        .ok_or_else(|| Error::from("projection requires a vector with a known owning axis"))?;
    let entries = dataset.axis_entries(&axis)?;
    let index = entries
        .iter()
        .position(|e| e == entry)
        .ok_or_else(|| Error::from(format!("unknown entry: {entry} on axis: {axis}")))?;
    Ok(Evaluated {
        value: QueryValue::Scalar(index_scalar(&v, index)),
        axis: None,
    })
}

fn index_scalar(v: &VectorData, index: usize) -> ScalarValue {
    macro_rules! at {
        ($variant:ident, $values:expr) => {
            ScalarValue::Numeric(NumericScalar::$variant($values[index]))
        };
    }
    match v {
        VectorData::Numeric(NumericArray::Int8(x)) => at!(Int8, x),
        VectorData::Numeric(NumericArray::Int16(x)) => at!(Int16, x),
        VectorData::Numeric(NumericArray::Int32(x)) => at!(Int32, x),
        VectorData::Numeric(NumericArray::Int64(x)) => at!(Int64, x),
        VectorData::Numeric(NumericArray::UInt8(x)) => at!(UInt8, x),
        VectorData::Numeric(NumericArray::UInt16(x)) => at!(UInt16, x),
        VectorData::Numeric(NumericArray::UInt32(x)) => at!(UInt32, x),
        VectorData::Numeric(NumericArray::UInt64(x)) => at!(UInt64, x),
        VectorData::Numeric(NumericArray::Float32(x)) => at!(Float32, x),
        VectorData::Numeric(NumericArray::Float64(x)) => at!(Float64, x),
        VectorData::Numeric(NumericArray::Bool(x)) => at!(Bool, x),
        VectorData::Str(x) => ScalarValue::Str(x[index].clone()),
    }
}

/// Slices a vector down to the named entries on its owning axis, preserving order
/// (spec §4.7: "slicing by a set of axis entries... by name").
fn slice_by_entries(evaluated: Evaluated, entries: &[String], dataset: &dyn Format) -> Result<Evaluated> {
    let QueryValue::Vector(v) = &evaluated.value else {
        return Err(Error::from("entry-name slicing is only supported on vectors"));
    };
    let axis = evaluated
        .axis
        .clone()
        .ok_or_else(|| Error::from("slicing requires a vector with a known owning axis"))?;
    let axis_entries = dataset.axis_entries(&axis)?;
    let indices = entries
        .iter()
        .map(|entry| {
            axis_entries
                .iter()
                .position(|e| e == entry)
                .ok_or_else(|| Error::from(format!("unknown entry: {entry} on axis: {axis}")))
        })
        .collect::<Result<Vec<usize>>>()?;
    let sliced = gather_vector(v, &indices);
    Ok(evaluated.shape_preserved(QueryValue::Vector(sliced)))
}

fn slice_by_mask(evaluated: Evaluated, mask_name: &str, dataset: &dyn Format) -> Result<Evaluated> {
    let QueryValue::Vector(v) = &evaluated.value else {
        return Err(Error::from("mask slicing is only supported on vectors"));
    };
    let axis = evaluated
        .axis
        .clone()
        .ok_or_else(|| Error::from("slicing requires a vector with a known owning axis"))?;
    let mask = dataset.get_vector(&axis, mask_name)?;
    let VectorData::Numeric(NumericArray::Bool(flags)) = mask else {
        return Err(Error::from(format!("mask vector: {mask_name} is not boolean")));
    };
    let indices: Vec<usize> = flags
        .iter()
        .enumerate()
        .filter_map(|(i, &flag)| flag.then_some(i))
        .collect();
    let sliced = gather_vector(v, &indices);
    Ok(evaluated.shape_preserved(QueryValue::Vector(sliced)))
}

fn gather_vector(v: &VectorData, indices: &[usize]) -> VectorData {
    macro_rules! gather {
        ($variant:ident, $values:expr) => {
            VectorData::Numeric(NumericArray::$variant(indices.iter().map(|&i| $values[i]).collect()))
        };
    }
    match v {
        VectorData::Numeric(NumericArray::Int8(x)) => gather!(Int8, x),
        VectorData::Numeric(NumericArray::Int16(x)) => gather!(Int16, x),
        VectorData::Numeric(NumericArray::Int32(x)) => gather!(Int32, x),
        VectorData::Numeric(NumericArray::Int64(x)) => gather!(Int64, x),
        VectorData::Numeric(NumericArray::UInt8(x)) => gather!(UInt8, x),
        VectorData::Numeric(NumericArray::UInt16(x)) => gather!(UInt16, x),
        VectorData::Numeric(NumericArray::UInt32(x)) => gather!(UInt32, x),
        VectorData::Numeric(NumericArray::UInt64(x)) => gather!(UInt64, x),
        VectorData::Numeric(NumericArray::Float32(x)) => gather!(Float32, x),
        VectorData::Numeric(NumericArray::Float64(x)) => gather!(Float64, x),
        VectorData::Numeric(NumericArray::Bool(x)) => gather!(Bool, x),
        VectorData::Str(x) => VectorData::Str(indices.iter().map(|&i| x[i].clone()).collect()),
    }
}

fn apply(evaluated: Evaluated, name: &str, params: &HashMap<String, String>) -> Result<Evaluated> {
    if let Some(ctor) = eltwise_registry().get(name) {
        let op = ctor(params)?;
        let value = match evaluated.value {
            QueryValue::Scalar(s) => QueryValue::Scalar(op.apply_to_number(&s)?),
            QueryValue::Vector(v) => QueryValue::Vector(op.apply_to_vector(&v)?),
            QueryValue::Matrix(m) => QueryValue::Matrix(op.apply_to_matrix(&m)?),
        };
        return Ok(Evaluated { value, axis: evaluated.axis });
    }
    if let Some(ctor) = reduction_registry().get(name) {
        let op = ctor(params)?;
        return match evaluated.value {
            QueryValue::Scalar(_) => Err(Error::from("cannot reduce a scalar")),
            QueryValue::Vector(v) => Ok(Evaluated {
                value: QueryValue::Scalar(op.apply_to_vector(&v)?),
                axis: None,
            }),
            QueryValue::Matrix(m) => Ok(Evaluated {
                value: QueryValue::Vector(op.apply_to_matrix(&m)?),
                // A matrix reduction collapses rows per spec §4.7, leaving the
                // result indexed by the columns axis already tracked in `axis`.
                axis: evaluated.axis,
            }),
        };
    }
    let kind = if looks_like_reduction_name(name) { "reduction" } else { "eltwise" };
    Err(Error::UnknownOperation {
        kind,
        name: name.to_string(),
    })
}

fn looks_like_reduction_name(name: &str) -> bool {
    matches!(name, "Sum" | "Mean" | "Max" | "Min" | "Count")
}

// ---------------------------------------------------------------------------
// Built-in operations
// ---------------------------------------------------------------------------

mod builtin {
    use super::{EltwiseCtor, EltwiseOp, ReductionCtor, ReductionOp, Registry};
    use crate::element::{MatrixData, MatrixStorage, NumericArray, NumericScalar, ScalarValue, VectorData};
    use crate::error::Result;
    use num::ToPrimitive;
    use std::sync::Arc;

    pub(super) fn register_builtin_eltwise(registry: &Registry<EltwiseCtor>) {
        const SITE: &str = "axisdata::query::builtin";
        registry
            .register("Abs", SITE, |_| Ok(Arc::new(Abs) as Arc<dyn EltwiseOp>))
            .expect("builtin registration cannot conflict");
        registry
            .register("Negate", SITE, |_| Ok(Arc::new(Negate) as Arc<dyn EltwiseOp>))
            .expect("builtin registration cannot conflict");
    }

    pub(super) fn register_builtin_reduction(registry: &Registry<ReductionCtor>) {
        const SITE: &str = "axisdata::query::builtin";
        registry
            .register("Sum", SITE, |_| Ok(Arc::new(Sum) as Arc<dyn ReductionOp>))
            .expect("builtin registration cannot conflict");
        registry
            .register("Mean", SITE, |_| Ok(Arc::new(Mean) as Arc<dyn ReductionOp>))
            .expect("builtin registration cannot conflict");
    }

    /// Applies the (per-numeric-type) inherent `$method` (e.g. `abs`) element-wise,
    /// leaving unsigned/bool arrays (already non-negative) untouched.
    macro_rules! map_numeric {
        ($values:expr, $method:ident) => {
            match $values {
                NumericArray::Int8(v) => NumericArray::Int8(v.iter().map(|x| x.$method()).collect()),
                NumericArray::Int16(v) => NumericArray::Int16(v.iter().map(|x| x.$method()).collect()),
                NumericArray::Int32(v) => NumericArray::Int32(v.iter().map(|x| x.$method()).collect()),
                NumericArray::Int64(v) => NumericArray::Int64(v.iter().map(|x| x.$method()).collect()),
                NumericArray::UInt8(v) => NumericArray::UInt8(v.clone()),
                NumericArray::UInt16(v) => NumericArray::UInt16(v.clone()),
                NumericArray::UInt32(v) => NumericArray::UInt32(v.clone()),
                NumericArray::UInt64(v) => NumericArray::UInt64(v.clone()),
                NumericArray::Float32(v) => NumericArray::Float32(v.iter().map(|x| x.$method()).collect()),
                NumericArray::Float64(v) => NumericArray::Float64(v.iter().map(|x| x.$method()).collect()),
                NumericArray::Bool(v) => NumericArray::Bool(v.clone()),
            }
        };
    }

    /// Absolute value, element-wise. Unsigned kinds and booleans pass through
    /// unchanged (already non-negative).
    struct Abs;

    impl EltwiseOp for Abs {
        fn apply_to_number(&self, value: &ScalarValue) -> Result<ScalarValue> {
            Ok(match value {
                ScalarValue::Numeric(NumericScalar::Int8(x)) => ScalarValue::Numeric(NumericScalar::Int8(x.abs())),
                ScalarValue::Numeric(NumericScalar::Int16(x)) => ScalarValue::Numeric(NumericScalar::Int16(x.abs())),
                ScalarValue::Numeric(NumericScalar::Int32(x)) => ScalarValue::Numeric(NumericScalar::Int32(x.abs())),
                ScalarValue::Numeric(NumericScalar::Int64(x)) => ScalarValue::Numeric(NumericScalar::Int64(x.abs())),
                ScalarValue::Numeric(NumericScalar::Float32(x)) => {
                    ScalarValue::Numeric(NumericScalar::Float32(x.abs()))
                }
                ScalarValue::Numeric(NumericScalar::Float64(x)) => {
                    ScalarValue::Numeric(NumericScalar::Float64(x.abs()))
                }
                other => other.clone(),
            })
        }

        fn apply_to_vector(&self, value: &VectorData) -> Result<VectorData> {
            let VectorData::Numeric(n) = value else {
                return Err(super::unsupported_capability("vector", value.kind().to_string()));
            };
            Ok(VectorData::Numeric(map_numeric!(n, abs)))
        }

        fn apply_to_matrix(&self, value: &MatrixData) -> Result<MatrixData> {
            let values = match &value.storage {
                MatrixStorage::Dense(n) => map_numeric!(n, abs),
                MatrixStorage::Sparse(_) => {
                    return Err(super::unsupported_capability("sparse matrix", value.kind().to_string()))
                }
            };
            Ok(MatrixData {
                storage: MatrixStorage::Dense(values),
                ..value.clone()
            })
        }
    }

    /// Arithmetic negation, element-wise; unsupported for unsigned/bool kinds.
    struct Negate;

    impl EltwiseOp for Negate {
        fn apply_to_vector(&self, value: &VectorData) -> Result<VectorData> {
            let VectorData::Numeric(n) = value else {
                return Err(super::unsupported_capability("vector", value.kind().to_string()));
            };
            Ok(VectorData::Numeric(match n {
                NumericArray::Int8(v) => NumericArray::Int8(v.iter().map(|x| -x).collect()),
                NumericArray::Int16(v) => NumericArray::Int16(v.iter().map(|x| -x).collect()),
                NumericArray::Int32(v) => NumericArray::Int32(v.iter().map(|x| -x).collect()),
                NumericArray::Int64(v) => NumericArray::Int64(v.iter().map(|x| -x).collect()),
                NumericArray::Float32(v) => NumericArray::Float32(v.iter().map(|x| -x).collect()),
                NumericArray::Float64(v) => NumericArray::Float64(v.iter().map(|x| -x).collect()),
                other => return Err(super::unsupported_capability("vector", other.kind().to_string())),
            }))
        }
    }

    /// Sums a vector's elements into a single `Float64` scalar (or a matrix's
    /// columns into a `Float64` vector).
    struct Sum;

    impl ReductionOp for Sum {
        fn apply_to_vector(&self, value: &VectorData) -> Result<ScalarValue> {
            let total = numeric_sum(value)?;
            Ok(ScalarValue::Numeric(NumericScalar::Float64(total)))
        }

        fn apply_to_matrix(&self, value: &MatrixData) -> Result<VectorData> {
            reduce_matrix_columns(value, |col| col.iter().sum())
        }
    }

    struct Mean;

    impl ReductionOp for Mean {
        fn apply_to_vector(&self, value: &VectorData) -> Result<ScalarValue> {
            let total = numeric_sum(value)?;
            let len = value.len().max(1) as f64;
            Ok(ScalarValue::Numeric(NumericScalar::Float64(total / len)))
        }

        fn apply_to_matrix(&self, value: &MatrixData) -> Result<VectorData> {
            reduce_matrix_columns(value, |col| {
                let len = col.len().max(1) as f64;
                col.iter().sum::<f64>() / len
            })
        }
    }

    /// Converts any numeric array to `Float64` via [`ToPrimitive`] rather than a
    /// per-variant cast, since `bool`'s `to_f64` (0.0/1.0) already gives `Sum` the
    /// right "count of true" behavior for free.
    fn numeric_array_as_f64(n: &NumericArray) -> Vec<f64> {
        macro_rules! as_f64 {
            ($v:expr) => {
                $v.iter().map(|x| x.to_f64().expect("finite numeric kind")).collect()
            };
        }
        match n {
            NumericArray::Int8(v) => as_f64!(v),
            NumericArray::Int16(v) => as_f64!(v),
            NumericArray::Int32(v) => as_f64!(v),
            NumericArray::Int64(v) => as_f64!(v),
            NumericArray::UInt8(v) => as_f64!(v),
            NumericArray::UInt16(v) => as_f64!(v),
            NumericArray::UInt32(v) => as_f64!(v),
            NumericArray::UInt64(v) => as_f64!(v),
            NumericArray::Float32(v) => as_f64!(v),
            NumericArray::Float64(v) => v.clone(),
            NumericArray::Bool(v) => v.iter().map(|&x| if x { 1.0 } else { 0.0 }).collect(),
        }
    }

    fn numeric_sum(value: &VectorData) -> Result<f64> {
        let VectorData::Numeric(n) = value else {
            return Err(super::unsupported_capability("vector", value.kind().to_string()));
        };
        Ok(numeric_array_as_f64(n).iter().sum())
    }

    /// Reduces a dense matrix's non-reduced axis (per spec §4.7: per-column for
    /// column-major matrices) using `f` over each column's `Float64` values.
    fn reduce_matrix_columns(value: &MatrixData, f: impl Fn(&[f64]) -> f64) -> Result<VectorData> {
        let MatrixStorage::Dense(n) = &value.storage else {
            return Err(super::unsupported_capability("sparse matrix", value.kind().to_string()));
        };
        let as_f64 = numeric_array_as_f64(n);
        let (rows, cols) = (value.rows, value.cols);
        // Dense storage is always logically row-major in memory here (relayout
        // materializes the transposed copy explicitly); reduce is always
        // per-column regardless of the declared major axis, matching the
        // column-major convention spec §4.7 calls out.
        let mut result = Vec::with_capacity(cols);
        for c in 0..cols {
            let column: Vec<f64> = (0..rows).map(|r| as_f64[r * cols + c]).collect();
            result.push(f(&column));
        }
        Ok(VectorData::Numeric(NumericArray::Float64(result)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{element::NumericScalar, format::FormatMut, memory_backend::MemoryDatastore};

    use super::*;

    fn dataset_with_signed_vector() -> MemoryDatastore {
        let ds = MemoryDatastore::new("d");
        ds.add_axis("cell", vec!["c0".into(), "c1".into(), "c2".into()]).unwrap();
        ds.set_vector(
            "cell",
            "signed",
            VectorData::Numeric(NumericArray::Int64(vec![-1, 2, -3])),
        )
        .unwrap();
        ds
    }

    #[test]
    fn builtin_abs_applies_to_selected_vector() {
        let ds = dataset_with_signed_vector();
        let result = evaluate("vec(cell, signed) | Abs", &ds).unwrap();
        assert_eq!(
            result,
            QueryValue::Vector(VectorData::Numeric(NumericArray::Int64(vec![1, 2, 3])))
        );
    }

    #[test]
    fn reregistering_same_site_is_a_no_op() {
        register_eltwise("Abs", "axisdata::query::builtin", |_| Ok(Arc::new(builtin_abs_stub()))).unwrap();
    }

    fn builtin_abs_stub() -> impl EltwiseOp {
        struct Stub;
        impl EltwiseOp for Stub {}
        Stub
    }

    #[test]
    fn conflicting_registration_from_different_site_errors() {
        let err = register_eltwise("Abs", "some-other-site", |_| Ok(Arc::new(builtin_abs_stub()))).unwrap_err();
        assert!(matches!(err, Error::ConflictingRegistration { .. }));
    }

    #[test]
    fn unknown_operation_errors() {
        let ds = dataset_with_signed_vector();
        let err = evaluate("vec(cell, signed) | Frobnicate", &ds).unwrap_err();
        assert!(matches!(err, Error::UnknownOperation { .. }));
    }

    #[test]
    fn scalar_selection_round_trips() {
        let ds = MemoryDatastore::new("d");
        ds.set_scalar("version", ScalarValue::Numeric(NumericScalar::Int64(1))).unwrap();
        let result = evaluate("scalar(version)", &ds).unwrap();
        assert_eq!(
            result,
            QueryValue::Scalar(ScalarValue::Numeric(NumericScalar::Int64(1)))
        );
    }

    #[test]
    fn mask_slice_filters_by_boolean_vector() {
        let ds = dataset_with_signed_vector();
        ds.set_vector(
            "cell",
            "flag",
            VectorData::Numeric(NumericArray::Bool(vec![true, false, true])),
        )
        .unwrap();
        let result = evaluate("vec(cell, signed){mask=flag}", &ds).unwrap();
        assert_eq!(
            result,
            QueryValue::Vector(VectorData::Numeric(NumericArray::Int64(vec![-1, -3])))
        );
    }

    #[test]
    fn sum_reduction_collapses_vector_to_scalar() {
        let ds = dataset_with_signed_vector();
        let result = evaluate("vec(cell, signed) | Sum", &ds).unwrap();
        assert_eq!(result, QueryValue::Scalar(ScalarValue::Numeric(NumericScalar::Float64(-2.0))));
    }
}
