//! The chain engine (component C6): stacks backends into a single logical
//! dataset. Reads resolve last-writer-wins by walking members in reverse; writes
//! target the tail member; deletion is forbidden when an earlier member still
//! holds the artifact. Axis entry sequences shared across members must agree
//! exactly at construction time (spec §4.5, invariant 5).

use std::sync::Arc;

use crate::{
    cache::DataKey,
    element::{ElementKind, IndexKind, MajorAxis, MatrixData, ScalarValue, VectorData},
    error::{Error, Result},
    format::{EmptyDenseHandle, EmptySparseHandle, Format, FormatMut},
};

/// One link in a chain: either a read-only member or a writer. Storing the
/// distinction explicitly (rather than requiring every member to implement
/// `FormatMut`) lets read-chains freely mix backends that are themselves
/// read-only wrappers, views, or other chains.
pub enum ChainMember {
    Reader(Arc<dyn Format>),
    Writer(Arc<dyn FormatMut>),
}

impl ChainMember {
    fn as_format(&self) -> &dyn Format {
        match self {
            ChainMember::Reader(r) => r.as_ref(),
            ChainMember::Writer(w) => w.as_ref(),
        }
    }

    fn name(&self) -> &str {
        self.as_format().dataset_name()
    }
}

/// An ordered overlay of member datasets exposing the same backend contract as any
/// single dataset.
pub struct Chain {
    name: String,
    members: Vec<ChainMember>,
}

impl Chain {
    /// Builds a chain from `members` (`d[0], …, d[n-1]`), validating axis
    /// consistency across them (spec §4.5, invariant 5, invariant 6).
    ///
    /// # Errors
    ///
    /// - [`Error::EmptyChain`] if `members` is empty.
    /// - [`Error::InconsistentAxis`] if two members declare the same axis name with
    ///   different entry sequences.
    pub fn new(name: impl Into<String>, members: Vec<ChainMember>) -> Result<Self> {
        if members.is_empty() {
            return Err(Error::EmptyChain);
        }
        Self::check_axis_consistency(&members)?;
        let name = name.into();
        tracing::trace!(
            "chain {} constructed from {} members",
            name,
            members.len()
        );
        Ok(Chain { name, members })
    }

    /// Convenience constructor for a write-chain: `readers` form `d[0..n-2]`, and
    /// `writer` is `d[n-1]`.
    ///
    /// # Errors
    ///
    /// Same as [`Chain::new`].
    pub fn new_write(
        name: impl Into<String>,
        readers: Vec<Arc<dyn Format>>,
        writer: Arc<dyn FormatMut>,
    ) -> Result<Self> {
        let mut members: Vec<ChainMember> = readers.into_iter().map(ChainMember::Reader).collect();
        members.push(ChainMember::Writer(writer));
        Self::new(name, members)
    }

    fn check_axis_consistency(members: &[ChainMember]) -> Result<()> {
        let mut seen: Vec<(String, Arc<Vec<String>>, String)> = Vec::new();
        for member in members {
            for axis in member.as_format().axis_names() {
                let entries = member.as_format().axis_entries(&axis)?;
                if let Some((_, existing_entries, existing_owner)) =
                    seen.iter().find(|(name, _, _)| *name == axis)
                {
                    if *existing_entries != entries {
                        tracing::trace!(
                            "axis {} entries diverge between members {} and {}",
                            axis,
                            existing_owner,
                            member.name()
                        );
                        return Err(Error::InconsistentAxis {
                            axis,
                            first: existing_owner.clone(),
                            second: member.name().to_string(),
                        });
                    }
                } else {
                    seen.push((axis, entries, member.name().to_string()));
                }
            }
        }
        Ok(())
    }

    fn writer(&self) -> Result<&Arc<dyn FormatMut>> {
        match self.members.last() {
            Some(ChainMember::Writer(w)) => Ok(w),
            Some(other) => Err(Error::ChainLastMemberNotWriter {
                member: other.name().to_string(),
            }),
            None => Err(Error::EmptyChain),
        }
    }

    /// Members earlier than the tail, in original order — used by the deletion
    /// policy (spec §4.5: "permitted only if no earlier member contains it").
    fn earlier_members(&self) -> &[ChainMember] {
        &self.members[..self.members.len().saturating_sub(1)]
    }

    fn first_earlier_holder(
        &self,
        predicate: impl Fn(&dyn Format) -> bool,
    ) -> Option<&str> {
        self.earlier_members()
            .iter()
            .find(|member| predicate(member.as_format()))
            .map(|member| member.name())
    }
}

impl Format for Chain {
    fn dataset_name(&self) -> &str {
        &self.name
    }

    fn has_scalar(&self, name: &str) -> bool {
        self.members.iter().any(|m| m.as_format().has_scalar(name))
    }

    fn get_scalar(&self, name: &str) -> Result<ScalarValue> {
        for member in self.members.iter().rev() {
            if member.as_format().has_scalar(name) {
                return member.as_format().get_scalar(name);
            }
        }
        Err(Error::MissingScalar {
            name: name.to_string(),
            dataset: self.name.clone(),
        })
    }

    fn scalar_names(&self) -> Vec<String> {
        let mut names: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
        for member in &self.members {
            names.extend(member.as_format().scalar_names());
        }
        names.into_iter().collect()
    }

    fn has_axis(&self, name: &str, for_change: bool) -> bool {
        if for_change {
            return self.writer().is_ok_and(|w| w.has_axis(name, true)) || self.has_axis(name, false);
        }
        self.members.iter().any(|m| m.as_format().has_axis(name, false))
    }

    fn axis_length(&self, name: &str) -> Result<usize> {
        Ok(self.axis_entries(name)?.len())
    }

    fn axis_entries(&self, name: &str) -> Result<Arc<Vec<String>>> {
        for member in self.members.iter().rev() {
            if member.as_format().has_axis(name, false) {
                return member.as_format().axis_entries(name);
            }
        }
        Err(Error::MissingAxis {
            name: name.to_string(),
            dataset: self.name.clone(),
        })
    }

    fn axis_names(&self) -> Vec<String> {
        let mut names: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
        for member in &self.members {
            names.extend(member.as_format().axis_names());
        }
        names.into_iter().collect()
    }

    fn has_vector(&self, axis: &str, name: &str) -> bool {
        self.members.iter().any(|m| m.as_format().has_vector(axis, name))
    }

    fn get_vector(&self, axis: &str, name: &str) -> Result<VectorData> {
        for member in self.members.iter().rev() {
            if member.as_format().has_vector(axis, name) {
                return member.as_format().get_vector(axis, name);
            }
        }
        Err(Error::MissingVector {
            axis: axis.to_string(),
            name: name.to_string(),
            dataset: self.name.clone(),
        })
    }

    fn vector_names(&self, axis: &str) -> Result<Vec<String>> {
        let mut names: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
        let mut any_has_axis = false;
        for member in &self.members {
            if member.as_format().has_axis(axis, false) {
                any_has_axis = true;
                names.extend(member.as_format().vector_names(axis)?);
            }
        }
        if !any_has_axis {
            return Err(Error::MissingAxis {
                name: axis.to_string(),
                dataset: self.name.clone(),
            });
        }
        Ok(names.into_iter().collect())
    }

    fn has_matrix(&self, rows: &str, cols: &str, name: &str, layout: MajorAxis, for_relayout: bool) -> bool {
        self.members
            .iter()
            .any(|m| m.as_format().has_matrix(rows, cols, name, layout, for_relayout))
    }

    /// Resolves a matrix by walking members in reverse, same as other artifact
    /// kinds. Unlike `has_matrix` (which accepts a convertible opposite-layout copy
    /// for `for_relayout` queries), a plain `get_matrix` only ever returns a member's
    /// copy stored in exactly `layout`: a member holding only the opposite-layout
    /// copy is not a match here, since relaying it out would require write access
    /// this method (and read-only members) doesn't have, and returning the
    /// differently-oriented copy under the requested layout's label would silently
    /// mislabel its shape and major axis.
    fn get_matrix(&self, rows: &str, cols: &str, name: &str, layout: MajorAxis) -> Result<MatrixData> {
        for member in self.members.iter().rev() {
            if member.as_format().has_matrix(rows, cols, name, layout, false) {
                return member.as_format().get_matrix(rows, cols, name, layout);
            }
        }
        Err(Error::MissingMatrix {
            rows: rows.to_string(),
            cols: cols.to_string(),
            name: name.to_string(),
            dataset: self.name.clone(),
        })
    }

    fn matrix_names(&self, rows: &str, cols: &str) -> Result<Vec<String>> {
        let mut names: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
        let mut any_has_axes = false;
        for member in &self.members {
            if member.as_format().has_axis(rows, false) && member.as_format().has_axis(cols, false) {
                any_has_axes = true;
                names.extend(member.as_format().matrix_names(rows, cols)?);
            }
        }
        if !any_has_axes {
            return Err(Error::MissingAxis {
                name: rows.to_string(),
                dataset: self.name.clone(),
            });
        }
        Ok(names.into_iter().collect())
    }

    /// A chain's version counter for a key is the sum of members' counters, so any
    /// change anywhere invalidates derived caches built against the chain (spec
    /// §4.5).
    fn version_counter(&self, key: &DataKey) -> u32 {
        self.members
            .iter()
            .map(|m| m.as_format().version_counter(key))
            .fold(0u32, |acc, v| acc.wrapping_add(v))
    }
}

impl FormatMut for Chain {
    fn set_scalar(&self, name: &str, value: ScalarValue) -> Result<()> {
        self.writer()?.set_scalar(name, value)
    }

    fn delete_scalar(&self, name: &str, for_set: bool) -> Result<()> {
        if !for_set {
            if let Some(earlier) = self.first_earlier_holder(|f| f.has_scalar(name)) {
                return Err(Error::ForbiddenDelete {
                    name: name.to_string(),
                    earlier: earlier.to_string(),
                });
            }
        }
        self.writer()?.delete_scalar(name, for_set)
    }

    fn add_axis(&self, name: &str, entries: Vec<String>) -> Result<()> {
        self.writer()?.add_axis(name, entries)
    }

    fn delete_axis(&self, name: &str) -> Result<()> {
        if let Some(earlier) = self.first_earlier_holder(|f| f.has_axis(name, false)) {
            return Err(Error::ForbiddenDelete {
                name: name.to_string(),
                earlier: earlier.to_string(),
            });
        }
        self.writer()?.delete_axis(name)
    }

    fn set_vector(&self, axis: &str, name: &str, value: VectorData) -> Result<()> {
        let writer = self.writer()?;
        if !writer.has_axis(axis, false) {
            let entries = self.axis_entries(axis)?;
            writer.add_axis(axis, (*entries).clone())?;
        }
        writer.set_vector(axis, name, value)
    }

    fn delete_vector(&self, axis: &str, name: &str, for_set: bool) -> Result<()> {
        if !for_set {
            if let Some(earlier) = self.first_earlier_holder(|f| f.has_vector(axis, name)) {
                return Err(Error::ForbiddenDelete {
                    name: name.to_string(),
                    earlier: earlier.to_string(),
                });
            }
        }
        self.writer()?.delete_vector(axis, name, for_set)
    }

    fn get_empty_dense_vector(&self, axis: &str, name: &str, kind: ElementKind) -> Result<EmptyDenseHandle> {
        let writer = self.writer()?;
        if !writer.has_axis(axis, false) {
            let entries = self.axis_entries(axis)?;
            writer.add_axis(axis, (*entries).clone())?;
        }
        writer.get_empty_dense_vector(axis, name, kind)
    }

    fn filled_empty_dense_vector(&self, handle: EmptyDenseHandle) -> Result<()> {
        self.writer()?.filled_empty_dense_vector(handle)
    }

    fn get_empty_sparse_vector(
        &self,
        axis: &str,
        name: &str,
        kind: ElementKind,
        nnz: usize,
        index_kind: IndexKind,
    ) -> Result<EmptySparseHandle> {
        self.writer()?.get_empty_sparse_vector(axis, name, kind, nnz, index_kind)
    }

    fn filled_empty_sparse_vector(&self, handle: EmptySparseHandle) -> Result<()> {
        self.writer()?.filled_empty_sparse_vector(handle)
    }

    fn set_matrix(&self, rows: &str, cols: &str, name: &str, value: MatrixData) -> Result<()> {
        self.writer()?.set_matrix(rows, cols, name, value)
    }

    fn delete_matrix(&self, rows: &str, cols: &str, name: &str, for_set: bool) -> Result<()> {
        if !for_set {
            if let Some(earlier) =
                self.first_earlier_holder(|f| f.has_matrix(rows, cols, name, MajorAxis::Row, true))
            {
                return Err(Error::ForbiddenDelete {
                    name: name.to_string(),
                    earlier: earlier.to_string(),
                });
            }
        }
        self.writer()?.delete_matrix(rows, cols, name, for_set)
    }

    fn get_empty_dense_matrix(
        &self,
        rows: &str,
        cols: &str,
        name: &str,
        kind: ElementKind,
        major: MajorAxis,
    ) -> Result<EmptyDenseHandle> {
        self.writer()?.get_empty_dense_matrix(rows, cols, name, kind, major)
    }

    fn filled_empty_dense_matrix(&self, handle: EmptyDenseHandle, major: MajorAxis) -> Result<()> {
        self.writer()?.filled_empty_dense_matrix(handle, major)
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
        self.writer()?
            .get_empty_sparse_matrix(rows, cols, name, kind, major, nnz, index_kind)
    }

    fn filled_empty_sparse_matrix(&self, handle: EmptySparseHandle, major: MajorAxis) -> Result<()> {
        self.writer()?.filled_empty_sparse_matrix(handle, major)
    }

    fn relayout_matrix(&self, rows: &str, cols: &str, name: &str, to: MajorAxis) -> Result<()> {
        self.writer()?.relayout_matrix(rows, cols, name, to)
    }

    fn increment_version_counter(&self, key: &DataKey) {
        if let Ok(writer) = self.writer() {
            writer.increment_version_counter(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{
        element::NumericScalar,
        facade::Writers,
        memory_backend::MemoryDatastore,
    };

    use super::*;

    fn ds(name: &str) -> Arc<MemoryDatastore> {
        Arc::new(MemoryDatastore::new(name))
    }

    #[test]
    fn last_writer_wins_on_read() {
        let a = ds("A");
        let b = ds("B");
        a.set_scalar("s", ScalarValue::Numeric(NumericScalar::Int64(1))).unwrap();
        b.set_scalar("s", ScalarValue::Numeric(NumericScalar::Int64(2))).unwrap();

        let chain = Chain::new(
            "chain",
            vec![
                ChainMember::Reader(a.clone() as Arc<dyn Format>),
                ChainMember::Reader(b.clone() as Arc<dyn Format>),
            ],
        )
        .unwrap();

        assert_eq!(
            chain.get_scalar("s").unwrap(),
            ScalarValue::Numeric(NumericScalar::Int64(2))
        );
    }

    #[test]
    fn deleting_from_earlier_member_is_forbidden_but_set_over_shadows() {
        let a = ds("A");
        let b = ds("B");
        a.set_scalar("s", ScalarValue::Numeric(NumericScalar::Int64(1))).unwrap();

        let chain = Chain::new_write("chain", vec![a.clone() as Arc<dyn Format>], b.clone() as Arc<dyn FormatMut>)
            .unwrap();

        let err = chain.delete_scalar_checked("s", true).unwrap_err();
        assert!(matches!(err, Error::ForbiddenDelete { .. }));

        chain
            .set_scalar_checked("s", ScalarValue::Numeric(NumericScalar::Int64(3)), true)
            .unwrap();
        assert_eq!(
            chain.get_scalar("s").unwrap(),
            ScalarValue::Numeric(NumericScalar::Int64(3))
        );
        assert_eq!(
            a.get_scalar("s").unwrap(),
            ScalarValue::Numeric(NumericScalar::Int64(1))
        );
    }

    #[test]
    fn inconsistent_axis_entries_fail_construction() {
        let a = ds("A");
        let b = ds("B");
        a.add_axis("cell", vec!["c0".into(), "c1".into()]).unwrap();
        b.add_axis("cell", vec!["c0".into(), "c2".into()]).unwrap();

        let err = Chain::new(
            "chain",
            vec![
                ChainMember::Reader(a as Arc<dyn Format>),
                ChainMember::Reader(b as Arc<dyn Format>),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, Error::InconsistentAxis { .. }));
    }

    #[test]
    fn write_chain_requires_writer_tail() {
        let a = ds("A");
        let b = ds("B");
        let chain = Chain::new(
            "chain",
            vec![
                ChainMember::Writer(a as Arc<dyn FormatMut>),
                ChainMember::Reader(b as Arc<dyn Format>),
            ],
        )
        .unwrap();
        let err = chain
            .set_scalar_checked("s", ScalarValue::Numeric(NumericScalar::Int64(1)), false)
            .unwrap_err();
        assert!(matches!(err, Error::ChainLastMemberNotWriter { .. }));
    }

    #[test]
    fn version_counter_is_sum_of_members() {
        let a = ds("A");
        let b = ds("B");
        let chain = Chain::new_write("chain", vec![a.clone() as Arc<dyn Format>], b.clone() as Arc<dyn FormatMut>)
            .unwrap();
        let key = DataKey::ScalarNames;
        let before = chain.version_counter(&key);
        b.set_scalar("x", ScalarValue::Numeric(NumericScalar::Int64(1))).unwrap();
        let after = chain.version_counter(&key);
        assert!(after != before);
    }
}
