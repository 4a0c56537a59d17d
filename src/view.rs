//! Views (component C7): a read-only renaming/reprojection of a source dataset.
//! A view holds an axis-alias map and an artifact-alias map and exposes the source
//! under the alternative names; an alias with no mapping surfaces as a [`Format`]
//! "missing" error naming the alias itself (spec §4.6).

use std::{collections::HashMap, sync::Arc};

use crate::{
    cache::DataKey,
    element::{MajorAxis, MatrixData, ScalarValue, VectorData},
    error::{Error, Result},
    format::Format,
};

/// What kind of artifact an artifact alias resolves to in the source, so a view can
/// answer `has_scalar`/`has_vector`/`has_matrix` without guessing from the alias
/// string alone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArtifactRef {
    Scalar { source_name: String },
    Vector { source_axis: String, source_name: String },
    Matrix {
        source_rows: String,
        source_cols: String,
        source_name: String,
    },
}

/// A renamed, read-only projection of a source [`Format`].
pub struct View<B> {
    name: String,
    source: Arc<B>,
    axis_aliases: HashMap<String, String>,
    artifact_aliases: HashMap<String, ArtifactRef>,
}

impl<B: Format> View<B> {
    #[must_use]
    pub fn new(name: impl Into<String>, source: Arc<B>) -> Self {
        View {
            name: name.into(),
            source,
            axis_aliases: HashMap::new(),
            artifact_aliases: HashMap::new(),
        }
    }

    /// Exposes `source_axis` under `alias`. Also affects how vector/matrix aliases
    /// referring to this axis report axis-length/entries.
    #[must_use]
    pub fn with_axis_alias(mut self, alias: impl Into<String>, source_axis: impl Into<String>) -> Self {
        self.axis_aliases.insert(alias.into(), source_axis.into());
        self
    }

    #[must_use]
    pub fn with_artifact_alias(mut self, alias: impl Into<String>, target: ArtifactRef) -> Self {
        self.artifact_aliases.insert(alias.into(), target);
        self
    }

    fn resolve_axis<'a>(&'a self, alias: &'a str) -> &'a str {
        self.axis_aliases.get(alias).map_or(alias, String::as_str)
    }

    fn unknown_alias(&self, alias: &str) -> Error {
        Error::UnknownAlias {
            alias: alias.to_string(),
            view: self.name.clone(),
        }
    }
}

impl<B: Format> Format for View<B> {
    fn dataset_name(&self) -> &str {
        &self.name
    }

    fn has_scalar(&self, name: &str) -> bool {
        match self.artifact_aliases.get(name) {
            Some(ArtifactRef::Scalar { source_name }) => self.source.has_scalar(source_name),
            Some(_) => false,
            None => self.source.has_scalar(name),
        }
    }

    fn get_scalar(&self, name: &str) -> Result<ScalarValue> {
        match self.artifact_aliases.get(name) {
            Some(ArtifactRef::Scalar { source_name }) => self.source.get_scalar(source_name),
            Some(_) => Err(self.unknown_alias(name)),
            None => self.source.get_scalar(name),
        }
    }

    fn scalar_names(&self) -> Vec<String> {
        let mut names = self.source.scalar_names();
        for (alias, target) in &self.artifact_aliases {
            if let ArtifactRef::Scalar { source_name } = target {
                if self.source.has_scalar(source_name) {
                    names.push(alias.clone());
                }
            }
        }
        names.sort();
        names.dedup();
        names
    }

    fn has_axis(&self, name: &str, for_change: bool) -> bool {
        if for_change {
            return false;
        }
        self.source.has_axis(self.resolve_axis(name), false)
    }

    fn axis_length(&self, name: &str) -> Result<usize> {
        self.source.axis_length(self.resolve_axis(name))
    }

    fn axis_entries(&self, name: &str) -> Result<Arc<Vec<String>>> {
        self.source.axis_entries(self.resolve_axis(name))
    }

    fn axis_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.source.axis_names();
        names.extend(self.axis_aliases.keys().cloned());
        names.sort();
        names.dedup();
        names
    }

    fn has_vector(&self, axis: &str, name: &str) -> bool {
        match self.artifact_aliases.get(name) {
            Some(ArtifactRef::Vector { source_axis, source_name }) => {
                self.resolve_axis(axis) == source_axis.as_str() && self.source.has_vector(source_axis, source_name)
            }
            Some(_) => false,
            None => self.source.has_vector(self.resolve_axis(axis), name),
        }
    }

    fn get_vector(&self, axis: &str, name: &str) -> Result<VectorData> {
        match self.artifact_aliases.get(name) {
            Some(ArtifactRef::Vector { source_axis, source_name }) => {
                self.source.get_vector(source_axis, source_name)
            }
            Some(_) => Err(self.unknown_alias(name)),
            None => self.source.get_vector(self.resolve_axis(axis), name),
        }
    }

    fn vector_names(&self, axis: &str) -> Result<Vec<String>> {
        let source_axis = self.resolve_axis(axis);
        let mut names = self.source.vector_names(source_axis)?;
        for (alias, target) in &self.artifact_aliases {
            if let ArtifactRef::Vector { source_axis: sa, source_name } = target {
                if sa == source_axis && self.source.has_vector(sa, source_name) {
                    names.push(alias.clone());
                }
            }
        }
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn has_matrix(&self, rows: &str, cols: &str, name: &str, layout: MajorAxis, for_relayout: bool) -> bool {
        match self.artifact_aliases.get(name) {
            Some(ArtifactRef::Matrix { source_rows, source_cols, source_name }) => {
                self.resolve_axis(rows) == source_rows.as_str()
                    && self.resolve_axis(cols) == source_cols.as_str()
                    && self.source.has_matrix(source_rows, source_cols, source_name, layout, for_relayout)
            }
            Some(_) => false,
            None => self
                .source
                .has_matrix(self.resolve_axis(rows), self.resolve_axis(cols), name, layout, for_relayout),
        }
    }

    fn get_matrix(&self, rows: &str, cols: &str, name: &str, layout: MajorAxis) -> Result<MatrixData> {
        match self.artifact_aliases.get(name) {
            Some(ArtifactRef::Matrix { source_rows, source_cols, source_name }) => {
                self.source.get_matrix(source_rows, source_cols, source_name, layout)
            }
            Some(_) => Err(self.unknown_alias(name)),
            None => self
                .source
                .get_matrix(self.resolve_axis(rows), self.resolve_axis(cols), name, layout),
        }
    }

    fn matrix_names(&self, rows: &str, cols: &str) -> Result<Vec<String>> {
        let source_rows = self.resolve_axis(rows);
        let source_cols = self.resolve_axis(cols);
        let mut names = self.source.matrix_names(source_rows, source_cols)?;
        for (alias, target) in &self.artifact_aliases {
            if let ArtifactRef::Matrix { source_rows: sr, source_cols: sc, source_name } = target {
                if sr == source_rows
                    && sc == source_cols
                    && self.source.has_matrix(sr, sc, source_name, MajorAxis::Row, true)
                {
                    names.push(alias.clone());
                }
            }
        }
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn version_counter(&self, key: &DataKey) -> u32 {
        self.source.version_counter(key)
    }

    fn description_header(&self) -> String {
        format!("view: {} over {}", self.name, self.source.description_header())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{element::NumericScalar, format::FormatMut, memory_backend::MemoryDatastore};

    use super::*;

    #[test]
    fn renamed_axis_and_artifact_resolve() {
        let ds = Arc::new(MemoryDatastore::new("d"));
        ds.add_axis("cell", vec!["c0".into(), "c1".into()]).unwrap();
        ds.set_scalar("version", ScalarValue::Numeric(NumericScalar::Int64(3))).unwrap();

        let view = View::new("v", ds)
            .with_axis_alias("obs", "cell")
            .with_artifact_alias(
                "ver",
                ArtifactRef::Scalar {
                    source_name: "version".to_string(),
                },
            );

        assert!(view.has_axis("obs", false));
        assert_eq!(view.axis_length("obs").unwrap(), 2);
        assert!(view.has_scalar("ver"));
        assert_eq!(
            view.get_scalar("ver").unwrap(),
            ScalarValue::Numeric(NumericScalar::Int64(3))
        );
    }

    #[test]
    fn unknown_alias_surfaces_its_own_name() {
        let ds = Arc::new(MemoryDatastore::new("d"));
        let view: View<MemoryDatastore> = View::new("v", ds);
        let err = view.get_scalar("nope").unwrap_err();
        match err {
            Error::MissingScalar { name, .. } => assert_eq!(name, "nope"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
