//! Feature transformation for loan default model inference.
//!
//! Turns raw loan records into the numeric matrix a trained model expects:
//! categorical fields are one-hot encoded, numeric fields are kept as-is,
//! incomplete rows are dropped and training features that a batch never
//! produced are backfilled with zeros.

use crate::error::{Result, ScoringError};
use crate::storage::ArtifactCache;
use crate::types::loan::{coerce_numeric, Numeric, RawRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

static NULL: Value = Value::Null;

/// Feature schema persisted alongside a trained model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSchema {
    /// Numeric features used unchanged
    pub as_is: Vec<String>,
    /// Categorical features expanded into `<feature>_<category>` indicators
    pub to_dummify: Vec<String>,
    /// Columns the model was fit against, in model input order
    pub trained_features: Vec<String>,
}

impl FeatureSchema {
    pub fn new<S: Into<String>>(
        as_is: impl IntoIterator<Item = S>,
        to_dummify: impl IntoIterator<Item = S>,
        trained_features: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            as_is: as_is.into_iter().map(Into::into).collect(),
            to_dummify: to_dummify.into_iter().map(Into::into).collect(),
            trained_features: trained_features.into_iter().map(Into::into).collect(),
        }
    }

    /// Pull a schema artifact and check it is usable.
    pub async fn load(artifacts: &ArtifactCache, key: &str) -> Result<Self> {
        let schema: Self = artifacts.pull_json(key).await?;
        schema.validate().map_err(|reason| ScoringError::ArtifactDecode {
            key: key.to_string(),
            reason,
        })?;
        debug!(
            key = %key,
            as_is = schema.as_is.len(),
            to_dummify = schema.to_dummify.len(),
            trained = schema.trained_features.len(),
            "Feature schema loaded"
        );
        Ok(schema)
    }

    /// Number of model input columns.
    pub fn feature_count(&self) -> usize {
        self.trained_features.len()
    }

    /// Check the schema is usable: at least one trained feature, no duplicates.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.trained_features.is_empty() {
            return Err("trained_features is empty".to_string());
        }
        let mut seen = HashSet::new();
        for name in &self.trained_features {
            if !seen.insert(name.as_str()) {
                return Err(format!("duplicate trained feature {name:?}"));
            }
        }
        Ok(())
    }

    fn is_selected(&self, column: &str) -> bool {
        self.as_is.iter().any(|f| f == column)
            || self.to_dummify.iter().any(|f| column.starts_with(f.as_str()))
    }
}

/// What to do with indicator columns for categories the model never saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnseenCategoryPolicy {
    /// Keep exactly the trained features
    #[default]
    Prune,
    /// Append unseen columns after the trained ones
    Keep,
}

/// Dense row-major feature matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    columns: Vec<String>,
    values: Vec<f64>,
    row_index: Vec<usize>,
    dropped_rows: Vec<usize>,
}

impl FeatureMatrix {
    fn from_parts(
        columns: Vec<String>,
        values: Vec<f64>,
        row_index: Vec<usize>,
        dropped_rows: Vec<usize>,
    ) -> Self {
        debug_assert_eq!(values.len(), columns.len() * row_index.len());
        Self {
            columns,
            values,
            row_index,
            dropped_rows,
        }
    }

    /// Build a matrix from records that are already in feature space.
    ///
    /// Every record must carry exactly the trained feature names; rows with a
    /// missing value are dropped.
    pub fn from_feature_records(records: &[RawRecord], trained_features: &[String]) -> Result<Self> {
        let expected: HashSet<&str> = trained_features.iter().map(String::as_str).collect();
        let mut values = Vec::with_capacity(records.len() * trained_features.len());
        let mut row_index = Vec::with_capacity(records.len());
        let mut dropped_rows = Vec::new();

        'rows: for (i, record) in records.iter().enumerate() {
            let missing: Vec<String> = trained_features
                .iter()
                .filter(|f| !record.contains_key(f.as_str()))
                .cloned()
                .collect();
            let unexpected: Vec<String> = record
                .keys()
                .filter(|k| !expected.contains(k.as_str()))
                .cloned()
                .collect();
            if !missing.is_empty() || !unexpected.is_empty() {
                return Err(ScoringError::SchemaMismatch {
                    missing,
                    unexpected,
                });
            }

            let mut row = Vec::with_capacity(trained_features.len());
            for feature in trained_features {
                let value = &record[feature.as_str()];
                match coerce_numeric(value) {
                    Numeric::Value(v) => row.push(v),
                    Numeric::Missing => {
                        dropped_rows.push(i);
                        continue 'rows;
                    }
                    Numeric::Invalid => {
                        return Err(ScoringError::Coercion {
                            row: i,
                            field: feature.clone(),
                            value: value.to_string(),
                        })
                    }
                }
            }
            values.extend(row);
            row_index.push(i);
        }

        Ok(Self::from_parts(
            trained_features.to_vec(),
            values,
            row_index,
            dropped_rows,
        ))
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn n_rows(&self) -> usize {
        self.row_index.len()
    }

    pub fn n_cols(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.row_index.is_empty()
    }

    /// Values of one row, in column order.
    pub fn row(&self, i: usize) -> &[f64] {
        let width = self.n_cols();
        &self.values[i * width..(i + 1) * width]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f64]> {
        (0..self.n_rows()).map(move |i| self.row(i))
    }

    /// Values of a named column.
    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let j = self.columns.iter().position(|c| c == name)?;
        Some(self.rows().map(|r| r[j]).collect())
    }

    /// Batch position of the record each row came from.
    pub fn row_index(&self) -> &[usize] {
        &self.row_index
    }

    /// Batch positions of records dropped for missing values.
    pub fn dropped_rows(&self) -> &[usize] {
        &self.dropped_rows
    }

    /// Row-major values narrowed to `f32` for model runtimes.
    pub fn to_f32(&self) -> Vec<f32> {
        self.values.iter().map(|&v| v as f32).collect()
    }
}

/// Transformer that maps raw loan records into model input features.
#[derive(Debug, Clone)]
pub struct FeatureTransformer {
    schema: Arc<FeatureSchema>,
    policy: UnseenCategoryPolicy,
}

impl FeatureTransformer {
    /// Create a transformer with the default unseen-category policy.
    pub fn new(schema: Arc<FeatureSchema>) -> Self {
        Self {
            schema,
            policy: UnseenCategoryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: UnseenCategoryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    pub fn policy(&self) -> UnseenCategoryPolicy {
        self.policy
    }

    /// Transform a batch of raw records.
    pub fn transform(&self, records: &[RawRecord]) -> Result<FeatureMatrix> {
        transform_with_policy(records, &self.schema, self.policy)
    }
}

/// Transform raw records with the reference behaviour: unseen category
/// columns are kept after the trained features.
pub fn transform(records: &[RawRecord], schema: &FeatureSchema) -> Result<FeatureMatrix> {
    transform_with_policy(records, schema, UnseenCategoryPolicy::Keep)
}

#[derive(Debug, Clone, Copy)]
enum Cell<'a> {
    Raw(&'a Value),
    Indicator(f64),
}

struct TableColumn<'a> {
    name: String,
    cells: Vec<Cell<'a>>,
}

/// Transform raw records into a feature matrix.
pub fn transform_with_policy(
    records: &[RawRecord],
    schema: &FeatureSchema,
    policy: UnseenCategoryPolicy,
) -> Result<FeatureMatrix> {
    let mut table = materialize(records);

    for feature in &schema.to_dummify {
        if let Some(pos) = table.iter().position(|c| &c.name == feature) {
            let original = table.remove(pos);
            table.extend(dummify(&original));
        }
    }

    table.retain(|c| schema.is_selected(&c.name));

    let mut rows: Vec<Vec<f64>> = Vec::with_capacity(records.len());
    let mut row_index = Vec::with_capacity(records.len());
    let mut dropped_rows = Vec::new();

    'rows: for i in 0..records.len() {
        let mut row = Vec::with_capacity(table.len());
        for column in &table {
            match column.cells[i] {
                Cell::Indicator(v) => row.push(v),
                Cell::Raw(value) => match coerce_numeric(value) {
                    Numeric::Value(v) => row.push(v),
                    Numeric::Missing => {
                        dropped_rows.push(i);
                        continue 'rows;
                    }
                    Numeric::Invalid => {
                        return Err(ScoringError::Coercion {
                            row: i,
                            field: column.name.clone(),
                            value: value.to_string(),
                        })
                    }
                },
            }
        }
        rows.push(row);
        row_index.push(i);
    }

    let positions: HashMap<&str, usize> = table
        .iter()
        .enumerate()
        .map(|(j, c)| (c.name.as_str(), j))
        .collect();

    let mut columns = schema.trained_features.clone();
    let mut sources: Vec<Option<usize>> = columns
        .iter()
        .map(|f| positions.get(f.as_str()).copied())
        .collect();

    let backfilled: Vec<&String> = columns
        .iter()
        .zip(&sources)
        .filter(|(_, s)| s.is_none())
        .map(|(c, _)| c)
        .collect();
    if !backfilled.is_empty() {
        debug!(columns = ?backfilled, "Backfilled training features with zeros");
    }

    let trained: HashSet<&str> = schema.trained_features.iter().map(String::as_str).collect();
    let unseen: Vec<(usize, &str)> = table
        .iter()
        .enumerate()
        .filter(|(_, c)| !trained.contains(c.name.as_str()))
        .map(|(j, c)| (j, c.name.as_str()))
        .collect();
    if !unseen.is_empty() {
        debug!(
            policy = ?policy,
            columns = ?unseen.iter().map(|(_, n)| *n).collect::<Vec<_>>(),
            "Columns outside the trained feature set"
        );
        if policy == UnseenCategoryPolicy::Keep {
            for (j, name) in unseen {
                columns.push(name.to_string());
                sources.push(Some(j));
            }
        }
    }

    let mut values = Vec::with_capacity(rows.len() * columns.len());
    for row in &rows {
        values.extend(sources.iter().map(|s| s.map_or(0.0, |j| row[j])));
    }

    debug!(
        rows = row_index.len(),
        dropped = dropped_rows.len(),
        columns = columns.len(),
        "Transformed records into feature matrix"
    );

    Ok(FeatureMatrix::from_parts(
        columns,
        values,
        row_index,
        dropped_rows,
    ))
}

/// Lay records out as named columns in first-seen key order.
fn materialize(records: &[RawRecord]) -> Vec<TableColumn<'_>> {
    let mut seen = HashSet::new();
    let mut names: Vec<&str> = Vec::new();
    for record in records {
        for key in record.keys() {
            if seen.insert(key.as_str()) {
                names.push(key.as_str());
            }
        }
    }

    names
        .into_iter()
        .map(|name| TableColumn {
            name: name.to_string(),
            cells: records
                .iter()
                .map(|r| Cell::Raw(r.get(name).unwrap_or(&NULL)))
                .collect(),
        })
        .collect()
}

fn category_label(cell: &Cell<'_>) -> Option<String> {
    match cell {
        Cell::Raw(Value::Null) => None,
        Cell::Raw(Value::String(s)) => Some(s.clone()),
        Cell::Raw(other) => Some(other.to_string()),
        Cell::Indicator(v) => Some(v.to_string()),
    }
}

/// One indicator column per observed category, categories sorted.
fn dummify<'a>(column: &TableColumn<'a>) -> Vec<TableColumn<'a>> {
    let labels: Vec<Option<String>> = column.cells.iter().map(category_label).collect();
    let categories: BTreeSet<&str> = labels.iter().flatten().map(String::as_str).collect();

    categories
        .into_iter()
        .map(|category| TableColumn {
            name: format!("{}_{}", column.name, category),
            cells: labels
                .iter()
                .map(|l| Cell::Indicator(if l.as_deref() == Some(category) { 1.0 } else { 0.0 }))
                .collect(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn records(value: Value) -> Vec<RawRecord> {
        serde_json::from_value(value).unwrap()
    }

    fn loan_schema() -> FeatureSchema {
        FeatureSchema::new(
            ["loan_amnt", "int_rate", "dti"],
            ["purpose", "term"],
            [
                "loan_amnt",
                "int_rate",
                "dti",
                "purpose_car",
                "purpose_credit_card",
                "purpose_educational",
                "term_ 36 months",
                "term_ 60 months",
            ],
        )
    }

    #[test]
    fn test_dummy_expansion_replaces_categorical_column() {
        let schema = FeatureSchema::new(
            Vec::<String>::new(),
            vec!["purpose".to_string()],
            vec!["purpose_car".to_string(), "purpose_credit_card".to_string()],
        );
        let input = records(json!([
            {"purpose": "car"},
            {"purpose": "credit_card"},
            {"purpose": "car"}
        ]));

        let m = transform(&input, &schema).unwrap();

        assert_eq!(m.columns(), ["purpose_car", "purpose_credit_card"]);
        assert!(m.column("purpose").is_none());
        assert_eq!(m.column("purpose_car").unwrap(), vec![1.0, 0.0, 1.0]);
        assert_eq!(m.column("purpose_credit_card").unwrap(), vec![0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_missing_trained_feature_backfilled_with_zeros() {
        let schema = FeatureSchema::new(["a", "b"], [], ["a", "b", "c"]);
        let input = records(json!([{"a": 1, "b": "2"}, {"a": 3.5, "b": 4}]));

        let m = transform(&input, &schema).unwrap();

        assert_eq!(m.columns(), ["a", "b", "c"]);
        assert_eq!(m.column("c").unwrap(), vec![0.0, 0.0]);
        assert_eq!(m.row(0), [1.0, 2.0, 0.0]);
        assert_eq!(m.row(1), [3.5, 4.0, 0.0]);
    }

    #[test]
    fn test_transform_is_idempotent() {
        let input = records(json!([
            {"loan_amnt": "5000.0", "int_rate": "10.65", "dti": "27.65", "purpose": "credit_card", "term": " 36 months", "addr_state": "AZ"},
            {"loan_amnt": 2500, "int_rate": 15.27, "dti": 1.0, "purpose": "car", "term": " 60 months", "addr_state": "GA"}
        ]));
        let transformer = FeatureTransformer::new(Arc::new(loan_schema()));

        let first = transformer.transform(&input).unwrap();
        let second = transformer.transform(&input).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.columns(), loan_schema().trained_features.as_slice());
        assert_eq!(first.column("term_ 60 months").unwrap(), vec![0.0, 1.0]);
        assert_eq!(first.column("purpose_educational").unwrap(), vec![0.0, 0.0]);
    }

    #[test]
    fn test_rows_with_missing_values_are_dropped() {
        let input = records(json!([
            {"loan_amnt": 5000, "int_rate": 10.65, "dti": null, "purpose": "car", "term": " 36 months"},
            {"loan_amnt": 2500, "int_rate": 15.27, "dti": 1.0, "purpose": "car", "term": " 60 months"},
            {"loan_amnt": 2400, "int_rate": "", "dti": 8.72, "purpose": "car", "term": " 36 months"}
        ]));

        let m = transform_with_policy(&input, &loan_schema(), UnseenCategoryPolicy::Prune).unwrap();

        assert_eq!(m.n_rows(), 1);
        assert_eq!(m.row_index(), [1]);
        assert_eq!(m.dropped_rows(), [0, 2]);
        assert_eq!(m.column("loan_amnt").unwrap(), vec![2500.0]);
    }

    #[test]
    fn test_missing_category_yields_zero_indicators() {
        let input = records(json!([
            {"loan_amnt": 5000, "int_rate": 10.65, "dti": 1.0, "purpose": null, "term": " 36 months"},
            {"loan_amnt": 2500, "int_rate": 15.27, "dti": 1.0, "term": " 60 months", "purpose": "car"}
        ]));

        let m = transform_with_policy(&input, &loan_schema(), UnseenCategoryPolicy::Prune).unwrap();

        assert_eq!(m.n_rows(), 2);
        assert_eq!(m.column("purpose_car").unwrap(), vec![0.0, 1.0]);
        assert_eq!(m.column("purpose_credit_card").unwrap(), vec![0.0, 0.0]);
    }

    #[test]
    fn test_unseen_category_policy() {
        let input = records(json!([
            {"loan_amnt": 5000, "int_rate": 10.65, "dti": 1.0, "purpose": "wedding", "term": " 36 months"}
        ]));

        let kept = transform_with_policy(&input, &loan_schema(), UnseenCategoryPolicy::Keep).unwrap();
        assert_eq!(kept.n_cols(), loan_schema().feature_count() + 1);
        assert_eq!(kept.columns().last().unwrap(), "purpose_wedding");
        assert_eq!(kept.column("purpose_wedding").unwrap(), vec![1.0]);

        let pruned = transform_with_policy(&input, &loan_schema(), UnseenCategoryPolicy::Prune).unwrap();
        assert_eq!(pruned.columns(), loan_schema().trained_features.as_slice());
    }

    #[test]
    fn test_unparseable_numeric_is_a_coercion_error() {
        let input = records(json!([
            {"loan_amnt": 5000, "int_rate": "ten", "dti": 1.0, "purpose": "car", "term": " 36 months"}
        ]));

        match transform(&input, &loan_schema()) {
            Err(ScoringError::Coercion { row, field, value }) => {
                assert_eq!(row, 0);
                assert_eq!(field, "int_rate");
                assert_eq!(value, "\"ten\"");
            }
            other => panic!("expected coercion error, got {other:?}"),
        }
    }

    #[test]
    fn test_unselected_columns_are_ignored() {
        let input = records(json!([
            {"loan_amnt": 5000, "int_rate": 10.65, "dti": 1.0, "home_ownership": "RENT", "addr_state": "AZ"}
        ]));
        let m = transform(&input, &loan_schema()).unwrap();
        assert_eq!(m.n_rows(), 1);
        assert!(m.column("home_ownership").is_none());
    }

    #[test]
    fn test_from_feature_records_requires_exact_features() {
        let trained = vec!["a".to_string(), "b".to_string()];

        let ok = records(json!([{"a": 1, "b": "2"}, {"a": null, "b": 1}]));
        let m = FeatureMatrix::from_feature_records(&ok, &trained).unwrap();
        assert_eq!(m.row_index(), [0]);
        assert_eq!(m.row(0), [1.0, 2.0]);

        let bad = records(json!([{"a": 1, "c": 2}]));
        match FeatureMatrix::from_feature_records(&bad, &trained) {
            Err(ScoringError::SchemaMismatch { missing, unexpected }) => {
                assert_eq!(missing, vec!["b".to_string()]);
                assert_eq!(unexpected, vec!["c".to_string()]);
            }
            other => panic!("expected schema mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_schema_validation() {
        assert!(loan_schema().validate().is_ok());
        let dup = FeatureSchema::new(["a"], [], ["a", "a"]);
        assert!(dup.validate().is_err());
        let empty = FeatureSchema::new(["a"], [], Vec::<&str>::new());
        assert!(empty.validate().is_err());
    }

    #[tokio::test]
    async fn test_load_schema_artifact() {
        use crate::storage::{LocalObjectStore, ObjectStore};

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalObjectStore::new(dir.path()));
        store
            .put("models/schema.json", serde_json::to_vec(&loan_schema()).unwrap())
            .await
            .unwrap();
        store
            .put("models/empty.json", br#"{"as_is": [], "to_dummify": [], "trained_features": []}"#.to_vec())
            .await
            .unwrap();
        let artifacts = ArtifactCache::new(store);

        let schema = FeatureSchema::load(&artifacts, "models/schema.json").await.unwrap();
        assert_eq!(schema, loan_schema());
        assert!(matches!(
            FeatureSchema::load(&artifacts, "models/empty.json").await,
            Err(ScoringError::ArtifactDecode { .. })
        ));
    }
}
