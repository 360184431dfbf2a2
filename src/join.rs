use anyhow::{bail, Context, Result};
use arrow::{
    array::{Array, UInt32Array},
    compute::{self, SortColumn},
    datatypes::{Field, Schema},
    record_batch::RecordBatch,
};
use serde::Deserialize;
use std::{collections::HashMap, sync::Arc};
use tracing::debug;

use crate::table::u64_values;

/// Which occurrence survives when a table carries repeat keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Precedence {
    #[default]
    LastWins,
    FirstWins,
}

/// Per-row composite key over the named code columns. A null in any key
/// column makes the whole key null; null keys never match.
fn composite_keys(batch: &RecordBatch, keys: &[&str]) -> Result<Vec<Option<Vec<u64>>>> {
    let cols = keys
        .iter()
        .map(|k| u64_values(batch, k))
        .collect::<Result<Vec<_>>>()?;
    let mut out = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        let mut key = Vec::with_capacity(cols.len());
        let mut valid = true;
        for c in &cols {
            if c.is_null(i) {
                valid = false;
                break;
            }
            key.push(c.value(i));
        }
        out.push(valid.then_some(key));
    }
    Ok(out)
}

/// Gather whole rows by index.
pub fn take_rows(batch: &RecordBatch, indices: &UInt32Array) -> Result<RecordBatch> {
    let cols = batch
        .columns()
        .iter()
        .map(|c| compute::take(c.as_ref(), indices, None))
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("taking rows")?;
    RecordBatch::try_new(batch.schema(), cols).context("rebuilding batch from taken rows")
}

/// Inner-join `fact` against `dim` on the shared key columns, attaching the
/// dimension's non-key columns that the fact side does not already carry.
///
/// The dimension must be unique on the key: a repeated key means the join
/// would fan out and multiply fact rows, which is a data-integrity violation,
/// not something to propagate. Fact rows with no dimension match are dropped
/// (the dimension was filtered; the row fell out of scope).
pub fn join_many_to_one(
    fact: &RecordBatch,
    dim: &RecordBatch,
    keys: &[&str],
    label: &str,
) -> Result<RecordBatch> {
    let dim_keys = composite_keys(dim, keys)
        .with_context(|| format!("extracting dimension keys for join `{label}`"))?;
    let mut index: HashMap<Vec<u64>, u32> = HashMap::with_capacity(dim.num_rows());
    for (i, key) in dim_keys.into_iter().enumerate() {
        if let Some(key) = key {
            if index.insert(key.clone(), i as u32).is_some() {
                bail!(
                    "join `{label}` on {keys:?} would fan out: dimension key {key:?} occurs more than once"
                );
            }
        }
    }

    let fact_keys = composite_keys(fact, keys)
        .with_context(|| format!("extracting fact keys for join `{label}`"))?;
    let mut fact_idx = Vec::new();
    let mut dim_idx = Vec::new();
    for (i, key) in fact_keys.into_iter().enumerate() {
        if let Some(j) = key.and_then(|k| index.get(&k).copied()) {
            fact_idx.push(i as u32);
            dim_idx.push(j);
        }
    }
    debug!(
        label,
        fact_rows = fact.num_rows(),
        matched = fact_idx.len(),
        "many-to-one join"
    );

    let fact_taken = take_rows(fact, &UInt32Array::from(fact_idx))?;
    let dim_indices = UInt32Array::from(dim_idx);

    let mut fields: Vec<Field> = fact_taken
        .schema()
        .fields()
        .iter()
        .map(|f| f.as_ref().clone())
        .collect();
    let mut columns = fact_taken.columns().to_vec();
    let fact_schema = fact.schema();
    for (field, col) in dim.schema().fields().iter().zip(dim.columns()) {
        if keys.contains(&field.name().as_str()) || fact_schema.column_with_name(field.name()).is_some() {
            continue;
        }
        let taken = compute::take(col.as_ref(), &dim_indices, None)
            .with_context(|| format!("gathering dimension column `{}`", field.name()))?;
        fields.push(field.as_ref().clone());
        columns.push(taken);
    }
    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
        .with_context(|| format!("assembling output of join `{label}`"))
}

/// Drop repeat-key rows, keeping the first or last occurrence. Rows with a
/// null key are always kept. Surviving rows stay in their original order.
pub fn dedupe_by_keys(
    batch: &RecordBatch,
    keys: &[&str],
    precedence: Precedence,
) -> Result<RecordBatch> {
    let row_keys = composite_keys(batch, keys)?;
    let mut chosen: HashMap<Vec<u64>, u32> = HashMap::new();
    let mut null_rows = Vec::new();
    for (i, key) in row_keys.into_iter().enumerate() {
        match key {
            None => null_rows.push(i as u32),
            Some(key) => match precedence {
                Precedence::LastWins => {
                    chosen.insert(key, i as u32);
                }
                Precedence::FirstWins => {
                    chosen.entry(key).or_insert(i as u32);
                }
            },
        }
    }
    let mut indices: Vec<u32> = chosen.into_values().chain(null_rows).collect();
    indices.sort_unstable();
    take_rows(batch, &UInt32Array::from(indices))
}

/// Stable lexicographic sort by the named columns.
pub fn sort_by(batch: &RecordBatch, keys: &[&str]) -> Result<RecordBatch> {
    let columns: Vec<SortColumn> = keys
        .iter()
        .map(|k| {
            batch
                .column_by_name(k)
                .cloned()
                .map(|values| SortColumn {
                    values,
                    options: None,
                })
                .ok_or_else(|| anyhow::anyhow!("sort column `{k}` not present"))
        })
        .collect::<Result<_>>()?;
    let indices = compute::lexsort_to_indices(&columns, None).context("sorting")?;
    take_rows(batch, &indices)
}
