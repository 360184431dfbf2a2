use anyhow::{anyhow, Context, Result};
use arrow::{
    array::{ArrayRef, BooleanArray, Float64Array, StringArray, UInt64Array},
    compute,
    datatypes::DataType,
    record_batch::RecordBatch,
};
use std::collections::HashSet;

/// A row predicate evaluated against each batch during the read, so that
/// out-of-scope rows are never materialized past the decoder.
#[derive(Debug, Clone)]
pub enum Predicate {
    /// Numeric column value is a member of the set.
    InU64 { column: String, values: HashSet<u64> },
    /// Numeric column value is not a member of the set.
    NotInU64 { column: String, values: HashSet<u64> },
    /// Text column value is a member of the set.
    InStr {
        column: String,
        values: HashSet<String>,
    },
    /// Text column value is not a member of the set.
    NotInStr {
        column: String,
        values: HashSet<String>,
    },
    /// Numeric column value is strictly greater than the bound.
    GtF64 { column: String, bound: f64 },
    /// Every sub-predicate holds.
    All(Vec<Predicate>),
}

impl Predicate {
    pub fn in_u64(column: &str, values: impl IntoIterator<Item = u64>) -> Self {
        Predicate::InU64 {
            column: column.to_string(),
            values: values.into_iter().collect(),
        }
    }

    pub fn in_str<S: Into<String>>(column: &str, values: impl IntoIterator<Item = S>) -> Self {
        Predicate::InStr {
            column: column.to_string(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn gt(column: &str, bound: f64) -> Self {
        Predicate::GtF64 {
            column: column.to_string(),
            bound,
        }
    }

    /// Null column values never satisfy a predicate; the row is excluded.
    pub fn evaluate(&self, batch: &RecordBatch) -> Result<BooleanArray> {
        match self {
            Predicate::InU64 { column, values } => {
                let vals = u64_column(batch, column)?;
                Ok(vals
                    .iter()
                    .map(|v| Some(v.is_some_and(|x| values.contains(&x))))
                    .collect())
            }
            Predicate::NotInU64 { column, values } => {
                let vals = u64_column(batch, column)?;
                // a null is not a member of any drop list; the row survives
                Ok(vals
                    .iter()
                    .map(|v| Some(v.map_or(true, |x| !values.contains(&x))))
                    .collect())
            }
            Predicate::InStr { column, values } => {
                let vals = str_column(batch, column)?;
                Ok(vals
                    .iter()
                    .map(|v| Some(v.is_some_and(|x| values.contains(x))))
                    .collect())
            }
            Predicate::NotInStr { column, values } => {
                let vals = str_column(batch, column)?;
                Ok(vals
                    .iter()
                    .map(|v| Some(v.map_or(true, |x| !values.contains(x))))
                    .collect())
            }
            Predicate::GtF64 { column, bound } => {
                let col = named_column(batch, column)?;
                let cast = compute::cast(&col, &DataType::Float64)
                    .with_context(|| format!("casting `{column}` for comparison"))?;
                let vals = cast
                    .as_any()
                    .downcast_ref::<Float64Array>()
                    .ok_or_else(|| anyhow!("`{column}` did not cast to f64"))?;
                Ok(vals
                    .iter()
                    .map(|v| Some(v.is_some_and(|x| x > *bound)))
                    .collect())
            }
            Predicate::All(preds) => {
                let mut mask: Option<BooleanArray> = None;
                for p in preds {
                    let m = p.evaluate(batch)?;
                    mask = Some(match mask {
                        None => m,
                        Some(acc) => compute::and(&acc, &m)?,
                    });
                }
                Ok(mask.unwrap_or_else(|| vec![true; batch.num_rows()].into()))
            }
        }
    }
}

fn named_column(batch: &RecordBatch, name: &str) -> Result<ArrayRef> {
    batch
        .column_by_name(name)
        .cloned()
        .ok_or_else(|| anyhow!("predicate column `{name}` not present in batch"))
}

fn u64_column(batch: &RecordBatch, name: &str) -> Result<UInt64Array> {
    let col = named_column(batch, name)?;
    let cast = compute::cast(&col, &DataType::UInt64)
        .with_context(|| format!("casting `{name}` to u64 for predicate"))?;
    cast.as_any()
        .downcast_ref::<UInt64Array>()
        .cloned()
        .ok_or_else(|| anyhow!("`{name}` did not cast to u64"))
}

fn str_column(batch: &RecordBatch, name: &str) -> Result<StringArray> {
    let col = named_column(batch, name)?;
    let cast = compute::cast(&col, &DataType::Utf8)
        .with_context(|| format!("casting `{name}` to text for predicate"))?;
    cast.as_any()
        .downcast_ref::<StringArray>()
        .cloned()
        .ok_or_else(|| anyhow!("`{name}` did not cast to text"))
}
