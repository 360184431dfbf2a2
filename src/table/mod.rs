pub mod predicate;
pub mod read;
pub mod schema;

pub use predicate::Predicate;
pub use read::{read_tsv, ReadOptions};

use anyhow::{anyhow, Context, Result};
use arrow::{
    array::{ArrayRef, UInt64Array},
    compute,
    datatypes::{DataType, Field, Schema},
    record_batch::RecordBatch,
};
use std::{collections::HashSet, sync::Arc};

/// Column values as u64, via a widening cast. Only meaningful for the
/// unsigned code columns.
pub fn u64_values(batch: &RecordBatch, name: &str) -> Result<UInt64Array> {
    let col = batch
        .column_by_name(name)
        .ok_or_else(|| anyhow!("column `{name}` not present"))?;
    let cast = compute::cast(col, &DataType::UInt64)
        .with_context(|| format!("casting `{name}` to u64"))?;
    cast.as_any()
        .downcast_ref::<UInt64Array>()
        .cloned()
        .ok_or_else(|| anyhow!("`{name}` did not cast to u64"))
}

/// Distinct non-null values of a code column.
pub fn column_u64_set(batch: &RecordBatch, name: &str) -> Result<HashSet<u64>> {
    Ok(u64_values(batch, name)?.iter().flatten().collect())
}

/// Swap one column (and its field) for another, keeping position.
pub fn replace_column(
    batch: &RecordBatch,
    name: &str,
    field: Field,
    array: ArrayRef,
) -> Result<RecordBatch> {
    let idx = batch
        .schema()
        .index_of(name)
        .with_context(|| format!("replacing column `{name}`"))?;
    let mut fields: Vec<Field> = batch
        .schema()
        .fields()
        .iter()
        .map(|f| f.as_ref().clone())
        .collect();
    let mut columns = batch.columns().to_vec();
    fields[idx] = field;
    columns[idx] = array;
    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
        .with_context(|| format!("rebuilding batch after replacing `{name}`"))
}

/// Append a column at the end of the batch.
pub fn append_column(batch: &RecordBatch, field: Field, array: ArrayRef) -> Result<RecordBatch> {
    let mut fields: Vec<Field> = batch
        .schema()
        .fields()
        .iter()
        .map(|f| f.as_ref().clone())
        .collect();
    let mut columns = batch.columns().to_vec();
    fields.push(field);
    columns.push(array);
    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
        .context("rebuilding batch after append")
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::UInt32Array;

    fn batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new(
            "store_code_uc",
            DataType::UInt32,
            true,
        )]));
        RecordBatch::try_new(
            schema,
            vec![Arc::new(UInt32Array::from(vec![1, 2, 2, 3])) as ArrayRef],
        )
        .unwrap()
    }

    #[test]
    fn distinct_set() -> Result<()> {
        let set = column_u64_set(&batch(), "store_code_uc")?;
        assert_eq!(set, HashSet::from([1, 2, 3]));
        Ok(())
    }

    #[test]
    fn append_and_replace() -> Result<()> {
        let b = batch();
        let extra: ArrayRef = Arc::new(UInt64Array::from(vec![10, 20, 30, 40]));
        let b = append_column(&b, Field::new("upc", DataType::UInt64, true), extra)?;
        assert_eq!(b.num_columns(), 2);

        let swapped: ArrayRef = Arc::new(UInt64Array::from(vec![5, 6, 7, 8]));
        let b = replace_column(&b, "upc", Field::new("upc", DataType::UInt64, true), swapped)?;
        let vals = u64_values(&b, "upc")?;
        assert_eq!(vals.value(0), 5);
        Ok(())
    }
}
