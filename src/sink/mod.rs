//! Parquet output, one file per table, with row groups aligned to a chosen
//! partition column so downstream readers can skip whole blocks.

use anyhow::{Context, Result};
use arrow::{
    array::{BooleanArray, StringArray},
    compute,
    datatypes::DataType,
    record_batch::RecordBatch,
};
use parquet::{
    arrow::ArrowWriter,
    basic::{BrotliLevel, Compression, ZstdLevel},
    file::properties::WriterProperties,
};
use serde::Deserialize;
use std::{fs, path::Path};
use tracing::{info, warn};

/// Output compression. Brotli trades write speed for the smallest files,
/// which suits write-once research extracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    #[default]
    Brotli,
    Zstd,
    Snappy,
    Uncompressed,
}

impl Codec {
    fn compression(self) -> Result<Compression> {
        Ok(match self {
            Codec::Brotli => {
                Compression::BROTLI(BrotliLevel::try_new(5).context("brotli level")?)
            }
            Codec::Zstd => Compression::ZSTD(ZstdLevel::try_new(3).context("zstd level")?),
            Codec::Snappy => Compression::SNAPPY,
            Codec::Uncompressed => Compression::UNCOMPRESSED,
        })
    }
}

/// Write one table to `path`. With a partition column present, every
/// distinct value gets its own row group, in first-appearance order. An
/// empty table writes nothing at all.
pub fn write_table(
    batch: &RecordBatch,
    path: &Path,
    partition_key: Option<&str>,
    codec: Codec,
) -> Result<()> {
    if batch.num_rows() == 0 {
        info!(file = %path.display(), "table is empty, skipping");
        return Ok(());
    }
    let props = WriterProperties::builder()
        .set_compression(codec.compression()?)
        .build();
    let file = fs::File::create(path)
        .with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))
        .with_context(|| format!("opening parquet writer for {}", path.display()))?;

    let key = partition_key.filter(|k| {
        let present = batch.column_by_name(k).is_some();
        if !present {
            warn!(
                column = k,
                file = %path.display(),
                "partition column not present, writing a single block"
            );
        }
        present
    });

    match key {
        None => {
            writer.write(batch)?;
        }
        Some(key) => {
            for part in partition(batch, key)? {
                writer.write(&part)?;
                // one row group per partition value
                writer.flush()?;
            }
        }
    }
    writer
        .close()
        .with_context(|| format!("closing {}", path.display()))?;
    info!(rows = batch.num_rows(), file = %path.display(), "wrote table");
    Ok(())
}

/// Split a batch by the distinct values of one column, in the order the
/// values first appear. Nulls form their own slice.
fn partition(batch: &RecordBatch, key: &str) -> Result<Vec<RecordBatch>> {
    let col = batch
        .column_by_name(key)
        .ok_or_else(|| anyhow::anyhow!("partition column `{key}` not present"))?;
    let rendered = compute::cast(col, &DataType::Utf8)
        .with_context(|| format!("rendering partition column `{key}`"))?;
    let rendered = rendered
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| anyhow::anyhow!("partition column `{key}` did not render as text"))?
        .clone();

    let mut order: Vec<Option<String>> = Vec::new();
    for v in rendered.iter() {
        let v = v.map(str::to_string);
        if !order.contains(&v) {
            order.push(v);
        }
    }
    let mut parts = Vec::with_capacity(order.len());
    for value in order {
        let mask: BooleanArray = rendered
            .iter()
            .map(|v| Some(v.map(str::to_string) == value))
            .collect();
        parts.push(compute::filter_record_batch(batch, &mask)?);
    }
    Ok(parts)
}

/// Write every named table as `<stub>_<table>.parquet` under `dir`.
pub fn write_outputs(
    tables: &[(&str, &RecordBatch)],
    dir: &Path,
    stub: &str,
    partition_key: Option<&str>,
    codec: Codec,
) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    for (name, batch) in tables {
        let path = dir.join(format!("{stub}_{name}.parquet"));
        write_table(batch, &path, partition_key, codec)?;
    }
    Ok(())
}
