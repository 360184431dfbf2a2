use anyhow::{bail, Context, Result};
use arrow::{
    compute,
    csv::ReaderBuilder,
    datatypes::{DataType, Field, Schema, SchemaRef},
    record_batch::RecordBatch,
};
use std::{fs, io::Cursor, path::Path, sync::Arc};
use tracing::debug;

use super::predicate::Predicate;
use super::schema::{column_type, DICT_COLUMNS};

const BATCH_SIZE: usize = 65_536;

/// Options for a single typed read.
#[derive(Default)]
pub struct ReadOptions<'a> {
    /// Restrict materialized columns; an absent requested column is an error.
    pub columns: Option<&'a [&'a str]>,
    /// Row filter applied batch-by-batch during the read.
    pub predicate: Option<&'a Predicate>,
    /// Master files ship latin-1 encoded; everything else is plain UTF-8.
    pub latin1: bool,
    /// Column renames applied after the read, `(from, to)`.
    pub renames: &'a [(&'a str, &'a str)],
    /// Dictionary-encode the declared low-cardinality text columns.
    pub dictionary: bool,
}

/// Read a tab-separated file into a single record batch using the declared
/// column types. The header row drives the schema; unknown columns come back
/// as plain text. Values that fail their declared type are a hard error.
pub fn read_tsv(path: &Path, opts: &ReadOptions) -> Result<RecordBatch> {
    let bytes = fs::read(path).with_context(|| format!("opening {}", path.display()))?;
    let bytes = if opts.latin1 {
        decode_latin1(bytes)
    } else {
        bytes
    };

    let header = header_names(&bytes, path)?;
    let fields: Vec<Field> = header
        .iter()
        .map(|n| Field::new(n, column_type(n), true))
        .collect();
    let schema = Arc::new(Schema::new(fields));

    let projection = match opts.columns {
        Some(cols) => Some(projection_indices(&header, cols, path)?),
        None => None,
    };

    let mut builder = ReaderBuilder::new(schema.clone())
        .with_header(true)
        .with_delimiter(b'\t')
        .with_batch_size(BATCH_SIZE);
    if let Some(idx) = &projection {
        builder = builder.with_projection(idx.clone());
    }
    let reader = builder
        .build(Cursor::new(bytes))
        .with_context(|| format!("creating reader for {}", path.display()))?;

    let mut batches = Vec::new();
    for batch in reader {
        let batch = batch.with_context(|| format!("reading {}", path.display()))?;
        let batch = match opts.predicate {
            Some(p) => {
                let mask = p
                    .evaluate(&batch)
                    .with_context(|| format!("filtering {}", path.display()))?;
                compute::filter_record_batch(&batch, &mask)?
            }
            None => batch,
        };
        batches.push(batch);
    }

    let out_schema: SchemaRef = match batches.first() {
        Some(b) => b.schema(),
        None => match &projection {
            Some(idx) => Arc::new(schema.project(idx)?),
            None => schema,
        },
    };
    let mut out = compute::concat_batches(&out_schema, &batches)
        .with_context(|| format!("concatenating batches from {}", path.display()))?;

    if !opts.renames.is_empty() {
        out = rename_columns(&out, opts.renames)?;
    }
    if opts.dictionary {
        out = dict_encode(&out, DICT_COLUMNS)?;
    }

    debug!(rows = out.num_rows(), file = %path.display(), "read table");
    Ok(out)
}

/// Header row of the file, trimmed, with any UTF-8 BOM stripped.
fn header_names(bytes: &[u8], path: &Path) -> Result<Vec<String>> {
    let first = bytes
        .split(|&b| b == b'\n')
        .next()
        .unwrap_or_default();
    let line = std::str::from_utf8(first)
        .with_context(|| format!("header of {} is not valid UTF-8", path.display()))?
        .trim_end_matches('\r')
        .trim_start_matches('\u{feff}');
    if line.is_empty() {
        bail!("{} has no header row", path.display());
    }
    Ok(line.split('\t').map(|s| s.trim().to_string()).collect())
}

fn projection_indices(header: &[String], cols: &[&str], path: &Path) -> Result<Vec<usize>> {
    cols.iter()
        .map(|c| {
            header.iter().position(|h| h == c).ok_or_else(|| {
                anyhow::anyhow!("column `{c}` not present in {}", path.display())
            })
        })
        .collect()
}

/// Latin-1 decodes byte-per-char, so ASCII content passes through unchanged.
/// High bytes always mean latin-1 here, even when they happen to form valid
/// UTF-8 sequences.
fn decode_latin1(bytes: Vec<u8>) -> Vec<u8> {
    if bytes.is_ascii() {
        return bytes;
    }
    bytes
        .iter()
        .map(|&b| b as char)
        .collect::<String>()
        .into_bytes()
}

fn rename_columns(batch: &RecordBatch, renames: &[(&str, &str)]) -> Result<RecordBatch> {
    let fields: Vec<Field> = batch
        .schema()
        .fields()
        .iter()
        .map(|f| {
            let name = renames
                .iter()
                .find(|(from, _)| from == f.name())
                .map(|(_, to)| to.to_string())
                .unwrap_or_else(|| f.name().clone());
            Field::new(&name, f.data_type().clone(), f.is_nullable())
        })
        .collect();
    RecordBatch::try_new(Arc::new(Schema::new(fields)), batch.columns().to_vec())
        .context("renaming columns")
}

fn dict_encode(batch: &RecordBatch, columns: &[&str]) -> Result<RecordBatch> {
    let dict_type = DataType::Dictionary(Box::new(DataType::Int32), Box::new(DataType::Utf8));
    let mut out = batch.clone();
    for name in columns {
        let Some(idx) = out.schema().index_of(name).ok() else {
            continue;
        };
        if out.schema().field(idx).data_type() != &DataType::Utf8 {
            continue;
        }
        let encoded = compute::cast(out.column(idx), &dict_type)
            .with_context(|| format!("dictionary-encoding `{name}`"))?;
        out = super::replace_column(
            &out,
            name,
            Field::new(*name, dict_type.clone(), true),
            encoded,
        )?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Float64Array, UInt32Array, UInt64Array};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_tsv(content: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn reads_declared_types() -> Result<()> {
        let f = write_tsv("store_code_uc\tupc\tprice\n100\t111\t9.99\n200\t222\t1.50\n");
        let batch = read_tsv(f.path(), &ReadOptions::default())?;
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(
            batch.schema().field_with_name("upc")?.data_type(),
            &DataType::UInt64
        );
        let prices = batch
            .column_by_name("price")
            .unwrap()
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap()
            .clone();
        assert_eq!(prices.value(0), 9.99);
        Ok(())
    }

    #[test]
    fn projection_restricts_columns() -> Result<()> {
        let f = write_tsv("store_code_uc\tupc\tprice\n100\t111\t9.99\n");
        let opts = ReadOptions {
            columns: Some(&["upc", "price"]),
            ..Default::default()
        };
        let batch = read_tsv(f.path(), &opts)?;
        assert_eq!(batch.num_columns(), 2);
        assert_eq!(batch.schema().field(0).name(), "upc");
        Ok(())
    }

    #[test]
    fn missing_projected_column_is_an_error() {
        let f = write_tsv("store_code_uc\tupc\n100\t111\n");
        let opts = ReadOptions {
            columns: Some(&["week_end"]),
            ..Default::default()
        };
        assert!(read_tsv(f.path(), &opts).is_err());
    }

    #[test]
    fn predicate_filters_during_read() -> Result<()> {
        let f = write_tsv("store_code_uc\tupc\n100\t111\n200\t222\n300\t333\n");
        let pred = Predicate::in_u64("store_code_uc", [100, 300]);
        let opts = ReadOptions {
            predicate: Some(&pred),
            ..Default::default()
        };
        let batch = read_tsv(f.path(), &opts)?;
        let stores = batch
            .column_by_name("store_code_uc")
            .unwrap()
            .as_any()
            .downcast_ref::<UInt32Array>()
            .unwrap()
            .clone();
        let got: Vec<u32> = stores.iter().flatten().collect();
        assert_eq!(got, vec![100, 300]);
        Ok(())
    }

    #[test]
    fn out_of_range_value_is_a_hard_error() {
        // upc_ver_uc is u8; 999 does not fit.
        let f = write_tsv("upc\tupc_ver_uc\n111\t999\n");
        assert!(read_tsv(f.path(), &ReadOptions::default()).is_err());
    }

    #[test]
    fn malformed_value_is_a_hard_error() {
        let f = write_tsv("store_code_uc\tupc\nabc\t111\n");
        assert!(read_tsv(f.path(), &ReadOptions::default()).is_err());
    }

    #[test]
    fn renames_apply_after_read() -> Result<()> {
        let f = write_tsv("Household_Cd\tPanel_Year\n42\t2011\n");
        let opts = ReadOptions {
            renames: &[("Household_Cd", "household_code"), ("Panel_Year", "panel_year")],
            ..Default::default()
        };
        let batch = read_tsv(f.path(), &opts)?;
        assert!(batch.column_by_name("household_code").is_some());
        assert!(batch.column_by_name("panel_year").is_some());
        Ok(())
    }

    #[test]
    fn declared_text_columns_get_dictionary_encoded() -> Result<()> {
        let f = write_tsv("upc\tsize1_units\n1\tOZ\n2\tOZ\n3\tCT\n");
        let opts = ReadOptions {
            dictionary: true,
            ..Default::default()
        };
        let batch = read_tsv(f.path(), &opts)?;
        assert!(matches!(
            batch.schema().field_with_name("size1_units")?.data_type(),
            DataType::Dictionary(_, _)
        ));
        Ok(())
    }

    #[test]
    fn latin1_master_files_decode() -> Result<()> {
        let mut f = NamedTempFile::new().unwrap();
        // "café" in latin-1: 0xE9 is not valid UTF-8 on its own.
        f.write_all(b"upc\tbrand_descr\n1\tcaf\xe9\n").unwrap();
        let opts = ReadOptions {
            latin1: true,
            ..Default::default()
        };
        let batch = read_tsv(f.path(), &opts)?;
        let brands = batch
            .column_by_name("brand_descr")
            .unwrap()
            .as_any()
            .downcast_ref::<arrow::array::StringArray>()
            .unwrap()
            .clone();
        assert_eq!(brands.value(0), "café");
        Ok(())
    }

    #[test]
    fn latin1_high_bytes_never_pass_as_utf8() -> Result<()> {
        let mut f = NamedTempFile::new().unwrap();
        // 0xC3 0xA9 is "é" in UTF-8 but two latin-1 characters
        f.write_all(b"upc\tbrand_descr\n1\t\xc3\xa9\n").unwrap();
        let opts = ReadOptions {
            latin1: true,
            ..Default::default()
        };
        let batch = read_tsv(f.path(), &opts)?;
        let brands = batch
            .column_by_name("brand_descr")
            .unwrap()
            .as_any()
            .downcast_ref::<arrow::array::StringArray>()
            .unwrap()
            .clone();
        assert_eq!(brands.value(0), "Ã©");
        Ok(())
    }

    #[test]
    fn empty_file_yields_empty_batch_with_schema() -> Result<()> {
        let f = write_tsv("upc\tprice\n");
        let batch = read_tsv(f.path(), &ReadOptions::default())?;
        assert_eq!(batch.num_rows(), 0);
        assert_eq!(batch.num_columns(), 2);
        let _ = batch
            .column_by_name("upc")
            .unwrap()
            .as_any()
            .downcast_ref::<UInt64Array>()
            .unwrap();
        Ok(())
    }
}
