pub mod panel;
pub mod retail;
pub mod revise;

use anyhow::{bail, Context, Result};
use arrow::{compute, record_batch::RecordBatch};
use std::collections::HashSet;
use tracing::info;

use crate::catalog::FileCatalog;
use crate::join::{dedupe_by_keys, sort_by, Precedence};
use crate::table::{read_tsv, Predicate, ReadOptions};

/// Selection over the product master, applied as a read predicate so the
/// out-of-scope rows never materialize.
#[derive(Debug, Default, Clone)]
pub struct ProductFilter {
    pub upcs: Option<HashSet<u64>>,
    pub keep_groups: Option<Vec<u64>>,
    pub drop_groups: Option<Vec<u64>>,
    pub keep_modules: Option<Vec<u64>>,
    pub drop_modules: Option<Vec<u64>>,
}

impl ProductFilter {
    pub fn predicate(&self) -> Option<Predicate> {
        let mut preds = Vec::new();
        if let Some(upcs) = &self.upcs {
            preds.push(Predicate::InU64 {
                column: "upc".to_string(),
                values: upcs.clone(),
            });
        }
        if let Some(keep) = &self.keep_groups {
            preds.push(Predicate::in_u64("product_group_code", keep.iter().copied()));
        }
        if let Some(drop) = &self.drop_groups {
            preds.push(Predicate::NotInU64 {
                column: "product_group_code".to_string(),
                values: drop.iter().copied().collect(),
            });
        }
        if let Some(keep) = &self.keep_modules {
            preds.push(Predicate::in_u64(
                "product_module_code",
                keep.iter().copied(),
            ));
        }
        if let Some(drop) = &self.drop_modules {
            preds.push(Predicate::NotInU64 {
                column: "product_module_code".to_string(),
                values: drop.iter().copied().collect(),
            });
        }
        if preds.is_empty() {
            None
        } else {
            Some(Predicate::All(preds))
        }
    }
}

/// Concatenate per-file batches into one table. The set must be non-empty;
/// the first batch's schema governs and any divergence is a hard error.
pub(crate) fn concat_all(batches: Vec<RecordBatch>, what: &str) -> Result<RecordBatch> {
    let Some(first) = batches.first() else {
        bail!("no {what} batches to concatenate");
    };
    let schema = first.schema();
    compute::concat_batches(&schema, &batches)
        .with_context(|| format!("concatenating {what} tables"))
}

/// Read the product master from `Master_Files/Latest`, filtered and sorted
/// by upc. Master files ship latin-1 encoded; descriptor columns come back
/// dictionary-encoded.
pub fn read_products(catalog: &FileCatalog, filter: &ProductFilter) -> Result<RecordBatch> {
    let Some(path) = &catalog.products else {
        bail!(
            "could not find a valid products.tsv under Master_Files/Latest; \
             check the folder name and make sure it is unzipped"
        );
    };
    let predicate = filter.predicate();
    let opts = ReadOptions {
        predicate: predicate.as_ref(),
        latin1: true,
        dictionary: true,
        ..Default::default()
    };
    let batch = sort_by(&read_tsv(path, &opts)?, &["upc"])?;
    info!(rows = batch.num_rows(), "read products");
    Ok(batch)
}

/// Read the annual extra-characteristics files, restricted to `years` when
/// given, sorted by (upc, panel_year). Repeat (upc, version, year) entries
/// come from garbled source data rather than real version changes, so the
/// surviving occurrence is a caller choice.
pub fn read_extra(
    catalog: &FileCatalog,
    years: Option<&[u16]>,
    upcs: Option<&HashSet<u64>>,
    precedence: Precedence,
) -> Result<RecordBatch> {
    let predicate = upcs.map(|set| Predicate::InU64 {
        column: "upc".to_string(),
        values: set.clone(),
    });
    let mut batches = Vec::new();
    for (year, path) in &catalog.extra {
        if let Some(years) = years {
            if !years.contains(year) {
                continue;
            }
        }
        let opts = ReadOptions {
            predicate: predicate.as_ref(),
            ..Default::default()
        };
        batches.push(read_tsv(path, &opts)?);
    }
    let batch = concat_all(batches, "extra-characteristics")?;
    let batch = dedupe_by_keys(&batch, &["upc", "upc_ver_uc", "panel_year"], precedence)?;
    let batch = sort_by(&batch, &["upc", "panel_year"])?;
    info!(rows = batch.num_rows(), "read extra characteristics");
    Ok(batch)
}

/// Read the retailers master (panel deliveries only).
pub fn read_retailers(catalog: &FileCatalog) -> Result<RecordBatch> {
    let Some(path) = &catalog.retailers else {
        bail!(
            "could not find a valid retailers.tsv under Master_Files/Latest; \
             check the folder name and make sure it is unzipped"
        );
    };
    let opts = ReadOptions {
        latin1: true,
        dictionary: true,
        ..Default::default()
    };
    let batch = read_tsv(path, &opts)?;
    info!(rows = batch.num_rows(), "read retailers");
    Ok(batch)
}

/// Read the brand-variations master (panel deliveries only).
pub fn read_variations(catalog: &FileCatalog) -> Result<RecordBatch> {
    let Some(path) = &catalog.variations else {
        bail!(
            "could not find a valid brand_variations.tsv under Master_Files/Latest; \
             check the folder name and make sure it is unzipped"
        );
    };
    let opts = ReadOptions {
        latin1: true,
        ..Default::default()
    };
    let batch = read_tsv(path, &opts)?;
    info!(rows = batch.num_rows(), "read brand variations");
    Ok(batch)
}
