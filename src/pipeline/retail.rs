use anyhow::{anyhow, bail, Result};
use arrow::{
    array::{Date32Array, Float64Array, Int16Array, Scalar, UInt16Array},
    compute::{self, kernels::zip::zip},
    datatypes::{DataType, Field},
    record_batch::RecordBatch,
};
use chrono::{Datelike, NaiveDate};
use std::{collections::HashSet, sync::Arc};
use tracing::info;

use super::{concat_all, read_extra, read_products, ProductFilter};
use crate::catalog::{FileCatalog, GeoFilter};
use crate::join::{join_many_to_one, Precedence};
use crate::table::{
    append_column, column_u64_set, read_tsv, replace_column, u64_values, Predicate, ReadOptions,
};
use crate::util::timed;

const SALES_COLUMNS: &[&str] = &["store_code_uc", "upc", "week_end", "units", "prmult", "price"];
const PROMO_COLUMNS: &[&str] = &["feature", "display"];

/// Knobs for one retail-scanner run.
#[derive(Debug, Clone)]
pub struct RetailOptions {
    pub geo: GeoFilter,
    pub products: ProductFilter,
    pub include_promo: bool,
    pub extra_precedence: Precedence,
}

impl Default for RetailOptions {
    fn default() -> Self {
        RetailOptions {
            geo: GeoFilter::default(),
            products: ProductFilter::default(),
            include_promo: true,
            extra_precedence: Precedence::default(),
        }
    }
}

/// The cleaned, joined tables of one retail-scanner delivery.
#[derive(Debug)]
pub struct RetailTables {
    pub sales: RecordBatch,
    pub stores: RecordBatch,
    pub versions: RecordBatch,
    pub products: RecordBatch,
    pub extra: Option<RecordBatch>,
}

impl RetailTables {
    pub fn named(&self) -> Vec<(&'static str, &RecordBatch)> {
        let mut out = vec![
            ("sales", &self.sales),
            ("stores", &self.stores),
            ("versions", &self.versions),
            ("products", &self.products),
        ];
        if let Some(extra) = &self.extra {
            out.push(("extra", extra));
        }
        out
    }
}

/// Run the whole retail pipeline over an already-filtered catalog.
#[tracing::instrument(skip_all)]
pub fn run(catalog: &FileCatalog, opts: &RetailOptions) -> Result<RetailTables> {
    let stores = timed("read stores", || read_stores(catalog, &opts.geo))?;
    let versions = timed("read versions", || read_versions(catalog))?;
    let sales = read_sales(catalog, &stores, opts.include_promo)?;
    let sales = timed("clean sales", || clean_sales(&sales))?;
    let sales = join_many_to_one(&sales, &versions, &["upc", "panel_year"], "versions")?;
    let sales = join_many_to_one(&sales, &stores, &["store_code_uc", "panel_year"], "stores")?;

    // stores that sold nothing in scope carry no information
    let live = Predicate::InU64 {
        column: "store_code_uc".to_string(),
        values: column_u64_set(&sales, "store_code_uc")?,
    };
    let mask = live.evaluate(&stores)?;
    let stores = compute::filter_record_batch(&stores, &mask)?;

    let products = timed("read products", || read_products(catalog, &opts.products))?;
    let extra = if catalog.extra.is_empty() {
        None
    } else {
        Some(read_extra(
            catalog,
            None,
            opts.products.upcs.as_ref(),
            opts.extra_precedence,
        )?)
    };
    info!(
        sales = sales.num_rows(),
        stores = stores.num_rows(),
        "retail pipeline finished"
    );
    Ok(RetailTables {
        sales,
        stores,
        versions,
        products,
        extra,
    })
}

/// Read and stack the annual stores files, keyed by `panel_year`, with any
/// geography selection applied during the read.
pub fn read_stores(catalog: &FileCatalog, geo: &GeoFilter) -> Result<RecordBatch> {
    if catalog.stores.is_empty() {
        bail!(
            "could not find stores files under {}/Annual_Files",
            catalog.root.display()
        );
    }
    let predicate = geo.store_predicate();
    let mut batches = Vec::new();
    for path in catalog.stores.values() {
        let opts = ReadOptions {
            predicate: predicate.as_ref(),
            renames: &[("year", "panel_year")],
            dictionary: true,
            ..Default::default()
        };
        batches.push(read_tsv(path, &opts)?);
    }
    concat_all(batches, "stores")
}

/// Read and stack the annual upc-version maps.
pub fn read_versions(catalog: &FileCatalog) -> Result<RecordBatch> {
    if catalog.versions.is_empty() {
        bail!(
            "could not find rms_versions files under {}/Annual_Files",
            catalog.root.display()
        );
    }
    let mut batches = Vec::new();
    for path in catalog.versions.values() {
        batches.push(read_tsv(path, &ReadOptions::default())?);
    }
    concat_all(batches, "rms_versions")
}

/// Stores active in a given year, per the (possibly geo-filtered) stores
/// table.
fn active_stores(stores: &RecordBatch, year: u16) -> Result<HashSet<u64>> {
    let pred = Predicate::in_u64("panel_year", [u64::from(year)]);
    let mask = pred.evaluate(stores)?;
    let for_year = compute::filter_record_batch(stores, &mask)?;
    column_u64_set(&for_year, "store_code_uc")
}

/// Read every in-scope movement file, restricted to the year's active stores
/// while the rows stream in. Years reduce independently and stack at the end.
fn read_sales(catalog: &FileCatalog, stores: &RecordBatch, include_promo: bool) -> Result<RecordBatch> {
    let mut columns: Vec<&str> = SALES_COLUMNS.to_vec();
    if include_promo {
        columns.extend_from_slice(PROMO_COLUMNS);
    }
    let mut year_batches = Vec::new();
    for (year, files) in &catalog.sales {
        let batch = timed(&format!("read sales {year}"), || {
            let predicate = Predicate::InU64 {
                column: "store_code_uc".to_string(),
                values: active_stores(stores, *year)?,
            };
            let mut batches = Vec::new();
            for file in files {
                let opts = ReadOptions {
                    columns: Some(&columns),
                    predicate: Some(&predicate),
                    ..Default::default()
                };
                batches.push(read_tsv(&file.path, &opts)?);
            }
            concat_all(batches, "movement")
        })?;
        year_batches.push(batch);
    }
    concat_all(year_batches, "sales")
}

/// Normalize the raw movement rows: derive `panel_year` from the packed date,
/// scale multipack prices to per-unit, convert `week_end` to a calendar date
/// and fill unrecorded promotions with the −1 sentinel.
pub fn clean_sales(batch: &RecordBatch) -> Result<RecordBatch> {
    let week = u64_values(batch, "week_end")?;

    // panel_year comes off the packed form, before the date conversion
    let panel_year: UInt16Array = week
        .iter()
        .map(|v| v.map(|x| (x / 10_000) as u16))
        .collect();
    let mut out = append_column(
        batch,
        Field::new("panel_year", DataType::UInt16, true),
        Arc::new(panel_year),
    )?;

    // multipack rows carry the bundle price; scale to per-unit
    let price = out
        .column_by_name("price")
        .and_then(|c| c.as_any().downcast_ref::<Float64Array>())
        .ok_or_else(|| anyhow!("sales table has no float `price` column"))?
        .clone();
    let prmult = u64_values(&out, "prmult")?;
    let unit_price: Float64Array = price
        .iter()
        .zip(prmult.iter())
        .map(|(p, m)| match (p, m) {
            (Some(p), Some(m)) if m > 1 => Some(p / m as f64),
            (p, _) => p,
        })
        .collect();
    out = replace_column(
        &out,
        "price",
        Field::new("price", DataType::Float64, true),
        Arc::new(unit_price),
    )?;

    let mut days: Vec<Option<i32>> = Vec::with_capacity(week.len());
    for v in week.iter() {
        days.push(match v {
            Some(packed) => Some(packed_date_days(packed)?),
            None => None,
        });
    }
    out = replace_column(
        &out,
        "week_end",
        Field::new("week_end", DataType::Date32, true),
        Arc::new(Date32Array::from(days)),
    )?;

    for name in PROMO_COLUMNS {
        out = fill_promo_sentinel(&out, name)?;
    }
    Ok(out)
}

const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// Days since the Unix epoch for a packed `yyyymmdd` value.
fn packed_date_days(packed: u64) -> Result<i32> {
    let (y, m, d) = (
        (packed / 10_000) as i32,
        (packed / 100 % 100) as u32,
        (packed % 100) as u32,
    );
    let date = NaiveDate::from_ymd_opt(y, m, d)
        .ok_or_else(|| anyhow!("`{packed}` is not a valid yyyymmdd date"))?;
    Ok(date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE)
}

/// Null promotion flags mean "not recorded", not "no promotion"; the −1
/// sentinel keeps that distinction through the integer column.
fn fill_promo_sentinel(batch: &RecordBatch, name: &str) -> Result<RecordBatch> {
    let Some(col) = batch.column_by_name(name) else {
        return Ok(batch.clone());
    };
    let mask = compute::is_null(col)?;
    let sentinel = Scalar::new(Int16Array::from(vec![-1i16]));
    let filled = zip(&mask, &sentinel, col)?;
    replace_column(batch, name, Field::new(name, DataType::Int16, true), filled)
}
