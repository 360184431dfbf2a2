use anyhow::{anyhow, Result};
use arrow::{
    array::UInt16Array,
    datatypes::{DataType, Field},
    record_batch::RecordBatch,
};
use std::{collections::HashSet, sync::Arc};
use tracing::info;

use super::revise::{
    apply_birth_supplement, apply_flavor_supplement, apply_panelist_revisions,
    apply_product_revisions, apply_retailer_revisions, apply_variation_revisions,
};
use super::{concat_all, read_extra, read_products, read_retailers, read_variations, ProductFilter};
use crate::catalog::{FileCatalog, GeoFilter};
use crate::join::{join_many_to_one, Precedence};
use crate::table::{append_column, column_u64_set, read_tsv, Predicate, ReadOptions};
use crate::util::timed;

/// The panel files spell the household key and year in their own casing;
/// everything downstream uses the movement-side names.
pub(super) const PANEL_RENAMES: &[(&str, &str)] =
    &[("Household_Cd", "household_code"), ("Panel_Year", "panel_year")];

/// Knobs for one household-panel run.
#[derive(Debug, Clone)]
pub struct PanelOptions {
    pub geo: GeoFilter,
    pub products: ProductFilter,
    pub extra_precedence: Precedence,
    /// Fold in `Revised_Panelist_Files` and the open-issue supplements.
    pub apply_revisions: bool,
    /// Drop purchases of products outside the (filtered) master during the
    /// read instead of at the join.
    pub restrict_purchases_to_master: bool,
}

impl Default for PanelOptions {
    fn default() -> Self {
        PanelOptions {
            geo: GeoFilter::default(),
            products: ProductFilter::default(),
            extra_precedence: Precedence::default(),
            apply_revisions: true,
            restrict_purchases_to_master: true,
        }
    }
}

/// The cleaned, joined tables of one household-panel delivery.
#[derive(Debug)]
pub struct PanelTables {
    pub panelists: RecordBatch,
    pub trips: RecordBatch,
    pub purchases: RecordBatch,
    pub products: RecordBatch,
    pub variations: RecordBatch,
    pub retailers: RecordBatch,
    pub extra: Option<RecordBatch>,
}

impl PanelTables {
    pub fn named(&self) -> Vec<(&'static str, &RecordBatch)> {
        let mut out = vec![
            ("panelists", &self.panelists),
            ("trips", &self.trips),
            ("purchases", &self.purchases),
            ("products", &self.products),
            ("variations", &self.variations),
            ("retailers", &self.retailers),
        ];
        if let Some(extra) = &self.extra {
            out.push(("extra", extra));
        }
        out
    }
}

struct YearTables {
    panelists: RecordBatch,
    trips: RecordBatch,
    purchases: RecordBatch,
}

fn year_path<'a>(
    catalog: &'a FileCatalog,
    table: &str,
    year: u16,
) -> Result<&'a std::path::PathBuf> {
    let map = match table {
        "panelists" => &catalog.panelists,
        "trips" => &catalog.trips,
        _ => &catalog.purchases,
    };
    map.get(&year).ok_or_else(|| {
        anyhow!(
            "could not find a {table} file for {year} under {}",
            catalog.root.display()
        )
    })
}

/// One panel year, reduced in isolation: the kept panelists bound the trips,
/// and the kept trips bound the purchases.
fn read_year(
    catalog: &FileCatalog,
    year: u16,
    geo: &GeoFilter,
    master_upcs: Option<&HashSet<u64>>,
) -> Result<YearTables> {
    let panelist_pred = geo.panelist_predicate();
    let opts = ReadOptions {
        predicate: Some(&panelist_pred),
        renames: PANEL_RENAMES,
        dictionary: true,
        ..Default::default()
    };
    let panelists = read_tsv(year_path(catalog, "panelists", year)?, &opts)?;

    let households = Predicate::InU64 {
        column: "household_code".to_string(),
        values: column_u64_set(&panelists, "household_code")?,
    };
    let opts = ReadOptions {
        predicate: Some(&households),
        ..Default::default()
    };
    let trips = read_tsv(year_path(catalog, "trips", year)?, &opts)?;

    let mut preds = vec![Predicate::InU64 {
        column: "trip_code_uc".to_string(),
        values: column_u64_set(&trips, "trip_code_uc")?,
    }];
    if let Some(upcs) = master_upcs {
        preds.push(Predicate::InU64 {
            column: "upc".to_string(),
            values: upcs.clone(),
        });
    }
    let purchase_pred = Predicate::All(preds);
    let opts = ReadOptions {
        predicate: Some(&purchase_pred),
        ..Default::default()
    };
    let purchases = read_tsv(year_path(catalog, "purchases", year)?, &opts)?;

    // purchase files do not carry their year; pin it from the directory
    let years = UInt16Array::from(vec![year; purchases.num_rows()]);
    let purchases = append_column(
        &purchases,
        Field::new("panel_year", DataType::UInt16, true),
        Arc::new(years),
    )?;

    info!(
        year,
        panelists = panelists.num_rows(),
        trips = trips.num_rows(),
        purchases = purchases.num_rows(),
        "read panel year"
    );
    Ok(YearTables {
        panelists,
        trips,
        purchases,
    })
}

/// Run the whole panel pipeline over an already-filtered catalog.
#[tracing::instrument(skip_all)]
pub fn run(catalog: &FileCatalog, opts: &PanelOptions) -> Result<PanelTables> {
    let mut products = timed("read products", || read_products(catalog, &opts.products))?;
    let mut variations = timed("read variations", || read_variations(catalog))?;
    let mut retailers = timed("read retailers", || read_retailers(catalog))?;

    let master_upcs = if opts.restrict_purchases_to_master {
        Some(column_u64_set(&products, "upc")?)
    } else {
        None
    };

    let mut panelist_years = Vec::new();
    let mut trip_years = Vec::new();
    let mut purchase_years = Vec::new();
    for year in catalog.years() {
        let tables = timed(&format!("read panel {year}"), || {
            read_year(catalog, year, &opts.geo, master_upcs.as_ref())
        })?;
        panelist_years.push(tables.panelists);
        trip_years.push(tables.trips);
        purchase_years.push(tables.purchases);
    }
    let mut panelists = concat_all(panelist_years, "panelists")?;
    let trips = concat_all(trip_years, "trips")?;
    let purchases = concat_all(purchase_years, "purchases")?;

    let mut extra = if catalog.extra.is_empty() {
        None
    } else {
        Some(read_extra(
            catalog,
            None,
            master_upcs.as_ref(),
            opts.extra_precedence,
        )?)
    };

    if opts.apply_revisions {
        panelists = apply_panelist_revisions(catalog, &panelists)?;
        panelists = apply_birth_supplement(catalog, &panelists)?;
        products = apply_product_revisions(catalog, &products)?;
        variations = apply_variation_revisions(catalog, &variations)?;
        retailers = apply_retailer_revisions(catalog, &retailers)?;
        if let Some(batch) = &extra {
            extra = Some(apply_flavor_supplement(catalog, batch)?);
        }
    }

    // revisions land before any attribute propagates through a join
    let purchases = join_many_to_one(&purchases, &products, &["upc", "upc_ver_uc"], "products")?;
    let purchases = join_many_to_one(&purchases, &trips, &["trip_code_uc"], "trips")?;
    let purchases = join_many_to_one(
        &purchases,
        &panelists,
        &["household_code", "panel_year"],
        "panelists",
    )?;

    info!(
        purchases = purchases.num_rows(),
        panelists = panelists.num_rows(),
        "panel pipeline finished"
    );
    Ok(PanelTables {
        panelists,
        trips,
        purchases,
        products,
        variations,
        retailers,
        extra,
    })
}
