//! Key-aligned corrections shipped after the main delivery: the
//! `Revised_Panelist_Files` tree overwrites matching rows in place, and the
//! `OpenIssues_SupplementFiles` tree patches known data problems.

use anyhow::{anyhow, Context, Result};
use arrow::{
    array::{Array, ArrayRef, BooleanArray, Int32Array, StringArray, UInt32Array},
    compute::{self, kernels::zip::zip},
    datatypes::{DataType, Field},
    record_batch::RecordBatch,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::catalog::convention::{year_of, YearConvention};
use crate::catalog::FileCatalog;
use crate::table::{append_column, read_tsv, replace_column, ReadOptions};

/// Per-row key over the named columns, rendered as text so numeric and
/// descriptor keys compose. A null in any key column makes the key null.
fn text_keys(batch: &RecordBatch, keys: &[&str]) -> Result<Vec<Option<String>>> {
    let mut cols = Vec::with_capacity(keys.len());
    for key in keys {
        let col = batch
            .column_by_name(key)
            .ok_or_else(|| anyhow!("key column `{key}` not present"))?;
        let cast = compute::cast(col, &DataType::Utf8)
            .with_context(|| format!("rendering key column `{key}`"))?;
        let strings = cast
            .as_any()
            .downcast_ref::<StringArray>()
            .ok_or_else(|| anyhow!("key column `{key}` did not render as text"))?
            .clone();
        cols.push(strings);
    }
    let mut out = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        let mut parts = Vec::with_capacity(cols.len());
        let mut valid = true;
        for c in &cols {
            if c.is_null(i) {
                valid = false;
                break;
            }
            parts.push(c.value(i).to_string());
        }
        out.push(valid.then(|| parts.join("\u{1f}")));
    }
    Ok(out)
}

/// Overwrite the rows of `base` whose key appears in `revision`, column by
/// column, keeping base rows and columns that the revision does not cover.
/// Returns the revised batch and the number of rows touched.
pub fn overwrite_matching(
    base: &RecordBatch,
    revision: &RecordBatch,
    keys: &[&str],
) -> Result<(RecordBatch, usize)> {
    if revision.num_rows() == 0 || base.num_rows() == 0 {
        return Ok((base.clone(), 0));
    }
    let mut index: HashMap<String, u32> = HashMap::with_capacity(revision.num_rows());
    for (i, key) in text_keys(revision, keys)?.into_iter().enumerate() {
        if let Some(key) = key {
            // a later correction supersedes an earlier one
            index.insert(key, i as u32);
        }
    }

    let base_keys = text_keys(base, keys)?;
    let mut mask = Vec::with_capacity(base.num_rows());
    let mut rev_idx = Vec::with_capacity(base.num_rows());
    let mut touched = 0usize;
    for key in &base_keys {
        match key.as_ref().and_then(|k| index.get(k)) {
            Some(&j) => {
                mask.push(true);
                rev_idx.push(j);
                touched += 1;
            }
            None => {
                mask.push(false);
                rev_idx.push(0); // ignored under a false mask
            }
        }
    }
    if touched == 0 {
        return Ok((base.clone(), 0));
    }
    let mask = BooleanArray::from(mask);
    let rev_idx = UInt32Array::from(rev_idx);

    let rev_schema = revision.schema();
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(base.num_columns());
    for (field, col) in base.schema().fields().iter().zip(base.columns()) {
        if keys.contains(&field.name().as_str()) {
            columns.push(col.clone());
            continue;
        }
        let Some((rev_i, _)) = rev_schema.column_with_name(field.name()) else {
            columns.push(col.clone());
            continue;
        };
        let replacement = compute::take(revision.column(rev_i).as_ref(), &rev_idx, None)
            .with_context(|| format!("aligning revised column `{}`", field.name()))?;
        // dictionary columns zip through their plain value type
        let merged = if let DataType::Dictionary(_, value) = field.data_type() {
            let plain_base = compute::cast(col, value)?;
            let plain_rev = compute::cast(&replacement, value)?;
            let zipped = zip(&mask, &plain_rev, &plain_base)?;
            compute::cast(&zipped, field.data_type())?
        } else {
            let replacement = compute::cast(&replacement, field.data_type())
                .with_context(|| format!("casting revised column `{}`", field.name()))?;
            zip(&mask, &replacement, col)?
        };
        columns.push(merged);
    }
    let out = RecordBatch::try_new(base.schema(), columns)
        .context("rebuilding batch after overwrite")?;
    Ok((out, touched))
}

fn revised_files<'a>(catalog: &'a FileCatalog, token: &str) -> Vec<&'a PathBuf> {
    catalog
        .revised
        .iter()
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.contains(token))
                .unwrap_or(false)
        })
        .collect()
}

/// Fold the revised panelist files into the panelist table. Only revisions
/// for years still in scope apply; each file overwrites on the household and
/// year key.
pub fn apply_panelist_revisions(
    catalog: &FileCatalog,
    panelists: &RecordBatch,
) -> Result<RecordBatch> {
    let years = catalog.years();
    let mut out = panelists.clone();
    let mut touched = 0usize;
    for path in revised_files(catalog, "panelists") {
        let year = year_of(path, YearConvention::GrandparentDir)?;
        if !years.contains(&year) {
            continue;
        }
        let opts = ReadOptions {
            renames: super::panel::PANEL_RENAMES,
            ..Default::default()
        };
        let revision = read_tsv(path, &opts)?;
        let (next, n) = overwrite_matching(&out, &revision, &["household_code", "panel_year"])?;
        out = next;
        touched += n;
    }
    info!(rows = touched, "applied panelist revisions");
    Ok(out)
}

fn apply_master_revision(
    catalog: &FileCatalog,
    base: &RecordBatch,
    token: &str,
    keys: &[&str],
) -> Result<RecordBatch> {
    let mut out = base.clone();
    let mut touched = 0usize;
    for path in revised_files(catalog, token) {
        let opts = ReadOptions {
            latin1: true,
            ..Default::default()
        };
        let revision = read_tsv(path, &opts)?;
        let (next, n) = overwrite_matching(&out, &revision, keys)?;
        out = next;
        touched += n;
    }
    if touched > 0 {
        info!(rows = touched, table = token, "applied master revisions");
    }
    Ok(out)
}

pub fn apply_product_revisions(catalog: &FileCatalog, products: &RecordBatch) -> Result<RecordBatch> {
    apply_master_revision(catalog, products, "products", &["upc", "upc_ver_uc"])
}

pub fn apply_variation_revisions(
    catalog: &FileCatalog,
    variations: &RecordBatch,
) -> Result<RecordBatch> {
    apply_master_revision(
        catalog,
        variations,
        "brand_variations",
        &["brand_code_uc", "brand_descr"],
    )
}

pub fn apply_retailer_revisions(
    catalog: &FileCatalog,
    retailers: &RecordBatch,
) -> Result<RecordBatch> {
    apply_master_revision(catalog, retailers, "retailers", &["retailer_code"])
}

/// Patch the extra-characteristics flavor codes from the supplement shipped
/// under `OpenIssues_SupplementFiles`, keyed by upc, version and year.
pub fn apply_flavor_supplement(catalog: &FileCatalog, extra: &RecordBatch) -> Result<RecordBatch> {
    let mut out = extra.clone();
    let mut touched = 0usize;
    for issue in &catalog.issues {
        if !issue.issue.contains("FlavorCode") {
            continue;
        }
        // supplement files are tab-separated despite the .csv extension
        let supplement = read_tsv(&issue.path, &ReadOptions::default())?;
        let (next, n) =
            overwrite_matching(&out, &supplement, &["upc", "upc_ver_uc", "panel_year"])?;
        out = next;
        touched += n;
    }
    if touched > 0 {
        info!(rows = touched, "applied flavor supplement");
    }
    Ok(out)
}

/// Year a head-of-household birth supplement file covers: two digits at a
/// fixed offset of the stem (`hhb04_birth.csv` style names).
fn birth_file_year(path: &Path) -> Result<u16> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow!("{} has no usable filename", path.display()))?;
    let digits = stem
        .get(6..8)
        .ok_or_else(|| anyhow!("supplement name `{stem}` is too short to carry a year"))?;
    let two: u16 = digits
        .parse()
        .map_err(|_| anyhow!("supplement name `{stem}` carries no year digits"))?;
    Ok(2000 + two)
}

/// Birth year as an integer; the first four characters of the raw value.
/// A bare `-` means the household never reported one and maps to −1.
fn birth_year(raw: Option<&str>) -> Option<i32> {
    let raw = raw?.trim();
    if raw.is_empty() || raw == "-" {
        return Some(-1);
    }
    raw.get(..4).and_then(|y| y.parse().ok()).or(Some(-1))
}

const BIRTH_COLUMNS: &[&str] = &[
    "household_code",
    "panel_year",
    "male_head_birth",
    "female_head_birth",
];

/// Attach corrected head-of-household birth years from the supplement files
/// as `male_head_birth_revised` / `female_head_birth_revised`. Panelists
/// without a correction keep nulls in the new columns.
pub fn apply_birth_supplement(
    catalog: &FileCatalog,
    panelists: &RecordBatch,
) -> Result<RecordBatch> {
    let mut corrections: HashMap<String, (Option<i32>, Option<i32>)> = HashMap::new();
    let years = catalog.years();
    let mut any = false;
    for issue in &catalog.issues {
        if !issue.issue.contains("maleHeadBirth") {
            continue;
        }
        let year = birth_file_year(&issue.path)?;
        if !years.contains(&year) {
            continue;
        }
        any = true;
        let batch = read_tsv(&issue.path, &ReadOptions::default())?;
        if batch.num_columns() < BIRTH_COLUMNS.len() {
            warn!(file = %issue.path.display(), "birth supplement has too few columns");
            continue;
        }
        // column meaning is positional; delivered headers vary
        let batch = rename_positional(&batch, BIRTH_COLUMNS)?;
        let keys = text_keys(&batch, &["household_code", "panel_year"])?;
        let male = text_column(&batch, "male_head_birth")?;
        let female = text_column(&batch, "female_head_birth")?;
        for (i, key) in keys.into_iter().enumerate() {
            if let Some(key) = key {
                let m = birth_year(male.is_valid(i).then(|| male.value(i)));
                let f = birth_year(female.is_valid(i).then(|| female.value(i)));
                corrections.insert(key, (m, f));
            }
        }
    }
    if !any {
        return Ok(panelists.clone());
    }

    let keys = text_keys(panelists, &["household_code", "panel_year"])?;
    let mut male = Vec::with_capacity(keys.len());
    let mut female = Vec::with_capacity(keys.len());
    for key in &keys {
        match key.as_ref().and_then(|k| corrections.get(k)) {
            Some((m, f)) => {
                male.push(*m);
                female.push(*f);
            }
            None => {
                male.push(None);
                female.push(None);
            }
        }
    }
    let out = append_column(
        panelists,
        Field::new("male_head_birth_revised", DataType::Int32, true),
        std::sync::Arc::new(Int32Array::from(male)),
    )?;
    append_column(
        &out,
        Field::new("female_head_birth_revised", DataType::Int32, true),
        std::sync::Arc::new(Int32Array::from(female)),
    )
}

fn rename_positional(batch: &RecordBatch, names: &[&str]) -> Result<RecordBatch> {
    let fields: Vec<Field> = batch
        .schema()
        .fields()
        .iter()
        .enumerate()
        .map(|(i, f)| {
            let name = names.get(i).copied().unwrap_or(f.name().as_str());
            Field::new(name, f.data_type().clone(), f.is_nullable())
        })
        .collect();
    RecordBatch::try_new(
        std::sync::Arc::new(arrow::datatypes::Schema::new(fields)),
        batch.columns().to_vec(),
    )
    .context("renaming supplement columns")
}

fn text_column(batch: &RecordBatch, name: &str) -> Result<StringArray> {
    let col = batch
        .column_by_name(name)
        .ok_or_else(|| anyhow!("column `{name}` not present"))?;
    let cast = compute::cast(col, &DataType::Utf8)
        .with_context(|| format!("rendering `{name}` as text"))?;
    cast.as_any()
        .downcast_ref::<StringArray>()
        .cloned()
        .ok_or_else(|| anyhow!("`{name}` did not render as text"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Float64Array, StringArray, UInt16Array, UInt32Array};
    use arrow::datatypes::Schema;
    use std::sync::Arc;

    fn panelists() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("household_code", DataType::UInt32, true),
            Field::new("panel_year", DataType::UInt16, true),
            Field::new("Projection_Factor", DataType::UInt32, true),
            Field::new("region", DataType::Utf8, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(UInt32Array::from(vec![1, 2, 3])) as ArrayRef,
                Arc::new(UInt16Array::from(vec![2011, 2011, 2012])) as ArrayRef,
                Arc::new(UInt32Array::from(vec![100, 200, 300])) as ArrayRef,
                Arc::new(StringArray::from(vec!["east", "west", "east"])) as ArrayRef,
            ],
        )
        .unwrap()
    }

    #[test]
    fn overwrite_touches_only_matching_rows() -> Result<()> {
        let base = panelists();
        let schema = Arc::new(Schema::new(vec![
            Field::new("household_code", DataType::UInt32, true),
            Field::new("panel_year", DataType::UInt16, true),
            Field::new("Projection_Factor", DataType::UInt32, true),
        ]));
        let revision = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(UInt32Array::from(vec![2])) as ArrayRef,
                Arc::new(UInt16Array::from(vec![2011])) as ArrayRef,
                Arc::new(UInt32Array::from(vec![999])) as ArrayRef,
            ],
        )
        .unwrap();

        let (out, touched) =
            overwrite_matching(&base, &revision, &["household_code", "panel_year"])?;
        assert_eq!(touched, 1);
        let weights = out
            .column_by_name("Projection_Factor")
            .unwrap()
            .as_any()
            .downcast_ref::<UInt32Array>()
            .unwrap()
            .clone();
        let got: Vec<u32> = weights.iter().flatten().collect();
        assert_eq!(got, vec![100, 999, 300]);
        // columns the revision does not carry stay put
        let regions = out
            .column_by_name("region")
            .unwrap()
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap()
            .clone();
        assert_eq!(regions.value(1), "west");
        Ok(())
    }

    #[test]
    fn empty_revision_is_a_no_op() -> Result<()> {
        let base = panelists();
        let revision = RecordBatch::new_empty(base.schema());
        let (out, touched) =
            overwrite_matching(&base, &revision, &["household_code", "panel_year"])?;
        assert_eq!(touched, 0);
        assert_eq!(out.num_rows(), 3);
        Ok(())
    }

    #[test]
    fn text_keyed_overwrite_works() -> Result<()> {
        let schema = Arc::new(Schema::new(vec![
            Field::new("brand_code_uc", DataType::UInt32, true),
            Field::new("brand_descr", DataType::Utf8, true),
            Field::new("share", DataType::Float64, true),
        ]));
        let base = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(UInt32Array::from(vec![7, 7])) as ArrayRef,
                Arc::new(StringArray::from(vec!["COLA", "DIET COLA"])) as ArrayRef,
                Arc::new(Float64Array::from(vec![0.5, 0.5])) as ArrayRef,
            ],
        )
        .unwrap();
        let revision = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(UInt32Array::from(vec![7])) as ArrayRef,
                Arc::new(StringArray::from(vec!["DIET COLA"])) as ArrayRef,
                Arc::new(Float64Array::from(vec![0.9])) as ArrayRef,
            ],
        )
        .unwrap();
        let (out, touched) =
            overwrite_matching(&base, &revision, &["brand_code_uc", "brand_descr"])?;
        assert_eq!(touched, 1);
        let shares = out
            .column_by_name("share")
            .unwrap()
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap()
            .clone();
        assert_eq!(shares.value(0), 0.5);
        assert_eq!(shares.value(1), 0.9);
        Ok(())
    }

    #[test]
    fn flavor_supplement_overwrites_extra_rows() -> Result<()> {
        use crate::catalog::{resolve, testfs::write, DatasetKind};
        use crate::join::Precedence;
        let dir = tempfile::TempDir::new()?;
        let root = dir.path();
        write(
            root,
            "2011/Annual_Files/panelists_2011.tsv",
            "Household_Cd\tPanel_Year\tProjection_Factor\n1\t2011\t100\n",
        );
        write(
            root,
            "2011/Annual_Files/products_extra_2011.tsv",
            "upc\tupc_ver_uc\tpanel_year\tflavor_code\n\
             111\t1\t2011\t5\n\
             222\t1\t2011\t6\n",
        );
        write(root, "Master_Files/Latest/products.tsv", "upc\n");
        write(
            root,
            "OpenIssues_SupplementFiles/ExtraAttributes_FlavorCode/Latest_Flavor_2010.csv",
            "upc\tupc_ver_uc\tpanel_year\tflavor_code\n111\t1\t2011\t99\n",
        );
        let cat = resolve(root, DatasetKind::Panel)?;
        let extra = crate::pipeline::read_extra(&cat, None, None, Precedence::LastWins)?;
        let patched = apply_flavor_supplement(&cat, &extra)?;
        let flavors: Vec<u64> = crate::table::u64_values(&patched, "flavor_code")?
            .iter()
            .flatten()
            .collect();
        assert_eq!(flavors, vec![99, 6]);
        Ok(())
    }

    #[test]
    fn birth_supplement_attaches_revised_columns() -> Result<()> {
        use crate::catalog::{resolve, testfs::write, DatasetKind};
        let dir = tempfile::TempDir::new()?;
        let root = dir.path();
        write(
            root,
            "2011/Annual_Files/panelists_2011.tsv",
            "Household_Cd\tPanel_Year\tProjection_Factor\n\
             1\t2011\t100\n\
             2\t2011\t50\n",
        );
        write(root, "Master_Files/Latest/products.tsv", "upc\n");
        write(
            root,
            "OpenIssues_SupplementFiles/Panelist_maleHeadBirth_femaleHeadBirth/births11_heads.csv",
            "Household_Cd\tPanel_Year\tMale_Birth\tFemale_Birth\n1\t2011\t1975-06\t-\n",
        );
        let cat = resolve(root, DatasetKind::Panel)?;
        let opts = ReadOptions {
            renames: crate::pipeline::panel::PANEL_RENAMES,
            ..Default::default()
        };
        let panelists = read_tsv(&cat.panelists[&2011], &opts)?;
        let out = apply_birth_supplement(&cat, &panelists)?;

        let male = out
            .column_by_name("male_head_birth_revised")
            .unwrap()
            .as_any()
            .downcast_ref::<Int32Array>()
            .unwrap()
            .clone();
        let female = out
            .column_by_name("female_head_birth_revised")
            .unwrap()
            .as_any()
            .downcast_ref::<Int32Array>()
            .unwrap()
            .clone();
        assert_eq!(male.value(0), 1975);
        // never-reported heads carry the sentinel, uncorrected households a null
        assert_eq!(female.value(0), -1);
        assert!(male.is_null(1));
        assert!(female.is_null(1));
        Ok(())
    }

    #[test]
    fn birth_year_parsing() {
        assert_eq!(birth_year(Some("1975-06")), Some(1975));
        assert_eq!(birth_year(Some("1950")), Some(1950));
        assert_eq!(birth_year(Some("-")), Some(-1));
        assert_eq!(birth_year(Some("")), Some(-1));
        assert_eq!(birth_year(None), None);
    }

    #[test]
    fn birth_file_year_from_name() -> Result<()> {
        let p = std::path::PathBuf::from("OpenIssues_SupplementFiles/x/births11_heads.csv");
        assert_eq!(birth_file_year(&p)?, 2011);
        Ok(())
    }
}
