pub mod convention;
pub mod filter;

pub use filter::GeoFilter;

use anyhow::{bail, Context, Result};
use glob::glob;
use serde::Deserialize;
use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};
use tracing::info;

use convention::{group_of, module_of, year_of, YearConvention};

/// Which of the two Nielsen deliveries a root directory holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    Retail,
    Panel,
}

/// A movement file with the metadata its path encodes.
#[derive(Debug, Clone)]
pub struct SalesFile {
    pub path: PathBuf,
    pub year: u16,
    pub group: u32,
    pub module: u32,
}

/// An open-issue supplement file, tagged with its issue directory name.
#[derive(Debug, Clone)]
pub struct IssueFile {
    pub issue: String,
    pub path: PathBuf,
}

/// Every data file under a root directory, classified by role and annotated
/// with the year/group/module its name encodes. Built once per run; the
/// filter engine only ever narrows it.
#[derive(Debug, Clone)]
pub struct FileCatalog {
    pub root: PathBuf,
    pub kind: DatasetKind,
    pub products: Option<PathBuf>,
    pub variations: Option<PathBuf>,
    pub retailers: Option<PathBuf>,
    pub sales: BTreeMap<u16, Vec<SalesFile>>,
    pub stores: BTreeMap<u16, PathBuf>,
    pub versions: BTreeMap<u16, PathBuf>,
    pub extra: BTreeMap<u16, PathBuf>,
    pub panelists: BTreeMap<u16, PathBuf>,
    pub trips: BTreeMap<u16, PathBuf>,
    pub purchases: BTreeMap<u16, PathBuf>,
    pub revised: Vec<PathBuf>,
    pub issues: Vec<IssueFile>,
}

impl FileCatalog {
    fn empty(root: &Path, kind: DatasetKind) -> Self {
        FileCatalog {
            root: root.to_path_buf(),
            kind,
            products: None,
            variations: None,
            retailers: None,
            sales: BTreeMap::new(),
            stores: BTreeMap::new(),
            versions: BTreeMap::new(),
            extra: BTreeMap::new(),
            panelists: BTreeMap::new(),
            trips: BTreeMap::new(),
            purchases: BTreeMap::new(),
            revised: Vec::new(),
            issues: Vec::new(),
        }
    }

    /// Years still present after any filtering.
    pub fn years(&self) -> BTreeSet<u16> {
        match self.kind {
            DatasetKind::Retail => self.sales.keys().copied().collect(),
            DatasetKind::Panel => self
                .panelists
                .keys()
                .chain(self.trips.keys())
                .chain(self.purchases.keys())
                .copied()
                .collect(),
        }
    }

    pub fn all_groups(&self) -> BTreeSet<u32> {
        self.sales
            .values()
            .flatten()
            .map(|f| f.group)
            .collect()
    }

    pub fn all_modules(&self) -> BTreeSet<u32> {
        self.sales
            .values()
            .flatten()
            .map(|f| f.module)
            .collect()
    }
}

/// Recursively enumerate data files under `root`, skipping OS artifacts
/// (names with the `._` hidden-file prefix).
pub fn discover(root: &Path) -> Result<Vec<PathBuf>> {
    let pattern = format!("{}/**/*.?sv", root.display());
    let mut files: Vec<PathBuf> = glob(&pattern)
        .context("invalid glob pattern for discovery")?
        .filter_map(|e| e.ok())
        .filter(|p| p.is_file())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| !n.starts_with("._"))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    if files.is_empty() {
        bail!(
            "found no data files under {}; check the folder name and make sure it is unzipped",
            root.display()
        );
    }
    Ok(files)
}

fn has_component(path: &Path, name: &str) -> bool {
    path.components().any(|c| c.as_os_str() == name)
}

/// Master files live at exactly `Master_Files/Latest/<name>`.
fn is_master_latest(path: &Path, name: &str) -> bool {
    let file = path.file_name().and_then(|n| n.to_str()) == Some(name);
    let parent = path
        .parent()
        .and_then(|p| p.file_name())
        .map(|n| n == "Latest")
        .unwrap_or(false);
    let grandparent = path
        .parent()
        .and_then(|p| p.parent())
        .and_then(|p| p.file_name())
        .map(|n| n == "Master_Files")
        .unwrap_or(false);
    file && parent && grandparent && !has_component(path, "Revised_Panelist_Files")
}

fn file_name(path: &Path) -> &str {
    path.file_name().and_then(|n| n.to_str()).unwrap_or("")
}

/// Scan `root` and produce the catalog for one dataset kind.
///
/// Convention failures are collected across all files and raised as one
/// error; a partial catalog is never returned.
pub fn resolve(root: &Path, kind: DatasetKind) -> Result<FileCatalog> {
    let files = discover(root)?;
    let mut cat = FileCatalog::empty(root, kind);
    let mut errors: Vec<String> = Vec::new();

    for path in &files {
        if has_component(path, "OpenIssues_SupplementFiles") {
            let issue = path
                .parent()
                .and_then(|p| p.file_name())
                .and_then(|n| n.to_str())
                .unwrap_or("")
                .to_string();
            cat.issues.push(IssueFile {
                issue,
                path: path.clone(),
            });
            continue;
        }
        if has_component(path, "Revised_Panelist_Files") {
            cat.revised.push(path.clone());
            continue;
        }
        if is_master_latest(path, "products.tsv") {
            cat.products = Some(path.clone());
            continue;
        }
        if is_master_latest(path, "brand_variations.tsv") {
            cat.variations = Some(path.clone());
            continue;
        }
        if is_master_latest(path, "retailers.tsv") {
            cat.retailers = Some(path.clone());
            continue;
        }
        if has_component(path, "Movement_Files") {
            let parsed = year_of(path, YearConvention::StemSuffix).and_then(|year| {
                let group = group_of(path)?;
                let module = module_of(path)?;
                Ok(SalesFile {
                    path: path.clone(),
                    year,
                    group,
                    module,
                })
            });
            match parsed {
                Ok(sf) => cat.sales.entry(sf.year).or_default().push(sf),
                Err(e) => errors.push(e.to_string()),
            }
            continue;
        }
        if has_component(path, "Annual_Files") {
            let name = file_name(path);
            let convention = match kind {
                DatasetKind::Retail => YearConvention::StemSuffix,
                DatasetKind::Panel => YearConvention::GrandparentDir,
            };
            let role: Option<&mut BTreeMap<u16, PathBuf>> = match kind {
                DatasetKind::Retail => {
                    if name.contains("rms_versions") {
                        Some(&mut cat.versions)
                    } else if name.contains("products_extra") {
                        Some(&mut cat.extra)
                    } else if name.contains("stores") {
                        Some(&mut cat.stores)
                    } else {
                        None
                    }
                }
                DatasetKind::Panel => {
                    if name.contains("products_extra") {
                        Some(&mut cat.extra)
                    } else if name.contains("trips") {
                        Some(&mut cat.trips)
                    } else if name.contains("panelists") {
                        Some(&mut cat.panelists)
                    } else if name.contains("purchases") {
                        Some(&mut cat.purchases)
                    } else {
                        None
                    }
                }
            };
            if let Some(map) = role {
                match year_of(path, convention) {
                    Ok(year) => {
                        map.insert(year, path.clone());
                    }
                    Err(e) => errors.push(e.to_string()),
                }
            }
        }
    }

    if !errors.is_empty() {
        bail!(
            "file naming conventions violated under {}; use the original Nielsen structure:\n{}",
            root.display(),
            errors.join("\n")
        );
    }
    match kind {
        DatasetKind::Retail if cat.sales.is_empty() => {
            bail!("could not find Movement Files under {}", root.display())
        }
        DatasetKind::Panel
            if cat.panelists.is_empty() && cat.trips.is_empty() && cat.purchases.is_empty() =>
        {
            bail!(
                "could not find Annual Files (panelists, purchases, trips) under {}",
                root.display()
            )
        }
        _ => {}
    }

    info!(
        kind = ?kind,
        years = ?cat.years(),
        files = files.len(),
        "resolved catalog"
    );
    Ok(cat)
}

#[cfg(test)]
pub(crate) mod testfs {
    use std::fs;
    use std::path::Path;

    /// Write a fixture file, creating parent directories.
    pub fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use testfs::write;

    fn retail_tree(root: &Path) {
        write(
            root,
            "Movement_Files/1234_SNACKS/5678_CHIPS/5678_2010.tsv",
            "store_code_uc\tupc\n",
        );
        write(
            root,
            "Movement_Files/1234_SNACKS/9012_PRETZELS/9012_2011.tsv",
            "store_code_uc\tupc\n",
        );
        write(root, "Annual_Files/stores_2010.tsv", "store_code_uc\tyear\n");
        write(root, "Annual_Files/rms_versions_2010.tsv", "upc\tupc_ver_uc\tpanel_year\n");
        write(root, "Annual_Files/products_extra_2010.tsv", "upc\tpanel_year\n");
        write(root, "Master_Files/Latest/products.tsv", "upc\tupc_ver_uc\n");
    }

    #[test]
    fn retail_catalog_is_complete() -> Result<()> {
        let dir = TempDir::new()?;
        retail_tree(dir.path());
        let cat = resolve(dir.path(), DatasetKind::Retail)?;
        assert_eq!(cat.years(), BTreeSet::from([2010, 2011]));
        assert_eq!(cat.all_groups(), BTreeSet::from([1234]));
        assert_eq!(cat.all_modules(), BTreeSet::from([5678, 9012]));
        assert!(cat.products.is_some());
        assert_eq!(cat.stores.len(), 1);
        assert_eq!(cat.versions.len(), 1);
        assert_eq!(cat.extra.len(), 1);
        Ok(())
    }

    #[test]
    fn missing_movement_files_is_fatal() -> Result<()> {
        let dir = TempDir::new()?;
        write(dir.path(), "Annual_Files/stores_2010.tsv", "store_code_uc\n");
        let err = resolve(dir.path(), DatasetKind::Retail).unwrap_err();
        assert!(err.to_string().contains("Movement Files"));
        Ok(())
    }

    #[test]
    fn renamed_movement_file_fails_with_all_offenders_listed() -> Result<()> {
        let dir = TempDir::new()?;
        retail_tree(dir.path());
        write(
            dir.path(),
            "Movement_Files/1234_SNACKS/5678_CHIPS/renamed.tsv",
            "store_code_uc\tupc\n",
        );
        write(
            dir.path(),
            "Movement_Files/1234_SNACKS/5678_CHIPS/other.tsv",
            "store_code_uc\tupc\n",
        );
        let err = resolve(dir.path(), DatasetKind::Retail).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("renamed"));
        assert!(msg.contains("other"));
        Ok(())
    }

    #[test]
    fn os_artifacts_are_skipped() -> Result<()> {
        let dir = TempDir::new()?;
        retail_tree(dir.path());
        write(
            dir.path(),
            "Movement_Files/1234_SNACKS/5678_CHIPS/._5678_2010.tsv",
            "garbage",
        );
        let cat = resolve(dir.path(), DatasetKind::Retail)?;
        assert_eq!(cat.sales[&2010].len(), 1);
        Ok(())
    }

    #[test]
    fn panel_catalog_classifies_annual_roles() -> Result<()> {
        let dir = TempDir::new()?;
        let root = dir.path();
        write(root, "2011/Annual_Files/panelists_2011.tsv", "Household_Cd\n");
        write(root, "2011/Annual_Files/trips_2011.tsv", "trip_code_uc\n");
        write(root, "2011/Annual_Files/purchases_2011.tsv", "trip_code_uc\n");
        write(root, "2011/Annual_Files/products_extra_2011.tsv", "upc\n");
        write(root, "Master_Files/Latest/products.tsv", "upc\n");
        write(root, "Master_Files/Latest/retailers.tsv", "retailer_code\n");
        write(root, "Master_Files/Latest/brand_variations.tsv", "brand_code_uc\n");
        write(
            root,
            "Revised_Panelist_Files/2011/Annual_Files/panelists_2011.tsv",
            "Household_Cd\n",
        );
        let cat = resolve(root, DatasetKind::Panel)?;
        assert_eq!(cat.years(), BTreeSet::from([2011]));
        assert_eq!(cat.panelists.len(), 1);
        assert_eq!(cat.trips.len(), 1);
        assert_eq!(cat.purchases.len(), 1);
        assert_eq!(cat.extra.len(), 1);
        assert!(cat.retailers.is_some());
        assert!(cat.variations.is_some());
        // the revised copy must not shadow the master or annual roles
        assert_eq!(cat.revised.len(), 1);
        Ok(())
    }

    #[test]
    fn empty_panel_root_is_fatal() -> Result<()> {
        let dir = TempDir::new()?;
        write(dir.path(), "Master_Files/Latest/products.tsv", "upc\n");
        let err = resolve(dir.path(), DatasetKind::Panel).unwrap_err();
        assert!(err.to_string().contains("Annual Files"));
        Ok(())
    }
}
