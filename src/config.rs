use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::catalog::{DatasetKind, FileCatalog, GeoFilter};
use crate::join::Precedence;
use crate::pipeline::{panel::PanelOptions, retail::RetailOptions, ProductFilter};
use crate::sink::Codec;

/// Keep/drop lists over one scope axis. Both may be set; a value survives
/// only when it passes both.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AxisFilter<T> {
    pub keep: Option<Vec<T>>,
    pub drop: Option<Vec<T>>,
}

impl<T> AxisFilter<T> {
    pub fn keep(&self) -> Option<&[T]> {
        self.keep.as_deref()
    }
    pub fn drop(&self) -> Option<&[T]> {
        self.drop.as_deref()
    }
}

fn default_stub() -> String {
    "out".to_string()
}

fn default_true() -> bool {
    true
}

/// One run, described in a YAML file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Root of the unzipped delivery.
    pub read_dir: PathBuf,
    /// Where the parquet files land.
    pub write_dir: PathBuf,
    /// Output filename prefix, `<stub>_<table>.parquet`.
    #[serde(default = "default_stub")]
    pub stub: String,
    pub dataset: DatasetKind,
    #[serde(default)]
    pub compression: Codec,
    /// Column whose distinct values become parquet row groups.
    #[serde(default)]
    pub partition_key: Option<String>,
    #[serde(default)]
    pub years: AxisFilter<u16>,
    #[serde(default)]
    pub groups: AxisFilter<u32>,
    #[serde(default)]
    pub modules: AxisFilter<u32>,
    #[serde(default)]
    pub geography: GeoFilter,
    /// Restrict the product master (and everything keyed on it) to these.
    #[serde(default)]
    pub upcs: Option<Vec<u64>>,
    #[serde(default = "default_true")]
    pub include_promo: bool,
    #[serde(default)]
    pub extra_precedence: Precedence,
    #[serde(default = "default_true")]
    pub apply_revisions: bool,
    #[serde(default = "default_true")]
    pub restrict_purchases_to_master: bool,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Narrow a freshly resolved catalog to the configured scope.
    pub fn apply_filters(&self, catalog: &mut FileCatalog) {
        catalog.filter_years(self.years.keep(), self.years.drop());
        catalog.filter_groups(self.groups.keep(), self.groups.drop());
        catalog.filter_modules(self.modules.keep(), self.modules.drop());
    }

    fn product_filter(&self) -> ProductFilter {
        let widen = |v: &Option<Vec<u32>>| {
            v.as_ref()
                .map(|v| v.iter().map(|&x| u64::from(x)).collect::<Vec<_>>())
        };
        ProductFilter {
            upcs: self.upcs.as_ref().map(|v| v.iter().copied().collect()),
            keep_groups: widen(&self.groups.keep),
            drop_groups: widen(&self.groups.drop),
            keep_modules: widen(&self.modules.keep),
            drop_modules: widen(&self.modules.drop),
        }
    }

    pub fn retail_options(&self) -> RetailOptions {
        RetailOptions {
            geo: self.geography.clone(),
            products: self.product_filter(),
            include_promo: self.include_promo,
            extra_precedence: self.extra_precedence,
        }
    }

    pub fn panel_options(&self) -> PanelOptions {
        PanelOptions {
            geo: self.geography.clone(),
            products: self.product_filter(),
            extra_precedence: self.extra_precedence,
            apply_revisions: self.apply_revisions,
            restrict_purchases_to_master: self.restrict_purchases_to_master,
        }
    }
}
