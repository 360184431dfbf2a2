use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::info;

use super::FileCatalog;
use crate::table::Predicate;

/// True when `v` survives the keep whitelist and the drop blacklist.
fn selected<T: PartialEq + Copy>(v: T, keep: Option<&[T]>, drop: Option<&[T]>) -> bool {
    if let Some(keep) = keep {
        if !keep.contains(&v) {
            return false;
        }
    }
    if let Some(drop) = drop {
        if drop.contains(&v) {
            return false;
        }
    }
    true
}

fn retain_years<V>(map: &mut BTreeMap<u16, V>, keep: Option<&[u16]>, drop: Option<&[u16]>) {
    map.retain(|y, _| selected(*y, keep, drop));
}

impl FileCatalog {
    /// Narrow the catalog to the selected years. Cumulative: dropped years
    /// cannot be recovered without re-resolving.
    pub fn filter_years(&mut self, keep: Option<&[u16]>, drop: Option<&[u16]>) {
        retain_years(&mut self.sales, keep, drop);
        retain_years(&mut self.stores, keep, drop);
        retain_years(&mut self.versions, keep, drop);
        retain_years(&mut self.extra, keep, drop);
        retain_years(&mut self.panelists, keep, drop);
        retain_years(&mut self.trips, keep, drop);
        retain_years(&mut self.purchases, keep, drop);
        info!(years = ?self.years(), "years left");
    }

    /// Narrow the movement files to the selected product groups. A year left
    /// with no files falls out of scope entirely.
    pub fn filter_groups(&mut self, keep: Option<&[u32]>, drop: Option<&[u32]>) {
        for files in self.sales.values_mut() {
            files.retain(|f| selected(f.group, keep, drop));
        }
        self.sales.retain(|_, files| !files.is_empty());
        info!(groups = ?self.all_groups(), "groups left");
    }

    /// Narrow the movement files to the selected product modules. A year left
    /// with no files falls out of scope entirely.
    pub fn filter_modules(&mut self, keep: Option<&[u32]>, drop: Option<&[u32]>) {
        for files in self.sales.values_mut() {
            files.retain(|f| selected(f.module, keep, drop));
        }
        self.sales.retain(|_, files| !files.is_empty());
        info!(modules = ?self.all_modules(), "modules left");
    }
}

/// Geography and channel selection, applied as read predicates to the stores
/// and panelist tables rather than the catalog (those axes live in row data,
/// not filenames).
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GeoFilter {
    pub keep_dmas: Option<Vec<u64>>,
    pub drop_dmas: Option<Vec<u64>>,
    pub keep_states: Option<Vec<String>>,
    pub drop_states: Option<Vec<String>>,
    pub keep_channels: Option<Vec<String>>,
    pub drop_channels: Option<Vec<String>>,
}

impl GeoFilter {
    fn push_axes(&self, preds: &mut Vec<Predicate>, dma_col: &str, state_col: &str) {
        if let Some(keep) = &self.keep_dmas {
            preds.push(Predicate::InU64 {
                column: dma_col.to_string(),
                values: keep.iter().copied().collect(),
            });
        }
        if let Some(drop) = &self.drop_dmas {
            preds.push(Predicate::NotInU64 {
                column: dma_col.to_string(),
                values: drop.iter().copied().collect(),
            });
        }
        if let Some(keep) = &self.keep_states {
            preds.push(Predicate::InStr {
                column: state_col.to_string(),
                values: keep.iter().cloned().collect(),
            });
        }
        if let Some(drop) = &self.drop_states {
            preds.push(Predicate::NotInStr {
                column: state_col.to_string(),
                values: drop.iter().cloned().collect(),
            });
        }
    }

    /// Predicate over the stores table, or `None` when nothing is filtered.
    pub fn store_predicate(&self) -> Option<Predicate> {
        let mut preds = Vec::new();
        self.push_axes(&mut preds, "dma_code", "fips_state_descr");
        if let Some(keep) = &self.keep_channels {
            preds.push(Predicate::InStr {
                column: "channel_code".to_string(),
                values: keep.iter().cloned().collect(),
            });
        }
        if let Some(drop) = &self.drop_channels {
            preds.push(Predicate::NotInStr {
                column: "channel_code".to_string(),
                values: drop.iter().cloned().collect(),
            });
        }
        if preds.is_empty() {
            None
        } else {
            Some(Predicate::All(preds))
        }
    }

    /// Predicate over the raw panelist table. Always includes the positive
    /// projection-weight invariant; households with no weight never enter
    /// the panel.
    pub fn panelist_predicate(&self) -> Predicate {
        let mut preds = vec![Predicate::gt("Projection_Factor", 0.0)];
        self.push_axes(&mut preds, "DMA_Cd", "Fips_State_Desc");
        Predicate::All(preds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{resolve, testfs::write, DatasetKind};
    use anyhow::Result;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn tree() -> Result<(TempDir, crate::catalog::FileCatalog)> {
        let dir = TempDir::new()?;
        let root = dir.path();
        for (g, m, y) in [
            (10, 100, 2010),
            (10, 101, 2010),
            (20, 200, 2010),
            (10, 100, 2011),
            (20, 200, 2012),
        ] {
            write(
                root,
                &format!("Movement_Files/{g}_G/{m}_M/{m}_{y}.tsv"),
                "store_code_uc\tupc\n",
            );
        }
        for y in [2010, 2011, 2012] {
            write(root, &format!("Annual_Files/stores_{y}.tsv"), "store_code_uc\n");
        }
        write(root, "Master_Files/Latest/products.tsv", "upc\n");
        let cat = resolve(root, DatasetKind::Retail)?;
        Ok((dir, cat))
    }

    #[test]
    fn keep_and_drop_intersect() -> Result<()> {
        let (_dir, mut cat) = tree()?;
        cat.filter_years(Some(&[2010, 2011]), Some(&[2011]));
        assert_eq!(cat.years(), BTreeSet::from([2010]));
        assert_eq!(cat.stores.len(), 1);
        Ok(())
    }

    #[test]
    fn repeated_keeps_compose_like_an_intersection() -> Result<()> {
        let (_dir, mut seq) = tree()?;
        seq.filter_years(Some(&[2010, 2011]), None);
        seq.filter_years(Some(&[2011, 2012]), None);

        let (_dir2, mut once) = tree()?;
        once.filter_years(Some(&[2011]), None);

        assert_eq!(seq.years(), once.years());
        Ok(())
    }

    #[test]
    fn drop_never_restores_kept_out_entries() -> Result<()> {
        let (_dir, mut cat) = tree()?;
        cat.filter_years(Some(&[2010]), None);
        // dropping an unrelated year must not bring 2011/2012 back
        cat.filter_years(None, Some(&[2012]));
        assert_eq!(cat.years(), BTreeSet::from([2010]));
        Ok(())
    }

    #[test]
    fn group_and_module_axes_compose_in_any_order() -> Result<()> {
        let (_dir, mut cat) = tree()?;
        cat.filter_modules(None, Some(&[101]));
        cat.filter_groups(Some(&[10]), None);
        assert_eq!(cat.all_groups(), BTreeSet::from([10]));
        assert_eq!(cat.all_modules(), BTreeSet::from([100]));
        Ok(())
    }

    #[test]
    fn group_filter_retires_emptied_years() -> Result<()> {
        let (_dir, mut cat) = tree()?;
        // 2011 only carries group 10; keeping 20 must take the year with it
        cat.filter_groups(Some(&[20]), None);
        assert_eq!(cat.years(), BTreeSet::from([2010, 2012]));

        let (_dir2, mut cat) = tree()?;
        cat.filter_modules(Some(&[200]), None);
        assert_eq!(cat.years(), BTreeSet::from([2010, 2012]));
        Ok(())
    }

    #[test]
    fn empty_geo_filter_has_no_store_predicate() {
        assert!(GeoFilter::default().store_predicate().is_none());
    }
}
