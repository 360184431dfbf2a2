use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;

static LEADING_INT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)").unwrap());
static TRAILING_INT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)$").unwrap());

/// Where a file's year lives in the directory layout.
///
/// Movement and retail annual files carry the year as the last underscore
/// token of the filename stem (`5678_2010.tsv`, `stores_2010.tsv`). Panel
/// annual files sit one level deeper and carry the year as the grandparent
/// directory name (`2011/Annual_Files/trips_2011.tsv`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YearConvention {
    StemSuffix,
    GrandparentDir,
}

fn stem(path: &Path) -> Result<&str> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow!("{} has no usable filename", path.display()))
}

/// Year a file corresponds to, per the given convention.
pub fn year_of(path: &Path, convention: YearConvention) -> Result<u16> {
    match convention {
        YearConvention::StemSuffix => {
            let stem = stem(path)?;
            let m = TRAILING_INT
                .captures(stem)
                .and_then(|c| c.get(1))
                .ok_or_else(|| {
                    anyhow!(
                        "could not read a year from the end of `{}` ({})",
                        stem,
                        path.display()
                    )
                })?;
            m.as_str()
                .parse()
                .map_err(|_| anyhow!("year `{}` out of range in {}", m.as_str(), path.display()))
        }
        YearConvention::GrandparentDir => {
            let dir = path
                .parent()
                .and_then(|p| p.parent())
                .and_then(|p| p.file_name())
                .and_then(|n| n.to_str())
                .ok_or_else(|| anyhow!("{} has no grandparent directory", path.display()))?;
            dir.parse().map_err(|_| {
                anyhow!(
                    "grandparent directory `{}` of {} is not a year",
                    dir,
                    path.display()
                )
            })
        }
    }
}

/// Module code of a movement file: the leading integer of the filename stem.
pub fn module_of(path: &Path) -> Result<u32> {
    let stem = stem(path)?;
    let m = LEADING_INT
        .captures(stem)
        .and_then(|c| c.get(1))
        .ok_or_else(|| {
            anyhow!(
                "could not read a module code from the start of `{}` ({})",
                stem,
                path.display()
            )
        })?;
    m.as_str()
        .parse()
        .map_err(|_| anyhow!("module code `{}` out of range in {}", m.as_str(), path.display()))
}

/// Group code of a movement file: the leading integer of the grandparent
/// directory (`<group>_<descr>/<module>_<descr>/<module>_<year>.tsv`).
pub fn group_of(path: &Path) -> Result<u32> {
    let dir = path
        .parent()
        .and_then(|p| p.parent())
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("{} has no grandparent directory", path.display()))?;
    let m = LEADING_INT
        .captures(dir)
        .and_then(|c| c.get(1))
        .ok_or_else(|| {
            anyhow!(
                "could not read a group code from the start of `{}` ({})",
                dir,
                path.display()
            )
        })?;
    m.as_str()
        .parse()
        .map_err(|_| anyhow!("group code `{}` out of range in {}", m.as_str(), path.display()))
}
