use anyhow::{Context, Result};
use scanpipe::{
    catalog::{self, DatasetKind},
    config::Config,
    pipeline::{panel, retail},
    sink,
    util::timed,
};
use std::path::Path;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

fn main() -> Result<()> {
    // ─── 1) init logging ─────────────────────────────────────────────
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::Subscriber::builder().with_env_filter(env).init();
    info!("startup");

    // ─── 2) load config ──────────────────────────────────────────────
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "scanpipe.yaml".to_string());
    let config = Config::load(Path::new(&config_path))
        .with_context(|| format!("loading {config_path}"))?;
    info!(dataset = ?config.dataset, read_dir = %config.read_dir.display(), "configured");

    // ─── 3) resolve & narrow the file catalog ────────────────────────
    let mut cat = timed("resolve catalog", || {
        catalog::resolve(&config.read_dir, config.dataset)
    })?;
    config.apply_filters(&mut cat);

    // ─── 4) run the pipeline & write parquet ─────────────────────────
    let partition = config.partition_key.as_deref();
    match config.dataset {
        DatasetKind::Retail => {
            let tables = retail::run(&cat, &config.retail_options())?;
            timed("write outputs", || {
                sink::write_outputs(
                    &tables.named(),
                    &config.write_dir,
                    &config.stub,
                    partition,
                    config.compression,
                )
            })?;
        }
        DatasetKind::Panel => {
            let tables = panel::run(&cat, &config.panel_options())?;
            timed("write outputs", || {
                sink::write_outputs(
                    &tables.named(),
                    &config.write_dir,
                    &config.stub,
                    partition,
                    config.compression,
                )
            })?;
        }
    }
    info!("done");
    Ok(())
}
