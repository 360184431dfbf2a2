use anyhow::Result;
use std::time::Instant;
use tracing::info;

/// Run `f`, logging how long it took under `label`.
pub fn timed<T>(label: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let start = Instant::now();
    let out = f()?;
    info!(elapsed = ?start.elapsed(), "{label} done");
    Ok(out)
}
