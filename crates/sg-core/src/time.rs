use anyhow::{Context, Result};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn unix_seconds() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock before unix epoch")?
        .as_secs())
}
