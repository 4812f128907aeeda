use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use crate::builder::BuildLimits;

#[derive(Clone, Debug)]
pub struct ArchiveRuntimeConfig {
    pub max_concurrent_builds: usize,
    pub download_timeout_seconds: u64,
    pub channel_capacity: usize,
    pub consistency_timeout_seconds: u64,
    pub reaper_enabled: bool,
    pub reaper_interval_seconds: u64,
    pub stale_after_seconds: u64,
    pub max_build_attempts: i32,
    pub updating_window_minutes: u64,
}

#[derive(Deserialize)]
struct BuilderSection {
    max_concurrent_builds: Option<usize>,
    download_timeout_seconds: Option<u64>,
    channel_capacity: Option<usize>,
}

#[derive(Deserialize)]
struct ConsistencySection {
    timeout_seconds: Option<u64>,
}

#[derive(Deserialize)]
struct ReaperSection {
    enabled: Option<bool>,
    interval_seconds: Option<u64>,
    stale_after_seconds: Option<u64>,
    max_build_attempts: Option<i32>,
}

#[derive(Deserialize)]
struct AllArchiveSection {
    updating_window_minutes: Option<u64>,
}

pub fn default_config_json() -> Value {
    json!({
        "builder": {
            "max_concurrent_builds": 2,
            "download_timeout_seconds": 300,
            "channel_capacity": 256
        },
        "consistency": { "timeout_seconds": 30 },
        "reaper": {
            "enabled": true,
            "interval_seconds": 600,
            "stale_after_seconds": 3600,
            "max_build_attempts": 5
        },
        "all_archive": { "updating_window_minutes": 10 }
    })
}

fn section<T: for<'de> Deserialize<'de>>(value: &Value, name: &str) -> Option<T> {
    value
        .get(name)
        .and_then(|v| serde_json::from_value::<T>(v.clone()).ok())
}

impl ArchiveRuntimeConfig {
    pub fn from_json(value: &Value) -> Self {
        let builder = section::<BuilderSection>(value, "builder");
        let consistency = section::<ConsistencySection>(value, "consistency");
        let reaper = section::<ReaperSection>(value, "reaper");
        let all_archive = section::<AllArchiveSection>(value, "all_archive");
        Self {
            max_concurrent_builds: builder
                .as_ref()
                .and_then(|b| b.max_concurrent_builds)
                .unwrap_or(2)
                .max(1),
            download_timeout_seconds: builder
                .as_ref()
                .and_then(|b| b.download_timeout_seconds)
                .unwrap_or(300),
            channel_capacity: builder
                .as_ref()
                .and_then(|b| b.channel_capacity)
                .unwrap_or(256)
                .max(1),
            consistency_timeout_seconds: consistency
                .as_ref()
                .and_then(|c| c.timeout_seconds)
                .unwrap_or(30),
            reaper_enabled: reaper.as_ref().and_then(|r| r.enabled).unwrap_or(true),
            reaper_interval_seconds: reaper
                .as_ref()
                .and_then(|r| r.interval_seconds)
                .unwrap_or(600)
                .max(1),
            stale_after_seconds: reaper
                .as_ref()
                .and_then(|r| r.stale_after_seconds)
                .unwrap_or(3600),
            max_build_attempts: reaper
                .as_ref()
                .and_then(|r| r.max_build_attempts)
                .unwrap_or(5)
                .max(1),
            updating_window_minutes: all_archive
                .as_ref()
                .and_then(|a| a.updating_window_minutes)
                .unwrap_or(10),
        }
    }

    pub fn consistency_timeout(&self) -> Duration {
        Duration::from_secs(self.consistency_timeout_seconds)
    }

    pub fn build_limits(&self) -> BuildLimits {
        BuildLimits {
            index_timeout: self.consistency_timeout(),
            download_timeout: Duration::from_secs(self.download_timeout_seconds),
        }
    }
}
