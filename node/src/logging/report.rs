//! Run report types and generation.

// Verbose mode outputs JSON summary to stdout for user inspection
#![allow(clippy::print_stdout, reason = "verbose summary output to stdout")]

use crate::cli::{RunOptions, SyncConfig};
use crate::run::SessionReport;
use eyre::{Result, WrapErr};
use serde::Serialize;
use std::{
    env, fs,
    path::Path,
    process,
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::info;

/// Complete run report: metadata, inputs and results.
#[derive(Debug, Serialize)]
pub struct RunReport<'a> {
    pub meta: RunMeta,
    pub argv: &'a [String],
    pub config: &'a SyncConfig,
    pub options: &'a RunOptions,
    pub results: &'a SessionReport,
}

#[derive(Debug, Serialize)]
pub struct RunMeta {
    pub timestamp_utc: String,
    pub build: BuildInfo,
    pub env: EnvInfo,
}

#[derive(Debug, Serialize)]
pub struct BuildInfo {
    pub profile: String,
    pub debug_assertions: bool,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct EnvInfo {
    pub os: String,
    pub arch: String,
    pub cpu_count: usize,
    pub pid: u32,
}

/// Generate a UTC timestamp string from a SystemTime.
pub fn run_timestamp_utc(now: SystemTime) -> String {
    let secs = now.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64;
    let days = secs / 86_400;
    let rem = secs % 86_400;
    let hour = rem / 3_600;
    let min = (rem % 3_600) / 60;
    let sec = rem % 60;
    let (year, month, day) = civil_from_days(days);
    format!("{year:04}-{month:02}-{day:02}T{hour:02}:{min:02}:{sec:02}Z")
}

/// Convert days since Unix epoch to civil date (year, month, day).
fn civil_from_days(days: i64) -> (i32, i32, i32) {
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = mp + if mp < 10 { 3 } else { -9 };
    let year = y + i64::from(m <= 2);
    (year as i32, m as i32, d as i32)
}

fn build_info() -> BuildInfo {
    let profile = if cfg!(debug_assertions) {
        "debug"
    } else {
        "release"
    };
    BuildInfo {
        profile: profile.to_string(),
        debug_assertions: cfg!(debug_assertions),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }
}

fn env_info() -> EnvInfo {
    EnvInfo {
        os: env::consts::OS.to_string(),
        arch: env::consts::ARCH.to_string(),
        cpu_count: std::thread::available_parallelism()
            .map(std::num::NonZero::get)
            .unwrap_or(1),
        pid: process::id(),
    }
}

fn write_run_report(path: &Path, report: &RunReport<'_>) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let file = fs::File::create(path)
        .wrap_err_with(|| format!("failed to create report {}", path.display()))?;
    serde_json::to_writer_pretty(file, report)?;
    Ok(())
}

/// Print the summary at `-v` and write the report when `--report` is set.
pub fn generate_run_report(
    config: &SyncConfig,
    options: &RunOptions,
    argv: &[String],
    results: &SessionReport,
) -> Result<()> {
    if config.verbosity >= 1 {
        let summary_json = serde_json::to_string_pretty(&results.summary)?;
        println!("{summary_json}");
    }

    if let Some(path) = config.report.as_deref() {
        let report = RunReport {
            meta: RunMeta {
                timestamp_utc: run_timestamp_utc(SystemTime::now()),
                build: build_info(),
                env: env_info(),
            },
            argv,
            config,
            options,
            results,
        };
        write_run_report(path, &report)?;
        info!(path = %path.display(), "run report written");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn timestamp_formats_civil_date() {
        assert_eq!(run_timestamp_utc(UNIX_EPOCH), "1970-01-01T00:00:00Z");
        let leap_day = UNIX_EPOCH + Duration::from_secs(951_782_400 + 3_661);
        assert_eq!(run_timestamp_utc(leap_day), "2000-02-29T01:01:01Z");
    }
}
