//! File-per-sample spool.
//!
//! Every sample is one `{prefix}_{timestamp}.json` file under a root
//! directory. The timestamp part is fixed-width UTC seconds without colons,
//! so file names sort chronologically and the same codec drives both
//! writing and retention pruning.

use crate::error::{MonitorError, MonitorResult};
use crate::sample::Sample;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";
const SAMPLE_EXT: &str = ".json";
const TMP_EXT: &str = ".tmp";

pub fn encode_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn decode_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    // Fixed width: reject anything chrono would leniently accept.
    if raw.len() != 19 {
        return None;
    }
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

pub fn sample_file_name(prefix: &str, ts: DateTime<Utc>) -> String {
    format!("{}_{}{}", prefix, encode_timestamp(ts), SAMPLE_EXT)
}

/// Splits `{prefix}_{timestamp}.json` (optionally with a `.tmp` suffix).
pub fn parse_sample_file_name(name: &str) -> Option<(&str, DateTime<Utc>)> {
    let stem = name.strip_suffix(TMP_EXT).unwrap_or(name);
    let stem = stem.strip_suffix(SAMPLE_EXT)?;
    let (prefix, raw_ts) = stem.rsplit_once('_')?;
    if prefix.is_empty() {
        return None;
    }
    Some((prefix, decode_timestamp(raw_ts)?))
}

pub fn bootstrap<'a>(roots: impl IntoIterator<Item = &'a PathBuf>) -> MonitorResult<()> {
    for root in roots {
        fs::create_dir_all(root).map_err(|err| MonitorError::io("create", root, err))?;
    }
    Ok(())
}

/// Writes one sample file. Rewriting the same timestamp overwrites in place.
pub fn save<S: Sample>(sample: &S, root: &Path) -> MonitorResult<PathBuf> {
    let path = root.join(sample_file_name(S::PREFIX, sample.timestamp()));
    let tmp = tmp_path(&path);
    let body = serde_json::to_vec(sample).map_err(|err| MonitorError::parse("sample", err))?;
    fs::write(&tmp, body).map_err(|err| MonitorError::io("write", &tmp, err))?;
    if let Err(err) = fs::rename(&tmp, &path) {
        let _ = fs::remove_file(&tmp);
        return Err(MonitorError::io("rename", &path, err));
    }
    Ok(path)
}

/// Every readable sample of kind `S` under `root`, oldest first.
///
/// Unreadable or half-written files are logged and skipped; they stay on
/// disk until retention removes them.
pub fn list<S: Sample>(root: &Path) -> MonitorResult<Vec<(S, PathBuf)>> {
    let mut names = sample_names(root, S::PREFIX)?;
    names.sort();

    let mut out = Vec::with_capacity(names.len());
    for name in names {
        let path = root.join(&name);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(path=%path.display(), error=%err, "failed to read sample; skipping");
                continue;
            }
        };
        match serde_json::from_slice::<S>(&raw) {
            Ok(sample) => out.push((sample, path)),
            Err(err) => {
                tracing::warn!(path=%path.display(), error=%err, "failed to parse sample; skipping");
            }
        }
    }
    Ok(out)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PruneReport {
    pub deleted: usize,
    pub kept: usize,
    pub unparsed: usize,
}

pub fn prune(root: &Path, max_age_days: u32) -> MonitorResult<PruneReport> {
    prune_at(root, max_age_days, Utc::now())
}

/// Deletes sample files whose file name timestamp is older than
/// `now - max_age_days`. Names that do not decode are never deleted.
pub fn prune_at(root: &Path, max_age_days: u32, now: DateTime<Utc>) -> MonitorResult<PruneReport> {
    let cutoff = now - ChronoDuration::days(i64::from(max_age_days));
    let mut report = PruneReport::default();

    for entry in fs::read_dir(root).map_err(|err| MonitorError::io("read", root, err))? {
        let entry = entry.map_err(|err| MonitorError::io("read", root, err))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|v| v.to_str()) else {
            continue;
        };
        let stem = name.strip_suffix(TMP_EXT).unwrap_or(name);
        if !stem.ends_with(SAMPLE_EXT) {
            continue;
        }

        let Some((_prefix, ts)) = parse_sample_file_name(name) else {
            tracing::error!(path=%path.display(), "sample file name has no decodable timestamp; leaving in place");
            report.unparsed += 1;
            continue;
        };

        if ts >= cutoff {
            report.kept += 1;
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => report.deleted += 1,
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(path=%path.display(), error=%err, "failed to prune sample");
                report.kept += 1;
            }
        }
    }

    Ok(report)
}

/// Removes delivered files. A file that is already gone counts as removed.
pub fn remove_all(paths: &[PathBuf]) -> MonitorResult<()> {
    for path in paths {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(MonitorError::io("remove", path, err)),
        }
    }
    Ok(())
}

fn sample_names(root: &Path, prefix: &str) -> MonitorResult<Vec<String>> {
    let lead = format!("{}_", prefix);
    let mut names = Vec::new();
    for entry in fs::read_dir(root).map_err(|err| MonitorError::io("read", root, err))? {
        let entry = entry.map_err(|err| MonitorError::io("read", root, err))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|v| v.to_str()) else {
            continue;
        };
        // `radio_status_` must not be picked up by a `status_` scan and vice versa.
        let Some((file_prefix, _)) = parse_sample_file_name(name) else {
            if name.starts_with(&lead) && name.ends_with(SAMPLE_EXT) {
                tracing::warn!(path=%path.display(), "sample file name has no decodable timestamp; skipping");
            }
            continue;
        };
        if file_prefix == prefix && name.ends_with(SAMPLE_EXT) {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut raw = path.as_os_str().to_os_string();
    raw.push(TMP_EXT);
    PathBuf::from(raw)
}
