//! Config snapshot: sectioned key/value view over a TOML file with
//! mtime-based change detection and "N units" duration specs.
//!
//! The daemon treats configuration as a point-in-time snapshot: values are
//! read once at load, `changed()` reports whether the file has moved on, and
//! `reload()` re-reads it in place. Sections are top-level TOML tables;
//! scalar values are coerced to strings so callers parse on demand.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};

use regex::Regex;
use toml::Value;

use crate::core::errors::{CrawlerError, Result};

/// One section's options.
type Section = BTreeMap<String, String>;

/// Immutable-ish view of the configuration file at a point in time.
#[derive(Debug, Clone)]
pub struct Snapshot {
    filename: PathBuf,
    mtime: SystemTime,
    sections: BTreeMap<String, Section>,
}

impl Snapshot {
    /// Load a snapshot from `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CrawlerError::MissingConfig {
                path: path.to_path_buf(),
            });
        }
        let raw = std::fs::read_to_string(path).map_err(|e| CrawlerError::io(path, e))?;
        let mtime = file_mtime(path)?;
        Ok(Self {
            filename: path.to_path_buf(),
            mtime,
            sections: parse_sections(&raw)?,
        })
    }

    /// Path this snapshot was loaded from.
    #[must_use]
    pub fn filename(&self) -> &Path {
        &self.filename
    }

    /// Section names, sorted.
    #[must_use]
    pub fn sections(&self) -> Vec<&str> {
        self.sections.keys().map(String::as_str).collect()
    }

    /// Whether the underlying file's mtime has advanced since this snapshot
    /// was taken. Stat failures (file removed mid-run) read as "unchanged";
    /// the stale snapshot keeps the daemon running.
    #[must_use]
    pub fn changed(&self) -> bool {
        file_mtime(&self.filename).is_ok_and(|m| m > self.mtime)
    }

    /// Re-read the file in place, replacing sections and the recorded mtime.
    pub fn reload(&mut self) -> Result<()> {
        let raw =
            std::fs::read_to_string(&self.filename).map_err(|e| CrawlerError::io(&self.filename, e))?;
        self.sections = parse_sections(&raw)?;
        self.mtime = file_mtime(&self.filename)?;
        Ok(())
    }

    /// Required option; missing section or option is an error naming the key.
    pub fn get(&self, section: &str, option: &str) -> Result<String> {
        self.get_opt(section, option)
            .map(str::to_string)
            .ok_or_else(|| CrawlerError::MissingOption {
                section: section.to_string(),
                option: option.to_string(),
            })
    }

    /// Optional option.
    #[must_use]
    pub fn get_opt(&self, section: &str, option: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|s| s.get(option))
            .map(String::as_str)
    }

    /// Duration option in "N units" form; absent falls back to `default`.
    pub fn get_time(&self, section: &str, option: &str, default: Duration) -> Result<Duration> {
        match self.get_opt(section, option) {
            None => Ok(default),
            Some(spec) => parse_duration(spec),
        }
    }

    /// Integer option; absent falls back to `default`.
    pub fn get_usize(&self, section: &str, option: &str, default: usize) -> Result<usize> {
        match self.get_opt(section, option) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|_| CrawlerError::InvalidConfig {
                details: format!("{section}.{option}: not an integer: {raw:?}"),
            }),
        }
    }

    /// Comma-separated list option; absent or empty yields an empty list.
    #[must_use]
    pub fn get_list(&self, section: &str, option: &str) -> Vec<String> {
        self.get_opt(section, option)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn file_mtime(path: &Path) -> Result<SystemTime> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|e| CrawlerError::io(path, e))
}

fn parse_sections(raw: &str) -> Result<BTreeMap<String, Section>> {
    let table: toml::Table = raw.parse()?;
    let mut sections = BTreeMap::new();
    for (name, value) in table {
        let Value::Table(entries) = value else {
            return Err(CrawlerError::ConfigParse {
                context: "toml",
                details: format!("top-level key {name:?} is not a section"),
            });
        };
        let mut section = Section::new();
        for (option, value) in entries {
            section.insert(option, coerce_scalar(&value)?);
        }
        sections.insert(name, section);
    }
    Ok(sections)
}

/// Flatten a TOML scalar (or array of scalars) to the string form the
/// option accessors hand out.
fn coerce_scalar(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Integer(i) => Ok(i.to_string()),
        Value::Float(f) => Ok(f.to_string()),
        Value::Boolean(b) => Ok(b.to_string()),
        Value::Datetime(d) => Ok(d.to_string()),
        Value::Array(items) => {
            let parts: Result<Vec<String>> = items.iter().map(coerce_scalar).collect();
            Ok(parts?.join(", "))
        }
        Value::Table(_) => Err(CrawlerError::ConfigParse {
            context: "toml",
            details: "nested tables are not valid option values".to_string(),
        }),
    }
}

/// Parse an "N units" duration spec: an optional-decimal number with an
/// optional unit suffix (seconds when bare). Accepted units: s/sec/seconds,
/// m/min/minutes, h/hr/hours, d/days, w/weeks, case-insensitive.
pub fn parse_duration(spec: &str) -> Result<Duration> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"^(\d+(?:\.\d+)?)\s*([a-zA-Z]*)$").expect("static regex"));

    let trimmed = spec.trim();
    let captures = pattern
        .captures(trimmed)
        .ok_or_else(|| bad_duration(spec))?;
    let amount: f64 = captures[1].parse().map_err(|_| bad_duration(spec))?;
    let multiplier = match captures[2].to_ascii_lowercase().as_str() {
        "" | "s" | "sec" | "secs" | "second" | "seconds" => 1.0,
        "m" | "min" | "mins" | "minute" | "minutes" => 60.0,
        "h" | "hr" | "hrs" | "hour" | "hours" => 3_600.0,
        "d" | "day" | "days" => 86_400.0,
        "w" | "week" | "weeks" => 604_800.0,
        _ => return Err(bad_duration(spec)),
    };
    // The grammar accepts arbitrarily large numbers; a product past what a
    // Duration can hold must come back as a config error, not a panic.
    Duration::try_from_secs_f64(amount * multiplier).map_err(|_| bad_duration(spec))
}

fn bad_duration(spec: &str) -> CrawlerError {
    CrawlerError::InvalidConfig {
        details: format!("unrecognized duration spec: {spec:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_config(contents: &str) -> (tempfile::TempDir, Snapshot) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("crawler.toml");
        let mut file = std::fs::File::create(&path).expect("create config");
        file.write_all(contents.as_bytes()).expect("write config");
        let snap = Snapshot::load(&path).expect("load snapshot");
        (dir, snap)
    }

    #[test]
    fn reads_sections_and_options() {
        let (_dir, snap) = write_config(
            r#"
[crawler]
context = "TEST"
heartbeat = "5m"
plugins = "alpha, beta"

[alpha]
frequency = 30
"#,
        );
        assert_eq!(snap.sections(), vec!["alpha", "crawler"]);
        assert_eq!(snap.get("crawler", "context").unwrap(), "TEST");
        assert_eq!(snap.get_opt("alpha", "frequency"), Some("30"));
        assert_eq!(
            snap.get_list("crawler", "plugins"),
            vec!["alpha".to_string(), "beta".to_string()]
        );
    }

    #[test]
    fn missing_option_names_the_key() {
        let (_dir, snap) = write_config("[crawler]\ncontext = \"X\"\n");
        let err = snap.get("crawler", "exitpath").unwrap_err();
        assert_eq!(err.code(), "CRW-1004");
        assert!(err.to_string().contains("crawler.exitpath"), "got: {err}");
    }

    #[test]
    fn array_options_read_as_comma_lists() {
        let (_dir, snap) = write_config("[crawler]\nplugins = [\"a\", \"b\"]\n");
        assert_eq!(
            snap.get_list("crawler", "plugins"),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn get_time_falls_back_on_absent_option() {
        let (_dir, snap) = write_config("[crawler]\n");
        let fallback = Duration::from_secs(3600);
        assert_eq!(
            snap.get_time("crawler", "heartbeat", fallback).unwrap(),
            fallback
        );
    }

    #[test]
    fn changed_tracks_mtime_advance() {
        let (dir, snap) = write_config("[crawler]\ncontext = \"A\"\n");
        assert!(!snap.changed());

        let path = dir.path().join("crawler.toml");
        std::fs::write(&path, "[crawler]\ncontext = \"B\"\n").unwrap();
        let later = filetime::FileTime::from_unix_time(
            filetime::FileTime::from_last_modification_time(&std::fs::metadata(&path).unwrap())
                .unix_seconds()
                + 5,
            0,
        );
        filetime::set_file_mtime(&path, later).unwrap();
        assert!(snap.changed());

        let mut snap = snap;
        snap.reload().unwrap();
        assert_eq!(snap.get("crawler", "context").unwrap(), "B");
        assert!(!snap.changed());
    }

    #[test]
    fn duration_specs_cover_units_and_bare_seconds() {
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2 hours").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_duration("1W").unwrap(), Duration::from_secs(604_800));
        assert_eq!(
            parse_duration("7.5s").unwrap(),
            Duration::from_secs_f64(7.5)
        );
    }

    #[test]
    fn oversized_duration_spec_is_rejected_not_fatal() {
        for huge in ["99999999999999999999999999 w", "999999999999999999999"] {
            let err = parse_duration(huge).unwrap_err();
            assert_eq!(err.code(), "CRW-1001", "for {huge:?}");
        }
    }

    #[test]
    fn duration_spec_rejects_garbage() {
        for bad in ["", "fast", "10 fortnights", "-3s", "1.2.3"] {
            assert!(parse_duration(bad).is_err(), "accepted {bad:?}");
        }
    }
}
