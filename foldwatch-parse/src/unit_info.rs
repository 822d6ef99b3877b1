//! Reader for the client's `unitinfo.txt` summary of the active unit.
//!
//! ```text
//! Current Work Unit
//! -----------------
//! Name: Gromacs
//! Tag: P2669R13C159G79
//! Download time: March 8 22:41:08
//! Due time: March 14 22:41:08
//! Progress: 5%  [____]
//! ```

use chrono::{DateTime, Datelike, Duration, NaiveDateTime, Utc};
use foldwatch_common::types::UnitIdentity;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

const DATE_FORMAT: &str = "%Y %B %d %H:%M:%S";

/// Parsed dates further than this past the reference belong to the previous
/// year.
const FUTURE_TOLERANCE_DAYS: i64 = 30;

#[derive(Debug, Error)]
pub enum UnitInfoError {
    #[error("failed to read unit info {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Fields decoded from the unit-info file. Anything missing is `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UnitInfo {
    pub protein_name: Option<String>,
    pub tag: Option<String>,
    pub identity: Option<UnitIdentity>,
    pub download_time: Option<DateTime<Utc>>,
    pub due_time: Option<DateTime<Utc>>,
    pub progress_percent: Option<u32>,
}

/// Parse unit-info text. `reference` (usually the retrieval time) supplies the
/// year the file omits.
pub fn parse_unit_info(text: &str, reference: DateTime<Utc>) -> UnitInfo {
    let mut info = UnitInfo::default();

    for line in text.lines() {
        let line = line.trim();
        if let Some(value) = line.strip_prefix("Name:") {
            info.protein_name = non_empty(value);
        } else if let Some(value) = line.strip_prefix("Tag:") {
            let tag = value.trim();
            info.identity = UnitIdentity::from_tag(tag)
                .ok()
                .filter(|identity| identity.project != 0);
            info.tag = non_empty(tag);
        } else if let Some(value) = line.strip_prefix("Download time:") {
            info.download_time = parse_date(value, reference);
        } else if let Some(value) = line.strip_prefix("Due time:") {
            info.due_time = parse_date(value, reference);
        } else if let Some(value) = line.strip_prefix("Progress:") {
            let digits: String = value
                .trim_start()
                .chars()
                .take_while(char::is_ascii_digit)
                .collect();
            info.progress_percent = digits.parse().ok();
        }
    }

    info
}

/// Read and parse a unit-info file.
pub fn read_unit_info_file(
    path: &Path,
    reference: DateTime<Utc>,
) -> Result<UnitInfo, UnitInfoError> {
    let bytes = std::fs::read(path).map_err(|source| UnitInfoError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parse_unit_info(&String::from_utf8_lossy(&bytes), reference))
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Parse `"March 8 22:41:08"` as UTC, inferring the year from `reference`.
fn parse_date(value: &str, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let value = value.trim();
    let year = reference.year();

    let parse = |year: i32| {
        NaiveDateTime::parse_from_str(&format!("{year} {value}"), DATE_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    };

    let parsed = match parse(year) {
        Some(date) if date > reference + Duration::days(FUTURE_TOLERANCE_DAYS) => parse(year - 1),
        Some(date) => Some(date),
        // Feb 29 only exists in some years
        None => parse(year - 1),
    };

    if parsed.is_none() {
        debug!(value, "Unparseable unit info date");
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn reference() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2009, 3, 9, 12, 0, 0).unwrap()
    }

    const SAMPLE: &str = "\
Current Work Unit
-----------------
Name: Gromacs
Tag: P2669R13C159G79
Download time: March 8 22:41:08
Due time: March 14 22:41:08
Progress: 5%  [____________]
";

    #[test]
    fn test_parse_sample() {
        let info = parse_unit_info(SAMPLE, reference());
        assert_eq!(info.protein_name.as_deref(), Some("Gromacs"));
        assert_eq!(info.tag.as_deref(), Some("P2669R13C159G79"));
        assert_eq!(info.identity, Some(UnitIdentity::new(2669, 13, 159, 79)));
        assert_eq!(
            info.download_time,
            Some(Utc.with_ymd_and_hms(2009, 3, 8, 22, 41, 8).unwrap())
        );
        assert_eq!(
            info.due_time,
            Some(Utc.with_ymd_and_hms(2009, 3, 14, 22, 41, 8).unwrap())
        );
        assert_eq!(info.progress_percent, Some(5));
    }

    #[test]
    fn test_year_rolls_back_for_far_future_dates() {
        let reference = Utc.with_ymd_and_hms(2010, 1, 5, 0, 0, 0).unwrap();
        let info = parse_unit_info("Download time: December 28 10:00:00\n", reference);
        assert_eq!(
            info.download_time,
            Some(Utc.with_ymd_and_hms(2009, 12, 28, 10, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_near_future_keeps_year() {
        let info = parse_unit_info("Due time: March 30 10:00:00\n", reference());
        assert_eq!(
            info.due_time,
            Some(Utc.with_ymd_and_hms(2009, 3, 30, 10, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_missing_and_bad_fields() {
        let info = parse_unit_info("Name:\nTag: nonsense\nDownload time: yesterday\n", reference());
        assert_eq!(info.protein_name, None);
        assert_eq!(info.tag.as_deref(), Some("nonsense"));
        assert_eq!(info.identity, None);
        assert_eq!(info.download_time, None);
        assert_eq!(info.progress_percent, None);
    }

    #[test]
    fn test_empty_text() {
        assert_eq!(parse_unit_info("", reference()), UnitInfo::default());
    }

    #[test]
    fn test_read_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_unit_info_file(&dir.path().join("unitinfo.txt"), reference()).unwrap_err();
        assert!(matches!(err, UnitInfoError::Io { .. }));
    }
}
