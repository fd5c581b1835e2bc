use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::model::ImportSource;
use crate::punch::{ImportMode, ImportRequest, PunchType, RawPunch};

//=============================================================================
// Punch Sources
//=============================================================================

/// Anything that can hand the engine a batch of punches: a terminal, a file, an API.
#[async_trait]
pub trait PunchSource: Send + Sync {
    /// Key the import watermark is stored under.
    fn source_key(&self) -> &str;

    fn import_source(&self) -> ImportSource;

    /// Zone the source reports wall-clock times in, if it is not the employee's own.
    fn device_tz(&self) -> Option<Tz> {
        None
    }

    async fn fetch(&self) -> EngineResult<Vec<RawPunch>>;

    /// Fetches and wraps the punches into an import request.
    async fn pull(&self, mode: ImportMode) -> EngineResult<ImportRequest> {
        let punches = self.fetch().await?;
        debug!("Pulled {} punches from {}", punches.len(), self.source_key());
        Ok(ImportRequest {
            source_key: self.source_key().to_string(),
            source: self.import_source(),
            punches,
            device_tz: self.device_tz(),
            mode,
        })
    }
}

/// Punches already in memory, e.g. pushed through an API.
#[derive(Debug, Clone)]
pub struct StaticPunchSource {
    key: String,
    source: ImportSource,
    punches: Vec<RawPunch>,
}

impl StaticPunchSource {
    pub fn new(key: &str, source: ImportSource, punches: Vec<RawPunch>) -> Self {
        Self {
            key: key.to_string(),
            source,
            punches,
        }
    }
}

#[async_trait]
impl PunchSource for StaticPunchSource {
    fn source_key(&self) -> &str {
        &self.key
    }

    fn import_source(&self) -> ImportSource {
        self.source
    }

    async fn fetch(&self) -> EngineResult<Vec<RawPunch>> {
        Ok(self.punches.clone())
    }
}

// --- CSV ---

/// Wall-clock layouts accepted for punch timestamps, tried in order after RFC 3339.
const TIMESTAMP_FORMATS: [&str; 6] = [
    "%Y-%m-%d %H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%d/%m/%Y %H:%M",
    "%m/%d/%Y %H:%M",
];

/// Parses a punch timestamp. Values without an offset are wall-clock times in `tz`.
pub fn parse_timestamp(value: &str, tz: Tz) -> EngineResult<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(instant) = DateTime::parse_from_rfc3339(value) {
        return Ok(instant.with_timezone(&Utc));
    }
    let naive = TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .ok_or_else(|| EngineError::Validation(format!("Unrecognised timestamp '{}'", value)))?;
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| EngineError::Validation(format!("Timestamp '{}' does not exist in {}", value, tz)))
}

#[derive(Debug, Deserialize)]
struct CsvRow {
    identifier: String,
    timestamp: String,
    #[serde(default)]
    punch_type: Option<String>,
}

/// Rows that parsed, plus one message per row that did not.
#[derive(Debug, Default)]
pub struct ParsedPunches {
    pub punches: Vec<RawPunch>,
    pub errors: Vec<String>,
}

/// Reads `identifier,timestamp[,punch_type]` rows. A bad row is reported and skipped.
pub fn parse_punch_csv<R: std::io::Read>(reader: R, tz: Tz) -> ParsedPunches {
    let mut parsed = ParsedPunches::default();
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);

    for (index, row) in rdr.deserialize::<CsvRow>().enumerate() {
        let line = index + 2;
        let row = match row {
            Ok(row) => row,
            Err(e) => {
                parsed.errors.push(format!("line {}: {}", line, e));
                continue;
            }
        };
        let instant = match parse_timestamp(&row.timestamp, tz) {
            Ok(instant) => instant,
            Err(e) => {
                parsed.errors.push(format!("line {}: {}", line, e));
                continue;
            }
        };
        let punch_type = match row.punch_type.as_deref().filter(|s| !s.trim().is_empty()) {
            Some(raw) => match raw.parse::<PunchType>() {
                Ok(kind) => Some(kind),
                Err(e) => {
                    parsed.errors.push(format!("line {}: {}", line, e));
                    continue;
                }
            },
            None => None,
        };
        parsed.punches.push(RawPunch {
            identifier: row.identifier,
            instant,
            punch_type,
        });
    }
    parsed
}

/// A punch export file, read fresh on every fetch.
#[derive(Debug, Clone)]
pub struct CsvPunchSource {
    path: PathBuf,
    tz: Tz,
    key: String,
}

impl CsvPunchSource {
    /// `tz` is the zone of the timestamps in the file; the key defaults to the path.
    pub fn new(path: impl Into<PathBuf>, tz: Tz) -> Self {
        let path = path.into();
        let key = format!("csv:{}", path.display());
        Self { path, tz, key }
    }

    pub fn with_key(mut self, key: &str) -> Self {
        self.key = key.to_string();
        self
    }
}

#[async_trait]
impl PunchSource for CsvPunchSource {
    fn source_key(&self) -> &str {
        &self.key
    }

    fn import_source(&self) -> ImportSource {
        ImportSource::Csv
    }

    fn device_tz(&self) -> Option<Tz> {
        Some(self.tz)
    }

    async fn fetch(&self) -> EngineResult<Vec<RawPunch>> {
        let bytes = tokio::fs::read(&self.path).await?;
        let parsed = parse_punch_csv(bytes.as_slice(), self.tz);
        for error in &parsed.errors {
            warn!("Skipping punch row in {}: {}", self.path.display(), error);
        }
        info!(
            "Read {} punches from {} ({} rows rejected)",
            parsed.punches.len(),
            self.path.display(),
            parsed.errors.len()
        );
        Ok(parsed.punches)
    }
}

#[cfg(test)]
mod source_tests {
    use super::*;

    fn hcm() -> Tz {
        "Asia/Ho_Chi_Minh".parse().unwrap()
    }

    #[test]
    fn wall_clock_timestamps_use_the_source_zone() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 4, 1, 2, 0).unwrap();
        assert_eq!(parse_timestamp("2024-03-04 08:02:00", hcm()).unwrap(), expected);
        assert_eq!(parse_timestamp("2024-03-04 08:02", hcm()).unwrap(), expected);
        assert_eq!(parse_timestamp("04/03/2024 08:02:00", hcm()).unwrap(), expected);
        assert_eq!(parse_timestamp("2024-03-04T08:02:00+07:00", Tz::UTC).unwrap(), expected);
        assert!(matches!(
            parse_timestamp("yesterday", hcm()),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn bad_rows_are_reported_not_fatal() {
        let data = "identifier,timestamp,punch_type\n\
                    1001,2024-03-04 08:02:00,0\n\
                    1001,not a time,1\n\
                    1002,2024-03-04 17:30:00,sideways\n\
                    1002,2024-03-04 17:30:00,\n";
        let parsed = parse_punch_csv(data.as_bytes(), hcm());
        assert_eq!(parsed.punches.len(), 2);
        assert_eq!(parsed.punches[0].punch_type, Some(PunchType::In));
        assert_eq!(parsed.punches[1].punch_type, None);
        assert_eq!(parsed.errors.len(), 2);
        assert!(parsed.errors[0].starts_with("line 3"));
    }

    #[tokio::test]
    async fn csv_source_reads_file_into_request() {
        let path = std::env::temp_dir().join(format!("punches-{}.csv", std::process::id()));
        tokio::fs::write(&path, "identifier,timestamp\n1001,2024-03-04 08:02:00\n")
            .await
            .unwrap();

        let source = CsvPunchSource::new(&path, hcm()).with_key("terminal-1");
        let request = source.pull(ImportMode::Incremental).await.unwrap();
        tokio::fs::remove_file(&path).await.unwrap();

        assert_eq!(request.source_key, "terminal-1");
        assert_eq!(request.source, ImportSource::Csv);
        assert_eq!(request.device_tz, Some(hcm()));
        assert_eq!(request.punches.len(), 1);
        assert_eq!(request.punches[0].identifier, "1001");
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let source = CsvPunchSource::new("/nonexistent/punches.csv", Tz::UTC);
        assert!(matches!(source.fetch().await, Err(EngineError::Io(_))));
    }
}
