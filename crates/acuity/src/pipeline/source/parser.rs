use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use csv::StringRecord;
use std::io::Read;

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];
const OFFSET_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%z"];

/// Parses a timestamp cell. Offset-less values are taken to be UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }

    for format in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(trimmed, format) {
            return Some(dt.with_timezone(&Utc));
        }
    }

    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return date
            .and_hms_opt(0, 0, 0)
            .map(|naive| Utc.from_utc_datetime(&naive));
    }

    None
}

/// A CSV table whose header has been checked against the required columns.
pub(crate) struct CheckedTable<R: Read> {
    reader: csv::Reader<R>,
    headers: StringRecord,
}

impl<R: Read> CheckedTable<R> {
    /// Opens the table and returns the first required column missing from the header, if any.
    pub(crate) fn open<'a>(
        reader: R,
        required: impl IntoIterator<Item = &'a str>,
    ) -> Result<Result<Self, String>, csv::Error> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(reader);
        let headers = csv_reader.headers()?.clone();

        for column in required {
            if column_index(&headers, column).is_none() {
                return Ok(Err(column.to_string()));
            }
        }

        Ok(Ok(Self {
            reader: csv_reader,
            headers,
        }))
    }

    pub(crate) fn index_of(&self, column: &str) -> Option<usize> {
        column_index(&self.headers, column)
    }

    pub(crate) fn records(&mut self) -> csv::StringRecordsIter<'_, R> {
        self.reader.records()
    }
}

fn column_index(headers: &StringRecord, column: &str) -> Option<usize> {
    headers
        .iter()
        .position(|header| header.trim_start_matches('\u{feff}').trim() == column)
}
