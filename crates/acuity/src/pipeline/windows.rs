//! Window catalog: the caller-supplied scoring windows, validated and indexed per entity.

use super::domain::{format_timestamp, EntityId, Window};
use super::source::parse_timestamp;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::ops::Range;
use tracing::warn;

/// How invalid windows are treated on ingestion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strictness {
    /// Drop the window, log a warning and record it in the run report.
    #[default]
    Lenient,
    /// Fail the run before any batch executes.
    Strict,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WindowError {
    #[error("window {window} starts after it ends")]
    Inverted { window: Window },
    #[error("window {window} references unknown entity")]
    UnknownEntity { window: Window },
    #[error("window {window} overlaps {existing}")]
    Overlap { window: Window, existing: Window },
    #[error("window catalog row {row} is invalid: {detail}")]
    InvalidRow { row: usize, detail: String },
    #[error("day {day} of entity {entity} falls outside the supported date range")]
    OutOfRange { entity: EntityId, day: i64 },
}

impl WindowError {
    fn window(&self) -> Option<&Window> {
        match self {
            WindowError::Inverted { window }
            | WindowError::UnknownEntity { window }
            | WindowError::Overlap { window, .. } => Some(window),
            WindowError::InvalidRow { .. } | WindowError::OutOfRange { .. } => None,
        }
    }
}

/// A window removed during lenient ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DroppedWindow {
    pub entity_id: EntityId,
    pub start: String,
    pub end: String,
    pub reason: String,
}

impl DroppedWindow {
    fn from_error(window: &Window, error: &WindowError) -> Self {
        Self {
            entity_id: window.entity_id.clone(),
            start: format_timestamp(window.start),
            end: format_timestamp(window.end),
            reason: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowCatalog {
    windows: Vec<Window>,
    index: BTreeMap<EntityId, Range<usize>>,
}

impl WindowCatalog {
    /// Validates windows and builds the catalog.
    ///
    /// `known_entities`, when given, is the registry that windows must reference.
    pub fn ingest(
        windows: impl IntoIterator<Item = Window>,
        known_entities: Option<&BTreeSet<EntityId>>,
        strictness: Strictness,
    ) -> Result<(Self, Vec<DroppedWindow>), WindowError> {
        let mut candidates: Vec<Window> = windows.into_iter().collect();
        candidates.sort();

        let mut accepted: Vec<Window> = Vec::with_capacity(candidates.len());
        let mut dropped = Vec::new();

        for window in candidates {
            let verdict = if window.start > window.end {
                Err(WindowError::Inverted {
                    window: window.clone(),
                })
            } else if known_entities.is_some_and(|known| !known.contains(&window.entity_id)) {
                Err(WindowError::UnknownEntity {
                    window: window.clone(),
                })
            } else {
                match accepted.last() {
                    Some(previous) if previous.overlaps(&window) => Err(WindowError::Overlap {
                        window: window.clone(),
                        existing: previous.clone(),
                    }),
                    _ => Ok(()),
                }
            };

            match verdict {
                Ok(()) => accepted.push(window),
                Err(error) if strictness == Strictness::Strict => return Err(error),
                Err(error) => {
                    warn!(window = %window, error = %error, "dropping invalid window");
                    if let Some(window) = error.window() {
                        dropped.push(DroppedWindow::from_error(window, &error));
                    }
                }
            }
        }

        Ok((Self::from_sorted(accepted), dropped))
    }

    fn from_sorted(windows: Vec<Window>) -> Self {
        let mut index: BTreeMap<EntityId, Range<usize>> = BTreeMap::new();
        for (position, window) in windows.iter().enumerate() {
            index
                .entry(window.entity_id.clone())
                .and_modify(|range| range.end = position + 1)
                .or_insert(position..position + 1);
        }
        Self { windows, index }
    }

    /// Reads `entity_id,start,end` rows. Malformed rows fail regardless of strictness.
    pub fn read_csv<R: Read>(reader: R) -> Result<Vec<Window>, WindowError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);
        let mut windows = Vec::new();

        for (row, record) in csv_reader.deserialize::<WindowRow>().enumerate() {
            let row = row + 1;
            let record = record.map_err(|err| WindowError::InvalidRow {
                row,
                detail: err.to_string(),
            })?;
            windows.push(record.into_window(row)?);
        }

        Ok(windows)
    }

    /// Reads an entity registry: one `entity_id` per row, other columns ignored.
    pub fn read_entities<R: Read>(reader: R) -> Result<BTreeSet<EntityId>, WindowError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);
        let mut entities = BTreeSet::new();

        for (row, record) in csv_reader.deserialize::<EntityRow>().enumerate() {
            let record = record.map_err(|err| WindowError::InvalidRow {
                row: row + 1,
                detail: err.to_string(),
            })?;
            if !record.entity_id.is_empty() {
                entities.insert(EntityId(record.entity_id));
            }
        }

        Ok(entities)
    }

    /// Chained day windows `[start + k days, start + (k + 1) days - 1s]`.
    pub fn daily(
        entity: &EntityId,
        first_day_start: DateTime<Utc>,
        days: u32,
    ) -> Result<Vec<Window>, WindowError> {
        let length = Duration::days(1) - Duration::seconds(1);
        (0..i64::from(days))
            .map(|day| {
                Duration::try_days(day)
                    .and_then(|offset| first_day_start.checked_add_signed(offset))
                    .and_then(|start| Some((start, start.checked_add_signed(length)?)))
                    .map(|(start, end)| Window::new(entity.clone(), start, end))
                    .ok_or_else(|| WindowError::OutOfRange {
                        entity: entity.clone(),
                        day,
                    })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// All windows ordered by entity, then start.
    pub fn windows(&self) -> &[Window] {
        &self.windows
    }

    /// Distinct entities in sorted order.
    pub fn entities(&self) -> Vec<EntityId> {
        self.index.keys().cloned().collect()
    }

    /// The entity's windows in chronological order.
    pub fn for_entity(&self, entity: &EntityId) -> &[Window] {
        self.index
            .get(entity)
            .map(|range| &self.windows[range.clone()])
            .unwrap_or(&[])
    }

    pub fn restrict(&self, entities: &[EntityId]) -> WindowCatalog {
        let mut selected: Vec<&EntityId> = entities.iter().collect();
        selected.sort();
        selected.dedup();

        let windows = selected
            .into_iter()
            .flat_map(|entity| self.for_entity(entity).iter().cloned())
            .collect();
        Self::from_sorted(windows)
    }
}

#[derive(Debug, Deserialize)]
struct EntityRow {
    entity_id: String,
}

#[derive(Debug, Deserialize)]
struct WindowRow {
    entity_id: String,
    #[serde(deserialize_with = "timestamp_or_none")]
    start: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "timestamp_or_none")]
    end: Option<DateTime<Utc>>,
}

impl WindowRow {
    fn into_window(self, row: usize) -> Result<Window, WindowError> {
        let invalid = |detail: &str| WindowError::InvalidRow {
            row,
            detail: detail.to_string(),
        };
        if self.entity_id.is_empty() {
            return Err(invalid("empty entity_id"));
        }
        let start = self.start.ok_or_else(|| invalid("unparseable start"))?;
        let end = self.end.ok_or_else(|| invalid("unparseable end"))?;
        Ok(Window::new(self.entity_id, start, end))
    }
}

fn timestamp_or_none<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(parse_timestamp(&raw))
}
