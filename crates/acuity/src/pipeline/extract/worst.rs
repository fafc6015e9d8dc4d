use crate::pipeline::definition::Direction;
use crate::pipeline::source::normalize_label;
use crate::pipeline::store::Observation;
use chrono::{DateTime, Utc};

/// A candidate value with the time it was observed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Sample {
    pub at: DateTime<Utc>,
    pub value: f64,
}

/// Worst sample by `direction`. Samples arrive in time order; on ties the earliest wins.
pub(crate) fn worst(samples: impl IntoIterator<Item = Sample>, direction: Direction) -> Option<Sample> {
    samples.into_iter().fold(None, |selected, candidate| match selected {
        Some(current) if !is_worse(candidate.value, current.value, direction) => Some(current),
        _ => Some(candidate),
    })
}

fn is_worse(candidate: f64, current: f64, direction: Direction) -> bool {
    match direction {
        Direction::Min => candidate < current,
        Direction::Max => candidate > current,
    }
}

pub(crate) fn numeric_samples(observations: &[Observation]) -> impl Iterator<Item = Sample> + '_ {
    observations.iter().filter_map(|observation| {
        observation
            .value
            .as_number()
            .filter(|value| value.is_finite())
            .map(|value| Sample {
                at: observation.timestamp,
                value,
            })
    })
}

/// Ranks categorical observations by their position in `levels`; unknown labels are dropped.
pub(crate) fn ordinal_samples<'a>(
    observations: &'a [Observation],
    levels: &'a [String],
) -> impl Iterator<Item = Sample> + 'a {
    observations.iter().filter_map(move |observation| {
        let label = normalize_label(&observation.value.label());
        levels
            .iter()
            .position(|level| *level == label)
            .map(|rank| Sample {
                at: observation.timestamp,
                value: rank as f64,
            })
    })
}
