use super::policy::MissingComponentPolicy;
use super::{ComponentScore, ScoreRow, ScoreSource};
use crate::pipeline::domain::EntityId;
use crate::pipeline::pivot::RowStatus;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Forward-fills missing component scores across an entity's chronologically ordered days.
///
/// Operates on scores: a carried component is re-emitted unchanged, never re-scored. Rows
/// that did not complete are left alone and do not advance the state.
#[derive(Debug, Clone, Copy)]
pub struct CarryForward {
    policy: MissingComponentPolicy,
}

#[derive(Debug, Default)]
struct EntityState {
    entity: Option<EntityId>,
    last: BTreeMap<String, (ComponentScore, DateTime<Utc>)>,
}

impl CarryForward {
    pub fn new(policy: MissingComponentPolicy) -> Self {
        Self { policy }
    }

    /// `rows` must be ordered by entity, then window start.
    pub fn apply(&self, rows: &mut [ScoreRow]) {
        let mut state = EntityState::default();

        for row in rows.iter_mut() {
            if state.entity.as_ref() != Some(&row.window.entity_id) {
                state = EntityState {
                    entity: Some(row.window.entity_id.clone()),
                    last: BTreeMap::new(),
                };
            }
            if row.status != RowStatus::Complete {
                continue;
            }

            for component in &mut row.components {
                if component.tier.is_some() {
                    state.last.insert(
                        component.component.clone(),
                        (component.clone(), row.window.start),
                    );
                    continue;
                }

                match state.last.get(&component.component) {
                    Some((previous, origin)) => {
                        let from = match previous.source {
                            ScoreSource::CarriedForward { from } => from,
                            _ => *origin,
                        };
                        *component = ComponentScore {
                            source: ScoreSource::CarriedForward { from },
                            ..previous.clone()
                        };
                    }
                    None => {
                        component.tier = Some(0);
                        component.source = ScoreSource::Defaulted;
                        state.last.insert(
                            component.component.clone(),
                            (component.clone(), row.window.start),
                        );
                    }
                }
            }

            row.total = self
                .policy
                .combine(row.components.iter().map(|component| component.tier));
        }
    }
}
