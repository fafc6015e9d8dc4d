use super::domain::{Category, EntityId, Fact, FactValue};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub timestamp: DateTime<Utc>,
    pub value: FactValue,
}

/// Time-ordered observations of one category for one entity.
///
/// Sorting is stable, so observations sharing a timestamp keep their ingestion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Series {
    observations: Vec<Observation>,
}

impl Series {
    pub fn from_unsorted(mut observations: Vec<Observation>) -> Self {
        observations.sort_by_key(|observation| observation.timestamp);
        Self { observations }
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Observations with `start <= timestamp <= end`.
    pub fn within(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> &[Observation] {
        let lower = self
            .observations
            .partition_point(|observation| observation.timestamp < start);
        let upper = self
            .observations
            .partition_point(|observation| observation.timestamp <= end);
        if lower >= upper {
            &[]
        } else {
            &self.observations[lower..upper]
        }
    }

    /// Most recent observation strictly before `at`.
    pub fn last_before(&self, at: DateTime<Utc>) -> Option<&Observation> {
        let idx = self
            .observations
            .partition_point(|observation| observation.timestamp < at);
        idx.checked_sub(1).map(|idx| &self.observations[idx])
    }

    /// The observation in effect at `at`: the latest one at or before it, no older than
    /// `tolerance`.
    pub fn as_of(&self, at: DateTime<Utc>, tolerance: Duration) -> Option<&Observation> {
        let idx = self
            .observations
            .partition_point(|observation| observation.timestamp <= at);
        let candidate = &self.observations[idx.checked_sub(1)?];
        (at - candidate.timestamp <= tolerance).then_some(candidate)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityFacts {
    series: BTreeMap<Category, Series>,
    fact_count: usize,
}

impl EntityFacts {
    pub fn series(&self, category: &Category) -> Option<&Series> {
        self.series.get(category)
    }

    pub fn fact_count(&self) -> usize {
        self.fact_count
    }
}

/// Read-only index of every adapted fact, grouped by entity then category.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FactStore {
    entities: BTreeMap<EntityId, EntityFacts>,
}

impl FactStore {
    pub fn from_facts(facts: impl IntoIterator<Item = Fact>) -> Self {
        let mut grouped: BTreeMap<EntityId, BTreeMap<Category, Vec<Observation>>> =
            BTreeMap::new();
        for fact in facts {
            grouped
                .entry(fact.entity_id)
                .or_default()
                .entry(fact.category)
                .or_default()
                .push(Observation {
                    timestamp: fact.timestamp,
                    value: fact.value,
                });
        }

        let entities = grouped
            .into_iter()
            .map(|(entity, categories)| {
                let mut fact_count = 0;
                let series = categories
                    .into_iter()
                    .map(|(category, observations)| {
                        fact_count += observations.len();
                        (category, Series::from_unsorted(observations))
                    })
                    .collect();
                (entity, EntityFacts { series, fact_count })
            })
            .collect();

        Self { entities }
    }

    pub fn fact_count(&self) -> usize {
        self.entities.values().map(EntityFacts::fact_count).sum()
    }

    /// Borrows the facts of `entities` for one batch. Nothing is copied.
    pub fn prefetch(&self, entities: &[EntityId]) -> StoreSlice<'_> {
        let entities = entities
            .iter()
            .filter_map(|entity| self.entities.get_key_value(entity))
            .collect();
        StoreSlice { entities }
    }
}

/// Per-entity fact lookup, over the whole store or a batch's slice of it.
pub trait FactLookup {
    fn facts_for(&self, entity: &EntityId) -> Option<&EntityFacts>;
}

impl FactLookup for FactStore {
    fn facts_for(&self, entity: &EntityId) -> Option<&EntityFacts> {
        self.entities.get(entity)
    }
}

/// The entities of one batch, borrowed from the run-wide store.
#[derive(Debug, Clone, Default)]
pub struct StoreSlice<'a> {
    entities: BTreeMap<&'a EntityId, &'a EntityFacts>,
}

impl StoreSlice<'_> {
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn fact_count(&self) -> usize {
        self.entities.values().map(|facts| facts.fact_count()).sum()
    }
}

impl FactLookup for StoreSlice<'_> {
    fn facts_for(&self, entity: &EntityId) -> Option<&EntityFacts> {
        self.entities.get(entity).copied()
    }
}
