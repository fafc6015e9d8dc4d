//! Point-in-time resolution of a sparse category against a window.

use super::definition::CategoryDefinition;
use super::domain::{Category, EntityId, Window};
use super::source::{normalize_label, SchemaError};
use super::store::{EntityFacts, FactLookup, Observation, Series};
use chrono::Duration;
use std::collections::BTreeMap;
use std::time::Instant;

/// Per-category lookback tolerances. Categories without one never fall back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LookbackPolicy {
    tolerances: BTreeMap<Category, Duration>,
}

impl LookbackPolicy {
    pub fn from_definitions(categories: &[CategoryDefinition]) -> Result<Self, SchemaError> {
        let mut tolerances = BTreeMap::new();
        for category in categories {
            let Some(minutes) = category.lookback_minutes else {
                continue;
            };
            let tolerance = (minutes >= 0)
                .then(|| Duration::try_minutes(minutes))
                .flatten()
                .ok_or_else(|| SchemaError::InvalidCategory {
                    category: category.name.clone(),
                    detail: format!("lookback of {minutes} minutes is negative or out of range"),
                })?;
            tolerances.insert(Category(normalize_label(&category.name)), tolerance);
        }
        Ok(Self { tolerances })
    }

    pub fn with(mut self, category: impl Into<Category>, tolerance: Duration) -> Self {
        self.tolerances.insert(category.into(), tolerance);
        self
    }

    pub fn tolerance(&self, category: &Category) -> Option<Duration> {
        self.tolerances.get(category).copied()
    }
}

/// Facts that describe one category over one window.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedValueSet<'a> {
    pub window: &'a Window,
    pub category: &'a Category,
    pub in_window: &'a [Observation],
    /// Set only when `in_window` is empty and the prior fact is within tolerance.
    pub fallback: Option<&'a Observation>,
}

impl<'a> ResolvedValueSet<'a> {
    /// The observations feature extraction reduces over.
    pub fn values(&self) -> &'a [Observation] {
        match self.fallback {
            Some(fallback) if self.in_window.is_empty() => std::slice::from_ref(fallback),
            _ => self.in_window,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolverTimeoutError {
    #[error("entity {entity} has {facts} facts, above the per-entity budget of {limit}")]
    FactVolume {
        entity: EntityId,
        facts: usize,
        limit: usize,
    },
    #[error("entity {entity} exceeded its {limit_ms}ms resolution deadline")]
    Deadline { entity: EntityId, limit_ms: u64 },
}

impl ResolverTimeoutError {
    pub fn entity(&self) -> &EntityId {
        match self {
            Self::FactVolume { entity, .. } | Self::Deadline { entity, .. } => entity,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolverBudget {
    pub max_facts_per_entity: Option<usize>,
    pub entity_deadline: Option<std::time::Duration>,
}

#[derive(Debug, Clone)]
pub struct Resolver {
    lookback: LookbackPolicy,
    budget: ResolverBudget,
}

impl Resolver {
    pub fn new(lookback: LookbackPolicy, budget: ResolverBudget) -> Self {
        Self { lookback, budget }
    }

    /// Starts resolving one entity, checking its fact volume against the budget.
    pub fn entity<'a, S: FactLookup + ?Sized>(
        &'a self,
        store: &'a S,
        entity: &EntityId,
    ) -> Result<EntityResolver<'a>, ResolverTimeoutError> {
        let facts = store.facts_for(entity);
        let volume = facts.map(EntityFacts::fact_count).unwrap_or_default();
        if let Some(limit) = self.budget.max_facts_per_entity {
            if volume > limit {
                return Err(ResolverTimeoutError::FactVolume {
                    entity: entity.clone(),
                    facts: volume,
                    limit,
                });
            }
        }

        Ok(EntityResolver {
            resolver: self,
            entity: entity.clone(),
            facts,
            started: Instant::now(),
        })
    }
}

/// Resolution scoped to one entity, with its deadline clock running.
#[derive(Debug)]
pub struct EntityResolver<'a> {
    resolver: &'a Resolver,
    entity: EntityId,
    facts: Option<&'a EntityFacts>,
    started: Instant,
}

impl<'a> EntityResolver<'a> {
    fn series(&self, category: &Category) -> Option<&'a Series> {
        self.facts.and_then(|facts| facts.series(category))
    }

    pub fn check_deadline(&self) -> Result<(), ResolverTimeoutError> {
        match self.resolver.budget.entity_deadline {
            Some(deadline) if self.started.elapsed() >= deadline => {
                Err(ResolverTimeoutError::Deadline {
                    entity: self.entity.clone(),
                    limit_ms: u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
                })
            }
            _ => Ok(()),
        }
    }

    pub fn resolve<'w>(
        &self,
        window: &'w Window,
        category: &'w Category,
    ) -> Result<ResolvedValueSet<'w>, ResolverTimeoutError>
    where
        'a: 'w,
    {
        self.check_deadline()?;

        let Some(series) = self.series(category) else {
            return Ok(ResolvedValueSet {
                window,
                category,
                in_window: &[],
                fallback: None,
            });
        };

        let in_window = series.within(window.start, window.end);
        let fallback = if in_window.is_empty() {
            self.resolver
                .lookback
                .tolerance(category)
                .and_then(|tolerance| {
                    series
                        .last_before(window.start)
                        .filter(|prior| window.start - prior.timestamp <= tolerance)
                })
        } else {
            None
        };

        Ok(ResolvedValueSet {
            window,
            category,
            in_window,
            fallback,
        })
    }

    /// The observation of `category` in effect at `at`, no older than `tolerance`.
    pub fn as_of(
        &self,
        category: &Category,
        at: chrono::DateTime<chrono::Utc>,
        tolerance: Duration,
    ) -> Option<&'a Observation> {
        self.series(category)
            .and_then(|series| series.as_of(at, tolerance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::domain::{Fact, FactValue};
    use crate::pipeline::store::FactStore;
    use chrono::{DateTime, TimeZone, Utc};

    fn at(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0)
            .single()
            .expect("valid timestamp")
            + Duration::minutes(minutes)
    }

    fn fact(entity: &str, category: &str, minutes: i64, value: f64) -> Fact {
        Fact {
            entity_id: EntityId::from(entity),
            timestamp: at(minutes),
            category: Category::from(category),
            value: FactValue::Number(value),
            source_table: "labs".to_string(),
        }
    }

    fn lookback() -> LookbackPolicy {
        LookbackPolicy::default().with("bilirubin", Duration::hours(6))
    }

    #[test]
    fn in_window_facts_suppress_the_fallback() {
        let store = FactStore::from_facts(vec![
            fact("E1", "bilirubin", -60, 5.0),
            fact("E1", "bilirubin", 120, 1.1),
        ]);
        let resolver = Resolver::new(lookback(), ResolverBudget::default());
        let window = Window::new("E1", at(0), at(24 * 60));
        let category = Category::from("bilirubin");

        let entity = resolver
            .entity(&store, &EntityId::from("E1"))
            .expect("within budget");
        let resolved = entity.resolve(&window, &category).expect("resolves");

        assert_eq!(resolved.in_window.len(), 1);
        assert!(resolved.fallback.is_none());
        assert_eq!(resolved.values()[0].value, FactValue::Number(1.1));
    }

    #[test]
    fn fallback_tolerance_is_inclusive() {
        let category = Category::from("bilirubin");
        let window = Window::new("E1", at(0), at(60));
        let resolver = Resolver::new(lookback(), ResolverBudget::default());

        let store = FactStore::from_facts(vec![fact("E1", "bilirubin", -360, 2.2)]);
        let entity = resolver
            .entity(&store, &EntityId::from("E1"))
            .expect("within budget");
        let resolved = entity.resolve(&window, &category).expect("resolves");
        assert_eq!(
            resolved.fallback.map(|observation| observation.timestamp),
            Some(at(-360))
        );

        let older = FactStore::from_facts(vec![Fact {
            timestamp: at(-360) - Duration::seconds(1),
            ..fact("E1", "bilirubin", 0, 2.2)
        }]);
        let entity = resolver
            .entity(&older, &EntityId::from("E1"))
            .expect("within budget");
        let resolved = entity.resolve(&window, &category).expect("resolves");
        assert!(resolved.fallback.is_none());
        assert!(resolved.is_empty());
    }

    #[test]
    fn categories_without_tolerance_never_fall_back() {
        let store = FactStore::from_facts(vec![fact("E1", "platelets", -1, 80.0)]);
        let resolver = Resolver::new(lookback(), ResolverBudget::default());
        let window = Window::new("E1", at(0), at(60));
        let category = Category::from("platelets");

        let entity = resolver
            .entity(&store, &EntityId::from("E1"))
            .expect("within budget");
        assert!(entity
            .resolve(&window, &category)
            .expect("resolves")
            .is_empty());
    }

    #[test]
    fn fact_volume_budget_aborts_the_entity() {
        let store = FactStore::from_facts(vec![
            fact("E1", "bilirubin", 1, 1.0),
            fact("E1", "bilirubin", 2, 1.0),
            fact("E1", "bilirubin", 3, 1.0),
        ]);
        let resolver = Resolver::new(
            lookback(),
            ResolverBudget {
                max_facts_per_entity: Some(2),
                entity_deadline: None,
            },
        );

        let error = resolver
            .entity(&store, &EntityId::from("E1"))
            .expect_err("over budget");
        assert_eq!(
            error,
            ResolverTimeoutError::FactVolume {
                entity: EntityId::from("E1"),
                facts: 3,
                limit: 2,
            }
        );
    }

    #[test]
    fn zero_deadline_expires_immediately() {
        let store = FactStore::from_facts(vec![fact("E1", "bilirubin", 1, 1.0)]);
        let resolver = Resolver::new(
            lookback(),
            ResolverBudget {
                max_facts_per_entity: None,
                entity_deadline: Some(std::time::Duration::ZERO),
            },
        );
        let window = Window::new("E1", at(0), at(60));
        let category = Category::from("bilirubin");

        let entity = resolver
            .entity(&store, &EntityId::from("E1"))
            .expect("volume within budget");
        let error = entity.resolve(&window, &category).expect_err("deadline");
        assert!(matches!(error, ResolverTimeoutError::Deadline { limit_ms: 0, .. }));
    }

    #[test]
    fn lookback_policy_normalizes_category_names() {
        let policy = LookbackPolicy::from_definitions(&[
            CategoryDefinition {
                name: "Total Bilirubin".to_string(),
                lookback_minutes: Some(90),
            },
            CategoryDefinition {
                name: "platelets".to_string(),
                lookback_minutes: None,
            },
        ])
        .expect("valid lookbacks");
        assert_eq!(
            policy.tolerance(&Category::from("total_bilirubin")),
            Some(Duration::minutes(90))
        );
        assert_eq!(policy.tolerance(&Category::from("platelets")), None);
    }

    #[test]
    fn negative_or_unrepresentable_lookbacks_are_rejected() {
        for minutes in [-1, i64::MAX, i64::MIN] {
            let error = LookbackPolicy::from_definitions(&[CategoryDefinition {
                name: "creatinine".to_string(),
                lookback_minutes: Some(minutes),
            }])
            .expect_err("invalid lookback");
            assert!(matches!(
                error,
                SchemaError::InvalidCategory { category, .. } if category == "creatinine"
            ));
        }
    }
}
