//! Reduces resolved value sets to one feature value per window.

mod ratio;
mod worst;

use super::domain::Window;
use super::plan::{ContextStep, ExtractionPlan, FeatureStep, RatioStep, WorstStep};
use super::resolver::{EntityResolver, ResolverTimeoutError};
use chrono::{DateTime, Utc};
use ratio::aligned_ratios;
use serde::Serialize;
use std::collections::BTreeMap;
use worst::{numeric_samples, ordinal_samples, worst, Sample};

/// A selected value with its provenance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureValue {
    pub value: f64,
    pub observed_at: DateTime<Utc>,
    /// Concurrent device or category label, or the level label of an ordinal feature.
    pub context: Option<String>,
}

/// Every planned feature for one window; absent data is `None`, never a missing key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureVector {
    pub window: Window,
    pub features: BTreeMap<String, Option<FeatureValue>>,
}

impl FeatureVector {
    pub fn empty(window: Window, plan: &ExtractionPlan) -> Self {
        let features = plan
            .feature_names()
            .map(|name| (name.to_string(), None))
            .collect();
        Self { window, features }
    }

    pub fn get(&self, feature: &str) -> Option<&FeatureValue> {
        self.features.get(feature).and_then(Option::as_ref)
    }
}

pub struct FeatureExtractor<'p> {
    plan: &'p ExtractionPlan,
}

impl<'p> FeatureExtractor<'p> {
    pub fn new(plan: &'p ExtractionPlan) -> Self {
        Self { plan }
    }

    pub fn extract(
        &self,
        entity: &EntityResolver<'_>,
        window: &Window,
    ) -> Result<FeatureVector, ResolverTimeoutError> {
        let mut vector = FeatureVector::empty(window.clone(), self.plan);
        for step in self.plan.steps() {
            let value = match step {
                FeatureStep::Worst(step) => extract_worst(entity, window, step)?,
                FeatureStep::Ratio(step) => extract_ratio(entity, window, step)?,
            };
            vector.features.insert(step.name().to_string(), value);
        }
        Ok(vector)
    }
}

fn extract_worst(
    entity: &EntityResolver<'_>,
    window: &Window,
    step: &WorstStep,
) -> Result<Option<FeatureValue>, ResolverTimeoutError> {
    let resolved = entity.resolve(window, &step.category)?;
    let values = resolved.values();

    if step.levels.is_empty() {
        let selected = worst(numeric_samples(values), step.direction);
        return Ok(selected.map(|sample| with_context(entity, sample, step.context.as_ref())));
    }

    let selected = worst(ordinal_samples(values, &step.levels), step.direction);
    Ok(selected.map(|sample| FeatureValue {
        value: sample.value,
        observed_at: sample.at,
        context: step.levels.get(sample.value as usize).cloned(),
    }))
}

fn extract_ratio(
    entity: &EntityResolver<'_>,
    window: &Window,
    step: &RatioStep,
) -> Result<Option<FeatureValue>, ResolverTimeoutError> {
    let resolved = entity.resolve(window, &step.numerator)?;
    let ratios = aligned_ratios(resolved.values(), step.scale, |at| {
        entity.as_of(&step.denominator, at, step.alignment)
    });
    let selected = worst(ratios, step.direction);
    Ok(selected.map(|sample| with_context(entity, sample, step.context.as_ref())))
}

fn with_context(
    entity: &EntityResolver<'_>,
    sample: Sample,
    context: Option<&ContextStep>,
) -> FeatureValue {
    let context = context.and_then(|context| {
        entity
            .as_of(&context.category, sample.at, context.tolerance)
            .map(|observation| observation.value.label())
    });
    FeatureValue {
        value: sample.value,
        observed_at: sample.at,
        context,
    }
}
