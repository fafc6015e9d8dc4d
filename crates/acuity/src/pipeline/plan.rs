//! Typed extraction plan: which feature is computed from which categories, and how.

use super::definition::{ContextDefinition, Direction, FeatureDefinition, PipelineDefinition};
use super::domain::Category;
use super::resolver::LookbackPolicy;
use super::source::{normalize_label, SchemaError, SourceAdapter};
use chrono::Duration;
use std::collections::{BTreeMap, BTreeSet};

/// Concurrent category sampled at the selected value's timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextStep {
    pub category: Category,
    pub tolerance: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorstStep {
    pub name: String,
    pub category: Category,
    pub direction: Direction,
    /// Ordinal labels, least severe first. Empty for numeric features.
    pub levels: Vec<String>,
    pub context: Option<ContextStep>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RatioStep {
    pub name: String,
    pub numerator: Category,
    pub denominator: Category,
    pub direction: Direction,
    pub alignment: Duration,
    pub scale: f64,
    pub context: Option<ContextStep>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeatureStep {
    Worst(WorstStep),
    Ratio(RatioStep),
}

impl FeatureStep {
    pub fn name(&self) -> &str {
        match self {
            Self::Worst(step) => &step.name,
            Self::Ratio(step) => &step.name,
        }
    }

    /// Whether the feature emits a context label alongside its value.
    pub fn has_context(&self) -> bool {
        match self {
            Self::Worst(step) => step.context.is_some() || !step.levels.is_empty(),
            Self::Ratio(step) => step.context.is_some(),
        }
    }

    fn categories(&self) -> Vec<&Category> {
        let (mut categories, context) = match self {
            Self::Worst(step) => (vec![&step.category], &step.context),
            Self::Ratio(step) => (vec![&step.numerator, &step.denominator], &step.context),
        };
        if let Some(context) = context {
            categories.push(&context.category);
        }
        categories
    }
}

/// Validated once per run, before any batch starts.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionPlan {
    steps: Vec<FeatureStep>,
    lookback: LookbackPolicy,
    required: BTreeMap<String, BTreeSet<Category>>,
}

impl ExtractionPlan {
    /// Worst-extremal steps in definition order, then ratio steps in definition order.
    pub fn steps(&self) -> &[FeatureStep] {
        &self.steps
    }

    pub fn lookback(&self) -> &LookbackPolicy {
        &self.lookback
    }

    pub fn produces(&self, feature: &str) -> bool {
        self.steps.iter().any(|step| step.name() == feature)
    }

    pub fn feature_names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(FeatureStep::name)
    }

    /// Categories the named source must load for this plan.
    pub fn required_categories(&self, source: &str) -> BTreeSet<Category> {
        self.required.get(source).cloned().unwrap_or_default()
    }
}

pub struct PlanBuilder<'a> {
    definition: &'a PipelineDefinition,
}

impl<'a> PlanBuilder<'a> {
    pub fn new(definition: &'a PipelineDefinition) -> Self {
        Self { definition }
    }

    pub fn build(self) -> Result<ExtractionPlan, SchemaError> {
        let providers = self.category_providers()?;

        let mut worst = Vec::new();
        let mut ratios = Vec::new();
        let mut seen = BTreeSet::new();

        for feature in &self.definition.features {
            if !seen.insert(feature.name().to_string()) {
                return Err(SchemaError::DuplicateFeature(feature.name().to_string()));
            }
            match compile_feature(feature)? {
                step @ FeatureStep::Worst(_) => worst.push(step),
                step @ FeatureStep::Ratio(_) => ratios.push(step),
            }
        }

        let mut steps = worst;
        steps.extend(ratios);

        let mut required: BTreeMap<String, BTreeSet<Category>> = BTreeMap::new();
        for step in &steps {
            for category in step.categories() {
                let source = providers.get(category).ok_or_else(|| SchemaError::MissingCategory {
                    feature: step.name().to_string(),
                    category: category.to_string(),
                })?;
                required
                    .entry(source.clone())
                    .or_default()
                    .insert(category.clone());
            }
        }

        Ok(ExtractionPlan {
            steps,
            lookback: LookbackPolicy::from_definitions(&self.definition.categories)?,
            required,
        })
    }

    /// Maps every declared category to the one source providing it.
    fn category_providers(&self) -> Result<BTreeMap<Category, String>, SchemaError> {
        let mut providers: BTreeMap<Category, String> = BTreeMap::new();
        for source in &self.definition.sources {
            let adapter = SourceAdapter::new(source.clone());
            for category in adapter.declared() {
                if let Some(first) = providers.get(category) {
                    return Err(SchemaError::CategoryClash {
                        category: category.to_string(),
                        first: first.clone(),
                        second: source.name.clone(),
                    });
                }
                providers.insert(category.clone(), source.name.clone());
            }
        }
        Ok(providers)
    }
}

fn canonical(name: &str) -> Category {
    Category(normalize_label(name))
}

fn compile_context(
    feature: &str,
    context: &Option<ContextDefinition>,
) -> Result<Option<ContextStep>, SchemaError> {
    let Some(context) = context else {
        return Ok(None);
    };
    Ok(Some(ContextStep {
        category: canonical(&context.category),
        tolerance: minutes(feature, context.tolerance_minutes, "context tolerance")?,
    }))
}

fn compile_feature(feature: &FeatureDefinition) -> Result<FeatureStep, SchemaError> {
    match feature {
        FeatureDefinition::Worst {
            name,
            category,
            direction,
            levels,
            context,
        } => {
            if !levels.is_empty() && context.is_some() {
                return Err(invalid(name, "ordinal levels already provide the context"));
            }
            let levels: Vec<String> = levels.iter().map(|level| normalize_label(level)).collect();
            let distinct: BTreeSet<&String> = levels.iter().collect();
            if distinct.len() != levels.len() || levels.iter().any(String::is_empty) {
                return Err(invalid(name, "levels must be distinct and non-empty"));
            }

            Ok(FeatureStep::Worst(WorstStep {
                name: name.clone(),
                category: canonical(category),
                direction: *direction,
                levels,
                context: compile_context(name, context)?,
            }))
        }
        FeatureDefinition::Ratio {
            name,
            numerator,
            denominator,
            direction,
            alignment_minutes,
            scale,
            context,
        } => {
            let alignment = minutes(name, *alignment_minutes, "alignment")?;
            if !scale.is_finite() || *scale == 0.0 {
                return Err(invalid(name, "scale must be finite and non-zero"));
            }

            Ok(FeatureStep::Ratio(RatioStep {
                name: name.clone(),
                numerator: canonical(numerator),
                denominator: canonical(denominator),
                direction: *direction,
                alignment,
                scale: *scale,
                context: compile_context(name, context)?,
            }))
        }
    }
}

fn minutes(feature: &str, value: i64, what: &str) -> Result<Duration, SchemaError> {
    if value < 0 {
        return Err(invalid(feature, &format!("{what} must not be negative")));
    }
    Duration::try_minutes(value)
        .ok_or_else(|| invalid(feature, &format!("{what} of {value} minutes is out of range")))
}

fn invalid(feature: &str, detail: &str) -> SchemaError {
    SchemaError::InvalidFeature {
        feature: feature.to_string(),
        detail: detail.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(features: &str) -> PipelineDefinition {
        let raw = format!(
            r#"{{
            "name": "test",
            "sources": [
                {{"name": "labs", "entity_column": "encounter_id", "timestamp_column": "at",
                  "layout": {{"kind": "long", "category_column": "test", "value_column": "value"}},
                  "allowlist": ["platelets", "pao2", "bilirubin"]}},
                {{"name": "respiratory", "entity_column": "encounter_id", "timestamp_column": "at",
                  "layout": {{"kind": "wide", "columns": {{"fio2": "fio2", "device": "device"}}}},
                  "allowlist": ["fio2", "device"]}}
            ],
            "categories": [{{"name": "bilirubin", "lookback_minutes": 1440}}],
            "features": {features},
            "rule_table": "sofa"
        }}"#
        );
        PipelineDefinition::from_json(&raw).expect("definition parses")
    }

    #[test]
    fn ratios_follow_worst_features() {
        let plan = PlanBuilder::new(&definition(
            r#"[
                {"kind": "ratio", "name": "pf_ratio", "numerator": "pao2", "denominator": "fio2",
                 "direction": "min", "scale": 100.0,
                 "context": {"category": "device", "tolerance_minutes": 240}},
                {"kind": "worst", "name": "platelets", "category": "platelets", "direction": "min"},
                {"kind": "worst", "name": "device", "category": "device", "direction": "max",
                 "levels": ["none", "nasal_cannula", "invasive"]}
            ]"#,
        ))
        .build()
        .expect("plan builds");

        assert_eq!(
            plan.feature_names().collect::<Vec<_>>(),
            vec!["platelets", "device", "pf_ratio"]
        );
        let with_context: Vec<&str> = plan
            .steps()
            .iter()
            .filter(|step| step.has_context())
            .map(FeatureStep::name)
            .collect();
        assert_eq!(with_context, vec!["device", "pf_ratio"]);
        assert!(plan.produces("pf_ratio"));
        assert!(!plan.produces("gcs"));
        assert_eq!(
            plan.required_categories("respiratory"),
            BTreeSet::from([Category::from("device"), Category::from("fio2")])
        );
        assert_eq!(
            plan.required_categories("labs"),
            BTreeSet::from([Category::from("pao2"), Category::from("platelets")])
        );
        assert_eq!(
            plan.lookback().tolerance(&Category::from("bilirubin")),
            Some(Duration::hours(24))
        );
    }

    #[test]
    fn features_over_unprovided_categories_are_schema_errors() {
        let error = PlanBuilder::new(&definition(
            r#"[{"kind": "worst", "name": "gcs", "category": "gcs", "direction": "min"}]"#,
        ))
        .build()
        .expect_err("missing category");
        assert!(matches!(
            error,
            SchemaError::MissingCategory { feature, category } if feature == "gcs" && category == "gcs"
        ));
    }

    #[test]
    fn duplicate_feature_names_are_rejected() {
        let error = PlanBuilder::new(&definition(
            r#"[
                {"kind": "worst", "name": "platelets", "category": "platelets", "direction": "min"},
                {"kind": "worst", "name": "platelets", "category": "platelets", "direction": "max"}
            ]"#,
        ))
        .build()
        .expect_err("duplicate");
        assert!(matches!(error, SchemaError::DuplicateFeature(name) if name == "platelets"));
    }

    #[test]
    fn a_category_declared_by_two_sources_clashes() {
        let mut definition = definition(
            r#"[{"kind": "worst", "name": "platelets", "category": "platelets", "direction": "min"}]"#,
        );
        definition.sources[1].allowlist.push("Platelets".to_string());

        let error = PlanBuilder::new(&definition)
            .build()
            .expect_err("namespace clash");
        assert!(matches!(
            error,
            SchemaError::CategoryClash { category, first, second }
                if category == "platelets" && first == "labs" && second == "respiratory"
        ));
    }

    #[test]
    fn levels_and_context_are_mutually_exclusive() {
        let error = PlanBuilder::new(&definition(
            r#"[{"kind": "worst", "name": "device", "category": "device", "direction": "max",
                 "levels": ["none", "invasive"],
                 "context": {"category": "fio2", "tolerance_minutes": 60}}]"#,
        ))
        .build()
        .expect_err("invalid feature");
        assert!(matches!(error, SchemaError::InvalidFeature { .. }));
    }

    #[test]
    fn out_of_range_durations_are_schema_errors() {
        for features in [
            r#"[{"kind": "ratio", "name": "pf_ratio", "numerator": "pao2", "denominator": "fio2",
                 "direction": "min", "alignment_minutes": 9223372036854775807}]"#,
            r#"[{"kind": "ratio", "name": "pf_ratio", "numerator": "pao2", "denominator": "fio2",
                 "direction": "min", "alignment_minutes": -5}]"#,
            r#"[{"kind": "worst", "name": "platelets", "category": "platelets", "direction": "min",
                 "context": {"category": "device", "tolerance_minutes": 9223372036854775807}}]"#,
        ] {
            let error = PlanBuilder::new(&definition(features))
                .build()
                .expect_err("invalid duration");
            assert!(matches!(error, SchemaError::InvalidFeature { .. }));
        }
    }

    #[test]
    fn out_of_range_lookbacks_fail_the_plan() {
        let mut definition = definition(
            r#"[{"kind": "worst", "name": "platelets", "category": "platelets", "direction": "min"}]"#,
        );
        definition.categories[0].lookback_minutes = Some(i64::MAX);

        let error = PlanBuilder::new(&definition)
            .build()
            .expect_err("invalid lookback");
        assert!(matches!(
            error,
            SchemaError::InvalidCategory { category, .. } if category == "bilirubin"
        ));
    }
}
