use super::worst::{numeric_samples, Sample};
use crate::pipeline::store::Observation;
use chrono::{DateTime, Utc};

/// Pairs each numerator sample with the denominator in effect at its timestamp.
///
/// `denominator_at` is the as-of lookup bounded by the alignment tolerance. Pairs whose
/// denominator is missing, non-numeric or non-positive are dropped.
pub(crate) fn aligned_ratios<'a, F>(
    numerator: &'a [Observation],
    scale: f64,
    denominator_at: F,
) -> impl Iterator<Item = Sample> + 'a
where
    F: Fn(DateTime<Utc>) -> Option<&'a Observation> + 'a,
{
    numeric_samples(numerator).filter_map(move |sample| {
        let denominator = denominator_at(sample.at)?.value.as_number()?;
        if denominator <= 0.0 || !denominator.is_finite() {
            return None;
        }
        let ratio = sample.value / denominator * scale;
        ratio.is_finite().then_some(Sample {
            at: sample.at,
            value: ratio,
        })
    })
}
