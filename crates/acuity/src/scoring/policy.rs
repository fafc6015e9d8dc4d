use serde::{Deserialize, Serialize};

/// How null components contribute to a total. Stored components are never rewritten.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingComponentPolicy {
    /// Any null component makes the total null.
    Propagate,
    /// Sum of the non-null components; null only when every component is null.
    #[default]
    SumAvailable,
    /// Null components count as zero.
    FillZero,
}

impl MissingComponentPolicy {
    pub fn combine(&self, tiers: impl IntoIterator<Item = Option<u8>>) -> Option<u16> {
        let mut total: u16 = 0;
        let mut seen_value = false;
        let mut seen_null = false;

        for tier in tiers {
            match tier {
                Some(tier) => {
                    total = total.saturating_add(u16::from(tier));
                    seen_value = true;
                }
                None => seen_null = true,
            }
        }

        match self {
            MissingComponentPolicy::Propagate if seen_null => None,
            MissingComponentPolicy::SumAvailable if !seen_value => None,
            _ => Some(total),
        }
    }
}
