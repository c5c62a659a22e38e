//! Per-dimension targeting predicates.

use drip_core::types::{Client, TargetingCriteria};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    LifeStage,
    ClientType,
    PriorServices,
}

impl Dimension {
    pub const ALL: [Dimension; 3] = [
        Dimension::LifeStage,
        Dimension::ClientType,
        Dimension::PriorServices,
    ];

    pub fn targets<'a>(&self, criteria: &'a TargetingCriteria) -> &'a BTreeSet<String> {
        match self {
            Dimension::LifeStage => &criteria.life_stages,
            Dimension::ClientType => &criteria.client_types,
            Dimension::PriorServices => &criteria.prior_services,
        }
    }

    pub fn client_values<'a>(&self, client: &'a Client) -> Vec<&'a str> {
        match self {
            Dimension::LifeStage => client.life_stage.as_deref().into_iter().collect(),
            Dimension::ClientType => client.client_type.as_deref().into_iter().collect(),
            Dimension::PriorServices => client.prior_services.iter().map(String::as_str).collect(),
        }
    }
}

/// Outcome of evaluating one dimension for one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionCheck {
    pub dimension: Dimension,
    pub wildcard: bool,
    pub passed: bool,
}

/// A dimension passes when its target set is empty or any client value is
/// in the set. Comparison ignores ASCII case and surrounding whitespace.
pub fn dimension_passes<'a>(
    targets: &BTreeSet<String>,
    values: impl IntoIterator<Item = &'a str>,
) -> bool {
    if targets.is_empty() {
        return true;
    }
    values.into_iter().any(|value| {
        let value = value.trim();
        targets
            .iter()
            .any(|target| target.trim().eq_ignore_ascii_case(value))
    })
}

pub fn check(dimension: Dimension, client: &Client, criteria: &TargetingCriteria) -> DimensionCheck {
    let targets = dimension.targets(criteria);
    DimensionCheck {
        dimension,
        wildcard: targets.is_empty(),
        passed: dimension_passes(targets, dimension.client_values(client)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_empty_target_is_wildcard() {
        assert!(dimension_passes(&BTreeSet::new(), Vec::<&str>::new()));
        assert!(dimension_passes(&BTreeSet::new(), ["anything"]));
    }

    #[test]
    fn test_intersection_required() {
        let targets = set(&["roof_repair", "gutter_cleaning"]);
        assert!(dimension_passes(&targets, ["hvac", "gutter_cleaning"]));
        assert!(!dimension_passes(&targets, ["hvac"]));
        assert!(!dimension_passes(&targets, Vec::<&str>::new()));
    }

    #[test]
    fn test_case_insensitive() {
        let targets = set(&["Homeowner"]);
        assert!(dimension_passes(&targets, [" homeowner "]));
    }
}
