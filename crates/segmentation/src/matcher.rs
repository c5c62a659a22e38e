//! Campaign targeting: decides whether a client qualifies for a campaign.
//!
//! Pure functions with no I/O: AND across dimensions, OR within a
//! dimension's target set.

use crate::predicates::{self, Dimension, DimensionCheck};
use drip_core::types::{Campaign, CampaignStatus, Client, TargetingCriteria};

/// Whether `client` satisfies the campaign's targeting criteria. Campaign
/// status is not considered here.
pub fn eligible(client: &Client, campaign: &Campaign) -> bool {
    client.tenant_id == campaign.tenant_id && matches(client, &campaign.targeting)
}

pub fn matches(client: &Client, criteria: &TargetingCriteria) -> bool {
    if criteria.is_match_all() {
        return true;
    }
    Dimension::ALL
        .iter()
        .all(|d| predicates::check(*d, client, criteria).passed)
}

/// Per-dimension breakdown, used for diagnostics when a client is skipped.
pub fn explain(client: &Client, criteria: &TargetingCriteria) -> Vec<DimensionCheck> {
    Dimension::ALL
        .iter()
        .map(|d| predicates::check(*d, client, criteria))
        .collect()
}

/// Dimensions that rule the client out, in evaluation order.
pub fn failed_dimensions(client: &Client, criteria: &TargetingCriteria) -> Vec<Dimension> {
    explain(client, criteria)
        .into_iter()
        .filter(|c| !c.passed)
        .map(|c| c.dimension)
        .collect()
}

/// Active campaigns of the client's tenant that the client qualifies for.
pub fn matching_campaigns<'a, I>(client: &Client, campaigns: I) -> Vec<&'a Campaign>
where
    I: IntoIterator<Item = &'a Campaign>,
{
    campaigns
        .into_iter()
        .filter(|c| c.status == CampaignStatus::Active && eligible(client, c))
        .collect()
}
