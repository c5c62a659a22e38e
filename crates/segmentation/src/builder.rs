//! Targeting builder: fluent API for constructing campaign criteria.

use drip_core::types::TargetingCriteria;

#[derive(Debug, Default)]
pub struct TargetingBuilder {
    criteria: TargetingCriteria,
}

impl TargetingBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn life_stage(mut self, value: impl Into<String>) -> Self {
        self.criteria.life_stages.insert(value.into());
        self
    }

    pub fn client_type(mut self, value: impl Into<String>) -> Self {
        self.criteria.client_types.insert(value.into());
        self
    }

    pub fn prior_service(mut self, value: impl Into<String>) -> Self {
        self.criteria.prior_services.insert(value.into());
        self
    }

    pub fn prior_services<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.criteria
            .prior_services
            .extend(values.into_iter().map(Into::into));
        self
    }

    pub fn build(self) -> TargetingCriteria {
        self.criteria
    }
}
