use crate::{Phase, conditions::ApplicationCondition, platform::Managed};

/// Status fields every primary resource reports
pub trait ObservedStatus: Default + Clone + PartialEq + std::fmt::Debug + Send + Sync + 'static {
    fn set_observed_generation(&mut self, generation: i64);
    fn observed_generation(&self) -> Option<i64>;
    fn conditions(&self) -> &[ApplicationCondition];
    fn conditions_mut(&mut self) -> &mut Vec<ApplicationCondition>;

    fn set_phase(&mut self, _phase: Phase) {}
    fn phase(&self) -> Option<Phase> {
        None
    }
    fn set_message(&mut self, _message: Option<String>) {}
    fn set_url(&mut self, _url: Option<String>) {}
}

/// A custom resource with a status subresource
pub trait StatusResource: Managed {
    type Status: ObservedStatus;

    fn status_slot(&mut self) -> &mut Option<Self::Status>;
    fn current_status(&self) -> Option<&Self::Status>;

    fn current_phase(&self) -> Option<Phase> {
        self.current_status().and_then(|s| s.phase())
    }
}
