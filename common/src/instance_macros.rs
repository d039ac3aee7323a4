/// Wires a custom resource to its status struct so the status committer can reach it.
/// Requires the generated `status: Option<$status>` field.
#[macro_export]
macro_rules! impl_status_resource {
    ($kind:ty, $status:ty) => {
        impl $crate::status::StatusResource for $kind {
            type Status = $status;

            fn status_slot(&mut self) -> &mut Option<$status> {
                &mut self.status
            }

            fn current_status(&self) -> Option<&$status> {
                self.status.as_ref()
            }
        }
    };
}

/// Shared accessors for `observed_generation` and `conditions`
#[macro_export]
macro_rules! observed_status_base {
    () => {
        fn set_observed_generation(&mut self, generation: i64) {
            self.observed_generation = Some(generation);
        }

        fn observed_generation(&self) -> Option<i64> {
            self.observed_generation
        }

        fn conditions(&self) -> &[$crate::conditions::ApplicationCondition] {
            &self.conditions
        }

        fn conditions_mut(&mut self) -> &mut Vec<$crate::conditions::ApplicationCondition> {
            &mut self.conditions
        }
    };
}

/// Generates the `ObservedStatus` implementation of a status struct.
///
/// `phase` adds the `phase`/`message` fields, `url` adds the `url` field.
#[macro_export]
macro_rules! impl_observed_status {
    ($status:ty) => {
        impl $crate::status::ObservedStatus for $status {
            $crate::observed_status_base!();
        }
    };
    ($status:ty, phase) => {
        impl $crate::status::ObservedStatus for $status {
            $crate::observed_status_base!();

            fn set_phase(&mut self, phase: $crate::Phase) {
                self.phase = Some(phase);
            }

            fn phase(&self) -> Option<$crate::Phase> {
                self.phase
            }

            fn set_message(&mut self, message: Option<String>) {
                self.message = message;
            }
        }
    };
    ($status:ty, phase, url) => {
        impl $crate::status::ObservedStatus for $status {
            $crate::observed_status_base!();

            fn set_phase(&mut self, phase: $crate::Phase) {
                self.phase = Some(phase);
            }

            fn phase(&self) -> Option<$crate::Phase> {
                self.phase
            }

            fn set_message(&mut self, message: Option<String>) {
                self.message = message;
            }

            fn set_url(&mut self, url: Option<String>) {
                self.url = url;
            }
        }
    };
}
