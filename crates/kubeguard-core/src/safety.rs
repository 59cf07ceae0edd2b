//! Declarative "never switch from / never switch to" policy, evaluated as
//! pure predicates before any mutating kubectl call.

use thiserror::Error;

use crate::config::{SafetyConfig, UNCONFIGURED_CONTEXT};

#[derive(Debug, Error)]
pub enum SafetyError {
    #[error("cannot switch to context '{0}': it is in the never_switch_to list")]
    NeverSwitchTo(String),
    #[error("context '{0}' is protected by the never_switch_from list")]
    NeverSwitchFrom(String),
    #[error("default context '{0}' does not exist in the kubectl configuration")]
    UnknownDefault(String),
    #[error("default context is not configured")]
    Unconfigured,
}

#[derive(Debug, Clone, Default)]
pub struct SafetyPolicy {
    never_switch_from: Vec<String>,
    never_switch_to: Vec<String>,
}

impl SafetyPolicy {
    pub fn new(never_switch_from: Vec<String>, never_switch_to: Vec<String>) -> Self {
        Self {
            never_switch_from,
            never_switch_to,
        }
    }

    pub fn from_config(config: &SafetyConfig) -> Self {
        Self::new(
            config.never_switch_from.clone(),
            config.never_switch_to.clone(),
        )
    }

    pub fn can_switch_from(&self, name: &str) -> bool {
        !self.never_switch_from.iter().any(|entry| entry == name)
    }

    pub fn can_switch_to(&self, name: &str) -> bool {
        !self.never_switch_to.iter().any(|entry| entry == name)
    }

    pub fn ensure_switch_to(&self, name: &str) -> Result<(), SafetyError> {
        if self.can_switch_to(name) {
            Ok(())
        } else {
            Err(SafetyError::NeverSwitchTo(name.to_string()))
        }
    }

    pub fn ensure_switch_from(&self, name: &str) -> Result<(), SafetyError> {
        if self.can_switch_from(name) {
            Ok(())
        } else {
            Err(SafetyError::NeverSwitchFrom(name.to_string()))
        }
    }
}

/// A usable default context must exist and must not be the "needs
/// configuration" sentinel.
pub fn validate_default(name: &str, available_contexts: &[String]) -> Result<(), SafetyError> {
    if name == UNCONFIGURED_CONTEXT {
        return Err(SafetyError::Unconfigured);
    }
    if !available_contexts.iter().any(|context| context == name) {
        return Err(SafetyError::UnknownDefault(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> SafetyPolicy {
        SafetyPolicy::new(
            vec!["gke-prod".to_string()],
            vec!["staging-eu".to_string()],
        )
    }

    #[test]
    fn switch_from_is_blocked_for_protected_contexts() {
        let policy = policy();
        assert!(!policy.can_switch_from("gke-prod"));
        assert!(policy.can_switch_from("minikube"));
        assert!(matches!(
            policy.ensure_switch_from("gke-prod"),
            Err(SafetyError::NeverSwitchFrom(name)) if name == "gke-prod"
        ));
    }

    #[test]
    fn switch_to_is_blocked_for_forbidden_targets() {
        let policy = policy();
        assert!(!policy.can_switch_to("staging-eu"));
        assert!(policy.can_switch_to("minikube"));
        assert!(matches!(
            policy.ensure_switch_to("staging-eu"),
            Err(SafetyError::NeverSwitchTo(name)) if name == "staging-eu"
        ));
    }

    #[test]
    fn empty_policy_allows_everything() {
        let policy = SafetyPolicy::default();
        assert!(policy.can_switch_from("anything"));
        assert!(policy.can_switch_to("anything"));
    }

    #[test]
    fn default_must_exist_and_be_configured() {
        let available = vec!["minikube".to_string(), "gke-prod".to_string()];
        assert!(validate_default("minikube", &available).is_ok());
        assert!(matches!(
            validate_default("missing", &available),
            Err(SafetyError::UnknownDefault(name)) if name == "missing"
        ));
        assert!(matches!(
            validate_default(UNCONFIGURED_CONTEXT, &available),
            Err(SafetyError::Unconfigured)
        ));
    }
}
