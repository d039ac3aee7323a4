use super::owned_meta;
use common::{GROUP, platform::Managed};
use k8s_openapi::api::{
    core::v1::ServiceAccount,
    rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject},
};
use std::collections::BTreeMap;

/// ServiceAccount, Role and RoleBinding sharing one name
pub struct Rbac {
    pub service_account: ServiceAccount,
    pub role: Role,
    pub binding: RoleBinding,
}

fn rule(api_group: &str, resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![api_group.to_string()]),
        resources: Some(resources.iter().map(|r| r.to_string()).collect()),
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..PolicyRule::default()
    }
}

/// The aggregator discovers its backends itself
pub fn vmcp_rules() -> Vec<PolicyRule> {
    vec![
        rule(
            GROUP,
            &["mcpgroups", "mcpservers", "mcpremoteproxies", "mcpexternalauthconfigs", "mcptoolconfigs"],
            &["get", "list", "watch"],
        ),
        rule("", &["configmaps", "secrets"], &["get", "list", "watch"]),
    ]
}

pub fn runner_rules() -> Vec<PolicyRule> {
    vec![
        rule("", &["configmaps"], &["get", "list", "watch"]),
        rule("", &["secrets"], &["get"]),
    ]
}

pub fn build<K: Managed>(owner: &K, name: &str, labels: &BTreeMap<String, String>, rules: Vec<PolicyRule>) -> Rbac {
    let meta = owned_meta(owner, name, labels);
    Rbac {
        service_account: ServiceAccount {
            metadata: meta.clone(),
            ..ServiceAccount::default()
        },
        role: Role {
            metadata: meta.clone(),
            rules: Some(rules),
        },
        binding: RoleBinding {
            metadata: meta.clone(),
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "Role".to_string(),
                name: name.to_string(),
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".to_string(),
                name: name.to_string(),
                namespace: meta.namespace.clone(),
                ..Subject::default()
            }]),
        },
    }
}
