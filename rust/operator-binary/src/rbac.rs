//! Answers whether a Service account has been granted a given [`PolicyRule`]

use async_trait::async_trait;
use snafu::{ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::api::{
        core::v1::ServiceAccount,
        rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject},
    },
    kube::ResourceExt,
};

use crate::cluster::{self, Cluster};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to list bindings"))]
    ListBindings { source: cluster::Error },

    #[snafu(display("failed to resolve role {role:?}"))]
    ResolveRole { source: cluster::Error, role: String },
}
type Result<T, E = Error> = std::result::Result<T, E>;

#[async_trait]
pub trait RuleChecker: Send + Sync {
    /// Whether `service_account` may perform everything that `rule` describes, inside `namespace` or
    /// cluster-wide if `namespace` is `None`.
    async fn rule_satisfied(
        &self,
        service_account: &ServiceAccount,
        namespace: Option<&str>,
        rule: &PolicyRule,
    ) -> Result<bool>;
}

/// [`RuleChecker`] that evaluates the RoleBindings and ClusterRoleBindings stored in a [`Cluster`].
#[derive(Clone)]
pub struct BindingRuleChecker<C> {
    cluster: C,
}

impl<C: Cluster> BindingRuleChecker<C> {
    pub fn new(cluster: C) -> Self {
        Self { cluster }
    }

    async fn role_rules(&self, role_ref: &RoleRef, namespace: Option<&str>) -> Result<Vec<PolicyRule>> {
        let rules = match (role_ref.kind.as_str(), namespace) {
            ("ClusterRole", _) => self
                .cluster
                .get_opt::<ClusterRole>(&role_ref.name, None)
                .await
                .with_context(|_| ResolveRoleSnafu {
                    role: &role_ref.name,
                })?
                .and_then(|role| role.rules),
            ("Role", Some(namespace)) => self
                .cluster
                .get_opt::<Role>(&role_ref.name, Some(namespace))
                .await
                .with_context(|_| ResolveRoleSnafu {
                    role: &role_ref.name,
                })?
                .and_then(|role| role.rules),
            _ => None,
        };
        Ok(rules.unwrap_or_default())
    }

    /// All rules granted to `service_account`, through ClusterRoleBindings and the RoleBindings of
    /// `namespace`.
    async fn granted_rules(
        &self,
        service_account: &ServiceAccount,
        namespace: Option<&str>,
    ) -> Result<Vec<PolicyRule>> {
        let name = service_account.name_any();
        let sa_namespace = service_account.namespace().unwrap_or_default();
        let mut rules = Vec::new();
        for binding in self
            .cluster
            .list::<ClusterRoleBinding>(None)
            .await
            .context(ListBindingsSnafu)?
        {
            if binds(binding.subjects.as_deref(), &name, &sa_namespace) {
                rules.extend(self.role_rules(&binding.role_ref, None).await?);
            }
        }
        if let Some(namespace) = namespace {
            for binding in self
                .cluster
                .list::<RoleBinding>(Some(namespace))
                .await
                .context(ListBindingsSnafu)?
            {
                if binds(binding.subjects.as_deref(), &name, &sa_namespace) {
                    rules.extend(self.role_rules(&binding.role_ref, Some(namespace)).await?);
                }
            }
        }
        Ok(rules)
    }
}

#[async_trait]
impl<C: Cluster> RuleChecker for BindingRuleChecker<C> {
    async fn rule_satisfied(
        &self,
        service_account: &ServiceAccount,
        namespace: Option<&str>,
        rule: &PolicyRule,
    ) -> Result<bool> {
        let granted = self.granted_rules(service_account, namespace).await?;
        Ok(covers(&granted, rule))
    }
}

fn binds(subjects: Option<&[Subject]>, name: &str, namespace: &str) -> bool {
    subjects.unwrap_or_default().iter().any(|subject| {
        match subject.kind.as_str() {
            "ServiceAccount" => {
                subject.name == name && subject.namespace.as_deref() == Some(namespace)
            }
            "Group" => {
                subject.name == "system:serviceaccounts"
                    || subject.name == format!("system:serviceaccounts:{namespace}")
            }
            _ => false,
        }
    })
}

fn matches(allowed: &[String], requested: &str) -> bool {
    allowed.iter().any(|allowed| allowed == "*" || allowed == requested)
}

fn matches_url(allowed: &[String], requested: &str) -> bool {
    allowed.iter().any(|allowed| match allowed.strip_suffix('*') {
        Some(prefix) => requested.starts_with(prefix),
        None => allowed == requested,
    })
}

/// Whether the union of `granted` allows every request described by `requested`.
///
/// A requested rule that names no verbs, groups or resources (or URLs) describes nothing and is
/// never covered.
pub fn covers(granted: &[PolicyRule], requested: &PolicyRule) -> bool {
    let verbs = &requested.verbs;
    if verbs.is_empty() {
        return false;
    }
    if let Some(urls) = requested.non_resource_urls.as_deref().filter(|urls| !urls.is_empty()) {
        return verbs.iter().all(|verb| {
            urls.iter().all(|url| {
                granted.iter().any(|rule| {
                    matches(&rule.verbs, verb)
                        && matches_url(rule.non_resource_urls.as_deref().unwrap_or_default(), url)
                })
            })
        });
    }

    let groups = requested.api_groups.as_deref().unwrap_or_default();
    let resources = requested.resources.as_deref().unwrap_or_default();
    if groups.is_empty() || resources.is_empty() {
        return false;
    }
    let names = match requested.resource_names.as_deref() {
        Some(names) if !names.is_empty() => names.iter().map(Some).collect::<Vec<_>>(),
        _ => vec![None],
    };
    verbs.iter().all(|verb| {
        groups.iter().all(|group| {
            resources.iter().all(|resource| {
                names.iter().all(|resource_name| {
                    granted.iter().any(|rule| {
                        let allowed_names = rule.resource_names.as_deref().unwrap_or_default();
                        matches(&rule.verbs, verb)
                            && matches(rule.api_groups.as_deref().unwrap_or_default(), group)
                            && matches(rule.resources.as_deref().unwrap_or_default(), resource)
                            && (allowed_names.is_empty()
                                || resource_name.is_some_and(|name| allowed_names.contains(name)))
                    })
                })
            })
        })
    })
}
