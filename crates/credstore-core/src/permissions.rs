//! Permission filter contract for secret listings

use crate::models::Secret;
use serde::{Deserialize, Serialize};

/// Role of a user within their current org
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum OrgRole {
    Viewer,
    Editor,
    Admin,
}

/// The caller a listing is filtered for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedInUser {
    pub user_id: i64,
    pub org_id: i64,
    pub login: String,
    pub org_role: OrgRole,
}

impl SignedInUser {
    pub fn new(user_id: i64, org_id: i64, login: impl Into<String>, org_role: OrgRole) -> Self {
        Self {
            user_id,
            org_id,
            login: login.into(),
            org_role,
        }
    }

    pub fn has_role(&self, role: OrgRole) -> bool {
        self.org_role >= role
    }
}

/// Removes secrets the user may not see. Implementations must keep the
/// input order of the secrets they retain.
pub trait SecretPermissionFilter: Send + Sync {
    fn filter(&self, user: &SignedInUser, secrets: Vec<Secret>) -> Vec<Secret>;
}

/// Adapts a per-secret predicate into a [`SecretPermissionFilter`]
pub struct PredicateFilter<F> {
    predicate: F,
}

impl<F> PredicateFilter<F>
where
    F: Fn(&SignedInUser, &Secret) -> bool + Send + Sync,
{
    pub fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<F> SecretPermissionFilter for PredicateFilter<F>
where
    F: Fn(&SignedInUser, &Secret) -> bool + Send + Sync,
{
    fn filter(&self, user: &SignedInUser, secrets: Vec<Secret>) -> Vec<Secret> {
        secrets
            .into_iter()
            .filter(|secret| (self.predicate)(user, secret))
            .collect()
    }
}
