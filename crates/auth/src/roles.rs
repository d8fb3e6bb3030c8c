use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::Permission;

/// Role identifier used for RBAC inside an agency.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(Cow<'static, str>);

impl Role {
    pub const OWNER: Role = Role(Cow::Borrowed("owner"));
    pub const EDITOR: Role = Role(Cow::Borrowed("editor"));
    pub const VIEWER: Role = Role(Cow::Borrowed("viewer"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Built-in role → permission mapping for agency members.
///
/// Unknown roles grant nothing; explicit permissions on the membership still apply.
pub fn role_permissions(role: &Role) -> Vec<Permission> {
    match role.as_str() {
        "owner" => vec![Permission::WILDCARD],
        "editor" => vec![
            Permission::JOBS_SUBMIT,
            Permission::JOBS_READ,
            Permission::JOBS_CANCEL,
            Permission::JOBS_RETRY,
            Permission::VERSIONS_MANAGE,
        ],
        "viewer" => vec![Permission::JOBS_READ],
        _ => Vec::new(),
    }
}
