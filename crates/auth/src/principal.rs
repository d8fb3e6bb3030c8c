use serde::{Deserialize, Serialize};

use contentforge_core::AgencyId;

use crate::{Permission, Role};

/// A principal's membership in an agency.
///
/// States *which agency* the principal acts within and which roles and
/// explicit permissions it holds there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgencyMembership {
    pub agency_id: AgencyId,
    pub roles: Vec<Role>,
    pub permissions: Vec<Permission>,
}

impl AgencyMembership {
    pub fn new(agency_id: AgencyId) -> Self {
        Self {
            agency_id,
            roles: Vec::new(),
            permissions: Vec::new(),
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.roles.push(role);
        self
    }

    pub fn with_permission(mut self, permission: Permission) -> Self {
        self.permissions.push(permission);
        self
    }

    /// Explicit permissions plus everything granted by roles.
    pub fn effective_permissions(&self) -> Vec<Permission> {
        let mut perms = self.permissions.clone();
        for role in &self.roles {
            perms.extend(crate::role_permissions(role));
        }
        perms
    }
}
