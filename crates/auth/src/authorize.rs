use thiserror::Error;

use contentforge_core::{AgencyId, UserId};

use crate::{AgencyMembership, Permission, Role};

/// A verified caller, as supplied by the authentication layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub principal_id: UserId,
    pub active_agency_id: AgencyId,
    pub membership: AgencyMembership,
}

impl Principal {
    pub fn new(principal_id: UserId, membership: AgencyMembership) -> Self {
        Self {
            principal_id,
            active_agency_id: membership.agency_id,
            membership,
        }
    }

    /// Convenience constructor for an agency owner (all permissions).
    pub fn owner(agency_id: AgencyId) -> Self {
        Self::new(UserId::new(), AgencyMembership::new(agency_id).with_role(Role::OWNER))
    }

    pub fn agency_id(&self) -> AgencyId {
        self.active_agency_id
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("agency mismatch")]
    AgencyMismatch,

    #[error("forbidden: missing permission '{0}'")]
    Forbidden(String),
}

/// Authorize a principal within its active agency context.
///
/// Pure policy check: no IO, no panics.
pub fn authorize(principal: &Principal, required: &Permission) -> Result<(), AuthzError> {
    if principal.active_agency_id != principal.membership.agency_id {
        return Err(AuthzError::AgencyMismatch);
    }

    let granted = principal
        .membership
        .effective_permissions()
        .iter()
        .any(|p| p.is_wildcard() || p == required);

    if granted {
        Ok(())
    } else {
        Err(AuthzError::Forbidden(required.as_str().to_string()))
    }
}

/// Authorize a principal against a resource owned by `owner`.
///
/// Checked before any state is touched.
pub fn authorize_for_agency(
    principal: &Principal,
    owner: AgencyId,
    required: &Permission,
) -> Result<(), AuthzError> {
    authorize(principal, required)?;
    if principal.active_agency_id != owner {
        return Err(AuthzError::AgencyMismatch);
    }
    Ok(())
}
