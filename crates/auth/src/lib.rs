//! `contentforge-auth` - agency-scoped authorization for pipeline operations.
//!
//! Authentication happens upstream; this crate only decides whether an already
//! verified principal may act on a given agency's jobs and versions.

pub mod authorize;
pub mod permissions;
pub mod principal;
pub mod roles;

pub use authorize::{AuthzError, Principal, authorize, authorize_for_agency};
pub use permissions::Permission;
pub use principal::AgencyMembership;
pub use roles::{Role, role_permissions};
