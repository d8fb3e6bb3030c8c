use std::borrow::Cow;

use serde::{Deserialize, Serialize};

/// Permission identifier.
///
/// Permissions are opaque dotted strings (e.g. "content.jobs.submit").
/// The wildcard `"*"` grants everything.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permission(Cow<'static, str>);

impl Permission {
    pub const WILDCARD: Permission = Permission(Cow::Borrowed("*"));
    pub const JOBS_SUBMIT: Permission = Permission(Cow::Borrowed("content.jobs.submit"));
    pub const JOBS_READ: Permission = Permission(Cow::Borrowed("content.jobs.read"));
    pub const JOBS_CANCEL: Permission = Permission(Cow::Borrowed("content.jobs.cancel"));
    pub const JOBS_RETRY: Permission = Permission(Cow::Borrowed("content.jobs.retry"));
    pub const VERSIONS_MANAGE: Permission = Permission(Cow::Borrowed("content.versions.manage"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_wildcard(&self) -> bool {
        self.as_str() == "*"
    }
}

impl core::fmt::Display for Permission {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}
