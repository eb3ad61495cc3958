use std::borrow::Cow;

use serde::{Deserialize, Serialize};

/// Role identifier used for RBAC.
///
/// Roles arrive as opaque strings in the token; the API maps them to permissions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(Cow<'static, str>);

impl Role {
    /// Full access.
    pub const ADMIN: Role = Role(Cow::Borrowed("admin"));
    /// Drafts and submits journal entries.
    pub const ACCOUNTANT: Role = Role(Cow::Borrowed("accountant"));
    /// Approves, rejects and posts journal entries.
    pub const APPROVER: Role = Role(Cow::Borrowed("approver"));

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
