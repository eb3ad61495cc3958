use axum::http::StatusCode;

use journalflow_auth::{CommandAuthorization, Permission};

use crate::app::errors;
use crate::context::PrincipalContext;

/// Permissions an endpoint requires before the workflow runs.
pub struct ActionAuth {
    required: Vec<Permission>,
}

impl ActionAuth {
    pub fn new(required: impl IntoIterator<Item = Permission>) -> Self {
        Self {
            required: required.into_iter().collect(),
        }
    }
}

impl CommandAuthorization for ActionAuth {
    fn required_permissions(&self) -> &[Permission] {
        &self.required
    }
}

/// 403 response unless the principal holds `permission`.
pub fn require(principal: &PrincipalContext, permission: Permission) -> Result<(), axum::response::Response> {
    crate::authz::authorize_command(principal, &ActionAuth::new([permission]))
        .map_err(|e| errors::json_error(StatusCode::FORBIDDEN, "forbidden", e.to_string()))
}
