use journalflow_auth::{PrincipalId, Role};

/// Principal context for a request (authenticated identity + roles).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrincipalContext {
    principal_id: PrincipalId,
    actor: String,
    roles: Vec<Role>,
}

impl PrincipalContext {
    pub fn new(principal_id: PrincipalId, actor: impl Into<String>, roles: Vec<Role>) -> Self {
        Self {
            principal_id,
            actor: actor.into(),
            roles,
        }
    }

    pub fn principal_id(&self) -> PrincipalId {
        self.principal_id
    }

    /// Name recorded in workflow logs for actions by this principal.
    pub fn actor(&self) -> &str {
        &self.actor
    }

    pub fn roles(&self) -> &[Role] {
        &self.roles
    }
}
