//! API-side authorization guard for workflow actions.
//!
//! This enforces authorization at the action boundary (before the workflow
//! runs), while keeping the domain and infra crates auth-agnostic.

use journalflow_auth::{
    AuthzError, CommandAuthorization, Membership, Permission, Principal, Role, authorize,
};

use crate::context::PrincipalContext;

pub const JOURNAL_READ: Permission = Permission::from_static("journal.read");
pub const JOURNAL_WRITE: Permission = Permission::from_static("journal.write");
pub const JOURNAL_SUBMIT: Permission = Permission::from_static("journal.submit");
pub const JOURNAL_SEND: Permission = Permission::from_static("journal.send");
pub const JOURNAL_APPROVE: Permission = Permission::from_static("journal.approve");
pub const JOURNAL_POST: Permission = Permission::from_static("journal.post");
pub const PROCESS_READ: Permission = Permission::from_static("process.read");
pub const PROCESS_CANCEL: Permission = Permission::from_static("process.cancel");

/// Check authorization for an action in the current request context.
pub fn authorize_command<C: CommandAuthorization>(
    principal: &PrincipalContext,
    command: &C,
) -> Result<(), AuthzError> {
    let resolved = Principal {
        principal_id: principal.principal_id(),
        membership: Membership {
            roles: principal.roles().to_vec(),
            permissions: permissions_from_roles(principal.roles()),
        },
    };

    for perm in command.required_permissions() {
        authorize(&resolved, perm)?;
    }

    Ok(())
}

/// Static role→permission mapping. Unknown roles grant nothing.
fn permissions_from_roles(roles: &[Role]) -> Vec<Permission> {
    // Convention: "admin" grants all permissions.
    if roles.contains(&Role::ADMIN) {
        return vec![Permission::from_static("*")];
    }

    let mut perms = Vec::new();
    if roles.contains(&Role::ACCOUNTANT) {
        perms.extend([JOURNAL_READ, JOURNAL_WRITE, JOURNAL_SUBMIT, JOURNAL_SEND, PROCESS_READ]);
    }
    if roles.contains(&Role::APPROVER) {
        perms.extend([JOURNAL_READ, JOURNAL_APPROVE, JOURNAL_POST, PROCESS_READ, PROCESS_CANCEL]);
    }
    perms.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    perms.dedup();
    perms
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::routes::common::ActionAuth;
    use journalflow_auth::PrincipalId;

    fn ctx(roles: Vec<Role>) -> PrincipalContext {
        PrincipalContext::new(PrincipalId::new(), "jdoe", roles)
    }

    #[test]
    fn accountant_cannot_approve() {
        let p = ctx(vec![Role::ACCOUNTANT]);
        assert!(authorize_command(&p, &ActionAuth::new([JOURNAL_SUBMIT])).is_ok());
        assert!(authorize_command(&p, &ActionAuth::new([JOURNAL_APPROVE])).is_err());
    }

    #[test]
    fn combined_roles_union_permissions() {
        let p = ctx(vec![Role::ACCOUNTANT, Role::APPROVER]);
        assert!(authorize_command(&p, &ActionAuth::new([JOURNAL_WRITE, JOURNAL_POST])).is_ok());
        assert_eq!(
            permissions_from_roles(p.roles())
                .iter()
                .filter(|perm| **perm == JOURNAL_READ)
                .count(),
            1
        );
    }

    #[test]
    fn admin_and_unknown_roles() {
        assert!(authorize_command(&ctx(vec![Role::ADMIN]), &ActionAuth::new([PROCESS_CANCEL])).is_ok());
        assert!(authorize_command(&ctx(vec![Role::new("viewer")]), &ActionAuth::new([JOURNAL_READ])).is_err());
    }
}
