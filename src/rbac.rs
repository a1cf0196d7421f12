/// Role-based access control for administrative operations
///
/// A static action matrix maps dot-notation action names to the roles
/// allowed to perform them. Everything not listed is denied.
use serde::{Deserialize, Serialize};

/// Administrative role levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Read-only access to operational views
    Viewer,
    /// Read access to the audit trail
    Auditor,
    /// Day-to-day grant and voucher operations
    Operator,
    /// Full access including account and config management
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Auditor => "auditor",
            Role::Operator => "operator",
            Role::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "viewer" => Some(Role::Viewer),
            "auditor" => Some(Role::Auditor),
            "operator" => Some(Role::Operator),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

/// Action matrix: action name to allowed roles
const ACTION_MATRIX: &[(&str, &[Role])] = &[
    ("health.read", &[Role::Viewer, Role::Auditor, Role::Operator, Role::Admin]),
    ("grants.list", &[Role::Viewer, Role::Auditor, Role::Operator, Role::Admin]),
    ("grants.extend", &[Role::Operator, Role::Admin]),
    ("grants.revoke", &[Role::Operator, Role::Admin]),
    ("vouchers.create", &[Role::Operator, Role::Admin]),
    ("vouchers.revoke", &[Role::Operator, Role::Admin]),
    ("integrations.read", &[Role::Viewer, Role::Operator, Role::Admin]),
    ("integrations.write", &[Role::Admin]),
    ("portal_config.read", &[Role::Viewer, Role::Operator, Role::Admin]),
    ("portal_config.write", &[Role::Admin]),
    ("audit.read", &[Role::Auditor, Role::Admin]),
    ("admin_accounts.manage", &[Role::Admin]),
];

/// Check whether `role` may perform `action`. Unknown actions deny.
pub fn is_allowed(role: Role, action: &str) -> bool {
    ACTION_MATRIX
        .iter()
        .find(|(name, _)| *name == action)
        .map(|(_, roles)| roles.contains(&role))
        .unwrap_or(false)
}
