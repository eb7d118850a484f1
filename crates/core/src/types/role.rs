//! User roles and the permission policy.
//!
//! Authorization is decided here, by the caller, before any store write. The
//! store itself does not enforce roles.

use serde::{Deserialize, Serialize};

use super::status::{UnknownVariant, stored_names};

/// The role a user holds. Exactly one per user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum UserRole {
    /// Places orders and chats with their account manager.
    #[default]
    Customer,
    /// Owns a set of customer accounts.
    AccountManager,
    /// Staff member working orders.
    Employee,
    /// Full access.
    Admin,
    /// Soft-deleted account; no access.
    Suspended,
}

stored_names!(UserRole, "user role", {
    Customer => "customer",
    AccountManager => "accountManager",
    Employee => "employee",
    Admin => "admin",
    Suspended => "suspended",
});

/// An action gated by role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    CreateOrder,
    EditOrder,
    UpdateOrderStatus,
    DeleteOrder,
    ViewAllOrders,
    SendMessage,
    CreateTeamChat,
    DeleteChat,
    ChangeRoles,
}

impl Permission {
    /// Short description used in error messages.
    #[must_use]
    pub const fn describe(&self) -> &'static str {
        match self {
            Self::CreateOrder => "create orders",
            Self::EditOrder => "edit orders",
            Self::UpdateOrderStatus => "update order status",
            Self::DeleteOrder => "delete orders",
            Self::ViewAllOrders => "view all orders",
            Self::SendMessage => "send messages",
            Self::CreateTeamChat => "create team chats",
            Self::DeleteChat => "delete chats",
            Self::ChangeRoles => "change roles",
        }
    }
}

impl core::fmt::Display for Permission {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.describe())
    }
}

impl UserRole {
    /// Whether this role may perform `permission`.
    #[must_use]
    pub const fn allows(&self, permission: Permission) -> bool {
        use Permission as P;
        match self {
            Self::Admin => true,
            Self::AccountManager => !matches!(permission, P::ChangeRoles),
            Self::Employee => matches!(
                permission,
                P::CreateOrder
                    | P::EditOrder
                    | P::UpdateOrderStatus
                    | P::ViewAllOrders
                    | P::SendMessage
                    | P::CreateTeamChat
            ),
            Self::Customer => matches!(permission, P::CreateOrder | P::SendMessage),
            Self::Suspended => false,
        }
    }

    /// Staff roles see every order and can work them.
    #[must_use]
    pub const fn is_staff(&self) -> bool {
        matches!(self, Self::AccountManager | Self::Employee | Self::Admin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_admin_and_account_manager_delete() {
        for role in UserRole::ALL {
            let expected = matches!(role, UserRole::Admin | UserRole::AccountManager);
            assert_eq!(role.allows(Permission::DeleteOrder), expected, "{role}");
            assert_eq!(role.allows(Permission::DeleteChat), expected, "{role}");
        }
    }

    #[test]
    fn test_only_admin_changes_roles() {
        assert!(UserRole::Admin.allows(Permission::ChangeRoles));
        assert!(!UserRole::AccountManager.allows(Permission::ChangeRoles));
    }

    #[test]
    fn test_suspended_has_no_access() {
        assert!(!UserRole::Suspended.allows(Permission::SendMessage));
        assert!(!UserRole::Suspended.allows(Permission::CreateOrder));
    }

    #[test]
    fn test_customer_permissions() {
        assert!(UserRole::Customer.allows(Permission::CreateOrder));
        assert!(UserRole::Customer.allows(Permission::SendMessage));
        assert!(!UserRole::Customer.allows(Permission::EditOrder));
        assert!(!UserRole::Customer.allows(Permission::ViewAllOrders));
        assert!(!UserRole::Customer.is_staff());
    }

    #[test]
    fn test_role_names() {
        assert_eq!(UserRole::AccountManager.to_string(), "accountManager");
        assert_eq!("admin".parse::<UserRole>(), Ok(UserRole::Admin));
        assert!("owner".parse::<UserRole>().is_err());
    }
}
