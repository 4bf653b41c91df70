use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permission {
    CollectServer,
    FilesystemRead,
    FilesystemWrite,
    Execve,
    ServerAdmin,
    ArtifactWriter,
}

impl Permission {
    pub const ALL: [Permission; 6] = [
        Permission::CollectServer,
        Permission::FilesystemRead,
        Permission::FilesystemWrite,
        Permission::Execve,
        Permission::ServerAdmin,
        Permission::ArtifactWriter,
    ];
}

/// Permission set the query engine checks privileged plugins against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclProfile {
    role: String,
    permissions: BTreeSet<Permission>,
}

impl AclProfile {
    pub fn new(role: impl Into<String>, permissions: impl IntoIterator<Item = Permission>) -> Self {
        Self {
            role: role.into(),
            permissions: permissions.into_iter().collect(),
        }
    }

    /// Full access. Server queries run with this profile.
    pub fn administrator() -> Self {
        Self::new("administrator", Permission::ALL)
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn has(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn administrator_holds_every_permission() {
        let acl = AclProfile::administrator();
        assert_eq!(acl.role(), "administrator");
        assert!(Permission::ALL.iter().all(|p| acl.has(*p)));
    }

    #[test]
    fn restricted_role_only_holds_granted_permissions() {
        let acl = AclProfile::new("reader", [Permission::FilesystemRead]);
        assert!(acl.has(Permission::FilesystemRead));
        assert!(!acl.has(Permission::FilesystemWrite));
    }
}
