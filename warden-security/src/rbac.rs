//! Static role and permission policy.
//!
//! Roles carry a privilege level and a set of [`PermissionGrant`]s. Nothing
//! here is mutable: the tables are built on first use and shared for the
//! life of the process.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoleError {
    #[error("Role not found: {0}")]
    RoleNotFound(String),

    #[error("Role '{actor}' cannot assign role '{target}'")]
    InvalidAssignment { actor: String, target: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PermissionError {
    #[error("Role '{role}' lacks permission '{permission}'")]
    MissingPermission { role: String, permission: String },

    #[error("Role '{role}' has privilege level {actual}, {required} required")]
    InsufficientLevel {
        role: String,
        required: u32,
        actual: u32,
    },
}

pub type RoleResult<T> = Result<T, RoleError>;

/// Roles in the system with hierarchical privilege levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Full system access
    Admin,
    /// Manages users, content and files
    Moderator,
    /// Regular account
    User,
    /// Unauthenticated or probationary access
    Guest,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Admin, Role::Moderator, Role::User, Role::Guest];

    /// Parse role from string
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Role::Admin),
            "moderator" => Some(Role::Moderator),
            "user" => Some(Role::User),
            "guest" => Some(Role::Guest),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Moderator => "moderator",
            Role::User => "user",
            Role::Guest => "guest",
        }
    }

    pub fn level(&self) -> u32 {
        match self {
            Role::Admin => 100,
            Role::Moderator => 50,
            Role::User => 10,
            Role::Guest => 0,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Role::Admin => "Full system access",
            Role::Moderator => "Manages users, content and uploaded files",
            Role::User => "Regular account with access to its own profile and content",
            Role::Guest => "Read-only access to public content",
        }
    }

    fn grants(&self) -> Vec<PermissionGrant> {
        let raw: &[&str] = match self {
            Role::Admin => &["*"],
            Role::Moderator => &[
                "users.read",
                "users.update",
                "content.*",
                "files.*",
                "commands.execute",
                "audit.read",
                "sessions.read",
                "profile.*",
            ],
            Role::User => &[
                "profile.*",
                "content.read",
                "content.create",
                "files.upload",
                "files.read",
                "commands.execute",
            ],
            Role::Guest => &["content.read", "files.read"],
        };
        raw.iter().map(|s| PermissionGrant::parse(s)).collect()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = RoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::parse(s).ok_or_else(|| RoleError::RoleNotFound(s.to_string()))
    }
}

/// A permission held by a role
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PermissionGrant {
    /// Every permission (`*`)
    All,
    /// Every action on one resource (`resource.*`)
    ResourceWildcard(String),
    /// One named permission (`resource.action`)
    Exact(String),
}

impl PermissionGrant {
    pub fn parse(s: &str) -> Self {
        if s == "*" {
            PermissionGrant::All
        } else if let Some(resource) = s.strip_suffix(".*") {
            PermissionGrant::ResourceWildcard(resource.to_string())
        } else {
            PermissionGrant::Exact(s.to_string())
        }
    }

    /// Whether this grant covers the named permission
    pub fn matches(&self, permission: &str) -> bool {
        match self {
            PermissionGrant::All => true,
            PermissionGrant::Exact(name) => name == permission,
            PermissionGrant::ResourceWildcard(resource) => permission
                .split_once('.')
                .map(|(res, _)| res == resource)
                .unwrap_or(false),
        }
    }

    /// Whether this grant names the permission outright (`*` or the exact
    /// name); resource wildcards do not count
    pub fn names(&self, permission: &str) -> bool {
        match self {
            PermissionGrant::All => true,
            PermissionGrant::Exact(name) => name == permission,
            PermissionGrant::ResourceWildcard(_) => false,
        }
    }

    /// Whether this grant covers every action on a resource
    pub fn covers_resource(&self, resource: &str) -> bool {
        match self {
            PermissionGrant::All => true,
            PermissionGrant::ResourceWildcard(r) => r == resource,
            PermissionGrant::Exact(_) => false,
        }
    }
}

impl fmt::Display for PermissionGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PermissionGrant::All => f.write_str("*"),
            PermissionGrant::ResourceWildcard(resource) => write!(f, "{}.*", resource),
            PermissionGrant::Exact(name) => f.write_str(name),
        }
    }
}

/// Catalog entry describing one permission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub name: String,
    pub resource: String,
    pub action: String,
    pub description: String,
}

impl Permission {
    fn new(resource: &str, action: &str, description: &str) -> Self {
        Self {
            name: format!("{}.{}", resource, action),
            resource: resource.to_string(),
            action: action.to_string(),
            description: description.to_string(),
        }
    }
}

/// Public description of a role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleInfo {
    pub name: String,
    pub level: u32,
    pub description: String,
    pub permissions: Vec<PermissionGrant>,
}

struct RoleDefinition {
    role: Role,
    grants: Vec<PermissionGrant>,
}

struct Tables {
    roles: Vec<RoleDefinition>,
    permissions: Vec<Permission>,
}

fn tables() -> &'static Tables {
    static TABLES: OnceLock<Tables> = OnceLock::new();
    TABLES.get_or_init(|| Tables {
        roles: Role::ALL
            .iter()
            .map(|role| RoleDefinition {
                role: *role,
                grants: role.grants(),
            })
            .collect(),
        permissions: permission_catalog(),
    })
}

fn permission_catalog() -> Vec<Permission> {
    vec![
        // Users
        Permission::new("users", "read", "View user accounts"),
        Permission::new("users", "create", "Create user accounts"),
        Permission::new("users", "update", "Edit user accounts"),
        Permission::new("users", "delete", "Delete user accounts"),
        // Administration
        Permission::new("admin", "users", "Manage roles and privileges of users"),
        Permission::new("admin", "system", "Change system configuration"),
        // Audit and sessions
        Permission::new("audit", "read", "Read the security audit trail"),
        Permission::new("sessions", "read", "List active sessions"),
        Permission::new("sessions", "revoke", "Force logout of other users"),
        // Content
        Permission::new("content", "read", "Read content"),
        Permission::new("content", "create", "Create content"),
        Permission::new("content", "update", "Edit content"),
        Permission::new("content", "delete", "Delete content"),
        // Files
        Permission::new("files", "upload", "Upload files"),
        Permission::new("files", "read", "Download files"),
        Permission::new("files", "delete", "Delete files"),
        // Commands
        Permission::new("commands", "execute", "Run chat and bot commands"),
        // Own profile
        Permission::new("profile", "read", "Read own profile"),
        Permission::new("profile", "update", "Edit own profile"),
    ]
}

fn definition(role: &str) -> RoleResult<&'static RoleDefinition> {
    let parsed: Role = role.parse()?;
    tables()
        .roles
        .iter()
        .find(|def| def.role == parsed)
        .ok_or_else(|| RoleError::RoleNotFound(role.to_string()))
}

/// Read-only policy oracle over the static role table
#[derive(Debug, Clone, Copy, Default)]
pub struct RoleRegistry;

impl RoleRegistry {
    pub fn new() -> Self {
        Self
    }

    /// Check if a role holds a permission by name. `resource.*` grants are
    /// only honoured by [`Self::check_resource_access`]. Unknown roles hold nothing.
    pub fn has_permission(&self, role: &str, permission: &str) -> bool {
        match definition(role) {
            Ok(def) if def.role == Role::Admin => true,
            Ok(def) => def.grants.iter().any(|grant| grant.names(permission)),
            Err(_) => false,
        }
    }

    /// Check access to `action` on `resource`
    pub fn check_resource_access(&self, role: &str, resource: &str, action: &str) -> bool {
        let Ok(def) = definition(role) else {
            return false;
        };
        if def.role == Role::Admin {
            return true;
        }

        self.has_permission(role, &format!("{}.{}", resource, action))
            || def.grants.iter().any(|grant| grant.covers_resource(resource))
    }

    /// An actor may grant any role at or below its own level
    pub fn validate_role_assignment(&self, actor_role: &str, target_role: &str) -> bool {
        match (definition(actor_role), definition(target_role)) {
            (Ok(actor), Ok(target)) => actor.role.level() >= target.role.level(),
            _ => false,
        }
    }

    pub fn authorize_assignment(&self, actor_role: &str, target_role: &str) -> RoleResult<()> {
        let actor = definition(actor_role)?;
        let target = definition(target_role)?;

        if actor.role.level() >= target.role.level() {
            Ok(())
        } else {
            Err(RoleError::InvalidAssignment {
                actor: actor.role.to_string(),
                target: target.role.to_string(),
            })
        }
    }

    pub fn require_permission(&self, role: &str, permission: &str) -> Result<(), PermissionError> {
        if self.has_permission(role, permission) {
            Ok(())
        } else {
            Err(PermissionError::MissingPermission {
                role: role.to_string(),
                permission: permission.to_string(),
            })
        }
    }

    pub fn require_level(&self, role: &str, required: u32) -> Result<(), PermissionError> {
        let actual = Role::parse(role).map(|r| r.level());
        match actual {
            Some(level) if level >= required => Ok(()),
            _ => Err(PermissionError::InsufficientLevel {
                role: role.to_string(),
                required,
                actual: actual.unwrap_or(0),
            }),
        }
    }

    pub fn role_level(&self, role: &str) -> RoleResult<u32> {
        Ok(definition(role)?.role.level())
    }

    pub fn get_role_info(&self, role: &str) -> RoleResult<RoleInfo> {
        Ok(role_info(definition(role)?))
    }

    /// All roles, highest privilege first
    pub fn get_all_roles(&self) -> Vec<RoleInfo> {
        tables().roles.iter().map(role_info).collect()
    }

    pub fn get_all_permissions(&self) -> &'static [Permission] {
        &tables().permissions
    }

    /// Catalog permissions a role effectively holds, with wildcards expanded
    pub fn get_user_permissions(&self, role: &str) -> RoleResult<Vec<Permission>> {
        let def = definition(role)?;
        Ok(tables()
            .permissions
            .iter()
            .filter(|p| {
                def.role == Role::Admin || def.grants.iter().any(|grant| grant.matches(&p.name))
            })
            .cloned()
            .collect())
    }
}

fn role_info(def: &RoleDefinition) -> RoleInfo {
    RoleInfo {
        name: def.role.to_string(),
        level: def.role.level(),
        description: def.role.description().to_string(),
        permissions: def.grants.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[test]
    fn test_role_parsing() {
        assert_eq!(Role::parse("admin"), Some(Role::Admin));
        assert_eq!(Role::parse("Admin"), None);
        assert_eq!(Role::parse("MODERATOR"), None);
        assert_eq!(Role::parse("invalid"), None);
        assert!(matches!("root".parse::<Role>(), Err(RoleError::RoleNotFound(_))));
    }

    #[test]
    fn test_grant_parsing() {
        assert_eq!(PermissionGrant::parse("*"), PermissionGrant::All);
        assert_eq!(
            PermissionGrant::parse("files.*"),
            PermissionGrant::ResourceWildcard("files".to_string())
        );
        assert_eq!(
            PermissionGrant::parse("files.read"),
            PermissionGrant::Exact("files.read".to_string())
        );
        assert_eq!(PermissionGrant::parse("files.*").to_string(), "files.*");
    }

    #[test]
    fn test_resource_wildcard_is_not_a_prefix_match() {
        let grant = PermissionGrant::parse("file.*");
        assert!(grant.matches("file.read"));
        assert!(!grant.matches("files.read"));
        assert!(!grant.matches("file"));
        assert!(!grant.names("file.read"));
        assert!(PermissionGrant::parse("file.read").names("file.read"));
        assert!(PermissionGrant::All.names("file.read"));
    }

    #[rstest]
    #[case("users.delete")]
    #[case("admin.users")]
    #[case("admin.system")]
    #[case("anything.at.all")]
    fn test_admin_has_every_permission(#[case] permission: &str) {
        assert!(RoleRegistry::new().has_permission("admin", permission));
    }

    #[rstest]
    #[case("guest", "admin.users", false)]
    #[case("guest", "content.read", true)]
    #[case("guest", "files.upload", false)]
    #[case("user", "files.upload", true)]
    #[case("user", "content.create", true)]
    #[case("user", "profile.update", false)]
    #[case("user", "users.delete", false)]
    #[case("moderator", "audit.read", true)]
    #[case("moderator", "files.delete", false)]
    #[case("moderator", "content.update", false)]
    #[case("ADMIN", "users.delete", false)]
    #[case("Guest", "content.read", false)]
    #[case("moderator", "admin.users", false)]
    #[case("unknown", "content.read", false)]
    fn test_has_permission(#[case] role: &str, #[case] permission: &str, #[case] expected: bool) {
        assert_eq!(RoleRegistry::new().has_permission(role, permission), expected);
    }

    #[rstest]
    #[case("admin", "users", "delete", true)]
    #[case("moderator", "files", "delete", true)]
    #[case("moderator", "users", "delete", false)]
    #[case("user", "profile", "anything", true)]
    #[case("user", "content", "delete", false)]
    #[case("guest", "files", "read", true)]
    #[case("nobody", "files", "read", false)]
    fn test_check_resource_access(
        #[case] role: &str,
        #[case] resource: &str,
        #[case] action: &str,
        #[case] expected: bool,
    ) {
        assert_eq!(
            RoleRegistry::new().check_resource_access(role, resource, action),
            expected
        );
    }

    #[rstest]
    #[case("moderator", "admin", false)]
    #[case("admin", "moderator", true)]
    #[case("moderator", "moderator", true)]
    #[case("user", "guest", true)]
    #[case("guest", "user", false)]
    #[case("admin", "superuser", false)]
    fn test_validate_role_assignment(
        #[case] actor: &str,
        #[case] target: &str,
        #[case] expected: bool,
    ) {
        assert_eq!(
            RoleRegistry::new().validate_role_assignment(actor, target),
            expected
        );
    }

    #[test]
    fn test_authorize_assignment_errors() {
        let registry = RoleRegistry::new();
        assert_eq!(
            registry.authorize_assignment("user", "admin"),
            Err(RoleError::InvalidAssignment {
                actor: "user".to_string(),
                target: "admin".to_string(),
            })
        );
        assert_eq!(
            registry.authorize_assignment("user", "root"),
            Err(RoleError::RoleNotFound("root".to_string()))
        );
        assert!(registry.authorize_assignment("admin", "user").is_ok());
    }

    #[test]
    fn test_require_permission_and_level() {
        let registry = RoleRegistry::new();

        assert!(registry.require_permission("user", "files.upload").is_ok());
        assert!(matches!(
            registry.require_permission("guest", "files.upload"),
            Err(PermissionError::MissingPermission { .. })
        ));

        assert!(registry.require_level("moderator", 50).is_ok());
        assert_eq!(
            registry.require_level("user", 50),
            Err(PermissionError::InsufficientLevel {
                role: "user".to_string(),
                required: 50,
                actual: 10,
            })
        );
        assert!(registry.require_level("ghost", 0).is_err());
    }

    #[test]
    fn test_role_info() {
        let registry = RoleRegistry::new();

        let info = registry.get_role_info("moderator").unwrap();
        assert_eq!(info.name, "moderator");
        assert_eq!(info.level, 50);
        assert!(info
            .permissions
            .contains(&PermissionGrant::ResourceWildcard("files".to_string())));

        assert!(matches!(
            registry.get_role_info("ghost"),
            Err(RoleError::RoleNotFound(_))
        ));
    }

    #[test]
    fn test_all_roles_ordered_by_level() {
        let levels: Vec<u32> = RoleRegistry::new()
            .get_all_roles()
            .iter()
            .map(|r| r.level)
            .collect();
        assert_eq!(levels, vec![100, 50, 10, 0]);
    }

    #[test]
    fn test_permission_catalog_names_are_consistent() {
        for permission in RoleRegistry::new().get_all_permissions() {
            assert_eq!(
                permission.name,
                format!("{}.{}", permission.resource, permission.action)
            );
        }
    }

    #[test]
    fn test_user_permissions_expand_wildcards() {
        let registry = RoleRegistry::new();

        let admin = registry.get_user_permissions("admin").unwrap();
        assert_eq!(admin.len(), registry.get_all_permissions().len());

        let user: Vec<String> = registry
            .get_user_permissions("user")
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert!(user.contains(&"profile.read".to_string()));
        assert!(user.contains(&"profile.update".to_string()));
        assert!(!user.contains(&"users.delete".to_string()));

        let guest: Vec<String> = registry
            .get_user_permissions("guest")
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(guest, vec!["content.read".to_string(), "files.read".to_string()]);

        assert!(registry.get_user_permissions("ghost").is_err());
    }
}
