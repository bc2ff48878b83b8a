//! User identity and role set

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Primary key type shared by users, entries and dialog messages
pub type UserId = i64;

/// A single role a user can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Mitglied,
    Erfasser,
    Pruefer,
    Auditor,
    Administrator,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Mitglied,
        Role::Erfasser,
        Role::Pruefer,
        Role::Auditor,
        Role::Administrator,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Mitglied => "mitglied",
            Role::Erfasser => "erfasser",
            Role::Pruefer => "pruefer",
            Role::Auditor => "auditor",
            Role::Administrator => "administrator",
        }
    }

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| format!("Unbekannte Rolle: {s}"))
    }
}

/// Set of roles held by one user, stored as a bitset
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct RoleSet(u8);

impl RoleSet {
    pub const fn empty() -> Self {
        RoleSet(0)
    }

    pub fn of(roles: &[Role]) -> Self {
        roles.iter().copied().collect()
    }

    pub fn contains(self, role: Role) -> bool {
        self.0 & role.bit() != 0
    }

    pub fn insert(&mut self, role: Role) {
        self.0 |= role.bit();
    }

    pub fn remove(&mut self, role: Role) {
        self.0 &= !role.bit();
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = Role> {
        Role::ALL.into_iter().filter(move |role| self.contains(*role))
    }

    /// May approve, reject, return and correct entries
    pub fn can_review(self) -> bool {
        self.contains(Role::Pruefer) || self.contains(Role::Administrator)
    }

    /// May create entries on behalf of other members
    pub fn can_record_for_others(self) -> bool {
        self.contains(Role::Erfasser) || self.contains(Role::Administrator)
    }

    /// May read the audit log
    pub fn can_audit(self) -> bool {
        self.contains(Role::Auditor) || self.contains(Role::Administrator)
    }

    pub fn is_admin(self) -> bool {
        self.contains(Role::Administrator)
    }

    /// Role names as persisted in the `users.roles` column
    pub fn to_names(self) -> Vec<String> {
        self.iter().map(|role| role.as_str().to_string()).collect()
    }

    /// Parse persisted role names; unknown names are skipped with a warning
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Self {
        names
            .iter()
            .filter_map(|name| match name.as_ref().parse::<Role>() {
                Ok(role) => Some(role),
                Err(_) => {
                    tracing::warn!(role = name.as_ref(), "Ignoring unknown role");
                    None
                },
            })
            .collect()
    }
}

impl FromIterator<Role> for RoleSet {
    fn from_iter<I: IntoIterator<Item = Role>>(iter: I) -> Self {
        let mut set = RoleSet::empty();
        for role in iter {
            set.insert(role);
        }
        set
    }
}

impl fmt::Debug for RoleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl Serialize for RoleSet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

impl<'de> Deserialize<'de> for RoleSet {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let roles = Vec::<Role>::deserialize(deserializer)?;
        Ok(roles.into_iter().collect())
    }
}

/// A fully populated user identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub name: String,
    pub is_active: bool,
    pub roles: RoleSet,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    /// Base32 TOTP secret; present once the authenticator app is confirmed
    #[serde(skip_serializing)]
    pub totp_secret: Option<String>,
    pub email_2fa_enabled: bool,
    pub failed_login_attempts: u32,
    pub locked_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn totp_enabled(&self) -> bool {
        self.totp_secret.is_some()
    }

    pub fn is_2fa_enabled(&self) -> bool {
        self.totp_enabled() || self.email_2fa_enabled
    }

    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| until > now)
    }
}
