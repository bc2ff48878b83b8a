//! Audit data models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

// ============================================================================
// Audit Query Constants
// ============================================================================

/// Default number of audit entries returned per query
pub const DEFAULT_AUDIT_QUERY_LIMIT: i64 = 100;

/// Maximum number of audit entries that can be returned in a single query.
pub const MAX_AUDIT_QUERY_LIMIT: i64 = 1000;

/// Audit log entry as stored
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditEntry {
    pub id: i64,
    /// Acting user (absent for anonymous actions such as failed logins)
    pub user_id: Option<i64>,
    pub action: String,
    pub table_name: String,
    pub record_id: Option<i64>,
    pub old_values: Option<JsonValue>,
    pub new_values: Option<JsonValue>,
    pub description: String,
    pub ip_address: Option<String>,
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Audit action taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
    Restore,
    Login,
    Logout,
    LoginFailed,
    StatusChange,
    Export,
    Import,
    ConfigChange,
    DialogMessage,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Restore => "restore",
            Self::Login => "login",
            Self::Logout => "logout",
            Self::LoginFailed => "login_failed",
            Self::StatusChange => "status_change",
            Self::Export => "export",
            Self::Import => "import",
            Self::ConfigChange => "config_change",
            Self::DialogMessage => "dialog_message",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tables whose records are audited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditTable {
    Users,
    Sessions,
    WorkEntries,
    DialogMessages,
    Settings,
}

impl AuditTable {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Users => "users",
            Self::Sessions => "sessions",
            Self::WorkEntries => "work_entries",
            Self::DialogMessages => "dialog_messages",
            Self::Settings => "settings",
        }
    }
}

impl std::fmt::Display for AuditTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One changed field with its value before and after
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    pub field: String,
    pub old: Option<JsonValue>,
    pub new: Option<JsonValue>,
}

/// Ordered old/new value diff attached to an audit record
///
/// Each transition builds its diff from the fields it actually touches, so
/// the same transition always yields the same shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AuditDiff {
    changes: Vec<FieldChange>,
}

fn to_json<T: Serialize>(value: T) -> JsonValue {
    serde_json::to_value(value).unwrap_or(JsonValue::Null)
}

impl AuditDiff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a field that changed from `old` to `new`
    pub fn changed<O: Serialize, N: Serialize>(
        mut self,
        field: impl Into<String>,
        old: O,
        new: N,
    ) -> Self {
        self.changes.push(FieldChange {
            field: field.into(),
            old: Some(to_json(old)),
            new: Some(to_json(new)),
        });
        self
    }

    /// Record a field that only has a new value (creation, context data)
    pub fn set<N: Serialize>(mut self, field: impl Into<String>, new: N) -> Self {
        self.changes.push(FieldChange {
            field: field.into(),
            old: None,
            new: Some(to_json(new)),
        });
        self
    }

    /// Record a field that only has a previous value (deletion)
    pub fn unset<O: Serialize>(mut self, field: impl Into<String>, old: O) -> Self {
        self.changes.push(FieldChange {
            field: field.into(),
            old: Some(to_json(old)),
            new: None,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn changes(&self) -> &[FieldChange] {
        &self.changes
    }

    pub fn get(&self, field: &str) -> Option<&FieldChange> {
        self.changes.iter().find(|change| change.field == field)
    }

    /// JSON object of all previous values, `None` when there are none
    pub fn old_values(&self) -> Option<JsonValue> {
        Self::collect(self.changes.iter().filter_map(|c| c.old.clone().map(|v| (&c.field, v))))
    }

    /// JSON object of all new values, `None` when there are none
    pub fn new_values(&self) -> Option<JsonValue> {
        Self::collect(self.changes.iter().filter_map(|c| c.new.clone().map(|v| (&c.field, v))))
    }

    fn collect<'a>(values: impl Iterator<Item = (&'a String, JsonValue)>) -> Option<JsonValue> {
        let map: Map<String, JsonValue> = values.map(|(k, v)| (k.clone(), v)).collect();
        (!map.is_empty()).then_some(JsonValue::Object(map))
    }
}

/// Query parameters for audit logs
#[derive(Debug, Clone, Deserialize)]
pub struct AuditQuery {
    pub user_id: Option<i64>,
    pub action: Option<AuditAction>,
    pub table: Option<AuditTable>,
    pub record_id: Option<i64>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    DEFAULT_AUDIT_QUERY_LIMIT
}

impl Default for AuditQuery {
    fn default() -> Self {
        Self {
            user_id: None,
            action: None,
            table: None,
            record_id: None,
            start_time: None,
            end_time: None,
            limit: default_limit(),
            offset: 0,
        }
    }
}

/// Input for creating an audit entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateAuditEntry {
    pub user_id: Option<i64>,
    pub action: AuditAction,
    pub table: AuditTable,
    pub record_id: Option<i64>,
    pub diff: AuditDiff,
    pub description: String,
    pub ip_address: Option<String>,
    pub session_id: Option<String>,
}

impl CreateAuditEntry {
    /// Create a builder for constructing audit entries
    pub fn builder() -> AuditEntryBuilder {
        AuditEntryBuilder::default()
    }
}

/// Builder for creating audit entries
#[derive(Debug, Clone, Default)]
pub struct AuditEntryBuilder {
    user_id: Option<i64>,
    action: Option<AuditAction>,
    table: Option<AuditTable>,
    record_id: Option<i64>,
    diff: AuditDiff,
    description: String,
    ip_address: Option<String>,
    session_id: Option<String>,
}

impl AuditEntryBuilder {
    pub fn user_id(mut self, user_id: Option<i64>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn action(mut self, action: AuditAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn table(mut self, table: AuditTable) -> Self {
        self.table = Some(table);
        self
    }

    pub fn record_id(mut self, record_id: Option<i64>) -> Self {
        self.record_id = record_id;
        self
    }

    pub fn diff(mut self, diff: AuditDiff) -> Self {
        self.diff = diff;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn ip_address(mut self, ip_address: Option<String>) -> Self {
        self.ip_address = ip_address;
        self
    }

    pub fn session_id(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    /// Build the CreateAuditEntry, failing when action or table are missing
    pub fn try_build(self) -> Result<CreateAuditEntry, &'static str> {
        let action = self.action.ok_or("action is required")?;
        let table = self.table.ok_or("table is required")?;

        Ok(CreateAuditEntry {
            user_id: self.user_id,
            action,
            table,
            record_id: self.record_id,
            diff: self.diff,
            description: self.description,
            ip_address: self.ip_address,
            session_id: self.session_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_action_names() {
        assert_eq!(AuditAction::LoginFailed.as_str(), "login_failed");
        assert_eq!(AuditAction::StatusChange.as_str(), "status_change");
        assert_eq!(
            serde_json::to_string(&AuditAction::DialogMessage).unwrap(),
            r#""dialog_message""#
        );
    }

    #[test]
    fn test_diff_splits_old_and_new_values() {
        let diff = AuditDiff::new()
            .changed("status", "eingereicht", "freigegeben")
            .set("reason", "passt");

        assert_eq!(diff.old_values(), Some(json!({"status": "eingereicht"})));
        assert_eq!(
            diff.new_values(),
            Some(json!({"status": "freigegeben", "reason": "passt"}))
        );
        assert_eq!(diff.get("status").unwrap().new, Some(json!("freigegeben")));
    }

    #[test]
    fn test_empty_diff_has_no_values() {
        let diff = AuditDiff::new();
        assert!(diff.is_empty());
        assert_eq!(diff.old_values(), None);
        assert_eq!(diff.new_values(), None);
    }

    #[test]
    fn test_builder_requires_action_and_table() {
        assert!(CreateAuditEntry::builder().action(AuditAction::Login).try_build().is_err());

        let entry = CreateAuditEntry::builder()
            .action(AuditAction::Login)
            .table(AuditTable::Users)
            .user_id(Some(7))
            .record_id(Some(7))
            .description("Anmeldung erfolgreich")
            .ip_address(Some("192.0.2.1".to_string()))
            .try_build()
            .unwrap();
        assert_eq!(entry.table, AuditTable::Users);
        assert_eq!(entry.user_id, Some(7));
    }
}
