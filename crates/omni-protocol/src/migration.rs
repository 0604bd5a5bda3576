//! Versioned field migrations applied once while decoding wire records.
//!
//! Records persisted by older builds stay decodable: a renamed field is
//! accepted under its old name when the new name is absent, and a removed
//! field is dropped instead of rejected. Every compatibility rule lives in
//! [`MIGRATIONS`]; the decoder does not special-case field names anywhere else.

use serde_json::{Map, Value};

/// Wire schema version written by this build.
pub const WIRE_SCHEMA_VERSION: u32 = 3;

/// Which part of a wire record a migration applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationScope {
    ActionArgs,
    ObservationExtras,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldChange {
    /// `old name → new name`; the old value is used only when the new name is absent.
    Renamed { to: &'static str },
    /// The field no longer exists and is discarded.
    Removed,
    /// The field moved to the record envelope under `to`.
    Hoisted { to: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldMigration {
    /// First schema version in which the old shape is no longer written.
    pub since: u32,
    pub scope: MigrationScope,
    pub field: &'static str,
    pub change: FieldChange,
}

pub const MIGRATIONS: &[FieldMigration] = &[
    FieldMigration {
        since: 2,
        scope: MigrationScope::ActionArgs,
        field: "is_confirmed",
        change: FieldChange::Renamed {
            to: "confirmation_state",
        },
    },
    FieldMigration {
        since: 2,
        scope: MigrationScope::ActionArgs,
        field: "images_urls",
        change: FieldChange::Renamed { to: "image_urls" },
    },
    FieldMigration {
        since: 2,
        scope: MigrationScope::ActionArgs,
        field: "keep_prompt",
        change: FieldChange::Removed,
    },
    FieldMigration {
        since: 2,
        scope: MigrationScope::ActionArgs,
        field: "timestamp",
        change: FieldChange::Hoisted { to: "timestamp" },
    },
    FieldMigration {
        since: 3,
        scope: MigrationScope::ActionArgs,
        field: "security_risk",
        change: FieldChange::Removed,
    },
    FieldMigration {
        since: 3,
        scope: MigrationScope::ObservationExtras,
        field: "command_id",
        change: FieldChange::Removed,
    },
];

/// Applies every migration for `scope` to `fields` in place.
///
/// Hoisted values are returned as `(envelope key, value)` pairs for the caller
/// to merge into the envelope when the envelope does not already carry them.
pub fn migrate(
    scope: MigrationScope,
    fields: &mut Map<String, Value>,
) -> Vec<(&'static str, Value)> {
    let mut hoisted = Vec::new();
    for migration in MIGRATIONS.iter().filter(|m| m.scope == scope) {
        let Some(value) = fields.remove(migration.field) else {
            continue;
        };
        match migration.change {
            FieldChange::Renamed { to } => {
                fields.entry(to).or_insert(value);
            }
            FieldChange::Removed => {}
            FieldChange::Hoisted { to } => hoisted.push((to, value)),
        }
    }
    hoisted
}
