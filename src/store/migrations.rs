//! Schema versioning for the sighting table
//!
//! The version lives in `PRAGMA user_version`. Upgrades only ever add nullable
//! columns. If an upgrade cannot be applied the table is dropped and created
//! again, which loses every stored sighting; that path is logged at error
//! level and reported as `SchemaOutcome::Recreated`.

use log::{error, info, warn};
use rusqlite::{Connection, Transaction};

use crate::error::StoreError;

pub const CURRENT_SCHEMA_VERSION: i32 = 2;
pub const TABLE_NAME: &str = "discovered_devices";

/// What opening the database did to the schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaOutcome {
    UpToDate,
    Created,
    Migrated,
    /// Data-loss path: the table was dropped and recreated
    Recreated { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub from_version: i32,
    pub to_version: i32,
    pub outcome: SchemaOutcome,
}

impl MigrationReport {
    pub fn lost_data(&self) -> bool {
        matches!(self.outcome, SchemaOutcome::Recreated { .. })
    }
}

pub fn run_migrations(conn: &mut Connection) -> Result<MigrationReport, StoreError> {
    let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if version > CURRENT_SCHEMA_VERSION {
        return Err(StoreError::SchemaTooNew {
            found: version,
            supported: CURRENT_SCHEMA_VERSION,
        });
    }

    let existing = table_columns(conn)?;
    let version = if version == 0 && !existing.is_empty() {
        let inferred = if existing.iter().any(|column| column == "latitude") {
            CURRENT_SCHEMA_VERSION
        } else {
            1
        };
        warn!(
            "Table {} exists without a schema version; treating it as version {}",
            TABLE_NAME, inferred
        );
        if inferred == CURRENT_SCHEMA_VERSION {
            conn.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)?;
        }
        inferred
    } else {
        version
    };

    let outcome = if version == CURRENT_SCHEMA_VERSION {
        SchemaOutcome::UpToDate
    } else if version == 0 {
        create_schema(conn)?;
        info!("Created table {} at schema version {}", TABLE_NAME, CURRENT_SCHEMA_VERSION);
        SchemaOutcome::Created
    } else {
        info!(
            "Upgrading database from version {} to {}",
            version, CURRENT_SCHEMA_VERSION
        );
        match upgrade(conn, version) {
            Ok(()) => SchemaOutcome::Migrated,
            Err(err) => {
                error!(
                    "Upgrade of {} from version {} failed: {}; dropping and recreating the table, stored sightings are lost",
                    TABLE_NAME, version, err
                );
                recreate_schema(conn)?;
                SchemaOutcome::Recreated {
                    reason: err.to_string(),
                }
            }
        }
    };

    Ok(MigrationReport {
        from_version: version,
        to_version: CURRENT_SCHEMA_VERSION,
        outcome,
    })
}

/// Column names of the sighting table; empty when it does not exist
fn table_columns(conn: &Connection) -> Result<Vec<String>, StoreError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", TABLE_NAME))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

fn create_schema(conn: &mut Connection) -> Result<(), StoreError> {
    let tx = conn.transaction()?;
    tx.execute_batch(include_str!("schemas/create_v2.sql"))?;
    tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)?;
    tx.commit()?;
    Ok(())
}

fn upgrade(conn: &mut Connection, from: i32) -> Result<(), StoreError> {
    // Dropping the transaction on error rolls back partial alterations
    let tx = conn.transaction()?;
    let mut version = from;
    while version < CURRENT_SCHEMA_VERSION {
        let next_version = version + 1;
        apply_migration(&tx, next_version)?;
        version = next_version;
    }
    tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)?;
    tx.commit()?;
    Ok(())
}

fn apply_migration(tx: &Transaction<'_>, version: i32) -> Result<(), StoreError> {
    match version {
        2 => {
            tx.execute_batch(include_str!("schemas/migrate_v2.sql"))?;
            info!("Columns latitude and longitude added to {}", TABLE_NAME);
            Ok(())
        }
        other => Err(StoreError::Migration(format!(
            "unknown migration target version: {}",
            other
        ))),
    }
}

fn recreate_schema(conn: &mut Connection) -> Result<(), StoreError> {
    let tx = conn.transaction()?;
    tx.execute_batch(&format!("DROP TABLE IF EXISTS {};", TABLE_NAME))?;
    tx.execute_batch(include_str!("schemas/create_v2.sql"))?;
    tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)?;
    tx.commit()?;
    Ok(())
}
