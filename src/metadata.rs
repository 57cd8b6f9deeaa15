//! # Store Metadata
//!
//! Every store carries a handful of SDK identity fields next to its records:
//! the install version, the last seen config ("info update") version, and the
//! stable instance id. They are a closed, typed set: [`MetadataKey`] names them
//! and [`StoreMetadata`] holds their values.
//!
//! ## Salvage
//!
//! When a store fails to open, the loader tries to carry identity across the
//! replacement store. Only keys on the allow-list ([`MetadataKey::SALVAGEABLE`])
//! are carried forward:
//!
//! | Key | Salvaged | Reason |
//! |-----|----------|--------|
//! | `installVersion` | yes | losing it re-sends the install event |
//! | `instanceId` | yes | losing it splits one device into two |
//! | `infoUpdateVersion` | no | a fresh config fetch is harmless |

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use crate::error::{Error, Result};

/// Names of the metadata fields, as stored in the `store_metadata` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataKey {
    InstallVersion,
    InfoUpdateVersion,
    InstanceId,
}

impl MetadataKey {
    pub const ALL: [MetadataKey; 3] = [
        MetadataKey::InstallVersion,
        MetadataKey::InfoUpdateVersion,
        MetadataKey::InstanceId,
    ];

    /// Keys safe to carry from a damaged store into its replacement.
    pub const SALVAGEABLE: [MetadataKey; 2] = [MetadataKey::InstallVersion, MetadataKey::InstanceId];

    pub fn as_str(self) -> &'static str {
        match self {
            MetadataKey::InstallVersion => "installVersion",
            MetadataKey::InfoUpdateVersion => "infoUpdateVersion",
            MetadataKey::InstanceId => "instanceId",
        }
    }

    /// True if this key is on the salvage allow-list.
    pub fn is_salvageable(self) -> bool {
        Self::SALVAGEABLE.contains(&self)
    }
}

/// Typed values of all metadata fields; `None` means "never set".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreMetadata {
    pub install_version: Option<i64>,
    pub info_update_version: Option<i64>,
    pub instance_id: Option<String>,
}

impl StoreMetadata {
    /// True when no field is set.
    pub fn is_empty(&self) -> bool {
        self.install_version.is_none()
            && self.info_update_version.is_none()
            && self.instance_id.is_none()
    }

    /// Drops every field not on the salvage allow-list.
    pub fn salvageable(&self) -> StoreMetadata {
        StoreMetadata {
            install_version: self.install_version,
            info_update_version: None,
            instance_id: self.instance_id.clone(),
        }
    }

    /// Reads every field.
    pub fn read(conn: &Connection) -> Result<Self> {
        Ok(Self {
            install_version: read_int(conn, MetadataKey::InstallVersion)?,
            info_update_version: read_int(conn, MetadataKey::InfoUpdateVersion)?,
            instance_id: read_raw(conn, MetadataKey::InstanceId)?,
        })
    }

    /// Writes every field that is set. Unset fields are left untouched.
    ///
    /// Callers run this inside their own transaction when it must commit
    /// together with other writes.
    pub fn apply(&self, conn: &Connection) -> Result<()> {
        if let Some(v) = self.install_version {
            write_raw(conn, MetadataKey::InstallVersion, Some(&v.to_string()))?;
        }
        if let Some(v) = self.info_update_version {
            write_raw(conn, MetadataKey::InfoUpdateVersion, Some(&v.to_string()))?;
        }
        if let Some(v) = &self.instance_id {
            write_raw(conn, MetadataKey::InstanceId, Some(v))?;
        }
        Ok(())
    }
}

// =============================================================================
// Raw Access
// =============================================================================

/// Reads one field as text.
pub fn read_raw(conn: &Connection, key: MetadataKey) -> Result<Option<String>> {
    let value = conn
        .query_row(
            "SELECT value FROM store_metadata WHERE key = ?",
            [key.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

/// Reads one integer field.
pub fn read_int(conn: &Connection, key: MetadataKey) -> Result<Option<i64>> {
    match read_raw(conn, key)? {
        None => Ok(None),
        Some(s) => s
            .parse::<i64>()
            .map(Some)
            .map_err(|_| Error::Decode(format!("metadata '{}' is not an integer: {s:?}", key.as_str()))),
    }
}

/// Sets (`Some`) or clears (`None`) one field.
pub fn write_raw(conn: &Connection, key: MetadataKey, value: Option<&str>) -> Result<()> {
    match value {
        Some(v) => {
            conn.execute(
                "INSERT INTO store_metadata (key, value) VALUES (?, ?)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key.as_str(), v],
            )?;
        }
        None => {
            conn.execute("DELETE FROM store_metadata WHERE key = ?", [key.as_str()])?;
        }
    }
    Ok(())
}

// =============================================================================
// Salvage
// =============================================================================

/// Best-effort recovery of allow-listed metadata from a store that failed to open.
///
/// Opens the file read-only (no migration, no WAL switch) and reads each
/// allow-listed key on its own, so one unreadable value does not cost the
/// others. Never fails: anything unreadable is simply absent.
pub fn salvage(path: &std::path::Path) -> StoreMetadata {
    let mut salvaged = StoreMetadata::default();

    if !path.exists() {
        return salvaged;
    }

    let conn = match Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    ) {
        Ok(conn) => conn,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "salvage: store unreadable");
            return salvaged;
        }
    };

    for key in MetadataKey::SALVAGEABLE {
        match key {
            MetadataKey::InstallVersion => match read_int(&conn, key) {
                Ok(v) => salvaged.install_version = v,
                Err(e) => tracing::warn!(key = key.as_str(), error = %e, "salvage: key lost"),
            },
            MetadataKey::InstanceId => match read_raw(&conn, key) {
                Ok(v) => salvaged.instance_id = v,
                Err(e) => tracing::warn!(key = key.as_str(), error = %e, "salvage: key lost"),
            },
            MetadataKey::InfoUpdateVersion => {}
        }
    }

    tracing::info!(
        path = %path.display(),
        install_version = ?salvaged.install_version,
        instance_id = ?salvaged.instance_id,
        "salvaged store metadata"
    );

    salvaged
}
