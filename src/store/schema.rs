//! Schema history of the durable store.
//!
//! Every version lists the full set of tables valid as of that version. A key
//! shape change cannot be applied to existing rows, so it is expressed as one
//! step that drops the table and a later step that declares it again.

use anyhow::{bail, Result};

// Substore prefixes. None is a prefix of another.
pub const SCHEMA_PREFIX: &str = "schema";
pub const PATH_PREF_PREFIX: &str = "pathpref";
pub const SETTINGS_PREFIX: &str = "settings";
pub const QUERY_PREFIX: &str = "querycache";
pub const CONTENT_PREFIX: &str = "entrycontent";
pub const CONTENT_BY_MARKER_PREFIX: &str = "bymarker";
pub const CONTENT_BY_PATH_PREFIX: &str = "bypath";
pub const IMAGE_PREFIX: &str = "entryimage";
pub const IMAGE_BY_ENTRY_PREFIX: &str = "byentry";

pub const SCHEMA_VERSION_KEY: &str = "schema/version";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    PathPreferences,
    Settings,
    QueryCache,
    EntryContent,
    EntryImages,
}

impl Table {
    /// Row prefix followed by the prefixes of the table's indexes.
    pub fn prefixes(self) -> &'static [&'static str] {
        match self {
            Table::PathPreferences => &[PATH_PREF_PREFIX],
            Table::Settings => &[SETTINGS_PREFIX],
            Table::QueryCache => &[QUERY_PREFIX],
            Table::EntryContent => &[
                CONTENT_PREFIX,
                CONTENT_BY_MARKER_PREFIX,
                CONTENT_BY_PATH_PREFIX,
            ],
            Table::EntryImages => &[IMAGE_PREFIX, IMAGE_BY_ENTRY_PREFIX],
        }
    }
}

#[derive(Debug)]
pub struct SchemaVersion {
    pub version: u32,
    pub tables: &'static [Table],
    /// Tables whose rows are deleted when upgrading to this version.
    pub dropped: &'static [Table],
}

pub const VERSIONS: &[SchemaVersion] = &[
    SchemaVersion {
        version: 1,
        tables: &[Table::PathPreferences, Table::Settings],
        dropped: &[],
    },
    SchemaVersion {
        version: 2,
        tables: &[Table::PathPreferences, Table::Settings, Table::QueryCache],
        dropped: &[],
    },
    // Entry content keyed by the bare entry id.
    SchemaVersion {
        version: 3,
        tables: &[
            Table::PathPreferences,
            Table::Settings,
            Table::QueryCache,
            Table::EntryContent,
        ],
        dropped: &[],
    },
    SchemaVersion {
        version: 4,
        tables: &[
            Table::PathPreferences,
            Table::Settings,
            Table::QueryCache,
            Table::EntryContent,
            Table::EntryImages,
        ],
        dropped: &[],
    },
    SchemaVersion {
        version: 5,
        tables: &[
            Table::PathPreferences,
            Table::Settings,
            Table::QueryCache,
            Table::EntryImages,
        ],
        dropped: &[Table::EntryContent],
    },
    // Entry content keyed by EntryKey (path id + entry id).
    SchemaVersion {
        version: 6,
        tables: &[
            Table::PathPreferences,
            Table::Settings,
            Table::QueryCache,
            Table::EntryContent,
            Table::EntryImages,
        ],
        dropped: &[],
    },
];

pub fn latest() -> &'static SchemaVersion {
    &VERSIONS[VERSIONS.len() - 1]
}

/// Every substore prefix the storage must be opened with.
pub fn substore_prefixes() -> Vec<String> {
    let mut prefixes = vec![SCHEMA_PREFIX.to_string()];
    for version in VERSIONS {
        for table in version.tables.iter().chain(version.dropped) {
            for prefix in table.prefixes() {
                if !prefixes.iter().any(|p| p == prefix) {
                    prefixes.push(prefix.to_string());
                }
            }
        }
    }
    prefixes
}

/// Steps to apply to a store currently at `stored` (0 = fresh).
pub fn pending_steps(stored: u32) -> Result<&'static [SchemaVersion]> {
    let latest = latest().version;
    if stored > latest {
        bail!(
            "store schema version {} is newer than supported version {}",
            stored,
            latest
        );
    }
    let start = VERSIONS
        .iter()
        .position(|v| v.version > stored)
        .unwrap_or(VERSIONS.len());
    Ok(&VERSIONS[start..])
}
