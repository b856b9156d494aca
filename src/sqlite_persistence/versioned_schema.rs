use anyhow::{bail, Result};
use rusqlite::{params, types::Type, Connection};

/// Offset added to schema versions before they are written to `PRAGMA
/// user_version`, so that a database created by unrelated tooling (version 0,
/// 1, ...) is never mistaken for one of ours.
pub const BASE_DB_VERSION: usize = 99999;

#[macro_export]
macro_rules! sqlite_column {
    ($name:expr, $sql_type:expr $(, $field:ident = $value:expr)*) => {
        {
            // unused_mut fires when the macro is invoked without any
            // field overrides, which is the common case
            #[allow(unused_mut)]
            let mut column = Column {
                name: $name,
                sql_type: $sql_type,
                is_primary_key: false,
                non_null: false,
                is_unique: false,
                default_value: None,
                foreign_key: None,
            };
            $(
                column.$field = $value;
            )*
            column
        }
    };
}

#[derive(Debug, PartialEq, Eq)]
pub enum SqlType {
    Text,
    Integer,
    Real,
    Blob,
}

impl SqlType {
    fn as_sql(&self) -> &'static str {
        match self {
            SqlType::Text => "TEXT",
            SqlType::Integer => "INTEGER",
            SqlType::Real => "REAL",
            SqlType::Blob => "BLOB",
        }
    }

    fn from_sql(s: &str) -> Option<&'static SqlType> {
        match s {
            "TEXT" => Some(&SqlType::Text),
            "INTEGER" => Some(&SqlType::Integer),
            "REAL" => Some(&SqlType::Real),
            "BLOB" => Some(&SqlType::Blob),
            _ => None,
        }
    }
}

#[allow(unused)]
pub enum ForeignKeyOnChange {
    NoAction,
    Restrict,
    SetNull,
    SetDefault,
    Cascade,
}

impl ForeignKeyOnChange {
    fn as_sql(&self) -> &'static str {
        match self {
            ForeignKeyOnChange::NoAction => "NO ACTION",
            ForeignKeyOnChange::Restrict => "RESTRICT",
            ForeignKeyOnChange::SetNull => "SET NULL",
            ForeignKeyOnChange::SetDefault => "SET DEFAULT",
            ForeignKeyOnChange::Cascade => "CASCADE",
        }
    }
}

pub struct ForeignKey {
    pub foreign_table: &'static str,
    pub foreign_column: &'static str,
    pub on_delete: ForeignKeyOnChange,
}

pub struct Column<'a, S: AsRef<str>> {
    pub name: S,
    pub sql_type: &'a SqlType,
    pub is_primary_key: bool,
    pub non_null: bool,
    pub is_unique: bool,
    pub default_value: Option<S>,
    pub foreign_key: Option<&'a ForeignKey>,
}

pub struct Table {
    pub name: &'static str,
    pub columns: &'static [Column<'static, &'static str>],
    pub indices: &'static [(&'static str, &'static str)],
    pub unique_constraints: &'static [&'static [&'static str]],
}

impl Table {
    pub fn create(&self, conn: &Connection) -> Result<()> {
        let mut column_defs = Vec::with_capacity(self.columns.len());
        for column in self.columns {
            let mut def = format!("{} {}", column.name, column.sql_type.as_sql());
            if column.is_primary_key {
                def.push_str(" PRIMARY KEY");
            }
            if column.non_null {
                def.push_str(" NOT NULL");
            }
            if column.is_unique {
                def.push_str(" UNIQUE");
            }
            if let Some(default_value) = column.default_value {
                def.push_str(&format!(" DEFAULT {}", default_value));
            }
            if let Some(fk) = column.foreign_key {
                def.push_str(&format!(
                    " REFERENCES {}({}) ON DELETE {}",
                    fk.foreign_table,
                    fk.foreign_column,
                    fk.on_delete.as_sql()
                ));
            }
            column_defs.push(def);
        }
        for unique_columns in self.unique_constraints {
            column_defs.push(format!("UNIQUE ({})", unique_columns.join(", ")));
        }
        conn.execute(
            &format!("CREATE TABLE {} ({});", self.name, column_defs.join(", ")),
            params![],
        )?;

        for (index_name, indexed_columns) in self.indices {
            conn.execute(
                &format!(
                    "CREATE INDEX {} ON {}({});",
                    index_name, self.name, indexed_columns
                ),
                params![],
            )?;
        }
        Ok(())
    }

    fn validate(&self, conn: &Connection) -> Result<()> {
        self.validate_columns(conn)?;
        self.validate_indices(conn)?;
        self.validate_unique_constraints(conn)?;
        self.validate_foreign_keys(conn)?;
        Ok(())
    }

    fn validate_columns(&self, conn: &Connection) -> Result<()> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({});", self.name))?;
        let actual_columns: Vec<Column<'_, String>> = stmt
            .query_map(params![], |row| {
                let name = row.get::<usize, String>(1)?;
                let declared_type = row.get::<_, String>(2)?;
                let sql_type = SqlType::from_sql(&declared_type).ok_or_else(|| {
                    rusqlite::Error::InvalidColumnType(2, declared_type.clone(), Type::Text)
                })?;
                Ok(Column {
                    name,
                    sql_type,
                    non_null: row.get::<_, i32>(3)? == 1,
                    default_value: row.get::<_, Option<String>>(4)?,
                    is_primary_key: row.get::<_, i32>(5)? == 1,
                    is_unique: false,
                    foreign_key: None,
                })
            })?
            .collect::<rusqlite::Result<_>>()?;

        if actual_columns.len() != self.columns.len() {
            bail!(
                "Table {} has {} columns, expected {} (found: {}, expected: {})",
                self.name,
                actual_columns.len(),
                self.columns.len(),
                actual_columns
                    .iter()
                    .map(|c| c.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
                self.columns
                    .iter()
                    .map(|c| c.name)
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }

        for (actual, expected) in actual_columns.iter().zip(self.columns.iter()) {
            if actual.name != expected.name {
                bail!(
                    "Table {} column name mismatch: expected {}, got {}",
                    self.name,
                    expected.name,
                    actual.name
                );
            }
            if actual.sql_type != expected.sql_type {
                bail!(
                    "Table {} column {} type mismatch: expected {:?}, got {:?}",
                    self.name,
                    expected.name,
                    expected.sql_type,
                    actual.sql_type
                );
            }
            if actual.non_null != expected.non_null {
                bail!(
                    "Table {} column {} non-null mismatch: expected {}, got {}",
                    self.name,
                    expected.name,
                    expected.non_null,
                    actual.non_null
                );
            }
            // SQLite may echo defaults back wrapped in parentheses
            if actual.default_value.as_ref().map(strip_outer_parens)
                != expected.default_value.map(strip_outer_parens)
            {
                bail!(
                    "Table {} column {} default value mismatch: expected {:?}, got {:?}",
                    self.name,
                    expected.name,
                    expected.default_value,
                    actual.default_value
                );
            }
            if actual.is_primary_key != expected.is_primary_key {
                bail!(
                    "Table {} column {} primary key mismatch: expected {}, got {}",
                    self.name,
                    expected.name,
                    expected.is_primary_key,
                    actual.is_primary_key
                );
            }
        }
        Ok(())
    }

    fn validate_indices(&self, conn: &Connection) -> Result<()> {
        for (index_name, _indexed_columns) in self.indices {
            let index_exists: bool = conn
                .query_row(
                    "SELECT 1 FROM sqlite_master WHERE type='index' AND name=?1 AND tbl_name=?2",
                    params![index_name, self.name],
                    |_| Ok(true),
                )
                .unwrap_or(false);
            if !index_exists {
                bail!("Table {} is missing index '{}'", self.name, index_name);
            }
        }
        Ok(())
    }

    /// SQLite surfaces table-level UNIQUE constraints as unique indices, so
    /// the check goes through `PRAGMA index_list` / `PRAGMA index_info`.
    /// Column order within a constraint is not significant.
    fn validate_unique_constraints(&self, conn: &Connection) -> Result<()> {
        if self.unique_constraints.is_empty() {
            return Ok(());
        }

        let mut stmt = conn.prepare(&format!("PRAGMA index_list({})", self.name))?;
        let unique_indices: Vec<String> = stmt
            .query_map([], |row| {
                let name: String = row.get(1)?;
                let is_unique: i32 = row.get(2)?;
                Ok((name, is_unique))
            })?
            .filter_map(|r| r.ok())
            .filter(|(_, is_unique)| *is_unique == 1)
            .map(|(name, _)| name)
            .collect();

        let mut unique_index_columns: Vec<Vec<String>> = Vec::new();
        for index_name in &unique_indices {
            let mut idx_stmt = conn.prepare(&format!("PRAGMA index_info({})", index_name))?;
            let mut cols: Vec<String> = idx_stmt
                .query_map([], |row| row.get::<_, String>(2))?
                .filter_map(|r| r.ok())
                .collect();
            cols.sort();
            unique_index_columns.push(cols);
        }

        for expected_columns in self.unique_constraints {
            let mut expected_sorted: Vec<&str> = expected_columns.to_vec();
            expected_sorted.sort();

            let found = unique_index_columns.iter().any(|actual_cols| {
                actual_cols.iter().map(|s| s.as_str()).collect::<Vec<_>>() == expected_sorted
            });
            if !found {
                bail!(
                    "Table {} is missing unique constraint on columns ({})",
                    self.name,
                    expected_columns.join(", ")
                );
            }
        }
        Ok(())
    }

    fn validate_foreign_keys(&self, conn: &Connection) -> Result<()> {
        struct ActualFk {
            from_column: String,
            to_table: String,
            to_column: String,
            on_delete: String,
        }

        // PRAGMA foreign_key_list columns: id, seq, table, from, to, on_update, on_delete, match
        let mut stmt = conn.prepare(&format!("PRAGMA foreign_key_list({})", self.name))?;
        let actual_fks: Vec<ActualFk> = stmt
            .query_map([], |row| {
                Ok(ActualFk {
                    from_column: row.get(3)?,
                    to_table: row.get(2)?,
                    to_column: row.get(4)?,
                    on_delete: row.get(6)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        for column in self.columns {
            let Some(expected_fk) = column.foreign_key else {
                continue;
            };
            let expected_on_delete = expected_fk.on_delete.as_sql();

            let found = actual_fks.iter().any(|actual| {
                actual.from_column == column.name
                    && actual.to_table == expected_fk.foreign_table
                    && actual.to_column == expected_fk.foreign_column
                    && actual.on_delete == expected_on_delete
            });
            if found {
                continue;
            }

            // Distinguish "declared differently" from "not declared at all"
            if let Some(actual) = actual_fks.iter().find(|a| a.from_column == column.name) {
                bail!(
                    "Table {} column {} has foreign key mismatch: expected REFERENCES {}({}) ON DELETE {}, got REFERENCES {}({}) ON DELETE {}",
                    self.name,
                    column.name,
                    expected_fk.foreign_table,
                    expected_fk.foreign_column,
                    expected_on_delete,
                    actual.to_table,
                    actual.to_column,
                    actual.on_delete
                );
            } else {
                bail!(
                    "Table {} column {} is missing foreign key: expected REFERENCES {}({}) ON DELETE {}",
                    self.name,
                    column.name,
                    expected_fk.foreign_table,
                    expected_fk.foreign_column,
                    expected_on_delete
                );
            }
        }
        Ok(())
    }
}

pub struct VersionedSchema {
    pub version: usize,
    pub tables: &'static [Table],
    pub migration: Option<fn(&Connection) -> Result<()>>,
}

impl VersionedSchema {
    pub fn create(&self, conn: &Connection) -> Result<()> {
        conn.execute("PRAGMA foreign_keys = ON;", params![])?;
        for table in self.tables {
            table.create(conn)?;
        }
        conn.execute(
            &format!("PRAGMA user_version = {}", BASE_DB_VERSION + self.version),
            [],
        )?;
        Ok(())
    }

    pub fn validate(&self, conn: &Connection) -> Result<()> {
        for table in self.tables {
            table.validate(conn)?;
        }
        Ok(())
    }
}

fn strip_outer_parens<S: AsRef<str>>(s: S) -> String {
    let s = s.as_ref();
    if s.starts_with('(') && s.ends_with(')') {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INDEXED_TABLE: Table = Table {
        name: "deliveries",
        columns: &[
            sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
            sqlite_column!("recipient_id", &SqlType::Text, non_null = true),
        ],
        indices: &[("idx_deliveries_recipient", "recipient_id")],
        unique_constraints: &[],
    };

    #[test]
    fn test_validate_detects_missing_index() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute(
            "CREATE TABLE deliveries (id INTEGER PRIMARY KEY, recipient_id TEXT NOT NULL)",
            [],
        )
        .unwrap();

        let schema = VersionedSchema {
            version: 1,
            tables: &[INDEXED_TABLE],
            migration: None,
        };

        let err = schema.validate(&conn).unwrap_err().to_string();
        assert!(err.contains("missing index"));
        assert!(err.contains("idx_deliveries_recipient"));
    }

    #[test]
    fn test_validate_passes_when_index_present() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute(
            "CREATE TABLE deliveries (id INTEGER PRIMARY KEY, recipient_id TEXT NOT NULL)",
            [],
        )
        .unwrap();
        conn.execute(
            "CREATE INDEX idx_deliveries_recipient ON deliveries(recipient_id)",
            [],
        )
        .unwrap();

        let schema = VersionedSchema {
            version: 1,
            tables: &[INDEXED_TABLE],
            migration: None,
        };
        schema.validate(&conn).unwrap();
    }

    #[test]
    fn test_validate_rejects_index_attached_to_other_table() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute(
            "CREATE TABLE deliveries (id INTEGER PRIMARY KEY, recipient_id TEXT NOT NULL)",
            [],
        )
        .unwrap();
        conn.execute(
            "CREATE TABLE other (id INTEGER PRIMARY KEY, recipient_id TEXT NOT NULL)",
            [],
        )
        .unwrap();
        // Same index name, wrong table
        conn.execute(
            "CREATE INDEX idx_deliveries_recipient ON other(recipient_id)",
            [],
        )
        .unwrap();

        let schema = VersionedSchema {
            version: 1,
            tables: &[INDEXED_TABLE],
            migration: None,
        };

        let err = schema.validate(&conn).unwrap_err().to_string();
        assert!(err.contains("missing index"));
    }

    const UNIQUE_PAIR_TABLE: Table = Table {
        name: "memberships",
        columns: &[
            sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
            sqlite_column!("group_id", &SqlType::Text, non_null = true),
            sqlite_column!("actor_id", &SqlType::Text, non_null = true),
        ],
        indices: &[],
        unique_constraints: &[&["group_id", "actor_id"]],
    };

    #[test]
    fn test_validate_detects_missing_unique_constraint() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute(
            "CREATE TABLE memberships (
                id INTEGER PRIMARY KEY,
                group_id TEXT NOT NULL,
                actor_id TEXT NOT NULL
            )",
            [],
        )
        .unwrap();

        let schema = VersionedSchema {
            version: 1,
            tables: &[UNIQUE_PAIR_TABLE],
            migration: None,
        };

        let err = schema.validate(&conn).unwrap_err().to_string();
        assert!(err.contains("missing unique constraint"));
        assert!(err.contains("group_id"));
        assert!(err.contains("actor_id"));
    }

    #[test]
    fn test_validate_passes_with_unique_constraint_present() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute(
            "CREATE TABLE memberships (
                id INTEGER PRIMARY KEY,
                group_id TEXT NOT NULL,
                actor_id TEXT NOT NULL,
                UNIQUE (group_id, actor_id)
            )",
            [],
        )
        .unwrap();

        let schema = VersionedSchema {
            version: 1,
            tables: &[UNIQUE_PAIR_TABLE],
            migration: None,
        };
        schema.validate(&conn).unwrap();
    }

    #[test]
    fn test_validate_unique_constraint_ignores_column_order() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute(
            "CREATE TABLE memberships (
                id INTEGER PRIMARY KEY,
                group_id TEXT NOT NULL,
                actor_id TEXT NOT NULL,
                UNIQUE (actor_id, group_id)
            )",
            [],
        )
        .unwrap();

        let schema = VersionedSchema {
            version: 1,
            tables: &[UNIQUE_PAIR_TABLE],
            migration: None,
        };
        schema.validate(&conn).unwrap();
    }

    #[test]
    fn test_validate_rejects_unique_on_single_column_of_pair() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute(
            "CREATE TABLE memberships (
                id INTEGER PRIMARY KEY,
                group_id TEXT NOT NULL UNIQUE,
                actor_id TEXT NOT NULL
            )",
            [],
        )
        .unwrap();

        let schema = VersionedSchema {
            version: 1,
            tables: &[UNIQUE_PAIR_TABLE],
            migration: None,
        };
        assert!(schema.validate(&conn).is_err());
    }

    const GROUPS_FK: ForeignKey = ForeignKey {
        foreign_table: "groups",
        foreign_column: "id",
        on_delete: ForeignKeyOnChange::Cascade,
    };

    const CHILD_TABLE_WITH_FK: Table = Table {
        name: "group_members",
        columns: &[
            sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
            sqlite_column!(
                "group_id",
                &SqlType::Text,
                non_null = true,
                foreign_key = Some(&GROUPS_FK)
            ),
        ],
        indices: &[],
        unique_constraints: &[],
    };

    #[test]
    fn test_validate_detects_missing_foreign_key() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("CREATE TABLE groups (id TEXT PRIMARY KEY)", [])
            .unwrap();
        conn.execute(
            "CREATE TABLE group_members (id INTEGER PRIMARY KEY, group_id TEXT NOT NULL)",
            [],
        )
        .unwrap();

        let schema = VersionedSchema {
            version: 1,
            tables: &[CHILD_TABLE_WITH_FK],
            migration: None,
        };

        let err = schema.validate(&conn).unwrap_err().to_string();
        assert!(err.contains("missing foreign key"));
        assert!(err.contains("group_id"));
    }

    #[test]
    fn test_validate_passes_with_foreign_key_present() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("CREATE TABLE groups (id TEXT PRIMARY KEY)", [])
            .unwrap();
        conn.execute(
            "CREATE TABLE group_members (
                id INTEGER PRIMARY KEY,
                group_id TEXT NOT NULL REFERENCES groups(id) ON DELETE CASCADE
            )",
            [],
        )
        .unwrap();

        let schema = VersionedSchema {
            version: 1,
            tables: &[CHILD_TABLE_WITH_FK],
            migration: None,
        };
        schema.validate(&conn).unwrap();
    }

    #[test]
    fn test_validate_detects_wrong_on_delete_action() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("CREATE TABLE groups (id TEXT PRIMARY KEY)", [])
            .unwrap();
        conn.execute(
            "CREATE TABLE group_members (
                id INTEGER PRIMARY KEY,
                group_id TEXT NOT NULL REFERENCES groups(id) ON DELETE SET NULL
            )",
            [],
        )
        .unwrap();

        let schema = VersionedSchema {
            version: 1,
            tables: &[CHILD_TABLE_WITH_FK],
            migration: None,
        };

        let err = schema.validate(&conn).unwrap_err().to_string();
        assert!(err.contains("foreign key mismatch"));
        assert!(err.contains("CASCADE"));
        assert!(err.contains("SET NULL"));
    }

    #[test]
    fn test_validate_detects_foreign_key_to_wrong_table() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("CREATE TABLE groups (id TEXT PRIMARY KEY)", [])
            .unwrap();
        conn.execute("CREATE TABLE other (id TEXT PRIMARY KEY)", [])
            .unwrap();
        conn.execute(
            "CREATE TABLE group_members (
                id INTEGER PRIMARY KEY,
                group_id TEXT NOT NULL REFERENCES other(id) ON DELETE CASCADE
            )",
            [],
        )
        .unwrap();

        let schema = VersionedSchema {
            version: 1,
            tables: &[CHILD_TABLE_WITH_FK],
            migration: None,
        };

        let err = schema.validate(&conn).unwrap_err().to_string();
        assert!(err.contains("foreign key mismatch"));
    }

    #[test]
    fn test_create_applies_defaults_and_user_version() {
        const COUNTER_TABLE: Table = Table {
            name: "counters",
            columns: &[
                sqlite_column!("id", &SqlType::Text, is_primary_key = true),
                sqlite_column!(
                    "value",
                    &SqlType::Integer,
                    non_null = true,
                    default_value = Some("0")
                ),
            ],
            indices: &[],
            unique_constraints: &[],
        };
        let schema = VersionedSchema {
            version: 3,
            tables: &[COUNTER_TABLE],
            migration: None,
        };

        let conn = Connection::open_in_memory().unwrap();
        schema.create(&conn).unwrap();
        schema.validate(&conn).unwrap();

        conn.execute("INSERT INTO counters (id) VALUES ('a')", [])
            .unwrap();
        let value: i64 = conn
            .query_row("SELECT value FROM counters WHERE id = 'a'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(value, 0);

        let user_version: usize = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(user_version, BASE_DB_VERSION + 3);
    }
}
