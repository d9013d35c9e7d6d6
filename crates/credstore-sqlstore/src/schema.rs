//! Declarative table definitions rendered to SQLite DDL

use std::fmt::Write as _;

/// Portable column types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    BigInt,
    /// Variable length string with a maximum character count
    Varchar(u32),
    Text,
    DateTime,
}

impl ColumnType {
    fn sqlite_type(&self) -> String {
        match self {
            // AUTOINCREMENT is only accepted on INTEGER PRIMARY KEY
            ColumnType::BigInt => "INTEGER".to_string(),
            ColumnType::Varchar(len) => format!("VARCHAR({})", len),
            ColumnType::Text => "TEXT".to_string(),
            ColumnType::DateTime => "DATETIME".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
    pub primary_key: bool,
    pub auto_increment: bool,
    pub nullable: bool,
    pub default: Option<&'static str>,
}

impl Column {
    pub fn new(name: &'static str, ty: ColumnType) -> Self {
        Self {
            name,
            ty,
            primary_key: false,
            auto_increment: false,
            nullable: false,
            default: None,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.auto_increment = true;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// String literal default, quoted when rendered
    pub fn default_value(mut self, value: &'static str) -> Self {
        self.default = Some(value);
        self
    }

    fn to_sql(&self) -> String {
        let mut sql = format!("\"{}\" {}", self.name, self.ty.sqlite_type());

        if self.primary_key {
            sql.push_str(" PRIMARY KEY");
            if self.auto_increment {
                sql.push_str(" AUTOINCREMENT");
            }
        }

        sql.push_str(if self.nullable { " NULL" } else { " NOT NULL" });

        if let Some(default) = self.default {
            let _ = write!(sql, " DEFAULT '{}'", default.replace('\'', "''"));
        }

        // SQLite ignores declared lengths
        if let ColumnType::Varchar(len) = self.ty {
            let _ = write!(sql, " CHECK (length(\"{}\") <= {})", self.name, len);
        }

        sql
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    pub table: &'static str,
    pub columns: Vec<&'static str>,
    pub unique: bool,
}

impl Index {
    /// `IDX_<table>_<cols>` or `UQE_<table>_<cols>`
    pub fn name(&self) -> String {
        let prefix = if self.unique { "UQE" } else { "IDX" };
        format!("{}_{}_{}", prefix, self.table, self.columns.join("_"))
    }

    /// Migration id for adding this index
    pub fn migration_id(&self) -> String {
        let kind = if self.unique { "add unique index" } else { "add index" };
        format!("{} {}.{}", kind, self.table, self.columns.join("_"))
    }

    pub fn create_sql(&self) -> String {
        let columns: Vec<String> = self.columns.iter().map(|c| format!("\"{}\"", c)).collect();
        format!(
            "CREATE {}INDEX IF NOT EXISTS \"{}\" ON \"{}\" ({})",
            if self.unique { "UNIQUE " } else { "" },
            self.name(),
            self.table,
            columns.join(", ")
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub name: &'static str,
    pub columns: Vec<Column>,
    pub indexes: Vec<Index>,
}

impl Table {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            columns: Vec::new(),
            indexes: Vec::new(),
        }
    }

    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    pub fn index(mut self, columns: &[&'static str]) -> Self {
        self.indexes.push(Index {
            table: self.name,
            columns: columns.to_vec(),
            unique: false,
        });
        self
    }

    pub fn unique_index(mut self, columns: &[&'static str]) -> Self {
        self.indexes.push(Index {
            table: self.name,
            columns: columns.to_vec(),
            unique: true,
        });
        self
    }

    pub fn create_sql(&self) -> String {
        let columns: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("    {}", c.to_sql()))
            .collect();
        format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" (\n{}\n)",
            self.name,
            columns.join(",\n")
        )
    }
}

/// The `secret` table
pub fn secret_table() -> Table {
    Table::new("secret")
        .column(Column::new("id", ColumnType::BigInt).primary_key())
        .column(Column::new("org_id", ColumnType::BigInt))
        .column(Column::new("entity_uid", ColumnType::Varchar(40)).default_value("0"))
        .column(Column::new("secure_json_data", ColumnType::Text).nullable())
        .column(Column::new("created", ColumnType::DateTime))
        .column(Column::new("updated", ColumnType::DateTime))
        .index(&["org_id"])
        .unique_index(&["org_id", "entity_uid"])
}
