use std::fmt;

use anyhow::{Result, bail};

/// Fully-qualified destination table: `database.schema.table`, with the
/// database and schema components optional on input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub database: Option<String>,
    pub schema: Option<String>,
    pub table: String,
}

impl TableRef {
    /// Parse `table`, `schema.table`, or `database.schema.table`.
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('.').collect();

        if parts.iter().any(|p| p.trim().is_empty()) {
            bail!("invalid table name '{}': empty component", s);
        }

        match parts.as_slice() {
            [table] => Ok(Self {
                database: None,
                schema: None,
                table: (*table).to_string(),
            }),
            [schema, table] => Ok(Self {
                database: None,
                schema: Some((*schema).to_string()),
                table: (*table).to_string(),
            }),
            [database, schema, table] => Ok(Self {
                database: Some((*database).to_string()),
                schema: Some((*schema).to_string()),
                table: (*table).to_string(),
            }),
            _ => bail!(
                "invalid table name '{}': expected at most database.schema.table",
                s
            ),
        }
    }

    /// Quoted form for use in SQL statements, e.g. `"db"."schema"."table"`.
    pub fn qualified(&self) -> String {
        let quote = |part: &str| format!("\"{}\"", part.replace('"', "\"\""));

        let mut parts = Vec::with_capacity(3);
        if let Some(database) = &self.database {
            parts.push(quote(database));
        }
        if let Some(schema) = &self.schema {
            parts.push(quote(schema));
        }
        parts.push(quote(&self.table));
        parts.join(".")
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(database) = &self.database {
            write!(f, "{}.", database)?;
        }
        if let Some(schema) = &self.schema {
            write!(f, "{}.", schema)?;
        }
        write!(f, "{}", self.table)
    }
}
