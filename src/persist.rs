//! The storage collaborator and its SQLite implementation.
//!
//! Owner tables are created by the application; the meta table of each
//! entity type is created by [`Store::create_meta_table`] and has the layout
//!
//! | column | notes |
//! |---|---|
//! | `id` | auto-increment primary key |
//! | `<owner>_id` | references the owner table, cascading deletes |
//! | `type` | type tag, `'null'` by default |
//! | `key` | indexed, lowercase |
//! | `value` | encoded payload, nullable |
//! | `created_at`, `updated_at` | audit columns |

// used for persistence
use rusqlite::types::ToSql;
use rusqlite::{Connection, params};

use chrono::NaiveDateTime;
use std::collections::BTreeMap;
use tracing::debug;

use crate::datatype::{TypeTag, Value};
use crate::error::{MetableError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceMode {
    InMemory,
    File(String),
}

/// A meta table row as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaRow {
    pub id: Option<i64>,
    pub owner_id: i64,
    pub key: String,
    pub type_tag: TypeTag,
    pub value: Option<String>,
    pub created_at: Option<NaiveDateTime>,
    pub updated_at: Option<NaiveDateTime>,
}

pub trait Store: Send {
    fn columns(&mut self, table: &str) -> Result<Vec<String>>;
    fn find(
        &mut self,
        table: &str,
        primary_key: &str,
        id: i64,
    ) -> Result<Option<BTreeMap<String, Value>>>;
    /// Inserts a row and returns its id.
    fn insert(&mut self, table: &str, attributes: &BTreeMap<String, Value>) -> Result<i64>;
    fn update(
        &mut self,
        table: &str,
        primary_key: &str,
        id: i64,
        attributes: &BTreeMap<String, Value>,
    ) -> Result<()>;
    fn delete(&mut self, table: &str, primary_key: &str, id: i64) -> Result<()>;
    /// Meta rows of one owner ordered by id.
    fn related(&mut self, meta_table: &str, owner_key: &str, owner_id: i64) -> Result<Vec<MetaRow>>;
    fn insert_meta(&mut self, meta_table: &str, owner_key: &str, row: &MetaRow) -> Result<i64>;
    fn update_meta(&mut self, meta_table: &str, owner_key: &str, row: &MetaRow) -> Result<i64>;
    fn delete_meta(&mut self, meta_table: &str, id: i64) -> Result<()>;
    fn delete_metas(&mut self, meta_table: &str, owner_key: &str, owner_id: i64) -> Result<usize>;
    /// Ids of owners having a row with this key and payload.
    fn where_meta(
        &mut self,
        meta_table: &str,
        owner_key: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<Vec<i64>>;
    fn create_meta_table(
        &mut self,
        meta_table: &str,
        owner_table: &str,
        owner_primary_key: &str,
        owner_key: &str,
    ) -> Result<()>;
    fn execute_batch(&mut self, sql: &str) -> Result<()>;
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

pub struct Persistor {
    connection: Connection,
}

impl Persistor {
    pub fn new(connection: Connection) -> Result<Self> {
        connection.execute_batch("pragma foreign_keys = on;")?;
        Ok(Self { connection })
    }
    pub fn open(mode: &PersistenceMode) -> Result<Self> {
        let connection = match mode {
            PersistenceMode::InMemory => Connection::open_in_memory()?,
            PersistenceMode::File(path) => Connection::open(path)?,
        };
        debug!(?mode, "opened store");
        Self::new(connection)
    }
    pub fn connection(&self) -> &Connection {
        &self.connection
    }
}

impl Store for Persistor {
    fn columns(&mut self, table: &str) -> Result<Vec<String>> {
        let mut statement = self
            .connection
            .prepare_cached("select name from pragma_table_info(?1) order by cid")?;
        let columns = statement
            .query_map(params![table], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(columns)
    }

    fn find(
        &mut self,
        table: &str,
        primary_key: &str,
        id: i64,
    ) -> Result<Option<BTreeMap<String, Value>>> {
        let sql = format!("select * from {} where {} = ?1", quote(table), quote(primary_key));
        let mut statement = self.connection.prepare_cached(&sql)?;
        let names: Vec<String> = statement
            .column_names()
            .into_iter()
            .map(String::from)
            .collect();
        let mut rows = statement.query(params![id])?;
        match rows.next()? {
            Some(row) => {
                let mut attributes = BTreeMap::new();
                for (index, name) in names.into_iter().enumerate() {
                    attributes.insert(name, row.get::<_, Value>(index)?);
                }
                Ok(Some(attributes))
            }
            None => Ok(None),
        }
    }

    fn insert(&mut self, table: &str, attributes: &BTreeMap<String, Value>) -> Result<i64> {
        if attributes.is_empty() {
            let sql = format!("insert into {} default values", quote(table));
            self.connection.prepare_cached(&sql)?.execute([])?;
        } else {
            let columns: Vec<String> = attributes.keys().map(|key| quote(key)).collect();
            let placeholders: Vec<String> =
                (1..=attributes.len()).map(|n| format!("?{}", n)).collect();
            let sql = format!(
                "insert into {} ({}) values ({})",
                quote(table),
                columns.join(", "),
                placeholders.join(", ")
            );
            let values: Vec<&dyn ToSql> = attributes.values().map(|v| v as &dyn ToSql).collect();
            self.connection.prepare_cached(&sql)?.execute(values.as_slice())?;
        }
        Ok(self.connection.last_insert_rowid())
    }

    fn update(
        &mut self,
        table: &str,
        primary_key: &str,
        id: i64,
        attributes: &BTreeMap<String, Value>,
    ) -> Result<()> {
        if attributes.is_empty() {
            return Ok(());
        }
        let assignments: Vec<String> = attributes
            .keys()
            .enumerate()
            .map(|(n, key)| format!("{} = ?{}", quote(key), n + 1))
            .collect();
        let sql = format!(
            "update {} set {} where {} = ?{}",
            quote(table),
            assignments.join(", "),
            quote(primary_key),
            attributes.len() + 1
        );
        let mut values: Vec<&dyn ToSql> = attributes.values().map(|v| v as &dyn ToSql).collect();
        values.push(&id);
        self.connection.prepare_cached(&sql)?.execute(values.as_slice())?;
        Ok(())
    }

    fn delete(&mut self, table: &str, primary_key: &str, id: i64) -> Result<()> {
        let sql = format!("delete from {} where {} = ?1", quote(table), quote(primary_key));
        self.connection.prepare_cached(&sql)?.execute(params![id])?;
        Ok(())
    }

    fn related(&mut self, meta_table: &str, owner_key: &str, owner_id: i64) -> Result<Vec<MetaRow>> {
        let sql = format!(
            "
            select id, {owner}, key, type, value, created_at, updated_at
              from {table}
             where {owner} = ?1
             order by id
            ",
            owner = quote(owner_key),
            table = quote(meta_table)
        );
        let mut statement = self.connection.prepare_cached(&sql)?;
        let rows = statement
            .query_map(params![owner_id], |row| {
                Ok(MetaRow {
                    id: Some(row.get(0)?),
                    owner_id: row.get(1)?,
                    key: row.get(2)?,
                    type_tag: row.get(3)?,
                    value: row.get(4)?,
                    created_at: row.get(5)?,
                    updated_at: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn insert_meta(&mut self, meta_table: &str, owner_key: &str, row: &MetaRow) -> Result<i64> {
        let sql = format!(
            "
            insert into {table} (
                {owner}, key, type, value, created_at, updated_at
            ) values (?1, ?2, ?3, ?4, ?5, ?6)
            ",
            owner = quote(owner_key),
            table = quote(meta_table)
        );
        self.connection.prepare_cached(&sql)?.execute(params![
            row.owner_id,
            row.key,
            row.type_tag,
            row.value,
            row.created_at,
            row.updated_at
        ])?;
        Ok(self.connection.last_insert_rowid())
    }

    fn update_meta(&mut self, meta_table: &str, owner_key: &str, row: &MetaRow) -> Result<i64> {
        let id = row.id.ok_or_else(|| {
            MetableError::Invariant(format!("meta row '{}' has no id to update", row.key))
        })?;
        let sql = format!(
            "
            update {table}
               set {owner} = ?1, key = ?2, type = ?3, value = ?4, updated_at = ?5
             where id = ?6
            ",
            owner = quote(owner_key),
            table = quote(meta_table)
        );
        let changed = self.connection.prepare_cached(&sql)?.execute(params![
            row.owner_id,
            row.key,
            row.type_tag,
            row.value,
            row.updated_at,
            id
        ])?;
        if changed == 0 {
            return Err(MetableError::Persistence(format!(
                "meta row {} in {} no longer exists",
                id, meta_table
            )));
        }
        Ok(id)
    }

    fn delete_meta(&mut self, meta_table: &str, id: i64) -> Result<()> {
        let sql = format!("delete from {} where id = ?1", quote(meta_table));
        self.connection.prepare_cached(&sql)?.execute(params![id])?;
        Ok(())
    }

    fn delete_metas(&mut self, meta_table: &str, owner_key: &str, owner_id: i64) -> Result<usize> {
        let sql = format!("delete from {} where {} = ?1", quote(meta_table), quote(owner_key));
        Ok(self.connection.prepare_cached(&sql)?.execute(params![owner_id])?)
    }

    fn where_meta(
        &mut self,
        meta_table: &str,
        owner_key: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<Vec<i64>> {
        let sql = format!(
            "
            select distinct {owner}
              from {table}
             where key = ?1 and value is ?2
             order by {owner}
            ",
            owner = quote(owner_key),
            table = quote(meta_table)
        );
        let mut statement = self.connection.prepare_cached(&sql)?;
        let owners = statement
            .query_map(params![key, value], |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(owners)
    }

    fn create_meta_table(
        &mut self,
        meta_table: &str,
        owner_table: &str,
        owner_primary_key: &str,
        owner_key: &str,
    ) -> Result<()> {
        let sql = format!(
            "
            create table if not exists {table} (
                id integer primary key autoincrement,
                {owner} integer not null,
                type text not null default 'null',
                key text not null,
                value text null,
                created_at text null,
                updated_at text null,
                constraint {constraint} foreign key (
                    {owner}
                ) references {owner_table}({owner_primary_key}) on delete cascade
            );
            create index if not exists {index} on {table} (key);
            ",
            table = quote(meta_table),
            owner = quote(owner_key),
            constraint = quote(&format!("{}_belongs_to_{}", meta_table, owner_table)),
            owner_table = quote(owner_table),
            owner_primary_key = quote(owner_primary_key),
            index = quote(&format!("{}_key_index", meta_table)),
        );
        self.connection.execute_batch(&sql)?;
        debug!(meta_table, owner_table, "meta table ready");
        Ok(())
    }

    fn execute_batch(&mut self, sql: &str) -> Result<()> {
        self.connection.execute_batch(sql)?;
        Ok(())
    }
}
