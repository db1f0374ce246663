//! Store Adapter (C2): transactional bulk insert/update over SQLite.
//!
//! Only the coordinator thread ever touches a `Store` — there is no
//! locking here because there is no contention to guard against.

use chrono::{DateTime, Utc};
use rusqlite::{
    types::{ToSqlOutput, Value},
    Connection, ToSql,
};

use crate::error::StoreError;
use crate::schema::{ColumnValue, Row, Table};

pub struct Store {
    conn: Connection,
}

impl ToSql for ColumnValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let value = match self {
            ColumnValue::Null => Value::Null,
            ColumnValue::Integer(i) => Value::Integer(*i),
            ColumnValue::Real(f) => Value::Real(*f),
            ColumnValue::Text(s) => Value::Text(s.clone()),
            ColumnValue::Bool(b) => Value::Integer(if *b { 1 } else { 0 }),
            ColumnValue::Timestamp(t) => Value::Text(t.to_rfc3339()),
        };
        Ok(ToSqlOutput::Owned(value))
    }
}

impl Store {
    /// Open (and create, if absent) the SQLite database at `db_url`, and
    /// declaratively create any missing tables.
    ///
    /// `db_url` is a plain filesystem path (or `:memory:`); this crate
    /// does not speak the `sqlite://` URL scheme some other stores use.
    pub fn open(db_url: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(db_url)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=OFF;")?;
        let store = Store { conn };
        store.create_tables()?;
        Ok(store)
    }

    fn create_tables(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS workflow (
                run_id TEXT PRIMARY KEY,
                workflow_name TEXT,
                workflow_version TEXT,
                host TEXT NOT NULL,
                user TEXT NOT NULL,
                rundir TEXT NOT NULL,
                time_began TEXT NOT NULL,
                time_completed TEXT,
                tasks_failed_count INTEGER NOT NULL,
                tasks_completed_count INTEGER NOT NULL,
                workflow_duration REAL
            );

            CREATE TABLE IF NOT EXISTS task (
                task_id INTEGER NOT NULL,
                run_id TEXT NOT NULL,
                task_depends TEXT,
                task_func_name TEXT NOT NULL,
                task_memoize TEXT NOT NULL,
                task_hashsum TEXT,
                task_inputs TEXT,
                task_outputs TEXT,
                task_stdin TEXT,
                task_stdout TEXT,
                task_stderr TEXT,
                task_time_returned TEXT,
                task_fail_count INTEGER NOT NULL,
                PRIMARY KEY (task_id, run_id)
            );

            CREATE TABLE IF NOT EXISTS try (
                try_id INTEGER NOT NULL,
                task_id INTEGER NOT NULL,
                run_id TEXT NOT NULL,
                hostname TEXT,
                task_executor TEXT NOT NULL,
                task_time_submitted TEXT,
                task_time_running TEXT,
                task_try_time_returned TEXT,
                task_fail_history TEXT,
                PRIMARY KEY (try_id, task_id, run_id)
            );

            CREATE TABLE IF NOT EXISTS status (
                task_id INTEGER NOT NULL,
                run_id TEXT NOT NULL,
                task_status_name TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                try_id INTEGER NOT NULL,
                PRIMARY KEY (task_id, run_id, task_status_name, timestamp)
            );

            CREATE TABLE IF NOT EXISTS node (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                hostname TEXT NOT NULL,
                cpu_count INTEGER NOT NULL,
                total_memory INTEGER NOT NULL,
                active INTEGER NOT NULL,
                worker_count INTEGER NOT NULL,
                python_v TEXT NOT NULL,
                reg_time TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS resource (
                try_id INTEGER NOT NULL,
                task_id INTEGER NOT NULL,
                run_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                resource_monitoring_interval REAL,
                psutil_process_pid INTEGER,
                psutil_process_cpu_percent REAL,
                psutil_process_memory_percent REAL,
                psutil_process_memory_virtual REAL,
                psutil_process_memory_resident REAL,
                psutil_process_disk_read REAL,
                psutil_process_disk_write REAL,
                psutil_process_children_count REAL,
                psutil_process_time_user REAL,
                psutil_process_time_system REAL,
                psutil_process_status TEXT,
                PRIMARY KEY (try_id, task_id, run_id, timestamp)
            );
            "#,
        )?;
        Ok(())
    }

    /// Insert every row into `table` inside one transaction. On a
    /// primary-key conflict, the whole transaction is rolled back and the
    /// error returned — there are no upsert semantics.
    pub fn bulk_insert(&mut self, table: Table, rows: &[Row]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let tx = self.conn.transaction()?;
        {
            for row in rows {
                let columns: Vec<&str> = row.iter().map(|(c, _)| *c).collect();
                let placeholders = vec!["?"; columns.len()].join(", ");
                let sql = format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    table.name(),
                    columns.join(", "),
                    placeholders
                );
                let values: Vec<&dyn ToSql> = row.iter().map(|(_, v)| v as &dyn ToSql).collect();
                tx.execute(&sql, values.as_slice())?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Update the listed columns of `table`, locating each row by the
    /// table's primary key (extracted from the row itself). Rows whose
    /// primary key doesn't exist are silently skipped by SQLite's
    /// zero-rows-affected `UPDATE` — the coordinator does not depend on
    /// the distinction, since it tracks insertion itself.
    pub fn bulk_update(&mut self, table: Table, rows: &[Row]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let pk = table.primary_key();
        let tx = self.conn.transaction()?;
        {
            for row in rows {
                let set_cols: Vec<&str> = row
                    .iter()
                    .map(|(c, _)| *c)
                    .filter(|c| !pk.contains(c))
                    .collect();
                if set_cols.is_empty() {
                    continue;
                }
                let set_clause = set_cols
                    .iter()
                    .map(|c| format!("{} = ?", c))
                    .collect::<Vec<_>>()
                    .join(", ");
                let where_clause = pk
                    .iter()
                    .map(|c| format!("{} = ?", c))
                    .collect::<Vec<_>>()
                    .join(" AND ");
                let sql = format!(
                    "UPDATE {} SET {} WHERE {}",
                    table.name(),
                    set_clause,
                    where_clause
                );

                let mut values: Vec<&dyn ToSql> = Vec::with_capacity(row.len());
                for c in &set_cols {
                    let (_, v) = row.iter().find(|(rc, _)| rc == c).unwrap();
                    values.push(v as &dyn ToSql);
                }
                for pk_col in pk {
                    let (_, v) = row
                        .iter()
                        .find(|(rc, _)| rc == pk_col)
                        .expect("update columns must include the table's primary key");
                    values.push(v as &dyn ToSql);
                }
                tx.execute(&sql, values.as_slice())?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Discard the current transaction, swallowing any error from a
    /// `ROLLBACK` issued outside an open transaction.
    pub fn rollback(&self) {
        if let Err(e) = self.conn.execute_batch("ROLLBACK") {
            tracing::debug!("rollback no-op or failed (no open transaction?): {}", e);
        }
    }

    /// Row count for a table; used only by tests to assert on persisted
    /// state.
    #[cfg(test)]
    pub fn count(&self, table: Table) -> i64 {
        self.conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", table.name()), [], |r| {
                r.get(0)
            })
            .unwrap_or(0)
    }

    #[cfg(test)]
    pub fn query_scalar<T: rusqlite::types::FromSql>(&self, sql: &str) -> Option<T> {
        self.conn.query_row(sql, [], |r| r.get(0)).ok()
    }
}

/// Parse an RFC3339 timestamp column back into a `DateTime<Utc>` (used by
/// tests reading rows back from the store).
#[cfg(test)]
pub fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workflow_row(run_id: &str) -> Row {
        vec![
            ("run_id", ColumnValue::Text(run_id.to_string())),
            ("host", ColumnValue::Text("h".to_string())),
            ("user", ColumnValue::Text("u".to_string())),
            ("rundir", ColumnValue::Text("/tmp".to_string())),
            ("time_began", ColumnValue::Timestamp(Utc::now())),
            ("tasks_failed_count", ColumnValue::Integer(0)),
            ("tasks_completed_count", ColumnValue::Integer(0)),
        ]
    }

    #[test]
    fn bulk_insert_rejects_primary_key_conflict() {
        let mut store = Store::open(":memory:").unwrap();
        store.bulk_insert(Table::Workflow, &[workflow_row("r1")]).unwrap();
        assert_eq!(store.count(Table::Workflow), 1);

        let err = store.bulk_insert(Table::Workflow, &[workflow_row("r1")]);
        assert!(err.is_err());
        // No partial commit: the conflicting insert leaves the table as-is.
        assert_eq!(store.count(Table::Workflow), 1);
    }

    #[test]
    fn bulk_update_on_missing_primary_key_is_a_silent_no_op() {
        let mut store = Store::open(":memory:").unwrap();
        let row = vec![
            ("run_id", ColumnValue::Text("missing".to_string())),
            ("tasks_failed_count", ColumnValue::Integer(1)),
            ("tasks_completed_count", ColumnValue::Integer(2)),
        ];
        // Nothing to conflict with and nothing to update; must not error.
        store.bulk_update(Table::Workflow, &[row]).unwrap();
        assert_eq!(store.count(Table::Workflow), 0);
    }

    #[test]
    fn bulk_update_changes_only_listed_columns() {
        let mut store = Store::open(":memory:").unwrap();
        store.bulk_insert(Table::Workflow, &[workflow_row("r1")]).unwrap();

        let update = vec![
            ("run_id", ColumnValue::Text("r1".to_string())),
            ("tasks_completed_count", ColumnValue::Integer(5)),
        ];
        store.bulk_update(Table::Workflow, &[update]).unwrap();

        let completed: i64 = store
            .query_scalar("SELECT tasks_completed_count FROM workflow WHERE run_id = 'r1'")
            .unwrap();
        assert_eq!(completed, 5);
        let failed: i64 = store
            .query_scalar("SELECT tasks_failed_count FROM workflow WHERE run_id = 'r1'")
            .unwrap();
        assert_eq!(failed, 0);
    }
}
