// Database interaction module

use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow, bail};
use crossbeam_channel::{Receiver, Sender, unbounded};
use duckdb::types::Value;
use duckdb::{Connection, params_from_iter};
use tokio::sync::oneshot;
use tokio::task;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::models::{Entity, SCHEMA};

pub enum DbCommand {
    /// Select statement returning `columns` values per row.
    Query {
        sql: String,
        params: Vec<Value>,
        columns: usize,
    },
    /// Insert statement ending in `RETURNING id`.
    Insert { sql: String, params: Vec<Value> },
    Execute { sql: String, params: Vec<Value> },
    Shutdown,
}

struct DbJob {
    command: DbCommand,
    response: oneshot::Sender<Result<DbResponse>>,
}

#[derive(Debug)]
pub enum DbResponse {
    Rows(Vec<Vec<Value>>),
    Inserted(i64),
    Affected(usize),
    ShutdownResult,
}

/// Cloneable handle to the worker thread that owns the single DuckDB
/// connection. Every record operation is one independent statement.
#[derive(Clone)]
pub struct DbHandle {
    tx: Sender<DbJob>,
}

impl DbHandle {
    fn new(tx: Sender<DbJob>) -> Self {
        DbHandle { tx }
    }

    async fn submit(&self, command: DbCommand) -> Result<DbResponse> {
        let (tx, rx) = oneshot::channel();
        let job = DbJob {
            command,
            response: tx,
        };
        self.tx
            .send(job)
            .map_err(|e| anyhow!("DB job send error: {}", e))?;
        rx.await
            .map_err(|e| anyhow!("DB job response error: {}", e))?
    }

    async fn select<T: Entity>(&self, sql: String, params: Vec<Value>) -> Result<Vec<T>> {
        let command = DbCommand::Query {
            sql,
            params,
            columns: T::COLUMNS.len() + 1,
        };
        match self.submit(command).await? {
            DbResponse::Rows(rows) => rows.iter().map(|row| T::from_values(row)).collect(),
            other => Err(anyhow!("unexpected response to query: {:?}", other)),
        }
    }

    async fn execute(&self, sql: String, params: Vec<Value>) -> Result<usize> {
        match self.submit(DbCommand::Execute { sql, params }).await? {
            DbResponse::Affected(n) => Ok(n),
            other => Err(anyhow!("unexpected response to statement: {:?}", other)),
        }
    }

    pub async fn load<T: Entity>(&self, id: i64) -> Result<Option<T>> {
        let sql = format!("SELECT {} FROM {} WHERE id = ?", T::select_list(), T::TABLE);
        Ok(self.select(sql, vec![Value::BigInt(id)]).await?.into_iter().next())
    }

    /// Load the first record whose lookup field equals `value`.
    pub async fn load_by_field<T: Entity>(&self, value: Value) -> Result<Option<T>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ? ORDER BY id LIMIT 1",
            T::select_list(),
            T::TABLE,
            T::LOOKUP_FIELD
        );
        Ok(self.select(sql, vec![value]).await?.into_iter().next())
    }

    /// Insert `record` and store the generated primary key back into it.
    pub async fn create<T: Entity>(&self, record: &mut T) -> Result<i64> {
        let placeholders = vec!["?"; T::COLUMNS.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING id",
            T::TABLE,
            T::COLUMNS.join(", "),
            placeholders
        );
        let params = record.values();
        match self.submit(DbCommand::Insert { sql, params }).await? {
            DbResponse::Inserted(id) => {
                record.set_id(id);
                Ok(id)
            }
            other => Err(anyhow!("unexpected response to insert: {:?}", other)),
        }
    }

    pub async fn update<T: Entity>(&self, record: &T) -> Result<usize> {
        let sql = format!(
            "UPDATE {} SET {} WHERE id = ?",
            T::TABLE,
            assignments(T::COLUMNS.iter().copied())
        );
        let mut params = record.values();
        params.push(Value::BigInt(record.id()));
        self.execute(sql, params).await
    }

    /// Set `values` on every record matching all of `criteria`.
    pub async fn update_many<T: Entity>(
        &self,
        values: &[(&str, Value)],
        criteria: &[(&str, Value)],
    ) -> Result<usize> {
        if values.is_empty() || criteria.is_empty() {
            bail!("update_many on {} needs both values and criteria", T::TABLE);
        }
        check_columns::<T>(values.iter().chain(criteria))?;

        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            T::TABLE,
            assignments(values.iter().map(|(c, _)| *c)),
            conditions(criteria)
        );
        let params = values
            .iter()
            .chain(criteria)
            .map(|(_, v)| v.clone())
            .collect();
        self.execute(sql, params).await
    }

    pub async fn remove<T: Entity>(&self, record: &T) -> Result<usize> {
        let sql = format!("DELETE FROM {} WHERE id = ?", T::TABLE);
        self.execute(sql, vec![Value::BigInt(record.id())]).await
    }

    /// All records matching every `(column, value)` pair; empty criteria
    /// selects the whole table.
    pub async fn query<T: Entity>(&self, criteria: &[(&str, Value)]) -> Result<Vec<T>> {
        check_columns::<T>(criteria.iter())?;
        let mut sql = format!("SELECT {} FROM {}", T::select_list(), T::TABLE);
        if !criteria.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions(criteria));
        }
        sql.push_str(" ORDER BY id");
        let params = criteria.iter().map(|(_, v)| v.clone()).collect();
        self.select(sql, params).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        match self.submit(DbCommand::Shutdown).await? {
            DbResponse::ShutdownResult => Ok(()),
            other => Err(anyhow!("unexpected response to shutdown: {:?}", other)),
        }
    }
}

fn assignments<'a>(columns: impl Iterator<Item = &'a str>) -> String {
    columns
        .map(|c| format!("{c} = ?"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn conditions(criteria: &[(&str, Value)]) -> String {
    criteria
        .iter()
        .map(|(c, _)| format!("{c} = ?"))
        .collect::<Vec<_>>()
        .join(" AND ")
}

// Column names are interpolated, so they must come from the entity's own list.
fn check_columns<'a, T: Entity>(
    mut pairs: impl Iterator<Item = &'a (&'a str, Value)>,
) -> Result<()> {
    match pairs.find(|(column, _)| !T::has_column(column)) {
        Some((column, _)) => bail!("unknown column '{}' for table {}", column, T::TABLE),
        None => Ok(()),
    }
}

/// Open the database (file or in-memory), bootstrap the schema and apply the
/// optional seed script.
pub fn open_database(path: Option<&str>, seed: Option<&Path>) -> Result<Connection> {
    let conn = match path {
        Some(p) => Connection::open(p)?,
        None => Connection::open_in_memory()?,
    };
    conn.execute_batch(SCHEMA)?;

    if let Some(seed) = seed {
        let sql = std::fs::read_to_string(seed)
            .map_err(|e| anyhow!("reading seed file {}: {}", seed.display(), e))?;
        conn.execute_batch(&sql)?;
        info!(seed = %seed.display(), "applied database seed");
    }
    Ok(conn)
}

fn run_command(conn: &Connection, command: DbCommand) -> Result<DbResponse> {
    match command {
        DbCommand::Query {
            sql,
            params,
            columns,
        } => {
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params_from_iter(params.iter()))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut values = Vec::with_capacity(columns);
                for idx in 0..columns {
                    values.push(row.get::<_, Value>(idx)?);
                }
                out.push(values);
            }
            Ok(DbResponse::Rows(out))
        }
        DbCommand::Insert { sql, params } => {
            let id: i64 = conn.query_row(&sql, params_from_iter(params.iter()), |row| row.get(0))?;
            Ok(DbResponse::Inserted(id))
        }
        DbCommand::Execute { sql, params } => {
            let affected = conn.execute(&sql, params_from_iter(params.iter()))?;
            Ok(DbResponse::Affected(affected))
        }
        DbCommand::Shutdown => Ok(DbResponse::ShutdownResult),
    }
}

/// Start the DB worker thread which owns a DuckDB connection and executes jobs.
/// If `path` is `Some`, opens that file, otherwise uses an in-memory DB.
/// Failing to open the database or bootstrap the schema is returned to the
/// caller, which treats it as fatal.
pub async fn start_db_worker(
    path: Option<String>,
    seed: Option<PathBuf>,
) -> Result<(DbHandle, JoinHandle<()>)> {
    let conn = task::spawn_blocking(move || open_database(path.as_deref(), seed.as_deref()))
        .await
        .map_err(|e| anyhow!("DB open task failed: {}", e))??;

    let (tx, rx): (Sender<DbJob>, Receiver<DbJob>) = unbounded();
    let handle = DbHandle::new(tx);

    let join = task::spawn_blocking(move || {
        while let Ok(job) = rx.recv() {
            match job.command {
                DbCommand::Shutdown => {
                    let res = conn
                        .close()
                        .map(|_| DbResponse::ShutdownResult)
                        .map_err(|(_, e)| anyhow!(e));
                    if let Err(e) = &res {
                        warn!(error = %e, "closing database failed");
                    }
                    let _ = job.response.send(res);
                    return;
                }
                command => {
                    let res = run_command(&conn, command);
                    if let Err(e) = &res {
                        error!(error = %e, "database statement failed");
                    }
                    let _ = job.response.send(res);
                }
            }
        }
        debug!("all database handles dropped; worker exiting");
    });

    Ok((handle, join))
}
