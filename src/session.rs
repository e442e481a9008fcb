/// Database Session Module
///
/// A `Session` is the single entry point of the access layer. It owns one
/// connection and all per-session state: write accounting, savepoints,
/// commit hooks, rollback observers, the point-lookup cache and the schema
/// cache. Sessions share nothing; two sessions are two connections.
///
/// Every connected session is inside a transaction. Connecting begins one,
/// and `commit` and `rollback` end the current one and begin the next.

use crate::cache::{CacheKey, PointLookupCache};
use crate::config::SessionConfig;
use crate::core::db::connection::ConnectionManager;
use crate::core::db::query::{mogrify, savepoint_name, Params, StatementType, Value};
use crate::core::db::schema::{self, Column, SchemaCache};
use crate::core::{Result, SessionError};
use crate::filters::{
    quote_identifier, validate_identifier, Fields, Filters, OrderBy, QueryBuilder, QueryDescriptor,
    QueryOptions,
};
use crate::hooks::{HookRegistry, RollbackObserver, RollbackObservers};
use crate::shaper::{shape, single, LookupValue, QueryOutput, Record, ShapeOptions};
use crate::transaction::{new_savepoint_name, StatementVerdict, TransactionState, TransactionTracker};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Rows per statement in `bulk_insert`.
pub const BULK_INSERT_CHUNK_SIZE: usize = 10_000;

/// Highest parameter index the bundled SQLite accepts in one statement.
const MAX_BOUND_PARAMETERS: usize = 32_766;

/// Options of `Session::execute`.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub as_dict: bool,
    pub as_list: bool,
    pub as_utf8: bool,
    pub pluck: bool,
    /// Log the statement with its values and the execution time at info level
    pub debug: bool,
    /// Log the query plan of SELECT statements
    pub explain: bool,
    /// Commit before and after the statement
    pub auto_commit: bool,
    /// Missing table or column yields an empty result instead of an error
    pub ignore_missing: bool,
    pub update: Option<Record>,
}

impl ExecuteOptions {
    pub fn as_dict() -> Self {
        ExecuteOptions {
            as_dict: true,
            ..ExecuteOptions::default()
        }
    }

    fn shape_options(&self) -> ShapeOptions {
        ShapeOptions {
            as_dict: self.as_dict,
            as_list: self.as_list,
            as_utf8: self.as_utf8,
            pluck: self.pluck,
            update: self.update.clone(),
        }
    }

    /// Stable rendering of the options that change a result's shape.
    fn shape_key(&self) -> Result<String> {
        let update = match &self.update {
            Some(record) => serde_json::to_string(record)?,
            None => String::new(),
        };
        Ok(format!(
            "dict={};list={};utf8={};pluck={};update={}",
            self.as_dict, self.as_list, self.as_utf8, self.pluck, update
        ))
    }
}

/// Options of the lookup family (`lookup`, `get_value`, `get`, ...).
#[derive(Debug, Clone)]
pub struct LookupOptions {
    pub as_dict: bool,
    pub pluck: bool,
    /// Serve named-key lookups from the point-lookup cache
    pub cache: bool,
    pub ignore_missing: bool,
    pub order_by: OrderBy,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// Also disables ordering
    pub distinct: bool,
    pub group_by: Option<String>,
    pub update: Option<Record>,
    pub debug: bool,
}

impl Default for LookupOptions {
    fn default() -> Self {
        LookupOptions {
            as_dict: false,
            pluck: false,
            cache: false,
            ignore_missing: false,
            order_by: OrderBy::Default,
            limit: None,
            offset: None,
            distinct: false,
            group_by: None,
            update: None,
            debug: false,
        }
    }
}

impl LookupOptions {
    /// Default options without any ORDER BY clause.
    pub fn unordered() -> Self {
        LookupOptions {
            order_by: OrderBy::Unordered,
            ..LookupOptions::default()
        }
    }

    fn query_options(&self) -> QueryOptions {
        QueryOptions {
            order_by: if self.distinct {
                OrderBy::Unordered
            } else {
                self.order_by.clone()
            },
            limit: self.limit,
            offset: self.offset,
            distinct: self.distinct,
            group_by: self.group_by.clone(),
        }
    }
}

/// One database session.
#[derive(Debug)]
pub struct Session {
    conn: ConnectionManager,
    builder: QueryBuilder,
    tracker: TransactionTracker,
    before_commit: HookRegistry<Session>,
    after_commit: HookRegistry<Session>,
    rollback_observers: RollbackObservers,
    cache: PointLookupCache,
    schema: SchemaCache,
    read_only: bool,
}

impl Session {
    /// Creates a disconnected session. Nothing touches the backend until
    /// the first statement or an explicit `connect`.
    pub fn new(config: SessionConfig) -> Self {
        let mut conn = ConnectionManager::new(config.database.clone());
        conn.set_read_only(config.transactions.read_only);
        Session {
            conn,
            builder: QueryBuilder::new(&config.lookup),
            tracker: TransactionTracker::new(&config.transactions),
            before_commit: HookRegistry::default(),
            after_commit: HookRegistry::default(),
            rollback_observers: RollbackObservers::default(),
            cache: PointLookupCache::default(),
            schema: SchemaCache::default(),
            read_only: config.transactions.read_only,
        }
    }

    /// Creates a session and connects it.
    pub fn open(config: SessionConfig) -> Result<Self> {
        let mut session = Session::new(config);
        session.connect()?;
        Ok(session)
    }

    /// Opens the connection and begins the first transaction. No-op when
    /// already connected.
    pub fn connect(&mut self) -> Result<()> {
        if self.conn.connect()? {
            self.open_transaction(false)?;
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Releases the connection. Uncommitted work is discarded and pending
    /// hooks are dropped unrun. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.conn.is_connected() && self.tracker.writes() > 0 {
            warn!(
                pending_writes = self.tracker.writes(),
                "closing session with uncommitted writes"
            );
        }
        self.before_commit.clear();
        self.after_commit.clear();
        self.rollback_observers.clear();
        self.tracker.reset();
        self.schema.clear();
        self.conn.close();
    }

    /// Write statements since the last transaction boundary.
    pub fn writes_in_transaction(&self) -> u64 {
        self.tracker.writes()
    }

    pub fn transaction_state(&self) -> TransactionState {
        self.tracker.state()
    }

    /// Open savepoints, innermost last.
    pub fn savepoints(&self) -> &[String] {
        self.tracker.savepoints()
    }

    pub fn set_auto_commit_on_many_writes(&mut self, enabled: bool) {
        self.tracker.set_auto_commit_on_many_writes(enabled);
    }

    /// Point-lookup cache (hits, misses).
    pub fn cache_stats(&self) -> (u64, u64) {
        self.cache.stats()
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    fn open_transaction(&mut self, read_only: bool) -> Result<()> {
        let read_only = read_only || self.read_only;
        self.conn.execute("BEGIN", &Params::None)?;
        let pragma = if read_only {
            "PRAGMA query_only = ON"
        } else {
            "PRAGMA query_only = OFF"
        };
        self.conn.execute(pragma, &Params::None)?;
        self.tracker.begin(read_only);
        debug!(read_only, "transaction started");
        Ok(())
    }

    /// Runs one statement and shapes its rows.
    ///
    /// `BEGIN`, `COMMIT` and `ROLLBACK` statements are routed to
    /// [`Session::begin`], [`Session::commit`] and [`Session::rollback`] so
    /// hooks and accounting stay consistent. `SAVEPOINT`, `RELEASE` and
    /// `ROLLBACK TO` go through the savepoint methods the same way.
    ///
    /// # Errors
    ///
    /// - `ImplicitCommit` for schema changes or `BEGIN` with writes pending
    /// - `TooManyWrites` when the write ceiling is crossed; the transaction
    ///   has been rolled back by then
    /// - classified backend errors from the connection
    pub fn execute(
        &mut self,
        sql: &str,
        params: impl Into<Params>,
        options: &ExecuteOptions,
    ) -> Result<QueryOutput> {
        let params = params.into();
        let sql = sql.trim();
        self.connect()?;

        let kind = StatementType::from_sql(sql);
        match kind {
            StatementType::Begin => {
                self.begin(false)?;
                return Ok(QueryOutput::Empty);
            }
            StatementType::Commit => {
                self.commit()?;
                return Ok(QueryOutput::Empty);
            }
            StatementType::Rollback => {
                self.rollback(None)?;
                return Ok(QueryOutput::Empty);
            }
            StatementType::Savepoint | StatementType::Release | StatementType::RollbackTo => {
                let name = savepoint_name(sql)
                    .ok_or_else(|| SessionError::Query(format!("no savepoint name in {:?}", sql)))?;
                match kind {
                    StatementType::Savepoint => self.savepoint(&name)?,
                    StatementType::Release => self.release_savepoint(&name)?,
                    _ => self.rollback(Some(name.as_str()))?,
                }
                return Ok(QueryOutput::Empty);
            }
            _ => {}
        }

        match self.tracker.check(sql)? {
            StatementVerdict::Proceed => {}
            StatementVerdict::CommitFirst => {
                self.commit()?;
                self.tracker.note_write();
            }
            StatementVerdict::ExceedsCeiling => {
                let limit = self.tracker.max_writes();
                warn!(limit, "write ceiling exceeded, rolling back");
                self.rollback(None)?;
                return Err(SessionError::TooManyWrites { limit });
            }
        }

        if options.auto_commit {
            self.commit()?;
        }

        let started = Instant::now();
        let raw = match self.conn.execute(sql, &params) {
            Ok(raw) => raw,
            Err(e) if options.ignore_missing && e.is_missing_table_or_column() => {
                debug!("ignoring missing table or column: {}", e);
                return Ok(QueryOutput::Empty);
            }
            Err(e) => return Err(e),
        };
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        if kind.changes_schema() {
            self.schema.clear();
        }

        if options.debug {
            info!(elapsed_ms, rows = raw.rows.len(), "{}", mogrify(sql, &params));
        } else {
            trace!(elapsed_ms, "{}", mogrify(sql, &params));
        }
        if options.explain && kind == StatementType::Select {
            self.explain(sql, &params);
        }

        if options.auto_commit {
            self.commit()?;
        }

        Ok(shape(raw, &options.shape_options()))
    }

    fn explain(&mut self, sql: &str, params: &Params) {
        match self.conn.execute(&format!("EXPLAIN QUERY PLAN {}", sql), params) {
            Ok(plan) => {
                for row in &plan.rows {
                    let detail = row.last().map(|v| v.to_string()).unwrap_or_default();
                    info!(target: "sqlsession::explain", "{}", detail);
                }
            }
            Err(e) => warn!("error in query explain: {}", e),
        }
    }

    /// First column of every row.
    pub fn sql_list(&mut self, sql: &str, params: impl Into<Params>) -> Result<Vec<Value>> {
        let options = ExecuteOptions {
            pluck: true,
            ..ExecuteOptions::default()
        };
        Ok(self.execute(sql, params, &options)?.into_column())
    }

    /// Commits pending work, runs a schema statement, and commits it.
    pub fn sql_ddl(&mut self, sql: &str) -> Result<()> {
        self.commit()?;
        self.execute(sql, Params::None, &ExecuteOptions::default())?;
        self.commit()
    }

    /// Builds the statement `lookup` would run, without running it.
    pub fn build_query(
        &self,
        table: &str,
        filters: &Filters,
        fields: &Fields,
        options: &LookupOptions,
    ) -> Result<QueryDescriptor> {
        self.builder.build(table, filters, fields, &options.query_options())
    }

    /// Selects rows of `table` matching `filters`.
    ///
    /// `Fields::All` always yields mappings. A `NamedKey` lookup with
    /// `options.cache` is served from and stored in the point-lookup cache.
    /// A key list with no usable keys returns `QueryOutput::Empty` without
    /// touching the backend.
    pub fn lookup(
        &mut self,
        table: &str,
        filters: &Filters,
        fields: &Fields,
        options: &LookupOptions,
    ) -> Result<QueryOutput> {
        let execute_options = ExecuteOptions {
            as_dict: options.as_dict || fields.is_all(),
            pluck: options.pluck,
            ignore_missing: options.ignore_missing,
            update: options.update.clone(),
            debug: options.debug,
            ..ExecuteOptions::default()
        };

        let cache_key = match filters.named_key() {
            Some(key) if options.cache => Some(CacheKey::new(
                table,
                key,
                &fields.cache_key(),
                &execute_options.shape_key()?,
            )),
            _ => None,
        };
        if let Some(key) = &cache_key {
            if let Some(hit) = self.cache.get(key) {
                debug!(table, key = %key.key, "point lookup cache hit");
                return Ok(hit);
            }
        }

        let (sql, params, run) = self.build_query(table, filters, fields, options)?.into_parts();
        if !run {
            debug!(table, "lookup has no usable keys, skipping backend");
            return Ok(QueryOutput::Empty);
        }

        let output = self.execute(&sql, params, &execute_options)?;

        if let Some(key) = cache_key {
            self.cache.insert(key, output.clone());
        }
        Ok(output)
    }

    /// Same as [`Session::lookup`].
    pub fn get_values(
        &mut self,
        table: &str,
        filters: &Filters,
        fields: &Fields,
        options: &LookupOptions,
    ) -> Result<QueryOutput> {
        self.lookup(table, filters, fields, options)
    }

    /// First matching row; a single column comes back as a bare scalar
    /// unless `options.as_dict` is set. `None` when nothing matches.
    pub fn get_value(
        &mut self,
        table: &str,
        filters: &Filters,
        fields: &Fields,
        options: &LookupOptions,
    ) -> Result<Option<LookupValue>> {
        let options = LookupOptions {
            limit: Some(1),
            ..options.clone()
        };
        let output = self.lookup(table, filters, fields, &options)?;
        Ok(single(output, options.as_dict))
    }

    /// First matching row as a mapping of every column.
    pub fn get(&mut self, table: &str, filters: &Filters) -> Result<Option<Record>> {
        Ok(self
            .get_value(table, filters, &Fields::All, &LookupOptions::default())?
            .and_then(LookupValue::into_record))
    }

    /// Primary key of the first matching row. A missing table reads as absence.
    pub fn exists(&mut self, table: &str, filters: &Filters) -> Result<Option<Value>> {
        let options = LookupOptions {
            ignore_missing: true,
            ..LookupOptions::unordered()
        };
        let pk = Fields::one(self.builder.primary_key());
        Ok(self
            .get_value(table, filters, &pk, &options)?
            .and_then(LookupValue::into_scalar))
    }

    /// Number of matching rows, or of distinct values of `distinct_on`.
    pub fn count(&mut self, table: &str, filters: &Filters, distinct_on: Option<&str>) -> Result<i64> {
        let field = match distinct_on {
            Some(column) => format!("count(distinct {})", validate_identifier(column)?),
            None => "count(*)".to_string(),
        };
        let value = self.get_value(table, filters, &Fields::one(field), &LookupOptions::unordered())?;
        Ok(value
            .as_ref()
            .and_then(LookupValue::as_scalar)
            .and_then(Value::as_i64)
            .unwrap_or(0))
    }

    /// Begins a new transaction.
    ///
    /// An open transaction without writes is committed silently first.
    /// With `read_only` the backend refuses writes until the next boundary.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::ImplicitCommit` when writes are pending.
    pub fn begin(&mut self, read_only: bool) -> Result<()> {
        if self.conn.connect()? {
            return self.open_transaction(read_only);
        }
        self.tracker.check("BEGIN")?;
        if !self.conn.is_autocommit() {
            self.conn.execute("COMMIT", &Params::None)?;
        }
        self.open_transaction(read_only)
    }

    /// Commits the current transaction and begins the next one.
    ///
    /// Before-commit hooks run first, in registration order; a failing hook
    /// aborts the commit and the transaction stays open. After the new
    /// transaction has begun, the deferred after-commit work runs once.
    /// Both registries are empty afterwards either way.
    pub fn commit(&mut self) -> Result<()> {
        self.before_commit.take().run_all(self)?;

        self.connect()?;
        let writes = self.tracker.writes();
        if !self.conn.is_autocommit() {
            self.conn.execute("COMMIT", &Params::None)?;
        }
        self.open_transaction(false)?;
        self.rollback_observers.clear();
        info!(writes, "transaction committed");

        self.after_commit.take().run_all(self)
    }

    /// Rolls back to `save_point`, or the whole transaction when `None`.
    ///
    /// A savepoint rollback keeps the savepoint open and leaves observers,
    /// hooks and the write counter alone. A full rollback drops pending
    /// hooks, begins a new transaction and then notifies every rollback
    /// observer once.
    pub fn rollback(&mut self, save_point: Option<&str>) -> Result<()> {
        match save_point {
            Some(name) => {
                let sql = format!("ROLLBACK TO SAVEPOINT {}", quote_identifier(name)?);
                self.conn.execute(&sql, &Params::None)?;
                self.tracker.rollback_to_savepoint(name);
                self.schema.clear();
                debug!(savepoint = name, "rolled back to savepoint");
                Ok(())
            }
            None => {
                self.connect()?;
                let discarded = self.tracker.writes();
                if !self.conn.is_autocommit() {
                    self.conn.execute("ROLLBACK", &Params::None)?;
                }
                self.before_commit.clear();
                self.after_commit.clear();
                self.schema.clear();
                self.open_transaction(false)?;
                self.rollback_observers.notify_and_clear();
                info!(discarded_writes = discarded, "transaction rolled back");
                Ok(())
            }
        }
    }

    /// Opens a named savepoint inside the current transaction.
    pub fn savepoint(&mut self, name: &str) -> Result<()> {
        let sql = format!("SAVEPOINT {}", quote_identifier(name)?);
        self.connect()?;
        self.conn.execute(&sql, &Params::None)?;
        self.tracker.push_savepoint(name);
        debug!(savepoint = name, "savepoint created");
        Ok(())
    }

    /// Releases a savepoint, keeping its work in the enclosing transaction.
    pub fn release_savepoint(&mut self, name: &str) -> Result<()> {
        let sql = format!("RELEASE SAVEPOINT {}", quote_identifier(name)?);
        self.conn.execute(&sql, &Params::None)?;
        self.tracker.release_savepoint(name);
        Ok(())
    }

    /// Runs `f` inside a fresh savepoint. On success the savepoint is
    /// released; on failure its work is rolled back and the error returned.
    pub fn with_savepoint<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Session) -> Result<T>,
    {
        let name = new_savepoint_name();
        self.savepoint(&name)?;
        match f(self) {
            Ok(value) => {
                // A commit or full rollback inside `f` already ended the savepoint
                if self.tracker.has_savepoint(&name) {
                    self.release_savepoint(&name)?;
                }
                Ok(value)
            }
            Err(e) => {
                if self.tracker.has_savepoint(&name) {
                    if let Err(cleanup) = self
                        .rollback(Some(name.as_str()))
                        .and_then(|_| self.release_savepoint(&name))
                    {
                        warn!(savepoint = %name, "failed to undo savepoint: {}", cleanup);
                    }
                }
                Err(e)
            }
        }
    }

    /// Registers work to run right before the next commit.
    pub fn register_commit_hook<F>(&mut self, hook: F)
    where
        F: FnOnce(&mut Session) -> Result<()> + Send + 'static,
    {
        self.before_commit.register(hook);
    }

    /// Registers work to run once after the next successful commit.
    /// Dropped by a full rollback.
    pub fn enqueue_after_commit<F>(&mut self, job: F)
    where
        F: FnOnce(&mut Session) -> Result<()> + Send + 'static,
    {
        self.after_commit.register(job);
    }

    /// Hooks waiting for the next commit.
    pub fn pending_commit_hooks(&self) -> usize {
        self.before_commit.len()
    }

    /// Adds an observer told about the next full rollback of this transaction.
    pub fn add_rollback_observer(&mut self, observer: Arc<dyn RollbackObserver>) {
        self.rollback_observers.add(observer);
    }

    /// Names of all tables.
    pub fn get_tables(&mut self) -> Result<Vec<String>> {
        if let Some(tables) = self.schema.tables() {
            return Ok(tables.to_vec());
        }
        self.connect()?;
        let tables = schema::get_tables(&mut self.conn)?;
        self.schema.set_tables(tables.clone());
        Ok(tables)
    }

    pub fn table_exists(&mut self, table: &str) -> Result<bool> {
        Ok(self.get_tables()?.iter().any(|t| t == table))
    }

    /// Column metadata of `table`.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::MissingTable` when the table has no columns.
    pub fn get_table_columns(&mut self, table: &str) -> Result<Vec<Column>> {
        if let Some(columns) = self.schema.columns(table) {
            return Ok(columns.to_vec());
        }
        self.connect()?;
        let columns = schema::get_table_columns(&mut self.conn, table)?;
        if columns.is_empty() {
            return Err(SessionError::MissingTable(table.to_string()));
        }
        self.schema.set_columns(table, columns.clone());
        Ok(columns)
    }

    pub fn has_column(&mut self, table: &str, column: &str) -> Result<bool> {
        Ok(self.get_table_columns(table)?.iter().any(|c| c.name == column))
    }

    /// Declared type of `column`, `None` when the table lacks it.
    pub fn get_column_type(&mut self, table: &str, column: &str) -> Result<Option<String>> {
        Ok(self
            .get_table_columns(table)?
            .into_iter()
            .find(|c| c.name == column)
            .map(|c| c.type_name))
    }

    /// Inserts `rows` in chunks of [`BULK_INSERT_CHUNK_SIZE`], one statement
    /// per chunk. Returns the number of rows sent.
    pub fn bulk_insert(
        &mut self,
        table: &str,
        fields: &[&str],
        rows: &[Vec<Value>],
        ignore_duplicates: bool,
    ) -> Result<usize> {
        self.bulk_insert_in_chunks(table, fields, rows, ignore_duplicates, BULK_INSERT_CHUNK_SIZE)
    }

    pub fn bulk_insert_in_chunks(
        &mut self,
        table: &str,
        fields: &[&str],
        rows: &[Vec<Value>],
        ignore_duplicates: bool,
        chunk_size: usize,
    ) -> Result<usize> {
        if fields.is_empty() {
            return Err(SessionError::Query("bulk insert needs at least one field".to_string()));
        }
        if let Some(bad) = rows.iter().position(|row| row.len() != fields.len()) {
            return Err(SessionError::Query(format!(
                "row {} has {} values for {} fields",
                bad,
                rows[bad].len(),
                fields.len()
            )));
        }

        let columns = fields
            .iter()
            .map(|f| quote_identifier(f))
            .collect::<Result<Vec<_>>>()?
            .join(", ");
        let verb = if ignore_duplicates {
            "INSERT OR IGNORE"
        } else {
            "INSERT"
        };
        let head = format!("{} INTO {} ({}) VALUES ", verb, quote_identifier(table)?, columns);
        let row_placeholders = format!("({})", vec!["?"; fields.len()].join(", "));
        let chunk_size = chunk_size.clamp(1, (MAX_BOUND_PARAMETERS / fields.len()).max(1));

        for chunk in rows.chunks(chunk_size) {
            let sql = format!("{}{}", head, vec![row_placeholders.as_str(); chunk.len()].join(", "));
            let params: Vec<Value> = chunk.iter().flatten().cloned().collect();
            self.execute(&sql, params, &ExecuteOptions::default())?;
        }
        debug!(table, rows = rows.len(), "bulk insert done");
        Ok(rows.len())
    }
}
