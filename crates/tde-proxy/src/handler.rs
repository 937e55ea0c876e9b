//! Connection handler for the Postgres wire protocol proxy.
//!
//! Each client connection gets a [`PasswordStartupHandler`] and a
//! [`TdeQueryHandler`] sharing one [`SessionContext`]. Queries are rewritten
//! by the [`QueryPipeline`], executed on a dedicated upstream connection, and
//! the result rows are join-filtered and decrypted before they are encoded.

use crate::error::ProxyError;
use async_trait::async_trait;
use futures::Sink;
use futures::sink::SinkExt;
use futures::stream;
use pgwire::api::auth::{
    DefaultServerParameterProvider, StartupHandler, finish_authentication, protocol_negotiation,
    save_startup_parameters_to_metadata,
};
use pgwire::api::query::SimpleQueryHandler;
use pgwire::api::results::{DataRowEncoder, FieldFormat, FieldInfo, QueryResponse, Response, Tag};
use pgwire::api::{
    ClientInfo, ClientPortalStore, PgWireConnectionState, PgWireServerHandlers, Type,
};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::startup::Authentication;
use pgwire::messages::{PgWireBackendMessage, PgWireFrontendMessage};
use sqlx::Column as SqlxColumn;
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgRow;
use sqlx::{Connection, PgPool, Postgres, Row as SqlxRow, TypeInfo};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;
use tde_sql::{QueryPipeline, RewrittenStatement, Row, StatementKind};
use tokio::sync::{Mutex, RwLock};

/// Session state for a connected client.
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// User name from the startup message.
    pub user: Option<String>,
    /// Client address.
    pub client_addr: Option<String>,
    /// Connection ID.
    pub connection_id: String,
    /// Whether the password exchange succeeded.
    pub authenticated: bool,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self {
            user: None,
            client_addr: None,
            connection_id: uuid::Uuid::new_v4().to_string(),
            authenticated: false,
        }
    }
}

/// Whether `given` is accepted against the configured password.
pub fn password_matches(expected: Option<&str>, given: &str) -> bool {
    match expected {
        Some(expected) => expected == given,
        None => true,
    }
}

/// Cleartext password authentication against the proxy's configured password.
pub struct PasswordStartupHandler {
    password: Option<Arc<String>>,
    session: Arc<RwLock<SessionContext>>,
    parameter_provider: DefaultServerParameterProvider,
}

impl PasswordStartupHandler {
    pub fn new(password: Option<Arc<String>>, session: Arc<RwLock<SessionContext>>) -> Self {
        Self {
            password,
            session,
            parameter_provider: DefaultServerParameterProvider::default(),
        }
    }
}

#[async_trait]
impl StartupHandler for PasswordStartupHandler {
    async fn on_startup<C>(
        &self,
        client: &mut C,
        message: PgWireFrontendMessage,
    ) -> PgWireResult<()>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<<C as Sink<PgWireBackendMessage>>::Error>,
    {
        match message {
            PgWireFrontendMessage::Startup(ref startup) => {
                protocol_negotiation(client, startup).await?;
                save_startup_parameters_to_metadata(client, startup);
                client.set_state(PgWireConnectionState::AuthenticationInProgress);
                client
                    .send(PgWireBackendMessage::Authentication(
                        Authentication::CleartextPassword,
                    ))
                    .await?;
            }
            PgWireFrontendMessage::PasswordMessageFamily(pwd) => {
                let password_msg = pwd.into_password()?;
                let user = client
                    .metadata()
                    .get("user")
                    .cloned()
                    .unwrap_or_else(|| "unknown".to_string());

                let expected = self.password.as_deref().map(String::as_str);
                if !password_matches(expected, &password_msg.password) {
                    tracing::warn!(user = %user, "Password authentication failed");
                    return Err(PgWireError::InvalidPassword(user));
                }

                {
                    let mut session = self.session.write().await;
                    session.user = Some(user.clone());
                    session.client_addr = Some(client.socket_addr().to_string());
                    session.authenticated = true;
                }
                tracing::info!(user = %user, "Client authenticated");

                finish_authentication(client, &self.parameter_provider).await?;
            }
            _ => {}
        }
        Ok(())
    }
}

// ============================================================================
// Query Handler Implementation
// ============================================================================

/// Rewrites client queries, runs them upstream and decrypts the results.
pub struct TdeQueryHandler {
    pipeline: Arc<QueryPipeline>,
    pool: PgPool,
    /// Upstream connection pinned to this client for session state
    /// (`SET`, transactions). Acquired on first use.
    connection: Mutex<Option<PoolConnection<Postgres>>>,
    session: Arc<RwLock<SessionContext>>,
}

impl TdeQueryHandler {
    pub fn new(
        pipeline: Arc<QueryPipeline>,
        pool: PgPool,
        session: Arc<RwLock<SessionContext>>,
    ) -> Self {
        Self {
            pipeline,
            pool,
            connection: Mutex::new(None),
            session,
        }
    }

    /// Get the current session context.
    pub async fn get_session(&self) -> SessionContext {
        self.session.read().await.clone()
    }

    /// Rewrite, execute and post-process one statement.
    async fn process_query(&self, sql: &str) -> Result<QueryResult, ProxyError> {
        let start = Instant::now();
        let session = self.get_session().await;

        let rewritten = self.pipeline.process(sql)?;
        let mut result = self.execute_upstream(&rewritten).await?;

        if rewritten.kind == StatementKind::Select {
            let fetched = result.rows.len();
            result.rows = self.pipeline.finish(&rewritten, result.rows)?;
            result.row_count = result.rows.len();
            result.command_tag = format!("SELECT {}", result.row_count);
            if result.columns.is_empty() {
                result.columns = fallback_columns(&rewritten);
            }
            for (column, output) in result.columns.iter_mut().zip(&rewritten.output_columns) {
                if output.is_encrypted() {
                    column.type_oid = TEXT_OID;
                }
            }
            tracing::debug!(
                fetched,
                returned = result.row_count,
                "Post-processed result rows"
            );
        }

        tracing::debug!(
            connection_id = %session.connection_id,
            kind = ?rewritten.kind,
            duration_ms = start.elapsed().as_millis() as u64,
            rows = result.row_count,
            "Query completed"
        );
        Ok(result)
    }

    /// Execute a rewritten statement on this client's upstream connection.
    async fn execute_upstream(
        &self,
        statement: &RewrittenStatement,
    ) -> Result<QueryResult, ProxyError> {
        let mut slot = self.connection.lock().await;
        if slot.is_none() {
            let conn = self
                .pool
                .acquire()
                .await
                .map_err(|e| ProxyError::UpstreamConnectionFailed(e.to_string()))?;
            *slot = Some(conn);
        }
        let conn = slot.as_mut().ok_or_else(|| {
            ProxyError::UpstreamConnectionFailed("no upstream connection".to_string())
        })?;

        // Simple-protocol results arrive in text format for every column type.
        let sql = statement.sql.as_str();
        if returns_rows(statement.kind, sql) {
            let rows = sqlx::Executor::fetch_all(&mut **conn, sqlx::raw_sql(sql))
                .await
                .map_err(|e| ProxyError::UpstreamQueryFailed(e.to_string()))?;

            let columns: Vec<ColumnInfo> = match rows.first() {
                Some(first) => first
                    .columns()
                    .iter()
                    .map(|c| ColumnInfo {
                        name: SqlxColumn::name(c).to_string(),
                        type_oid: pg_type_to_oid(SqlxColumn::type_info(c).name()),
                    })
                    .collect(),
                None => Vec::new(),
            };
            let data = rows.iter().map(row_to_text).collect::<Result<Vec<Row>, _>>()?;

            Ok(QueryResult {
                columns,
                row_count: data.len(),
                command_tag: format!("SELECT {}", data.len()),
                rows: data,
            })
        } else {
            let result = sqlx::Executor::execute(&mut **conn, sqlx::raw_sql(sql))
                .await
                .map_err(|e| ProxyError::UpstreamQueryFailed(e.to_string()))?;

            let affected = result.rows_affected() as usize;
            Ok(QueryResult {
                columns: Vec::new(),
                rows: Vec::new(),
                row_count: affected,
                command_tag: command_tag(statement.kind, sql, affected),
            })
        }
    }
}

impl Drop for TdeQueryHandler {
    /// Close the upstream connection instead of returning it to the pool, so
    /// `SET`s and open transactions end with the client session.
    fn drop(&mut self) {
        let Some(conn) = self.connection.get_mut().take() else {
            return;
        };
        let conn = conn.detach();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = conn.close().await {
                        tracing::debug!(error = %e, "Upstream connection closed uncleanly");
                    }
                });
            }
            Err(_) => drop(conn),
        }
    }
}

fn returns_rows(kind: StatementKind, sql: &str) -> bool {
    match kind {
        StatementKind::Select => true,
        StatementKind::Utility => first_keyword(sql) == "SHOW",
        StatementKind::Insert | StatementKind::Update => false,
    }
}

fn first_keyword(sql: &str) -> String {
    sql.split_whitespace()
        .next()
        .unwrap_or_default()
        .trim_end_matches(';')
        .to_uppercase()
}

/// Command completion tag for statements without a result set.
pub fn command_tag(kind: StatementKind, sql: &str, affected: usize) -> String {
    match kind {
        StatementKind::Insert => format!("INSERT 0 {affected}"),
        StatementKind::Update => format!("UPDATE {affected}"),
        StatementKind::Select => format!("SELECT {affected}"),
        StatementKind::Utility => match first_keyword(sql).as_str() {
            "START" => "BEGIN".to_string(),
            "END" => "COMMIT".to_string(),
            "ABORT" => "ROLLBACK".to_string(),
            "" => "OK".to_string(),
            keyword => keyword.to_string(),
        },
    }
}

/// Text form of every cell, as sent by the server. SQL NULL stays `None`.
fn row_to_text(row: &PgRow) -> Result<Row, ProxyError> {
    (0..row.len())
        .map(|i| {
            row.try_get_unchecked::<Option<String>, _>(i)
                .map_err(|e| ProxyError::UnreadableValue {
                    column: SqlxColumn::name(&row.columns()[i]).to_string(),
                    reason: e.to_string(),
                })
        })
        .collect()
}

/// Column headers for an empty SELECT result.
fn fallback_columns(statement: &RewrittenStatement) -> Vec<ColumnInfo> {
    statement
        .output_columns
        .iter()
        .map(|c| ColumnInfo {
            name: c.name.clone(),
            type_oid: TEXT_OID,
        })
        .collect()
}

/// Result of a query execution.
#[derive(Debug, Clone)]
pub struct QueryResult {
    /// Column information.
    pub columns: Vec<ColumnInfo>,
    /// Row data as strings.
    pub rows: Vec<Row>,
    /// Number of rows affected/returned.
    pub row_count: usize,
    /// Command completion tag.
    pub command_tag: String,
}

/// Column information.
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,
    /// PostgreSQL type OID.
    pub type_oid: u32,
}

const TEXT_OID: u32 = 25;

/// Map type name to PostgreSQL type OID. Unknown types are reported as text.
fn pg_type_to_oid(type_name: &str) -> u32 {
    match type_name.to_uppercase().as_str() {
        "BOOL" => 16,
        "BYTEA" => 17,
        "CHAR" => 18,
        "NAME" => 19,
        "INT8" => 20,
        "INT2" => 21,
        "INT4" => 23,
        "TEXT" => TEXT_OID,
        "OID" => 26,
        "JSON" => 114,
        "FLOAT4" => 700,
        "FLOAT8" => 701,
        "BPCHAR" => 1042,
        "VARCHAR" => 1043,
        "DATE" => 1082,
        "TIME" => 1083,
        "TIMESTAMP" => 1114,
        "TIMESTAMPTZ" => 1184,
        "INTERVAL" => 1186,
        "NUMERIC" => 1700,
        "UUID" => 2950,
        "JSONB" => 3802,
        _ => TEXT_OID,
    }
}

/// Wire type announced for a result column.
fn field_type(column: &ColumnInfo) -> Type {
    Type::from_oid(column.type_oid).unwrap_or(Type::TEXT)
}

fn user_error(message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".to_owned(),
        "XX000".to_owned(),
        message,
    )))
}

fn into_response(result: QueryResult) -> PgWireResult<Response> {
    if result.columns.is_empty() {
        let tag = Tag::new(&result.command_tag);
        return Ok(match result.command_tag.as_str() {
            "BEGIN" => Response::TransactionStart(tag),
            "COMMIT" | "ROLLBACK" => Response::TransactionEnd(tag),
            _ => Response::Execution(tag),
        });
    }

    let fields: Vec<FieldInfo> = result
        .columns
        .iter()
        .map(|c| FieldInfo::new(c.name.clone(), None, None, field_type(c), FieldFormat::Text))
        .collect();
    let schema = Arc::new(fields);

    let rows: Vec<PgWireResult<pgwire::messages::data::DataRow>> = result
        .rows
        .into_iter()
        .map(|row| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            for value in row {
                encoder.encode_field(&value)?;
            }
            Ok(encoder.take_row())
        })
        .collect();

    Ok(Response::Query(QueryResponse::new(
        schema,
        stream::iter(rows),
    )))
}

#[async_trait]
impl SimpleQueryHandler for TdeQueryHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<<C as Sink<PgWireBackendMessage>>::Error>,
    {
        if query.trim().trim_end_matches(';').trim().is_empty() {
            return Ok(vec![Response::EmptyQuery]);
        }

        match self.process_query(query).await {
            Ok(result) => Ok(vec![into_response(result)?]),
            Err(e) => {
                tracing::debug!(error = %e, "Query failed");
                Err(user_error(e.to_string()))
            }
        }
    }
}

/// Server handlers implementation for pgwire 0.37.
pub struct TdeServerHandlers {
    query_handler: Arc<TdeQueryHandler>,
    startup_handler: Arc<PasswordStartupHandler>,
}

impl TdeServerHandlers {
    pub fn new(
        query_handler: Arc<TdeQueryHandler>,
        startup_handler: Arc<PasswordStartupHandler>,
    ) -> Self {
        Self {
            query_handler,
            startup_handler,
        }
    }
}

impl PgWireServerHandlers for TdeServerHandlers {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.query_handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.startup_handler.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pg_type_to_oid() {
        assert_eq!(pg_type_to_oid("INT4"), 23);
        assert_eq!(pg_type_to_oid("bytea"), 17);
        assert_eq!(pg_type_to_oid("UUID"), 2950);
        assert_eq!(pg_type_to_oid("something_else"), 25);
    }

    #[test]
    fn test_field_types_follow_upstream() {
        let column = |oid: u32| ColumnInfo {
            name: "c".to_string(),
            type_oid: oid,
        };
        assert_eq!(field_type(&column(pg_type_to_oid("int4"))), Type::INT4);
        assert_eq!(field_type(&column(pg_type_to_oid("NUMERIC"))), Type::NUMERIC);
        assert_eq!(field_type(&column(TEXT_OID)), Type::TEXT);
        assert_eq!(field_type(&column(999_999)), Type::TEXT);
    }

    #[test]
    fn test_session_context_default() {
        let session = SessionContext::default();
        assert!(session.user.is_none());
        assert!(!session.authenticated);
        assert!(!session.connection_id.is_empty());
    }

    #[test]
    fn test_password_matches() {
        assert!(password_matches(None, "anything"));
        assert!(password_matches(Some("secret"), "secret"));
        assert!(!password_matches(Some("secret"), "Secret"));
        assert!(!password_matches(Some("secret"), ""));
    }

    #[test]
    fn test_command_tags() {
        assert_eq!(command_tag(StatementKind::Insert, "INSERT ...", 3), "INSERT 0 3");
        assert_eq!(command_tag(StatementKind::Update, "UPDATE ...", 1), "UPDATE 1");
        assert_eq!(command_tag(StatementKind::Utility, "begin;", 0), "BEGIN");
        assert_eq!(
            command_tag(StatementKind::Utility, "START TRANSACTION", 0),
            "BEGIN"
        );
        assert_eq!(command_tag(StatementKind::Utility, "set x = 1", 0), "SET");
        assert_eq!(command_tag(StatementKind::Utility, "rollback", 0), "ROLLBACK");
    }

    #[test]
    fn test_returns_rows() {
        assert!(returns_rows(StatementKind::Select, "SELECT 1"));
        assert!(returns_rows(StatementKind::Utility, "show search_path"));
        assert!(!returns_rows(StatementKind::Utility, "SET search_path TO x"));
        assert!(!returns_rows(StatementKind::Insert, "INSERT INTO t VALUES (1)"));
    }

    #[test]
    fn test_execution_responses() {
        let result = |tag: &str| QueryResult {
            columns: Vec::new(),
            rows: Vec::new(),
            row_count: 0,
            command_tag: tag.to_string(),
        };
        assert!(matches!(
            into_response(result("BEGIN")).unwrap(),
            Response::TransactionStart(_)
        ));
        assert!(matches!(
            into_response(result("COMMIT")).unwrap(),
            Response::TransactionEnd(_)
        ));
        assert!(matches!(
            into_response(result("UPDATE 2")).unwrap(),
            Response::Execution(_)
        ));
    }

    mod upstream {
        //! Runs against a live server when `TDE_TEST_DATABASE_URL` is set.

        use super::*;
        use sqlx::postgres::PgPoolOptions;
        use tde_core::ColumnCatalog;
        use tde_crypto::{KeyedCodec, MasterKey};

        async fn handler() -> Option<(TdeQueryHandler, PgPool)> {
            let url = std::env::var("TDE_TEST_DATABASE_URL").ok()?;
            let pool = PgPoolOptions::new()
                .max_connections(1)
                .connect(&url)
                .await
                .unwrap();
            Some((handler_on(&pool), pool))
        }

        fn handler_on(pool: &PgPool) -> TdeQueryHandler {
            let codec = KeyedCodec::new(MasterKey::generate(), 2).unwrap();
            let pipeline = QueryPipeline::new(Arc::new(ColumnCatalog::empty()), Arc::new(codec));
            TdeQueryHandler::new(
                Arc::new(pipeline),
                pool.clone(),
                Arc::new(RwLock::new(SessionContext::default())),
            )
        }

        #[tokio::test]
        async fn test_values_keep_their_text_and_type() {
            let Some((handler, _pool)) = handler().await else {
                return;
            };
            let result = handler
                .process_query(
                    "SELECT 1.50::numeric AS n, DATE '2024-02-29' AS d, NULL::text AS z, 7 AS i",
                )
                .await
                .unwrap();

            assert_eq!(
                result.rows,
                vec![vec![
                    Some("1.50".to_string()),
                    Some("2024-02-29".to_string()),
                    None,
                    Some("7".to_string()),
                ]]
            );
            let types: Vec<Type> = result.columns.iter().map(field_type).collect();
            assert_eq!(types, vec![Type::NUMERIC, Type::DATE, Type::TEXT, Type::INT4]);
        }

        #[tokio::test]
        async fn test_session_state_ends_with_client() {
            let Some((first, pool)) = handler().await else {
                return;
            };
            first
                .process_query("SET application_name = 'tde_first_client'")
                .await
                .unwrap();
            first.process_query("BEGIN").await.unwrap();
            drop(first);

            let second = handler_on(&pool);
            let result = second.process_query("SHOW application_name").await.unwrap();
            assert_ne!(result.rows[0][0].as_deref(), Some("tde_first_client"));
            // Inside a leftover transaction now() would predate this statement.
            let result = second
                .process_query("SELECT now() = statement_timestamp() AS fresh")
                .await
                .unwrap();
            assert_eq!(result.rows[0][0].as_deref(), Some("t"));
        }
    }
}
