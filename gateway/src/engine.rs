use crate::errors::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgPool};
use sqlx::query::Query;
use sqlx::{Postgres, Row};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

/// Opaque handle of one submitted query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExecutionId(String);

impl ExecutionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Succeeded | ExecutionState::Failed | ExecutionState::Cancelled
        )
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExecutionState::Queued => "QUEUED",
            ExecutionState::Running => "RUNNING",
            ExecutionState::Succeeded => "SUCCEEDED",
            ExecutionState::Failed => "FAILED",
            ExecutionState::Cancelled => "CANCELLED",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionStatus {
    pub state: ExecutionState,
    /// Engine-provided explanation of the last state change.
    pub reason: Option<String>,
}

impl ExecutionStatus {
    pub fn new(state: ExecutionState) -> Self {
        Self {
            state,
            reason: None,
        }
    }

    pub fn with_reason(state: ExecutionState, reason: impl Into<String>) -> Self {
        Self {
            state,
            reason: Some(reason.into()),
        }
    }
}

/// Bound value of a parameterized query.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryParam {
    Text(String),
    Timestamp(DateTime<Utc>),
    Integer(i64),
}

/// Query text with `$n` placeholders and the values bound to them.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParameterizedQuery {
    pub sql: String,
    pub params: Vec<QueryParam>,
}

impl ParameterizedQuery {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Adds a value and returns its placeholder.
    pub fn push(&mut self, param: QueryParam) -> String {
        self.params.push(param);
        format!("${}", self.params.len())
    }
}

/// One result row; cells are text, `None` for SQL NULL.
pub type ResultRow = Vec<Option<String>>;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResultPage {
    /// On the first page the first row carries the column names.
    pub rows: Vec<ResultRow>,
    pub next_token: Option<String>,
}

/// Asynchronous analytical query engine.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AnalyticsEngine: Send + Sync {
    async fn submit(&self, query: &ParameterizedQuery) -> Result<ExecutionId>;

    async fn status(&self, execution_id: &ExecutionId) -> Result<ExecutionStatus>;

    async fn results(
        &self,
        execution_id: &ExecutionId,
        page_size: usize,
        next_token: Option<String>,
    ) -> Result<ResultPage>;

    /// Drops any state kept for an execution whose results will not be read.
    async fn forget(&self, execution_id: &ExecutionId) -> Result<()>;
}

#[derive(Debug)]
enum Execution {
    Running,
    Succeeded(Vec<ResultRow>),
    Failed(String),
}

/// Engine running submitted queries against the Postgres telemetry tables.
///
/// Each submission runs on its own task; state is kept in memory until the
/// last result page is read or a failure has been reported.
#[derive(Clone)]
pub struct PgAnalyticsEngine {
    pool: PgPool,
    executions: Arc<RwLock<HashMap<ExecutionId, Execution>>>,
}

impl PgAnalyticsEngine {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            executions: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

fn bind_params<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &'q [QueryParam],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            QueryParam::Text(v) => query.bind(v.as_str()),
            QueryParam::Timestamp(v) => query.bind(*v),
            QueryParam::Integer(v) => query.bind(*v),
        };
    }
    query
}

async fn run_query(pool: &PgPool, query: &ParameterizedQuery) -> Result<Vec<ResultRow>> {
    let rows = bind_params(sqlx::query(&query.sql), &query.params)
        .fetch_all(pool)
        .await?;

    let mut out = Vec::with_capacity(rows.len() + 1);
    match rows.first() {
        Some(first) => {
            out.push(
                first
                    .columns()
                    .iter()
                    .map(|c| Some(sqlx::Column::name(c).to_string()))
                    .collect(),
            );
        }
        None => return Ok(out),
    }

    for row in &rows {
        let mut cells = Vec::with_capacity(row.len());
        for idx in 0..row.len() {
            cells.push(row.try_get::<Option<String>, _>(idx)?);
        }
        out.push(cells);
    }

    Ok(out)
}

#[async_trait]
impl AnalyticsEngine for PgAnalyticsEngine {
    async fn submit(&self, query: &ParameterizedQuery) -> Result<ExecutionId> {
        let execution_id = ExecutionId::new(uuid::Uuid::new_v4().to_string());
        self.executions
            .write()
            .await
            .insert(execution_id.clone(), Execution::Running);

        let pool = self.pool.clone();
        let executions = Arc::clone(&self.executions);
        let query = query.clone();
        let id = execution_id.clone();
        tokio::spawn(async move {
            let outcome = match run_query(&pool, &query).await {
                Ok(rows) => {
                    debug!("Execution {} produced {} rows", id, rows.len());
                    Execution::Succeeded(rows)
                }
                Err(e) => {
                    error!("Execution {} failed: {}", id, e);
                    Execution::Failed(e.to_string())
                }
            };
            // Executions forgotten while running stay forgotten
            match executions.write().await.get_mut(&id) {
                Some(entry) => *entry = outcome,
                None => debug!("Execution {} finished after being forgotten", id),
            }
        });

        info!("Submitted execution {}", execution_id);
        Ok(execution_id)
    }

    async fn status(&self, execution_id: &ExecutionId) -> Result<ExecutionStatus> {
        let mut executions = self.executions.write().await;
        let state = match executions.get(execution_id) {
            Some(Execution::Running) => ExecutionState::Running,
            Some(Execution::Succeeded(_)) => ExecutionState::Succeeded,
            Some(Execution::Failed(_)) => ExecutionState::Failed,
            None => return Err(Error::Engine(format!("Unknown execution {}", execution_id))),
        };

        if state != ExecutionState::Failed {
            return Ok(ExecutionStatus::new(state));
        }

        // A failure is reported once, then forgotten
        match executions.remove(execution_id) {
            Some(Execution::Failed(reason)) => Ok(ExecutionStatus::with_reason(state, reason)),
            _ => Ok(ExecutionStatus::new(state)),
        }
    }

    async fn results(
        &self,
        execution_id: &ExecutionId,
        page_size: usize,
        next_token: Option<String>,
    ) -> Result<ResultPage> {
        let offset = match next_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| Error::Engine(format!("Invalid page token '{}'", token)))?,
            None => 0,
        };

        let mut executions = self.executions.write().await;
        let rows = match executions.get(execution_id) {
            Some(Execution::Succeeded(rows)) => rows,
            Some(_) => {
                return Err(Error::Engine(format!(
                    "Execution {} has no results",
                    execution_id
                )))
            }
            None => return Err(Error::Engine(format!("Unknown execution {}", execution_id))),
        };

        let end = offset.saturating_add(page_size.max(1)).min(rows.len());
        let page: Vec<ResultRow> = rows.get(offset..end).unwrap_or_default().to_vec();
        let next_token = if end < rows.len() {
            Some(end.to_string())
        } else {
            None
        };

        if next_token.is_none() {
            executions.remove(execution_id);
        }

        Ok(ResultPage {
            rows: page,
            next_token,
        })
    }

    async fn forget(&self, execution_id: &ExecutionId) -> Result<()> {
        if self.executions.write().await.remove(execution_id).is_some() {
            debug!("Forgot execution {}", execution_id);
        }
        Ok(())
    }
}
