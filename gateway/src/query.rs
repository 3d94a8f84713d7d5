use crate::authz::AuthorizationEngine;
use crate::catalog::DeviceCatalog;
use crate::engine::{
    AnalyticsEngine, ExecutionId, ExecutionState, ParameterizedQuery, QueryParam, ResultRow,
};
use crate::errors::{Error, Result};
use crate::identity::CallerIdentity;
use crate::metrics::{
    MALFORMED_ROWS_TOTAL, POLL_ATTEMPTS_TOTAL, QUERIES_FAILED_TOTAL, QUERIES_SUBMITTED_TOTAL,
    QUERY_LATENCY_SECONDS, QUERY_TIMEOUTS_TOTAL,
};
use crate::model::{DatasetKey, DeviceTimeSeries, TimeSeriesPoint};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

const TIMESTAMP_COLUMN: &str = "timestamp";
const DEVICE_COLUMN: &str = "device_id";

#[derive(Debug, Clone)]
pub struct QuerySettings {
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
    pub page_size: usize,
    pub max_result_pages: usize,
    pub max_points: i64,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            max_poll_attempts: 30,
            page_size: 1000,
            max_result_pages: 10,
            max_points: 1000,
        }
    }
}

impl QuerySettings {
    /// Every row a series query may return, plus the header row, must fit
    /// in the pages the gateway is allowed to read.
    pub fn validate(&self) -> Result<()> {
        let capacity = self.page_size.saturating_mul(self.max_result_pages);
        let needed = usize::try_from(self.max_points.max(1))
            .unwrap_or(usize::MAX)
            .saturating_add(1);
        if capacity < needed {
            return Err(Error::Validation(format!(
                "{} pages of {} rows cannot hold {} points",
                self.max_result_pages, self.page_size, self.max_points
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SeriesRequest {
    pub farm_id: String,
    pub device_id: String,
    pub dataset_key: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

/// Tabular result of a finished execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<ResultRow>,
}

/// Submits telemetry queries to the analytics engine, polls them to
/// completion and maps the rows into time series the caller may see.
pub struct QueryGateway {
    engine: Arc<dyn AnalyticsEngine>,
    authz: Arc<AuthorizationEngine>,
    catalog: Arc<DeviceCatalog>,
    settings: QuerySettings,
}

impl QueryGateway {
    pub fn new(
        engine: Arc<dyn AnalyticsEngine>,
        authz: Arc<AuthorizationEngine>,
        catalog: Arc<DeviceCatalog>,
        settings: QuerySettings,
    ) -> Self {
        Self {
            engine,
            authz,
            catalog,
            settings,
        }
    }

    #[instrument(skip_all, fields(user_id = %caller.user_id, farm_id = %request.farm_id, device_id = %request.device_id))]
    pub async fn fetch_device_series(
        &self,
        caller: &CallerIdentity,
        request: &SeriesRequest,
        deadline: Option<Instant>,
    ) -> Result<Vec<DeviceTimeSeries>> {
        if request.farm_id.trim().is_empty() || request.device_id.trim().is_empty() {
            return Err(Error::Validation(
                "Farm ID and device ID are required".to_string(),
            ));
        }
        if let (Some(from), Some(to)) = (request.from, request.to) {
            if from > to {
                return Err(Error::Validation(format!(
                    "Range start {} is after range end {}",
                    from.to_rfc3339(),
                    to.to_rfc3339()
                )));
            }
        }

        let empty = || -> Result<Vec<DeviceTimeSeries>> { Ok(vec![empty_series(&request.device_id)]) };

        let visibility = self
            .authz
            .resolve_visibility(
                &caller.user_id,
                caller.role,
                &request.farm_id,
                Some(request.device_id.as_str()),
            )
            .await?;
        if !visibility.allows_device(&request.device_id) {
            return empty();
        }

        let dataset_key = match &request.dataset_key {
            Some(raw) => match raw.parse::<DatasetKey>() {
                Ok(key) => key,
                Err(_) => {
                    debug!(dataset_key = %raw, "Unknown dataset key requested");
                    return empty();
                }
            },
            None => match self.default_dataset(&request.farm_id, &request.device_id).await? {
                Some(key) => key,
                None => return empty(),
            },
        };

        if !visibility.allows_dataset(dataset_key) {
            debug!(dataset_key = %dataset_key, "Dataset not granted, skipping fetch");
            return empty();
        }

        let query = series_query(
            &request.farm_id,
            &request.device_id,
            dataset_key,
            request.from,
            request.to,
            self.settings.max_points,
        );
        let result = self.execute(&query, deadline).await?;
        let points = map_points(&result, &request.device_id, dataset_key);

        Ok(vec![DeviceTimeSeries {
            device_id: request.device_id.clone(),
            points,
        }])
    }

    async fn default_dataset(&self, farm_id: &str, device_id: &str) -> Result<Option<DatasetKey>> {
        Ok(self
            .catalog
            .list_devices(farm_id)
            .await?
            .iter()
            .find(|d| d.id == device_id)
            .and_then(|d| d.device_type.dataset_key()))
    }

    /// Runs one query through submit, poll and fetch. Either every row of the
    /// finished execution is returned or an error, never a partial result.
    pub async fn execute(
        &self,
        query: &ParameterizedQuery,
        deadline: Option<Instant>,
    ) -> Result<QueryResult> {
        let start = Instant::now();

        let execution_id = within(deadline, self.engine.submit(query))
            .await
            .ok_or(Error::QueryTimeout {
                execution_id: None,
                attempts: 0,
            })??;
        QUERIES_SUBMITTED_TOTAL.inc();
        info!("Submitted query execution {}", execution_id);

        let outcome = match self.wait_for_success(&execution_id, deadline).await {
            Ok(attempts) => self.fetch_results(&execution_id, deadline, attempts).await,
            Err(e) => Err(e),
        };
        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                self.abandon(&execution_id).await;
                return Err(e);
            }
        };

        let elapsed = start.elapsed().as_secs_f64();
        QUERY_LATENCY_SECONDS.observe(elapsed);
        debug!(
            "Execution {} returned {} rows in {:.3}s",
            execution_id,
            result.rows.len(),
            elapsed
        );

        Ok(result)
    }

    /// Releases engine-side state of an execution whose results will not be read.
    async fn abandon(&self, execution_id: &ExecutionId) {
        let release = self.engine.forget(execution_id);
        match tokio::time::timeout(self.settings.poll_interval, release).await {
            Ok(Ok(())) => debug!("Released execution {}", execution_id),
            Ok(Err(e)) => warn!("Failed to release execution {}: {}", execution_id, e),
            Err(_) => warn!("Timed out releasing execution {}", execution_id),
        }
    }

    /// Polls until the execution succeeds; returns the number of status checks made.
    async fn wait_for_success(
        &self,
        execution_id: &ExecutionId,
        deadline: Option<Instant>,
    ) -> Result<u32> {
        let max_attempts = self.settings.max_poll_attempts.max(1);
        let mut attempts = 0;

        loop {
            attempts += 1;
            POLL_ATTEMPTS_TOTAL.inc();

            let status = match within(deadline, self.engine.status(execution_id)).await {
                Some(status) => status?,
                None => return Err(timed_out(execution_id, attempts)),
            };
            debug!(
                "Execution {} attempt {}/{}: {}",
                execution_id, attempts, max_attempts, status.state
            );

            match status.state {
                ExecutionState::Succeeded => return Ok(attempts),
                ExecutionState::Failed | ExecutionState::Cancelled => {
                    QUERIES_FAILED_TOTAL.inc();
                    let reason = status.reason.unwrap_or_default();
                    warn!(
                        "Execution {} ended {}: {}",
                        execution_id, status.state, reason
                    );
                    return Err(Error::QueryFailed {
                        execution_id: execution_id.clone(),
                        state: status.state,
                        reason,
                    });
                }
                ExecutionState::Queued | ExecutionState::Running => {}
            }

            if attempts >= max_attempts {
                return Err(timed_out(execution_id, attempts));
            }

            let wake = Instant::now() + self.settings.poll_interval;
            if deadline.is_some_and(|d| wake >= d) {
                return Err(timed_out(execution_id, attempts));
            }
            tokio::time::sleep_until(wake).await;
        }
    }

    async fn fetch_results(
        &self,
        execution_id: &ExecutionId,
        deadline: Option<Instant>,
        attempts: u32,
    ) -> Result<QueryResult> {
        let mut result = QueryResult::default();
        let mut header_seen = false;
        let mut next_token: Option<String> = None;

        for _ in 0..self.settings.max_result_pages.max(1) {
            let page = within(
                deadline,
                self.engine
                    .results(execution_id, self.settings.page_size, next_token.take()),
            )
            .await
            .ok_or_else(|| timed_out(execution_id, attempts))??;

            let mut rows = page.rows.into_iter();
            if !header_seen {
                if let Some(header) = rows.next() {
                    result.columns = header.into_iter().map(Option::unwrap_or_default).collect();
                    header_seen = true;
                }
            }
            result.rows.extend(rows);

            match page.next_token {
                Some(token) => next_token = Some(token),
                None => break,
            }
        }

        if next_token.is_some() {
            warn!(
                "Execution {} has more than {} result pages",
                execution_id, self.settings.max_result_pages
            );
            return Err(Error::Engine(format!(
                "Execution {} returned more than {} result pages",
                execution_id, self.settings.max_result_pages
            )));
        }

        Ok(result)
    }
}

fn timed_out(execution_id: &ExecutionId, attempts: u32) -> Error {
    QUERY_TIMEOUTS_TOTAL.inc();
    warn!(
        "Execution {} timed out after {} status checks",
        execution_id, attempts
    );
    Error::QueryTimeout {
        execution_id: Some(execution_id.clone()),
        attempts,
    }
}

/// Awaits `fut`, giving up at `deadline`.
async fn within<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut).await.ok(),
        None => Some(fut.await),
    }
}

fn empty_series(device_id: &str) -> DeviceTimeSeries {
    DeviceTimeSeries {
        device_id: device_id.to_string(),
        points: Vec::new(),
    }
}

/// Builds the series query. Identifiers and bounds are bound parameters; the
/// metric column comes from the closed [`DatasetKey`] set.
pub fn series_query(
    farm_id: &str,
    device_id: &str,
    dataset_key: DatasetKey,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    limit: i64,
) -> ParameterizedQuery {
    let column = dataset_key.column();
    let mut query = ParameterizedQuery::default();

    let mut conditions = vec![
        format!(
            "farm_id = {}",
            query.push(QueryParam::Text(farm_id.to_string()))
        ),
        format!(
            "{} = {}",
            DEVICE_COLUMN,
            query.push(QueryParam::Text(device_id.to_string()))
        ),
    ];
    if let Some(from) = from {
        conditions.push(format!("ts >= {}", query.push(QueryParam::Timestamp(from))));
    }
    if let Some(to) = to {
        conditions.push(format!("ts <= {}", query.push(QueryParam::Timestamp(to))));
    }
    conditions.push(format!("{} IS NOT NULL", column));
    let limit = query.push(QueryParam::Integer(limit.max(1)));

    query.sql = format!(
        "SELECT {device}, \
         to_char(ts AT TIME ZONE 'UTC', 'YYYY-MM-DD\"T\"HH24:MI:SS.MS\"Z\"') AS \"{ts}\", \
         {column}::text AS {column} \
         FROM telemetry \
         WHERE {conditions} \
         ORDER BY ts ASC, {device} ASC \
         LIMIT {limit}",
        device = DEVICE_COLUMN,
        ts = TIMESTAMP_COLUMN,
        column = column,
        conditions = conditions.join(" AND "),
        limit = limit,
    );
    query
}

/// Maps result rows to points for `device_id`. Rows for other devices are
/// dropped; rows without a parseable timestamp and value are skipped.
pub fn map_points(
    result: &QueryResult,
    device_id: &str,
    dataset_key: DatasetKey,
) -> Vec<TimeSeriesPoint> {
    let position = |name: &str| result.columns.iter().position(|c| c == name);
    let (ts_idx, value_idx) = match (position(TIMESTAMP_COLUMN), position(dataset_key.column())) {
        (Some(ts), Some(value)) => (ts, value),
        _ => {
            warn!(
                "Result columns {:?} lack {} or {}",
                result.columns,
                TIMESTAMP_COLUMN,
                dataset_key.column()
            );
            MALFORMED_ROWS_TOTAL.inc_by(result.rows.len() as f64);
            return Vec::new();
        }
    };
    let device_idx = position(DEVICE_COLUMN);

    let mut skipped = 0usize;
    let mut points: Vec<TimeSeriesPoint> = result
        .rows
        .iter()
        .filter(|row| device_idx.map_or(true, |idx| cell(row, idx) == Some(device_id)))
        .filter_map(|row| {
            let timestamp = cell(row, ts_idx).and_then(parse_timestamp);
            let value = cell(row, value_idx).and_then(parse_value);
            match (timestamp, value) {
                (Some(timestamp), Some(value)) => Some(TimeSeriesPoint { timestamp, value }),
                _ => {
                    skipped += 1;
                    None
                }
            }
        })
        .collect();

    if skipped > 0 {
        MALFORMED_ROWS_TOTAL.inc_by(skipped as f64);
        info!("Skipped {} malformed rows for device {}", skipped, device_id);
    }

    points.sort_by_key(|p| p.timestamp);
    points
}

fn cell(row: &ResultRow, idx: usize) -> Option<&str> {
    row.get(idx).and_then(|c| c.as_deref())
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
                .ok()
                .map(|ts| ts.and_utc())
        })
}

fn parse_value(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}
