//! Aggregation query executor boundary: trait contract plus the SQL-backed
//! implementation that computes monthly indicator statistics.

use std::collections::BTreeMap;

use async_trait::async_trait;
use hemodash_core::{
    sort_rows, AggregationRow, IndicatorKey, IndicatorValue, MetricValue, RankedEntry,
    ReportWindow,
};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "hemodash-query";

#[derive(Debug, Error)]
pub enum QueryError {
    /// Connection-class failure; a later retry of the whole run may succeed.
    #[error("transient data-source failure: {0}")]
    Transient(String),
    /// Permanent data error for this indicator and window.
    #[error("{0}")]
    Data(String),
}

/// Pure function of (indicator, window) → monthly rows. Rows come back
/// sorted ascending by (year, month) regardless of backend ordering.
#[async_trait]
pub trait IndicatorExecutor: Send + Sync {
    async fn fetch(
        &self,
        key: &IndicatorKey,
        window: &ReportWindow,
    ) -> Result<Vec<AggregationRow>, QueryError>;
}

/// Stand-in executor for deployments without a configured data source.
/// Every fetch fails transiently, so reports render the per-indicator
/// unavailable placeholder instead of crashing.
#[derive(Debug, Default)]
pub struct NullExecutor;

#[async_trait]
impl IndicatorExecutor for NullExecutor {
    async fn fetch(
        &self,
        _key: &IndicatorKey,
        _window: &ReportWindow,
    ) -> Result<Vec<AggregationRow>, QueryError> {
        Err(QueryError::Transient(
            "no aggregation data source configured".to_string(),
        ))
    }
}

enum IndicatorQuery {
    Scalar(&'static str),
    ScalarText(&'static str),
    Dual(&'static str),
    Ranked(&'static str),
}

pub struct SqlIndicatorExecutor {
    pool: PgPool,
}

impl SqlIndicatorExecutor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, QueryError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(classify_sqlx_error)?;
        Ok(Self { pool })
    }

    async fn fetch_scalar(
        &self,
        sql: &str,
        window: &ReportWindow,
        textual: bool,
    ) -> Result<Vec<AggregationRow>, QueryError> {
        let rows = sqlx::query(sql)
            .bind(window.start)
            .bind(window.end)
            .fetch_all(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let value = if textual {
                MetricValue::Text(try_get(&row, "value")?)
            } else {
                MetricValue::Number(try_get::<f64>(&row, "value")?)
            };
            out.push(AggregationRow {
                year: try_get(&row, "year")?,
                month: try_get::<i32>(&row, "month")? as u32,
                value: IndicatorValue::Scalar(value),
            });
        }
        sort_rows(&mut out);
        Ok(out)
    }

    async fn fetch_dual(
        &self,
        sql: &str,
        window: &ReportWindow,
    ) -> Result<Vec<AggregationRow>, QueryError> {
        let rows = sqlx::query(sql)
            .bind(window.start)
            .bind(window.end)
            .fetch_all(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(AggregationRow {
                year: try_get(&row, "year")?,
                month: try_get::<i32>(&row, "month")? as u32,
                value: IndicatorValue::Dual {
                    first: try_get(&row, "first_value")?,
                    second: try_get(&row, "second_value")?,
                },
            });
        }
        sort_rows(&mut out);
        Ok(out)
    }

    async fn fetch_ranked(
        &self,
        sql: &str,
        window: &ReportWindow,
    ) -> Result<Vec<AggregationRow>, QueryError> {
        let rows = sqlx::query(sql)
            .bind(window.start)
            .bind(window.end)
            .fetch_all(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;

        let mut periods: BTreeMap<(i32, u32), Vec<RankedEntry>> = BTreeMap::new();
        for row in rows {
            let year: i32 = try_get(&row, "year")?;
            let month = try_get::<i32>(&row, "month")? as u32;
            periods.entry((year, month)).or_default().push(RankedEntry {
                rank: try_get::<i32>(&row, "rank")? as u32,
                label: try_get(&row, "label")?,
                detail: row.try_get("detail").ok(),
                frequency: try_get(&row, "frequency")?,
                percent: try_get(&row, "percent")?,
            });
        }

        let mut out: Vec<AggregationRow> = periods
            .into_iter()
            .map(|((year, month), mut entries)| {
                entries.sort_by_key(|e| e.rank);
                AggregationRow {
                    year,
                    month,
                    value: IndicatorValue::Ranked(entries),
                }
            })
            .collect();
        sort_rows(&mut out);
        Ok(out)
    }
}

#[async_trait]
impl IndicatorExecutor for SqlIndicatorExecutor {
    async fn fetch(
        &self,
        key: &IndicatorKey,
        window: &ReportWindow,
    ) -> Result<Vec<AggregationRow>, QueryError> {
        let Some(query) = query_for(key.as_str()) else {
            warn!(key = %key, "no query registered for indicator");
            return Err(QueryError::Data(format!("unknown indicator {key}")));
        };
        match query {
            IndicatorQuery::Scalar(sql) => self.fetch_scalar(sql, window, false).await,
            IndicatorQuery::ScalarText(sql) => self.fetch_scalar(sql, window, true).await,
            IndicatorQuery::Dual(sql) => self.fetch_dual(sql, window).await,
            IndicatorQuery::Ranked(sql) => self.fetch_ranked(sql, window).await,
        }
    }
}

fn try_get<'r, T>(row: &'r sqlx::postgres::PgRow, column: &str) -> Result<T, QueryError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column)
        .map_err(|err| QueryError::Data(format!("decoding column {column}: {err}")))
}

fn classify_sqlx_error(err: sqlx::Error) -> QueryError {
    match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed => QueryError::Transient(err.to_string()),
        _ => QueryError::Data(err.to_string()),
    }
}

/// Per-indicator aggregation SQL. All queries take the window as
/// `($1, $2)` = `[start, end)` and bucket by calendar month.
fn query_for(key: &str) -> Option<IndicatorQuery> {
    let query = match key {
        "apheresis_donations" => IndicatorQuery::Scalar(
            r#"
            SELECT EXTRACT(YEAR FROM start_time)::int AS year,
                   EXTRACT(MONTH FROM start_time)::int AS month,
                   COUNT(*)::float8 AS value
              FROM apheresis_procedures
             WHERE start_time >= $1 AND start_time < $2
             GROUP BY 1, 2
             ORDER BY 1, 2
            "#,
        ),
        "whole_blood_donations" => IndicatorQuery::Scalar(
            r#"
            SELECT EXTRACT(YEAR FROM start_date)::int AS year,
                   EXTRACT(MONTH FROM start_date)::int AS month,
                   COUNT(donation_id)::float8 AS value
              FROM wb_runs
             WHERE donation_id IS NOT NULL
               AND start_date >= $1 AND start_date < $2
             GROUP BY 1, 2
             ORDER BY 1, 2
            "#,
        ),
        "components_produced" => IndicatorQuery::Scalar(
            r#"
            SELECT year, month, SUM(produced)::float8 AS value
              FROM (
                    SELECT EXTRACT(YEAR FROM start_time)::int AS year,
                           EXTRACT(MONTH FROM start_time)::int AS month,
                           COUNT(*) AS produced
                      FROM apheresis_procedures
                     WHERE start_time >= $1 AND start_time < $2
                       AND (procedure_type ILIKE '%PLT%'
                            OR procedure_type ILIKE '%RBC%'
                            OR procedure_type ILIKE '%PLASMA%')
                     GROUP BY 1, 2
                    UNION ALL
                    SELECT EXTRACT(YEAR FROM r.start_date)::int,
                           EXTRACT(MONTH FROM r.start_date)::int,
                           SUM((p.platelet_volume > 1)::int
                               + (p.rbc_postfilter_volume > 1)::int
                               + (p.plasma_volume > 1)::int)
                      FROM wb_blood_products p
                      JOIN wb_runs r ON r.id = p.run_id
                     WHERE r.start_date >= $1 AND r.start_date < $2
                     GROUP BY 1, 2
                   ) combined
             GROUP BY year, month
             ORDER BY year, month
            "#,
        ),
        "staff_productivity" => IndicatorQuery::Scalar(
            r#"
            SELECT EXTRACT(YEAR FROM $2)::int AS year,
                   EXTRACT(MONTH FROM $2)::int AS month,
                   COUNT(DISTINCT operator_id)::float8 AS value
              FROM (
                    SELECT operator_id
                      FROM apheresis_procedures
                     WHERE start_time >= $1 AND start_time < $2
                       AND operator_id IS NOT NULL
                    UNION ALL
                    SELECT operator_id
                      FROM wb_runs
                     WHERE start_date >= $1 AND start_date < $2
                       AND operator_id IS NOT NULL
                   ) active
            "#,
        ),
        "platelet_offered_vs_collected" => IndicatorQuery::ScalarText(
            r#"
            SELECT EXTRACT(YEAR FROM start_time)::int AS year,
                   EXTRACT(MONTH FROM start_time)::int AS month,
                   ROUND(SUM(CASE WHEN yield >= 3 AND yield < 6 THEN 1
                                  WHEN yield >= 6 AND yield < 9 THEN 2
                                  WHEN yield >= 9 AND yield <= 12 THEN 3
                                  ELSE 0 END) * 100.0
                         / NULLIF(SUM(CASE WHEN offered_yield >= 3 AND offered_yield < 6 THEN 1
                                           WHEN offered_yield >= 6 AND offered_yield < 9 THEN 2
                                           WHEN offered_yield >= 9 AND offered_yield <= 12 THEN 3
                                           ELSE 0 END), 0))::int::text || '%' AS value
              FROM apheresis_procedures
             WHERE start_time >= $1 AND start_time < $2
             GROUP BY 1, 2
             ORDER BY 1, 2
            "#,
        ),
        "platelet_pre_count" => IndicatorQuery::Scalar(
            r#"
            SELECT EXTRACT(YEAR FROM start_time)::int AS year,
                   EXTRACT(MONTH FROM start_time)::int AS month,
                   ROUND(AVG(donor_pre_count))::float8 AS value
              FROM apheresis_procedures
             WHERE start_time >= $1 AND start_time < $2
             GROUP BY 1, 2
             ORDER BY 1, 2
            "#,
        ),
        "donor_ht_hb" => IndicatorQuery::Dual(
            r#"
            SELECT EXTRACT(YEAR FROM start_time)::int AS year,
                   EXTRACT(MONTH FROM start_time)::int AS month,
                   ROUND(AVG(donor_hematocrit)::numeric, 1)::float8 AS first_value,
                   ROUND(AVG(donor_hemoglobin)::numeric, 1)::float8 AS second_value
              FROM apheresis_procedures
             WHERE start_time >= $1 AND start_time < $2
             GROUP BY 1, 2
             ORDER BY 1, 2
            "#,
        ),
        "procedure_duration" => IndicatorQuery::Scalar(
            r#"
            SELECT EXTRACT(YEAR FROM start_time)::int AS year,
                   EXTRACT(MONTH FROM start_time)::int AS month,
                   ROUND(AVG(duration_minutes))::float8 AS value
              FROM apheresis_procedures
             WHERE start_time >= $1 AND start_time < $2
               AND duration_minutes IS NOT NULL
             GROUP BY 1, 2
             ORDER BY 1, 2
            "#,
        ),
        "top_alarms_apheresis" => IndicatorQuery::Ranked(
            r#"
            WITH total AS (
                SELECT COUNT(*)::float8 AS total
                  FROM apheresis_alarm_events
                 WHERE occurred_at >= $1 AND occurred_at < $2
            ),
            ranked AS (
                SELECT name,
                       alarm_type,
                       COUNT(*) AS frequency,
                       RANK() OVER (ORDER BY COUNT(*) DESC) AS rank
                  FROM apheresis_alarm_events
                 WHERE occurred_at >= $1 AND occurred_at < $2
                 GROUP BY name, alarm_type
                 ORDER BY frequency DESC
                 LIMIT 10
            )
            SELECT EXTRACT(YEAR FROM $2)::int AS year,
                   EXTRACT(MONTH FROM $2)::int AS month,
                   r.rank::int AS rank,
                   r.name AS label,
                   r.alarm_type AS detail,
                   r.frequency::bigint AS frequency,
                   ROUND((r.frequency * 100.0 / NULLIF(t.total, 0))::numeric, 2)::float8 AS percent
              FROM ranked r
             CROSS JOIN total t
             ORDER BY r.rank
            "#,
        ),
        "components_processed" => IndicatorQuery::Scalar(
            r#"
            SELECT EXTRACT(YEAR FROM r.start_date)::int AS year,
                   EXTRACT(MONTH FROM r.start_date)::int AS month,
                   (COUNT(*) FILTER (WHERE p.plasma_volume > 0)
                    + COUNT(*) FILTER (WHERE p.platelet_volume > 0))::float8 AS value
              FROM wb_blood_products p
              JOIN wb_runs r ON r.id = p.run_id
             WHERE r.start_date >= $1 AND r.start_date < $2
             GROUP BY 1, 2
             ORDER BY 1, 2
            "#,
        ),
        "run_duration" => IndicatorQuery::Scalar(
            r#"
            SELECT EXTRACT(YEAR FROM start_date)::int AS year,
                   EXTRACT(MONTH FROM start_date)::int AS month,
                   ROUND(AVG(run_duration_minutes))::float8 AS value
              FROM wb_runs
             WHERE start_date >= $1 AND start_date < $2
               AND run_duration_minutes IS NOT NULL
             GROUP BY 1, 2
             ORDER BY 1, 2
            "#,
        ),
        "platelet_mean_volume" => IndicatorQuery::Scalar(wb_product_avg("platelet_volume")),
        "platelet_yield_index" => IndicatorQuery::Scalar(wb_product_avg("platelet_yield_index")),
        "plasma_mean_volume" => IndicatorQuery::Scalar(wb_product_avg("plasma_volume")),
        "plasma_total_volume" => IndicatorQuery::Scalar(
            r#"
            SELECT EXTRACT(YEAR FROM r.start_date)::int AS year,
                   EXTRACT(MONTH FROM r.start_date)::int AS month,
                   SUM(p.plasma_volume)::float8 AS value
              FROM wb_blood_products p
              JOIN wb_runs r ON r.id = p.run_id
             WHERE r.start_date >= $1 AND r.start_date < $2
               AND p.plasma_volume > 0
             GROUP BY 1, 2
             ORDER BY 1, 2
            "#,
        ),
        "top_alarms_whole_blood" => IndicatorQuery::Ranked(
            r#"
            WITH total AS (
                SELECT COUNT(*)::float8 AS total
                  FROM wb_alarm_events
                 WHERE occurred_at >= $1 AND occurred_at < $2
            ),
            ranked AS (
                SELECT alarm_id,
                       message,
                       COUNT(*) AS frequency,
                       RANK() OVER (ORDER BY COUNT(*) DESC) AS rank
                  FROM wb_alarm_events
                 WHERE occurred_at >= $1 AND occurred_at < $2
                 GROUP BY alarm_id, message
                 ORDER BY frequency DESC
                 LIMIT 10
            )
            SELECT EXTRACT(YEAR FROM $2)::int AS year,
                   EXTRACT(MONTH FROM $2)::int AS month,
                   r.rank::int AS rank,
                   r.alarm_id AS label,
                   r.message AS detail,
                   r.frequency::bigint AS frequency,
                   ROUND((r.frequency * 100.0 / NULLIF(t.total, 0))::numeric, 2)::float8 AS percent
              FROM ranked r
             CROSS JOIN total t
             ORDER BY r.rank
            "#,
        ),
        _ => return None,
    };
    Some(query)
}

fn wb_product_avg(column: &'static str) -> &'static str {
    // Same query body for the per-product mean indicators.
    match column {
        "platelet_volume" => {
            r#"
            SELECT EXTRACT(YEAR FROM r.start_date)::int AS year,
                   EXTRACT(MONTH FROM r.start_date)::int AS month,
                   ROUND(AVG(p.platelet_volume)::numeric, 1)::float8 AS value
              FROM wb_blood_products p
              JOIN wb_runs r ON r.id = p.run_id
             WHERE r.start_date >= $1 AND r.start_date < $2
               AND p.platelet_volume > 0
             GROUP BY 1, 2
             ORDER BY 1, 2
            "#
        }
        "platelet_yield_index" => {
            r#"
            SELECT EXTRACT(YEAR FROM r.start_date)::int AS year,
                   EXTRACT(MONTH FROM r.start_date)::int AS month,
                   ROUND(AVG(p.platelet_yield_index)::numeric, 1)::float8 AS value
              FROM wb_blood_products p
              JOIN wb_runs r ON r.id = p.run_id
             WHERE r.start_date >= $1 AND r.start_date < $2
               AND p.platelet_yield_index > 0
             GROUP BY 1, 2
             ORDER BY 1, 2
            "#
        }
        _ => {
            r#"
            SELECT EXTRACT(YEAR FROM r.start_date)::int AS year,
                   EXTRACT(MONTH FROM r.start_date)::int AS month,
                   ROUND(AVG(p.plasma_volume)::numeric, 1)::float8 AS value
              FROM wb_blood_products p
              JOIN wb_runs r ON r.id = p.run_id
             WHERE r.start_date >= $1 AND r.start_date < $2
               AND p.plasma_volume > 0
             GROUP BY 1, 2
             ORDER BY 1, 2
            "#
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hemodash_core::{ResultShape, CATALOG};

    #[test]
    fn every_catalog_indicator_has_a_query() {
        for d in CATALOG {
            assert!(query_for(d.key).is_some(), "missing query for {}", d.key);
        }
    }

    #[test]
    fn query_variant_matches_descriptor_shape() {
        for d in CATALOG {
            let query = query_for(d.key).expect("query");
            let matches = match (d.shape, &query) {
                (ResultShape::Scalar, IndicatorQuery::Scalar(_))
                | (ResultShape::Scalar, IndicatorQuery::ScalarText(_))
                | (ResultShape::DualScalar, IndicatorQuery::Dual(_))
                | (ResultShape::RankedList, IndicatorQuery::Ranked(_)) => true,
                _ => false,
            };
            assert!(matches, "shape mismatch for {}", d.key);
        }
    }

    #[test]
    fn connection_class_errors_are_transient() {
        let io = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(matches!(classify_sqlx_error(io), QueryError::Transient(_)));
        assert!(matches!(
            classify_sqlx_error(sqlx::Error::PoolTimedOut),
            QueryError::Transient(_)
        ));
        assert!(matches!(
            classify_sqlx_error(sqlx::Error::RowNotFound),
            QueryError::Data(_)
        ));
    }
}
