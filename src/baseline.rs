//! Baseline Computer (C5): periodic per-service statistical baselines over
//! a rolling historical window, persisted append-only to
//! `service_baselines`.

use clickhouse::Row;
use serde::Deserialize;
use time::OffsetDateTime;

use crate::config::{DetectionConfig, ThresholdConfig};
use crate::rows::ServiceBaselineRow;
use crate::store::Store;

/// `{mean, stddev, min, max, p50, p95, p99, sample_count}` over a vector of
/// length `n >= 2`, per spec's percentile-index rule.
#[derive(Debug, Clone, Copy)]
pub struct StatSummary {
    pub mean: f64,
    pub stddev: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub sample_count: usize,
}

pub fn summarize(mut v: Vec<f64>) -> Option<StatSummary> {
    let n = v.len();
    if n < 2 {
        return None;
    }
    v.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mean = v.iter().sum::<f64>() / n as f64;
    let variance = v.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64;
    let idx = |frac: f64| -> usize { ((frac * n as f64).floor() as usize).min(n - 1) };
    let p95_idx = if n <= 20 { n - 1 } else { idx(0.95) };
    let p99_idx = if n <= 100 { n - 1 } else { idx(0.99) };
    Some(StatSummary {
        mean,
        stddev: variance.sqrt(),
        min: v[0],
        max: v[n - 1],
        p50: v[idx(0.5)],
        p95: v[p95_idx],
        p99: v[p99_idx],
        sample_count: n,
    })
}

#[derive(Row, Deserialize)]
struct ServiceName {
    service_name: String,
}

#[derive(Row, Deserialize)]
struct BucketValue {
    value: f64,
}

#[derive(Row, Deserialize)]
struct DistinctName {
    name: String,
}

#[derive(Row, Deserialize)]
struct ExceptionType {
    exception_type: String,
}

async fn active_services(store: &Store, window_hours: i64) -> Vec<String> {
    let sql = format!(
        "SELECT DISTINCT service_name AS service_name FROM (
            SELECT service_name FROM observability.spans WHERE start_time >= now() - INTERVAL {window_hours} HOUR
            UNION ALL
            SELECT service_name FROM observability.logs WHERE timestamp >= now() - INTERVAL {window_hours} HOUR
            UNION ALL
            SELECT service_name FROM observability.metrics WHERE timestamp >= now() - INTERVAL {window_hours} HOUR
        ) WHERE service_name != ''"
    );
    store
        .fetch_all::<ServiceName>(&sql)
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|r| r.service_name)
        .collect()
}

async fn bucketed_values(store: &Store, sql: &str) -> Vec<f64> {
    store
        .fetch_all::<BucketValue>(sql)
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|r| r.value)
        .collect()
}

fn sql_escape(s: &str) -> String {
    s.replace('\'', "''")
}

/// Computes and persists baselines for every series named in spec.md §4.5,
/// for every service with activity in the last `baseline_window_hours`.
pub async fn run(store: &Store, detection: &DetectionConfig, thresholds: &ThresholdConfig) -> anyhow::Result<()> {
    let window_hours = detection.baseline_window_hours;
    let min_samples = thresholds.min_samples_for_baseline;
    let services = active_services(store, window_hours).await;
    let computed_at = OffsetDateTime::now_utc();
    let mut rows: Vec<ServiceBaselineRow> = Vec::new();

    for service in &services {
        let svc = sql_escape(service);
        let known_exceptions = known_exception_types(store, &svc, window_hours).await;
        let known_json = serde_json::to_string(&known_exceptions).unwrap_or_else(|_| "[]".to_string());

        push_summary(
            &mut rows,
            service,
            "error_rate",
            error_rate_series(store, &svc, window_hours).await,
            min_samples,
            computed_at,
            window_hours,
            &known_json,
        );

        for (metric_type, sql_field) in [("latency_p50", "p50"), ("latency_p95", "p95"), ("latency_p99", "p99")] {
            let sql = format!(
                "SELECT {sql_field} AS value FROM (
                    SELECT
                        quantile(0.5)(duration_ns) AS p50,
                        quantile(0.95)(duration_ns) AS p95,
                        quantile(0.99)(duration_ns) AS p99,
                        count() AS total
                    FROM observability.spans
                    WHERE service_name = '{svc}' AND duration_ns > 0
                      AND start_time >= now() - INTERVAL {window_hours} HOUR
                    GROUP BY toStartOfHour(start_time)
                    HAVING total >= 10
                )"
            );
            push_summary(
                &mut rows,
                service,
                metric_type,
                bucketed_values(store, &sql).await,
                min_samples,
                computed_at,
                window_hours,
                &known_json,
            );
        }

        let throughput_sql = format!(
            "SELECT count() AS value FROM observability.spans
             WHERE service_name = '{svc}' AND span_kind = 'SERVER'
               AND start_time >= now() - INTERVAL {window_hours} HOUR
             GROUP BY toStartOfMinute(start_time)"
        );
        push_summary(
            &mut rows,
            service,
            "throughput",
            bucketed_values(store, &throughput_sql).await,
            min_samples,
            computed_at,
            window_hours,
            &known_json,
        );

        let exception_sql = format!(
            "SELECT count() AS value FROM observability.span_events
             WHERE service_name = '{svc}' AND exception_type != ''
               AND timestamp >= now() - INTERVAL {window_hours} HOUR
             GROUP BY toStartOfHour(timestamp)"
        );
        push_summary(
            &mut rows,
            service,
            "exception_rate",
            bucketed_values(store, &exception_sql).await,
            min_samples,
            computed_at,
            window_hours,
            &known_json,
        );

        for db_system in db_systems(store, &svc, window_hours).await {
            let db = sql_escape(&db_system);
            let lat_sql = format!(
                "SELECT avg(duration_ns) AS value FROM observability.spans
                 WHERE service_name = '{svc}' AND db_system = '{db}' AND duration_ns > 0
                   AND start_time >= now() - INTERVAL {window_hours} HOUR
                 GROUP BY toStartOfHour(start_time)"
            );
            push_summary(
                &mut rows,
                service,
                &format!("db_{db_system}_latency"),
                bucketed_values(store, &lat_sql).await,
                min_samples,
                computed_at,
                window_hours,
                &known_json,
            );

            let err_sql = format!(
                "SELECT errors / total AS value FROM (
                    SELECT countIf(status_code = 'ERROR') AS errors, count() AS total
                    FROM observability.spans
                    WHERE service_name = '{svc}' AND db_system = '{db}'
                      AND start_time >= now() - INTERVAL {window_hours} HOUR
                    GROUP BY toStartOfHour(start_time)
                    HAVING total > 0
                )"
            );
            push_summary(
                &mut rows,
                service,
                &format!("db_{db_system}_error_rate"),
                bucketed_values(store, &err_sql).await,
                min_samples,
                computed_at,
                window_hours,
                &known_json,
            );
        }

        for dep in dependencies(store, &svc, window_hours).await {
            let dep_esc = sql_escape(&dep);
            let lat_sql = format!(
                "SELECT avg(child.duration_ns) AS value
                 FROM observability.spans AS child
                 INNER JOIN observability.spans AS parent
                   ON parent.trace_id = child.trace_id AND parent.span_id = child.parent_span_id
                 WHERE parent.service_name = '{svc}' AND child.service_name = '{dep_esc}'
                   AND child.duration_ns > 0
                   AND child.start_time >= now() - INTERVAL {window_hours} HOUR
                 GROUP BY toStartOfHour(child.start_time)"
            );
            push_summary(
                &mut rows,
                service,
                &format!("dep_{dep}_latency"),
                bucketed_values(store, &lat_sql).await,
                min_samples,
                computed_at,
                window_hours,
                &known_json,
            );

            let err_sql = format!(
                "SELECT errors / total AS value FROM (
                    SELECT countIf(child.status_code = 'ERROR') AS errors, count() AS total
                    FROM observability.spans AS child
                    INNER JOIN observability.spans AS parent
                      ON parent.trace_id = child.trace_id AND parent.span_id = child.parent_span_id
                    WHERE parent.service_name = '{svc}' AND child.service_name = '{dep_esc}'
                      AND child.start_time >= now() - INTERVAL {window_hours} HOUR
                    GROUP BY toStartOfHour(child.start_time)
                    HAVING total > 0
                )"
            );
            push_summary(
                &mut rows,
                service,
                &format!("dep_{dep}_error_rate"),
                bucketed_values(store, &err_sql).await,
                min_samples,
                computed_at,
                window_hours,
                &known_json,
            );
        }
    }

    let count = rows.len();
    store.append("service_baselines", &rows).await?;
    tracing::info!("baseline computer: persisted {count} baseline rows across {} services", services.len());
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn push_summary(
    rows: &mut Vec<ServiceBaselineRow>,
    service: &str,
    metric_type: &str,
    series: Vec<f64>,
    min_samples: usize,
    computed_at: OffsetDateTime,
    window_hours: i64,
    known_exception_types_json: &str,
) {
    let Some(summary) = summarize(series) else { return };
    if summary.sample_count < min_samples {
        return;
    }
    rows.push(ServiceBaselineRow {
        computed_at,
        service_name: service.to_string(),
        metric_type: metric_type.to_string(),
        baseline_mean: summary.mean,
        baseline_stddev: summary.stddev,
        baseline_min: summary.min,
        baseline_max: summary.max,
        baseline_p50: summary.p50,
        baseline_p95: summary.p95,
        baseline_p99: summary.p99,
        sample_count: summary.sample_count as i32,
        window_hours: window_hours as i32,
        known_exception_types_json: known_exception_types_json.to_string(),
    });
}

async fn error_rate_series(store: &Store, svc: &str, window_hours: i64) -> Vec<f64> {
    let sql = format!(
        "SELECT errors / total AS value FROM (
            SELECT countIf(status_code = 'ERROR') AS errors, count() AS total
            FROM observability.spans
            WHERE service_name = '{svc}' AND start_time >= now() - INTERVAL {window_hours} HOUR
            GROUP BY toStartOfHour(start_time)
            HAVING total >= 10
        )"
    );
    bucketed_values(store, &sql).await
}

async fn db_systems(store: &Store, svc: &str, window_hours: i64) -> Vec<String> {
    let sql = format!(
        "SELECT DISTINCT db_system AS name FROM observability.spans
         WHERE service_name = '{svc}' AND db_system != ''
           AND start_time >= now() - INTERVAL {window_hours} HOUR"
    );
    store.fetch_all::<DistinctName>(&sql).await.unwrap_or_default().into_iter().map(|r| r.name).collect()
}

async fn dependencies(store: &Store, svc: &str, window_hours: i64) -> Vec<String> {
    let sql = format!(
        "SELECT DISTINCT child.service_name AS name
         FROM observability.spans AS child
         INNER JOIN observability.spans AS parent
           ON parent.trace_id = child.trace_id AND parent.span_id = child.parent_span_id
         WHERE parent.service_name = '{svc}' AND child.service_name != parent.service_name
           AND child.service_name != ''
           AND child.start_time >= now() - INTERVAL {window_hours} HOUR"
    );
    store.fetch_all::<DistinctName>(&sql).await.unwrap_or_default().into_iter().map(|r| r.name).collect()
}

/// Exception types with >= 3 occurrences in the window, for `NEW_EXCEPTION_TYPE` detection.
async fn known_exception_types(store: &Store, svc: &str, window_hours: i64) -> Vec<String> {
    let sql = format!(
        "SELECT exception_type AS exception_type FROM observability.span_events
         WHERE service_name = '{svc}' AND exception_type != ''
           AND timestamp >= now() - INTERVAL {window_hours} HOUR
         GROUP BY exception_type
         HAVING count() >= 3"
    );
    store
        .fetch_all::<ExceptionType>(&sql)
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|r| r.exception_type)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summarize_needs_at_least_two_samples() {
        assert!(summarize(vec![1.0]).is_none());
        assert!(summarize(vec![]).is_none());
    }

    #[test]
    fn summarize_computes_mean_stddev_minmax() {
        let s = summarize(vec![1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        assert_eq!(s.mean, 3.0);
        assert_eq!(s.min, 1.0);
        assert_eq!(s.max, 5.0);
        assert_eq!(s.sample_count, 5);
        assert!((s.stddev - 2f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn p95_falls_back_to_max_when_n_le_20() {
        let v: Vec<f64> = (1..=15).map(|x| x as f64).collect();
        let s = summarize(v).unwrap();
        assert_eq!(s.p95, 15.0);
        assert_eq!(s.p99, 15.0);
    }

    #[test]
    fn percentile_indices_scale_with_larger_n() {
        let v: Vec<f64> = (1..=200).map(|x| x as f64).collect();
        let s = summarize(v).unwrap();
        assert_eq!(s.p95, 191.0);
        assert_eq!(s.p99, 199.0);
    }

    #[test]
    fn invariant_min_le_p50_le_p95_le_p99_le_max() {
        let v: Vec<f64> = vec![5.0, 1.0, 9.0, 3.0, 7.0, 2.0, 8.0, 4.0, 6.0, 10.0, 11.0];
        let s = summarize(v).unwrap();
        assert!(s.min <= s.p50);
        assert!(s.p50 <= s.p95);
        assert!(s.p95 <= s.p99);
        assert!(s.p99 <= s.max);
    }
}
