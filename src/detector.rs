//! Anomaly Detector (C6): compares live 5-minute windows against learned
//! baselines via Z-score, emitting one `anomaly_scores` row per evaluated
//! metric and a `Finding` per threshold breach for the Alert Manager.

use std::collections::{HashMap, HashSet};

use clickhouse::Row;
use serde::Deserialize;
use time::OffsetDateTime;

use crate::config::{RootCauseConfig, ThresholdConfig};
use crate::rows::AnomalyScoreRow;
use crate::store::Store;
use crate::threshold::ThresholdManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone)]
pub struct Finding {
    pub service_name: String,
    pub alert_type: String,
    pub metric_type: String,
    pub severity: Severity,
    pub current_value: f64,
    pub expected_value: f64,
    pub baseline_mean: f64,
    pub baseline_stddev: f64,
    pub z_score: f64,
    pub title: String,
    pub description: String,
}

#[derive(Debug, Clone, Copy)]
struct BaselineEntry {
    mean: f64,
    stddev: f64,
}

/// All current baselines, indexed for O(1) lookup during a detection pass.
/// Rebuilt fresh on every tick — cheap compared to a live ClickHouse scan,
/// and always reflects the latest recomputation.
pub struct Baselines {
    entries: HashMap<(String, String), BaselineEntry>,
    known_exceptions: HashMap<String, HashSet<String>>,
    services: HashSet<String>,
}

#[derive(Row, Deserialize)]
struct LatestBaselineRow {
    service_name: String,
    metric_type: String,
    baseline_mean: f64,
    baseline_stddev: f64,
    known_exception_types_json: String,
}

impl Baselines {
    pub async fn load(store: &Store) -> Self {
        let sql = "
            SELECT service_name, metric_type, baseline_mean, baseline_stddev, known_exception_types_json
            FROM observability.service_baselines
            ORDER BY service_name, metric_type, computed_at DESC
            LIMIT 1 BY service_name, metric_type
        ";
        let rows: Vec<LatestBaselineRow> = store.fetch_all(sql).await.unwrap_or_default();
        let mut entries = HashMap::new();
        let mut known_exceptions: HashMap<String, HashSet<String>> = HashMap::new();
        let mut services = HashSet::new();
        for row in rows {
            services.insert(row.service_name.clone());
            if let Ok(types) = serde_json::from_str::<Vec<String>>(&row.known_exception_types_json) {
                known_exceptions.entry(row.service_name.clone()).or_default().extend(types);
            }
            entries.insert(
                (row.service_name.clone(), row.metric_type.clone()),
                BaselineEntry { mean: row.baseline_mean, stddev: row.baseline_stddev },
            );
        }
        Self { entries, known_exceptions, services }
    }

    fn get(&self, service: &str, metric_type: &str) -> Option<BaselineEntry> {
        self.entries.get(&(service.to_string(), metric_type.to_string())).copied()
    }

    fn known_exception_types(&self, service: &str) -> HashSet<String> {
        self.known_exceptions.get(service).cloned().unwrap_or_default()
    }

    /// Downstream database systems / services this service has a baseline
    /// for, derived from the `db_<system>_*` / `dep_<service>_*` metric
    /// type names (see `baseline.rs`'s naming convention).
    fn dimension_names(&self, service: &str, prefix: &str, suffix: &str) -> Vec<String> {
        self.entries
            .keys()
            .filter(|(svc, metric)| svc == service && metric.starts_with(prefix) && metric.ends_with(suffix))
            .map(|(_, metric)| metric[prefix.len()..metric.len() - suffix.len()].to_string())
            .collect()
    }
}

fn zscore(current: f64, baseline: BaselineEntry) -> Option<f64> {
    if baseline.stddev > 0.0 {
        Some((current - baseline.mean) / baseline.stddev)
    } else {
        None
    }
}

fn rising_severity(z: f64, theta: f64) -> Option<Severity> {
    if z > 1.5 * theta {
        Some(Severity::Critical)
    } else if z > theta {
        Some(Severity::Warning)
    } else {
        None
    }
}

fn dropping_severity(z: f64, theta: f64) -> Option<Severity> {
    if z < -1.5 * theta {
        Some(Severity::Critical)
    } else if z < -theta {
        Some(Severity::Warning)
    } else {
        None
    }
}

fn sql_escape(s: &str) -> String {
    s.replace('\'', "''")
}

struct Tracker {
    findings: Vec<Finding>,
    scores: Vec<AnomalyScoreRow>,
}

impl Tracker {
    #[allow(clippy::too_many_arguments)]
    fn record(
        &mut self,
        service: &str,
        metric_type: &str,
        current: f64,
        baseline: BaselineEntry,
        z: f64,
        severity: Option<Severity>,
        alert_type: &str,
        title: impl Into<String>,
        description: impl Into<String>,
    ) {
        let is_anomaly = severity.is_some();
        self.scores.push(AnomalyScoreRow {
            timestamp: OffsetDateTime::now_utc(),
            service_name: service.to_string(),
            metric_type: metric_type.to_string(),
            current_value: current,
            expected_value: baseline.mean,
            baseline_mean: baseline.mean,
            baseline_stddev: baseline.stddev,
            z_score: z,
            anomaly_score: (z.abs() / 5.0).min(1.0),
            is_anomaly,
            detection_method: "zscore".to_string(),
        });
        if let Some(severity) = severity {
            self.findings.push(Finding {
                service_name: service.to_string(),
                alert_type: alert_type.to_string(),
                metric_type: metric_type.to_string(),
                severity,
                current_value: current,
                expected_value: baseline.mean,
                baseline_mean: baseline.mean,
                baseline_stddev: baseline.stddev,
                z_score: z,
                title: title.into(),
                description: description.into(),
            });
        }
    }

    /// Records a rule-based (non-Z-score) hit. There's no live Z-score for
    /// these checks, so a definite hit is assigned the sentinel Z-score that
    /// saturates `anomaly_score = min(1.0, |z|/5)` at 1.0 — the invariant
    /// formula holds for this row same as every other.
    #[allow(clippy::too_many_arguments)]
    fn record_discrete(
        &mut self,
        service: &str,
        metric_type: &str,
        alert_type: &str,
        severity: Severity,
        current: f64,
        title: impl Into<String>,
        description: impl Into<String>,
    ) {
        const DEFINITE_HIT_Z: f64 = 5.0;
        self.scores.push(AnomalyScoreRow {
            timestamp: OffsetDateTime::now_utc(),
            service_name: service.to_string(),
            metric_type: metric_type.to_string(),
            current_value: current,
            expected_value: 0.0,
            baseline_mean: 0.0,
            baseline_stddev: 0.0,
            z_score: DEFINITE_HIT_Z,
            anomaly_score: (DEFINITE_HIT_Z.abs() / 5.0).min(1.0),
            is_anomaly: true,
            detection_method: "rule".to_string(),
        });
        self.findings.push(Finding {
            service_name: service.to_string(),
            alert_type: alert_type.to_string(),
            metric_type: metric_type.to_string(),
            severity,
            current_value: current,
            expected_value: 0.0,
            baseline_mean: 0.0,
            baseline_stddev: 0.0,
            z_score: DEFINITE_HIT_Z,
            title: title.into(),
            description: description.into(),
        });
    }
}

#[derive(Row, Deserialize)]
struct CountTotal {
    value: f64,
    total: u64,
}

#[derive(Row, Deserialize)]
struct OneValue {
    value: f64,
}

/// ClickHouse's native `RowBinary` format is positional: the struct's field
/// order must match the `SELECT` list exactly, so two-column and
/// single-column results need distinct row types.
async fn fetch_count_total(store: &Store, sql: &str) -> Option<CountTotal> {
    let rows: Vec<CountTotal> = store.fetch_all(sql).await.ok()?;
    rows.into_iter().next()
}

async fn fetch_one_value(store: &Store, sql: &str) -> Option<f64> {
    let rows: Vec<OneValue> = store.fetch_all(sql).await.ok()?;
    rows.into_iter().next().map(|r| r.value)
}

#[derive(Row, Deserialize)]
struct ExceptionCount {
    exception_type: String,
}

/// Runs one detection pass against every service with at least one
/// baseline. Returns the findings the Alert Manager should act on; persists
/// one `anomaly_scores` row per evaluated metric regardless of outcome.
pub async fn run(
    store: &Store,
    baselines: &Baselines,
    thresholds: &ThresholdConfig,
    threshold_mgr: &ThresholdManager,
    root_cause: &RootCauseConfig,
) -> anyhow::Result<Vec<Finding>> {
    let mut tracker = Tracker { findings: Vec::new(), scores: Vec::new() };

    for service in &baselines.services {
        let svc = sql_escape(service);
        let theta = thresholds.zscore_threshold;

        // 1. Error rate (symptom)
        if let Some(baseline) = baselines.get(service, "error_rate") {
            let sql = format!(
                "SELECT errors / total AS value, total AS total FROM (
                    SELECT countIf(status_code = 'ERROR') AS errors, count() AS total
                    FROM observability.spans
                    WHERE service_name = '{svc}' AND start_time >= now() - INTERVAL 5 MINUTE
                )"
            );
            if let Some(row) = fetch_count_total(store, &sql).await
                && row.total >= 5 {
                    let rate = row.value;
                    let z = zscore(rate, baseline).unwrap_or(0.0);
                    let mut severity = if baseline.stddev > 0.0 { rising_severity(z, theta) } else { None };
                    if rate >= thresholds.error_rate_critical {
                        severity = Some(Severity::Critical);
                    } else if rate >= thresholds.error_rate_warning && severity.is_none() {
                        severity = Some(Severity::Warning);
                    }
                    tracker.record(
                        service, "error_rate", rate, baseline, z, severity, "error_spike",
                        format!("Elevated error rate on {service}"),
                        format!("error rate {:.1}% over last 5m ({} of {} requests) vs baseline {:.1}%", rate * 100.0, row.total as f64 * rate, row.total, baseline.mean * 100.0),
                    );
                }
        }

        // 2. Latency (symptom)
        if let Some(baseline) = baselines.get(service, "latency_p95") {
            let sql = format!(
                "SELECT quantile(0.95)(duration_ns) AS value, count() AS total FROM observability.spans
                 WHERE service_name = '{svc}' AND duration_ns > 0 AND start_time >= now() - INTERVAL 5 MINUTE"
            );
            if let Some(row) = fetch_count_total(store, &sql).await
                && row.total > 0
                    && let Some(z) = zscore(row.value, baseline) {
                        let severity = rising_severity(z, theta);
                        tracker.record(
                            service, "latency_p95", row.value, baseline, z, severity, "latency_spike",
                            format!("Elevated p95 latency on {service}"),
                            format!("p95 duration {:.0}ns over last 5m vs baseline {:.0}ns", row.value, baseline.mean),
                        );
                    }
        }

        // 3. Throughput drop (symptom)
        if let Some(baseline) = baselines.get(service, "throughput")
            && baseline.mean >= 1.0 {
                let sql = format!(
                    "SELECT count() AS value FROM observability.spans
                     WHERE service_name = '{svc}' AND span_kind = 'SERVER' AND start_time >= now() - INTERVAL 5 MINUTE"
                );
                if let Some(value) = fetch_one_value(store, &sql).await {
                    let per_minute = value / 5.0;
                    if let Some(z) = zscore(per_minute, baseline) {
                        let severity = dropping_severity(z, theta);
                        tracker.record(
                            service, "throughput", per_minute, baseline, z, severity, "throughput_drop",
                            format!("Throughput drop on {service}"),
                            format!("{per_minute:.1} req/min over last 5m vs baseline {:.1} req/min", baseline.mean),
                        );
                    }
                }
            }

        // 4. Service down
        {
            let sql = format!(
                "SELECT count() AS value FROM observability.spans
                 WHERE service_name = '{svc}' AND start_time >= now() - INTERVAL 1 HOUR"
            );
            if let Some(value) = fetch_one_value(store, &sql).await
                && value == 0.0 {
                    tracker.record_discrete(
                        service, "availability", "service_down", Severity::Critical, 0.0,
                        format!("{service} appears down"),
                        format!("no spans observed for {service} in the last hour"),
                    );
                }
        }

        if !root_cause.enabled {
            continue;
        }

        // 5a. DB root-cause categories
        for db_system in baselines.dimension_names(service, "db_", "_latency") {
            if !threshold_mgr.category_enabled("DB_SLOW_QUERIES") {
                continue;
            }
            let metric_type = format!("db_{db_system}_latency");
            if let Some(baseline) = baselines.get(service, &metric_type) {
                let db = sql_escape(&db_system);
                let sql = format!(
                    "SELECT avg(duration_ns) AS value, count() AS total FROM observability.spans
                     WHERE service_name = '{svc}' AND db_system = '{db}' AND duration_ns > 0
                       AND start_time >= now() - INTERVAL 5 MINUTE"
                );
                if let Some(row) = fetch_count_total(store, &sql).await
                    && row.total > 0
                        && let Some(z) = zscore(row.value, baseline) {
                            let eff_theta = threshold_mgr.effective_threshold("db_slow_queries", &metric_type);
                            let severity = rising_severity(z, eff_theta);
                            tracker.record(
                                service, &metric_type, row.value, baseline, z, severity, "db_slow_queries",
                                format!("{db_system} queries slow on {service}"),
                                format!("avg duration {:.0}ns over last 5m vs baseline {:.0}ns", row.value, baseline.mean),
                            );
                        }
            }
        }

        for db_system in baselines.dimension_names(service, "db_", "_error_rate") {
            if !threshold_mgr.category_enabled("DB_CONNECTION_FAILURE") {
                continue;
            }
            let metric_type = format!("db_{db_system}_error_rate");
            if let Some(baseline) = baselines.get(service, &metric_type) {
                let db = sql_escape(&db_system);
                let sql = format!(
                    "SELECT errors / total AS value, total AS total FROM (
                        SELECT countIf(status_code = 'ERROR') AS errors, count() AS total
                        FROM observability.spans
                        WHERE service_name = '{svc}' AND db_system = '{db}' AND start_time >= now() - INTERVAL 5 MINUTE
                    )"
                );
                if let Some(row) = fetch_count_total(store, &sql).await
                    && row.total > 0
                        && let Some(z) = zscore(row.value, baseline) {
                            let eff_theta = threshold_mgr.effective_threshold("db_connection_failure", &metric_type);
                            let severity = rising_severity(z, eff_theta);
                            tracker.record(
                                service, &metric_type, row.value, baseline, z, severity, "db_connection_failure",
                                format!("{db_system} errors elevated on {service}"),
                                format!("error rate {:.1}% over last 5m vs baseline {:.1}%", row.value * 100.0, baseline.mean * 100.0),
                            );
                        }
            }
        }

        // 5b. Dependency root-cause categories
        for dep in baselines.dimension_names(service, "dep_", "_latency") {
            if !threshold_mgr.category_enabled("DEPENDENCY_LATENCY") {
                continue;
            }
            let metric_type = format!("dep_{dep}_latency");
            if let Some(baseline) = baselines.get(service, &metric_type) {
                let dep_esc = sql_escape(&dep);
                let sql = format!(
                    "SELECT avg(child.duration_ns) AS value, count() AS total
                     FROM observability.spans AS child
                     INNER JOIN observability.spans AS parent
                       ON parent.trace_id = child.trace_id AND parent.span_id = child.parent_span_id
                     WHERE parent.service_name = '{svc}' AND child.service_name = '{dep_esc}' AND child.duration_ns > 0
                       AND child.start_time >= now() - INTERVAL 5 MINUTE"
                );
                if let Some(row) = fetch_count_total(store, &sql).await
                    && row.total > 0
                        && let Some(z) = zscore(row.value, baseline) {
                            let eff_theta = threshold_mgr.effective_threshold("dependency_latency", &metric_type);
                            let severity = rising_severity(z, eff_theta);
                            tracker.record(
                                service, &metric_type, row.value, baseline, z, severity, "dependency_latency",
                                format!("{dep} slow as a dependency of {service}"),
                                format!("avg call duration {:.0}ns over last 5m vs baseline {:.0}ns", row.value, baseline.mean),
                            );
                        }
            }
        }

        for dep in baselines.dimension_names(service, "dep_", "_error_rate") {
            if !threshold_mgr.category_enabled("DEPENDENCY_FAILURE") {
                continue;
            }
            let metric_type = format!("dep_{dep}_error_rate");
            if let Some(baseline) = baselines.get(service, &metric_type) {
                let dep_esc = sql_escape(&dep);
                let sql = format!(
                    "SELECT errors / total AS value, total AS total FROM (
                        SELECT countIf(child.status_code = 'ERROR') AS errors, count() AS total
                        FROM observability.spans AS child
                        INNER JOIN observability.spans AS parent
                          ON parent.trace_id = child.trace_id AND parent.span_id = child.parent_span_id
                        WHERE parent.service_name = '{svc}' AND child.service_name = '{dep_esc}'
                          AND child.start_time >= now() - INTERVAL 5 MINUTE
                    )"
                );
                if let Some(row) = fetch_count_total(store, &sql).await
                    && row.total > 0
                        && let Some(z) = zscore(row.value, baseline) {
                            let eff_theta = threshold_mgr.effective_threshold("dependency_failure", &metric_type);
                            let severity = rising_severity(z, eff_theta);
                            tracker.record(
                                service, &metric_type, row.value, baseline, z, severity, "dependency_failure",
                                format!("{dep} failing as a dependency of {service}"),
                                format!("error rate {:.1}% over last 5m vs baseline {:.1}%", row.value * 100.0, baseline.mean * 100.0),
                            );
                        }
            }
        }

        // 5c. Exception surge
        if threshold_mgr.category_enabled("EXCEPTION_SURGE")
            && let Some(baseline) = baselines.get(service, "exception_rate") {
                let sql = format!(
                    "SELECT count() AS value FROM observability.span_events
                     WHERE service_name = '{svc}' AND exception_type != '' AND timestamp >= now() - INTERVAL 5 MINUTE"
                );
                if let Some(value) = fetch_one_value(store, &sql).await {
                    let hourly_equivalent = value * 12.0;
                    if let Some(z) = zscore(hourly_equivalent, baseline) {
                        let eff_theta = threshold_mgr.effective_threshold("exception_surge", "exception_rate");
                        let severity = rising_severity(z, eff_theta);
                        tracker.record(
                            service, "exception_rate", hourly_equivalent, baseline, z, severity, "exception_surge",
                            format!("Exception surge on {service}"),
                            format!("{:.0} exceptions/hour-equivalent vs baseline {:.1}", hourly_equivalent, baseline.mean),
                        );
                    }
                }
            }

        // 5d. New exception type
        if threshold_mgr.category_enabled("NEW_EXCEPTION_TYPE") {
            let known = baselines.known_exception_types(service);
            let sql = format!(
                "SELECT exception_type AS exception_type FROM observability.span_events
                 WHERE service_name = '{svc}' AND exception_type != '' AND timestamp >= now() - INTERVAL 15 MINUTE
                 GROUP BY exception_type
                 HAVING count() >= 2"
            );
            let rows: Vec<ExceptionCount> = store.fetch_all(&sql).await.unwrap_or_default();
            for row in rows {
                if !known.contains(&row.exception_type) {
                    tracker.record_discrete(
                        service, &row.exception_type, "new_exception_type", Severity::Warning, 1.0,
                        format!("New exception type on {service}"),
                        format!("{} seen on {service} for the first time in the baseline window", row.exception_type),
                    );
                }
            }
        }
    }

    store.append("anomaly_scores", &tracker.scores).await?;
    Ok(tracker.findings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn baseline(mean: f64, stddev: f64) -> BaselineEntry {
        BaselineEntry { mean, stddev }
    }

    #[test]
    fn zscore_none_when_stddev_zero() {
        assert_eq!(zscore(10.0, baseline(5.0, 0.0)), None);
    }

    #[test]
    fn zscore_computes_standard_deviations_from_mean() {
        assert_eq!(zscore(15.0, baseline(5.0, 5.0)), Some(2.0));
        assert_eq!(zscore(0.0, baseline(5.0, 5.0)), Some(-1.0));
    }

    #[test]
    fn rising_severity_thresholds() {
        assert_eq!(rising_severity(2.0, 3.0), None);
        assert_eq!(rising_severity(3.5, 3.0), Some(Severity::Warning));
        assert_eq!(rising_severity(4.6, 3.0), Some(Severity::Critical));
    }

    #[test]
    fn dropping_severity_mirrors_rising_on_the_negative_side() {
        assert_eq!(dropping_severity(-2.0, 3.0), None);
        assert_eq!(dropping_severity(-3.5, 3.0), Some(Severity::Warning));
        assert_eq!(dropping_severity(-4.6, 3.0), Some(Severity::Critical));
    }

    #[test]
    fn sql_escape_doubles_single_quotes() {
        assert_eq!(sql_escape("O'Brien's"), "O''Brien''s");
    }

    #[test]
    fn dimension_names_strips_prefix_and_suffix() {
        let mut entries = HashMap::new();
        entries.insert(
            ("checkout".to_string(), "db_postgresql_latency".to_string()),
            baseline(1.0, 1.0),
        );
        entries.insert(
            ("checkout".to_string(), "db_redis_latency".to_string()),
            baseline(1.0, 1.0),
        );
        entries.insert(("checkout".to_string(), "error_rate".to_string()), baseline(1.0, 1.0));
        let baselines = Baselines { entries, known_exceptions: HashMap::new(), services: HashSet::new() };
        let mut dims = baselines.dimension_names("checkout", "db_", "_latency");
        dims.sort();
        assert_eq!(dims, vec!["postgresql".to_string(), "redis".to_string()]);
    }
}
