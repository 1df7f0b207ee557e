//! Row types for the nine analytic/engine tables, one `clickhouse::Row` struct
//! per table, in the order they're defined in `migrations.rs`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, clickhouse::Row)]
pub struct LogRow {
    #[serde(with = "clickhouse::serde::time::datetime64::nanos")]
    pub timestamp: time::OffsetDateTime,
    pub service_name: String,
    pub severity_number: i32,
    pub severity_text: String,
    pub body_text: String,
    pub trace_id: String,
    pub span_id: String,
    pub attributes_json: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, clickhouse::Row)]
pub struct MetricRow {
    #[serde(with = "clickhouse::serde::time::datetime64::nanos")]
    pub timestamp: time::OffsetDateTime,
    pub service_name: String,
    pub metric_name: String,
    pub metric_unit: String,
    pub value_double: f64,
    pub attributes_flat: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, clickhouse::Row)]
pub struct SpanRow {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: String,
    #[serde(with = "clickhouse::serde::time::datetime64::nanos")]
    pub start_time: time::OffsetDateTime,
    pub duration_ns: i64,
    pub service_name: String,
    pub span_name: String,
    pub span_kind: String,
    pub status_code: String,
    pub http_status: i32,
    pub db_system: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, clickhouse::Row)]
pub struct SpanEventRow {
    #[serde(with = "clickhouse::serde::time::datetime64::nanos")]
    pub timestamp: time::OffsetDateTime,
    pub trace_id: String,
    pub span_id: String,
    pub service_name: String,
    pub span_name: String,
    pub event_name: String,
    pub event_attributes_json: String,
    pub exception_type: String,
    pub exception_message: String,
    pub exception_stacktrace: String,
    pub gen_ai_system: String,
    pub gen_ai_request_model: String,
    pub gen_ai_usage_input_tokens: i32,
    pub gen_ai_usage_output_tokens: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, clickhouse::Row)]
pub struct SpanLinkRow {
    pub trace_id: String,
    pub span_id: String,
    pub service_name: String,
    pub span_name: String,
    pub linked_trace_id: String,
    pub linked_span_id: String,
    pub linked_trace_state: String,
    pub link_attributes_json: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, clickhouse::Row)]
pub struct ServiceBaselineRow {
    #[serde(with = "clickhouse::serde::time::datetime64::nanos")]
    pub computed_at: time::OffsetDateTime,
    pub service_name: String,
    pub metric_type: String,
    pub baseline_mean: f64,
    pub baseline_stddev: f64,
    pub baseline_min: f64,
    pub baseline_max: f64,
    pub baseline_p50: f64,
    pub baseline_p95: f64,
    pub baseline_p99: f64,
    pub sample_count: i32,
    pub window_hours: i32,
    pub known_exception_types_json: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, clickhouse::Row)]
pub struct AnomalyScoreRow {
    #[serde(with = "clickhouse::serde::time::datetime64::nanos")]
    pub timestamp: time::OffsetDateTime,
    pub service_name: String,
    pub metric_type: String,
    pub current_value: f64,
    pub expected_value: f64,
    pub baseline_mean: f64,
    pub baseline_stddev: f64,
    pub z_score: f64,
    pub anomaly_score: f64,
    pub is_anomaly: bool,
    pub detection_method: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, clickhouse::Row)]
pub struct AlertRow {
    pub alert_id: String,
    #[serde(with = "clickhouse::serde::time::datetime64::nanos")]
    pub created_at: time::OffsetDateTime,
    #[serde(with = "clickhouse::serde::time::datetime64::nanos")]
    pub updated_at: time::OffsetDateTime,
    pub service_name: String,
    pub alert_type: String,
    pub severity: String,
    pub title: String,
    pub description: String,
    pub metric_type: String,
    pub current_value: f64,
    pub threshold_value: f64,
    pub baseline_value: f64,
    pub z_score: f64,
    pub status: String,
    #[serde(with = "clickhouse::serde::time::datetime64::nanos::option")]
    pub resolved_at: Option<time::OffsetDateTime>,
    pub auto_resolved: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, clickhouse::Row)]
pub struct AlertInvestigationRow {
    pub investigation_id: String,
    pub alert_id: String,
    #[serde(with = "clickhouse::serde::time::datetime64::nanos")]
    pub investigated_at: time::OffsetDateTime,
    pub service_name: String,
    pub alert_type: String,
    pub model_used: String,
    pub root_cause_summary: String,
    pub recommended_actions: String,
    pub supporting_evidence: String,
    pub queries_executed: i32,
    pub tokens_used: i32,
}
