//! OTLP-JSON -> row record translation. Pure functions, no I/O: every
//! public entry point takes a `serde_json::Value` and returns row structs
//! ready for the batch buffer, skipping malformed sub-records with a logged
//! warning instead of aborting the whole request.

use std::collections::BTreeMap;

use serde_json::Value;
use time::OffsetDateTime;

use crate::rows::{LogRow, MetricRow, SpanEventRow, SpanLinkRow, SpanRow};

/// A recursive OTLP `AnyValue`.
#[derive(Debug, Clone, PartialEq)]
pub enum AnyValue {
    String(String),
    Int64(i64),
    Float64(f64),
    Bool(bool),
    Bytes(String),
    Array(Vec<AnyValue>),
    KvList(BTreeMap<String, AnyValue>),
    Null,
}

impl AnyValue {
    /// Parse one OTLP `AnyValue` JSON object: `{"stringValue": "..."}`, etc.
    pub fn from_json(v: &Value) -> Self {
        let Some(obj) = v.as_object() else {
            return AnyValue::Null;
        };
        if let Some(s) = obj.get("stringValue").and_then(Value::as_str) {
            return AnyValue::String(s.to_string());
        }
        if let Some(s) = obj.get("intValue") {
            return AnyValue::Int64(safe_int(s));
        }
        if let Some(f) = obj.get("doubleValue") {
            return AnyValue::Float64(safe_float(f));
        }
        if let Some(b) = obj.get("boolValue").and_then(Value::as_bool) {
            return AnyValue::Bool(b);
        }
        if let Some(b) = obj.get("bytesValue").and_then(Value::as_str) {
            return AnyValue::Bytes(b.to_string());
        }
        if let Some(arr) = obj.get("arrayValue").and_then(|a| a.get("values")).and_then(Value::as_array) {
            return AnyValue::Array(arr.iter().map(AnyValue::from_json).collect());
        }
        if let Some(kvs) = obj.get("kvlistValue").and_then(|k| k.get("values")).and_then(Value::as_array) {
            let mut map = BTreeMap::new();
            for kv in kvs {
                if let Some(key) = kv.get("key").and_then(Value::as_str) {
                    let val = kv.get("value").map(AnyValue::from_json).unwrap_or(AnyValue::Null);
                    map.insert(key.to_string(), val);
                }
            }
            return AnyValue::KvList(map);
        }
        AnyValue::Null
    }

    /// Render as a JSON-ish scalar for flattening into `attributes_json`/`attributes_flat`.
    pub fn to_flat_string(&self) -> String {
        match self {
            AnyValue::String(s) => s.clone(),
            AnyValue::Int64(i) => i.to_string(),
            AnyValue::Float64(f) => f.to_string(),
            AnyValue::Bool(b) => b.to_string(),
            AnyValue::Bytes(b) => b.clone(),
            AnyValue::Null => String::new(),
            AnyValue::Array(_) | AnyValue::KvList(_) => self.to_json().to_string(),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            AnyValue::String(s) => Value::String(s.clone()),
            AnyValue::Int64(i) => Value::from(*i),
            AnyValue::Float64(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            AnyValue::Bool(b) => Value::Bool(*b),
            AnyValue::Bytes(b) => Value::String(b.clone()),
            AnyValue::Null => Value::Null,
            AnyValue::Array(items) => Value::Array(items.iter().map(AnyValue::to_json).collect()),
            AnyValue::KvList(map) => {
                Value::Object(map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
            }
        }
    }
}

/// `string | int | float | null` -> i64, never panics. Unparsable/missing -> 0.
pub fn safe_int(v: &Value) -> i64 {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

/// `string | int | float | null` -> f64, never panics. Unparsable/missing -> 0.0.
pub fn safe_float(v: &Value) -> f64 {
    match v {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn otlp_attrs_to_map(attrs: &Value) -> BTreeMap<String, AnyValue> {
    let mut map = BTreeMap::new();
    let Some(arr) = attrs.as_array() else { return map };
    for kv in arr {
        if let Some(key) = kv.get("key").and_then(Value::as_str) {
            let val = kv.get("value").map(AnyValue::from_json).unwrap_or(AnyValue::Null);
            map.insert(key.to_string(), val);
        }
    }
    map
}

/// Extract `service.name` from resource attributes, removing it from the map
/// in place so it doesn't leak back into `attributes_json`.
fn extract_service_name(resource_attrs: &mut BTreeMap<String, AnyValue>) -> String {
    resource_attrs
        .remove("service.name")
        .map(|v| v.to_flat_string())
        .unwrap_or_default()
}

/// Compact JSON object serialization of an attribute map, used by
/// logs/spans/events/links.
fn attrs_to_json_string(map: &BTreeMap<String, AnyValue>) -> String {
    let obj: serde_json::Map<String, Value> =
        map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect();
    Value::Object(obj).to_string()
}

/// `k=v,k=v,...` with keys sorted (BTreeMap iteration order is already sorted),
/// used as the coarse metric dimension key.
fn attrs_to_flat_string(map: &BTreeMap<String, AnyValue>) -> String {
    map.iter()
        .map(|(k, v)| format!("{k}={}", v.to_flat_string()))
        .collect::<Vec<_>>()
        .join(",")
}

fn nanos_to_datetime(nanos: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(nanos as i128).unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

pub const SPAN_KIND_NAMES: [&str; 6] = ["UNSPECIFIED", "INTERNAL", "SERVER", "CLIENT", "PRODUCER", "CONSUMER"];
pub const STATUS_CODE_NAMES: [&str; 3] = ["UNSET", "OK", "ERROR"];

fn enum_name(tables: &[&str], idx: &Value) -> String {
    let i = safe_int(idx) as usize;
    tables.get(i).map(|s| s.to_string()).unwrap_or_else(|| tables[0].to_string())
}

/// Decode one `ExportLogsServiceRequest` JSON body into `logs` rows.
pub fn decode_logs(request: &Value) -> Vec<LogRow> {
    let mut out = Vec::new();
    let Some(resource_logs) = request.get("resourceLogs").and_then(Value::as_array) else {
        return out;
    };
    for rl in resource_logs {
        let mut resource_attrs = rl
            .get("resource")
            .and_then(|r| r.get("attributes"))
            .map(otlp_attrs_to_map)
            .unwrap_or_default();
        let service_name = extract_service_name(&mut resource_attrs);

        let Some(scope_logs) = rl.get("scopeLogs").and_then(Value::as_array) else {
            tracing::warn!("decode_logs: skipping resourceLogs entry with no scopeLogs array");
            continue;
        };
        for sl in scope_logs {
            let scope = sl.get("scope");
            let scope_name = scope.and_then(|s| s.get("name")).and_then(Value::as_str).unwrap_or_default();
            let scope_version = scope.and_then(|s| s.get("version")).and_then(Value::as_str).unwrap_or_default();

            let Some(log_records) = sl.get("logRecords").and_then(Value::as_array) else {
                tracing::warn!("decode_logs: skipping scopeLogs entry with no logRecords array");
                continue;
            };
            for lr in log_records {
                if !lr.is_object() {
                    tracing::warn!("decode_logs: skipping malformed log record (not a JSON object)");
                    continue;
                }

                let timestamp_nanos = lr
                    .get("timeUnixNano")
                    .or_else(|| lr.get("observedTimeUnixNano"))
                    .map(safe_int)
                    .unwrap_or(0);

                let body_text = lr
                    .get("body")
                    .map(AnyValue::from_json)
                    .map(|v| v.to_flat_string())
                    .unwrap_or_default();

                let severity_text = lr.get("severityText").and_then(Value::as_str).unwrap_or_default();

                if timestamp_nanos == 0 && body_text.is_empty() && severity_text.is_empty() {
                    tracing::warn!("decode_logs: skipping log record with no timestamp, body, or severity");
                    continue;
                }

                let mut merged = resource_attrs.clone();
                if !scope_name.is_empty() {
                    merged.insert("otel.scope.name".to_string(), AnyValue::String(scope_name.to_string()));
                }
                if !scope_version.is_empty() {
                    merged.insert("otel.scope.version".to_string(), AnyValue::String(scope_version.to_string()));
                }
                let record_attrs = lr.get("attributes").map(otlp_attrs_to_map).unwrap_or_default();
                merged.extend(record_attrs);

                out.push(LogRow {
                    timestamp: nanos_to_datetime(timestamp_nanos),
                    service_name: service_name.clone(),
                    severity_number: lr.get("severityNumber").map(|v| safe_int(v) as i32).unwrap_or(0),
                    severity_text: severity_text.to_string(),
                    body_text,
                    trace_id: lr.get("traceId").and_then(Value::as_str).unwrap_or_default().to_string(),
                    span_id: lr.get("spanId").and_then(Value::as_str).unwrap_or_default().to_string(),
                    attributes_json: attrs_to_json_string(&merged),
                });
            }
        }
    }
    out
}

/// Names a fanned-out metric row before it's stamped with `timestamp`/`service_name`.
struct RawMetricPoint {
    name_suffix: String,
    unit: String,
    value: f64,
    attrs: String,
}

/// Decode one `ExportMetricsServiceRequest` JSON body into `metrics` rows,
/// fanning out histograms/summaries.
pub fn decode_metrics(request: &Value) -> Vec<MetricRow> {
    let mut out = Vec::new();
    let Some(resource_metrics) = request.get("resourceMetrics").and_then(Value::as_array) else {
        return out;
    };
    for rm in resource_metrics {
        let mut resource_attrs = rm
            .get("resource")
            .and_then(|r| r.get("attributes"))
            .map(otlp_attrs_to_map)
            .unwrap_or_default();
        let service_name = extract_service_name(&mut resource_attrs);

        let Some(scope_metrics) = rm.get("scopeMetrics").and_then(Value::as_array) else {
            tracing::warn!("decode_metrics: skipping resourceMetrics entry with no scopeMetrics array");
            continue;
        };
        for sm in scope_metrics {
            let Some(metrics) = sm.get("metrics").and_then(Value::as_array) else {
                tracing::warn!("decode_metrics: skipping scopeMetrics entry with no metrics array");
                continue;
            };
            for metric in metrics {
                let name = metric.get("name").and_then(Value::as_str).unwrap_or_default();
                let unit = metric.get("unit").and_then(Value::as_str).unwrap_or_default().to_string();

                let gauge = metric.get("gauge").and_then(|g| g.get("dataPoints")).and_then(Value::as_array);
                let sum = metric.get("sum").and_then(|g| g.get("dataPoints")).and_then(Value::as_array);
                let hist = metric.get("histogram").and_then(|g| g.get("dataPoints")).and_then(Value::as_array);
                let summ = metric.get("summary").and_then(|g| g.get("dataPoints")).and_then(Value::as_array);

                if name.is_empty() || (gauge.is_none() && sum.is_none() && hist.is_none() && summ.is_none()) {
                    tracing::warn!("decode_metrics: skipping malformed metric (no name or no recognized data points)");
                    continue;
                }

                if let Some(gauge) = gauge {
                    for dp in gauge {
                        out.extend(number_points(dp, name, &unit, "", &service_name));
                    }
                }
                if let Some(sum) = sum {
                    for dp in sum {
                        out.extend(number_points(dp, name, &unit, "", &service_name));
                    }
                }
                if let Some(hist) = hist {
                    for dp in hist {
                        for point in histogram_points(dp, &unit) {
                            out.push(stamp(point, name, &service_name, dp));
                        }
                    }
                }
                if let Some(summ) = summ {
                    for dp in summ {
                        for point in summary_points(dp, &unit) {
                            out.push(stamp(point, name, &service_name, dp));
                        }
                    }
                }
            }
        }
    }
    out
}

fn number_points(dp: &Value, name: &str, unit: &str, suffix: &str, service_name: &str) -> Vec<MetricRow> {
    let Some(value) = dp.get("asDouble").map(safe_float).or_else(|| dp.get("asInt").map(|v| safe_int(v) as f64)) else {
        tracing::warn!("decode_metrics: skipping data point for '{name}' with neither asDouble nor asInt");
        return Vec::new();
    };
    let point = RawMetricPoint {
        name_suffix: suffix.to_string(),
        unit: unit.to_string(),
        value,
        attrs: attrs_to_flat_string(&dp.get("attributes").map(otlp_attrs_to_map).unwrap_or_default()),
    };
    vec![stamp(point, name, service_name, dp)]
}

fn histogram_points(dp: &Value, unit: &str) -> Vec<RawMetricPoint> {
    let attrs = attrs_to_flat_string(&dp.get("attributes").map(otlp_attrs_to_map).unwrap_or_default());
    let mut points = Vec::new();
    let count = dp.get("count").map(safe_int).unwrap_or(0);
    points.push(RawMetricPoint { name_suffix: ".count".to_string(), unit: unit.to_string(), value: count as f64, attrs: attrs.clone() });
    if let Some(sum) = dp.get("sum") {
        points.push(RawMetricPoint { name_suffix: ".sum".to_string(), unit: unit.to_string(), value: safe_float(sum), attrs: attrs.clone() });
    }
    if let Some(min) = dp.get("min") {
        points.push(RawMetricPoint { name_suffix: ".min".to_string(), unit: unit.to_string(), value: safe_float(min), attrs: attrs.clone() });
    }
    if let Some(max) = dp.get("max") {
        points.push(RawMetricPoint { name_suffix: ".max".to_string(), unit: unit.to_string(), value: safe_float(max), attrs });
    }
    points
}

fn summary_points(dp: &Value, unit: &str) -> Vec<RawMetricPoint> {
    let attrs = attrs_to_flat_string(&dp.get("attributes").map(otlp_attrs_to_map).unwrap_or_default());
    let mut points = Vec::new();
    let count = dp.get("count").map(safe_int).unwrap_or(0);
    points.push(RawMetricPoint { name_suffix: ".count".to_string(), unit: unit.to_string(), value: count as f64, attrs: attrs.clone() });
    if let Some(sum) = dp.get("sum") {
        points.push(RawMetricPoint { name_suffix: ".sum".to_string(), unit: unit.to_string(), value: safe_float(sum), attrs: attrs.clone() });
    }
    if let Some(qvs) = dp.get("quantileValues").and_then(Value::as_array) {
        for qv in qvs {
            let quantile = qv.get("quantile").map(safe_float).unwrap_or(0.0);
            let value = qv.get("value").map(safe_float).unwrap_or(0.0);
            let p = (quantile * 100.0).round() as i64;
            points.push(RawMetricPoint {
                name_suffix: format!(".p{p}"),
                unit: unit.to_string(),
                value,
                attrs: attrs.clone(),
            });
        }
    }
    points
}

fn stamp(point: RawMetricPoint, name: &str, service_name: &str, dp: &Value) -> MetricRow {
    let timestamp_nanos = dp
        .get("timeUnixNano")
        .or_else(|| dp.get("startTimeUnixNano"))
        .map(safe_int)
        .unwrap_or(0);
    MetricRow {
        timestamp: nanos_to_datetime(timestamp_nanos),
        service_name: service_name.to_string(),
        metric_name: format!("{name}{}", &point.name_suffix),
        metric_unit: point.unit,
        value_double: point.value,
        attributes_flat: point.attrs,
    }
}

/// Decoded span plus its events/links, so callers can insert into all three
/// span-shaped tables from one decode pass.
pub struct DecodedSpan {
    pub span: SpanRow,
    pub events: Vec<SpanEventRow>,
    pub links: Vec<SpanLinkRow>,
}

fn promote_http_status(attrs: &BTreeMap<String, AnyValue>) -> i32 {
    attrs
        .get("http.status_code")
        .or_else(|| attrs.get("http.response.status_code"))
        .map(|v| v.to_flat_string().parse().unwrap_or(0))
        .unwrap_or(0)
}

/// Decode one `ExportTraceServiceRequest` JSON body into spans/events/links.
pub fn decode_traces(request: &Value) -> Vec<DecodedSpan> {
    let mut out = Vec::new();
    let Some(resource_spans) = request.get("resourceSpans").and_then(Value::as_array) else {
        return out;
    };
    for rs in resource_spans {
        let mut resource_attrs = rs
            .get("resource")
            .and_then(|r| r.get("attributes"))
            .map(otlp_attrs_to_map)
            .unwrap_or_default();
        let service_name = extract_service_name(&mut resource_attrs);

        let Some(scope_spans) = rs.get("scopeSpans").and_then(Value::as_array) else {
            tracing::warn!("decode_traces: skipping resourceSpans entry with no scopeSpans array");
            continue;
        };
        for ss in scope_spans {
            let Some(spans) = ss.get("spans").and_then(Value::as_array) else {
                tracing::warn!("decode_traces: skipping scopeSpans entry with no spans array");
                continue;
            };
            for span in spans {
                let trace_id = span.get("traceId").and_then(Value::as_str).unwrap_or_default().to_string();
                let span_id = span.get("spanId").and_then(Value::as_str).unwrap_or_default().to_string();

                if trace_id.is_empty() || span_id.is_empty() {
                    tracing::warn!("decode_traces: skipping span with missing traceId or spanId");
                    continue;
                }

                let span_name = span.get("name").and_then(Value::as_str).unwrap_or_default().to_string();

                let start_nanos = span.get("startTimeUnixNano").map(safe_int).unwrap_or(0);
                let end_nanos = span.get("endTimeUnixNano").map(safe_int).unwrap_or(0);
                let duration_ns = if start_nanos > 0 && end_nanos > 0 { end_nanos - start_nanos } else { 0 };

                let mut span_attrs = resource_attrs.clone();
                span_attrs.extend(span.get("attributes").map(otlp_attrs_to_map).unwrap_or_default());

                let status_code = span
                    .get("status")
                    .and_then(|s| s.get("code"))
                    .map(|v| enum_name(&STATUS_CODE_NAMES, v))
                    .unwrap_or_else(|| STATUS_CODE_NAMES[0].to_string());

                let span_row = SpanRow {
                    trace_id: trace_id.clone(),
                    span_id: span_id.clone(),
                    parent_span_id: span.get("parentSpanId").and_then(Value::as_str).unwrap_or_default().to_string(),
                    start_time: nanos_to_datetime(start_nanos),
                    duration_ns: duration_ns.max(0),
                    service_name: service_name.clone(),
                    span_name: span_name.clone(),
                    span_kind: span.get("kind").map(|v| enum_name(&SPAN_KIND_NAMES, v)).unwrap_or_else(|| SPAN_KIND_NAMES[0].to_string()),
                    status_code,
                    http_status: promote_http_status(&span_attrs),
                    db_system: span_attrs.get("db.system").map(|v| v.to_flat_string()).unwrap_or_default(),
                };

                let mut events = Vec::new();
                if let Some(evs) = span.get("events").and_then(Value::as_array) {
                    for ev in evs {
                        events.push(decode_span_event(ev, &trace_id, &span_id, &service_name, &span_name));
                    }
                }

                let mut links = Vec::new();
                if let Some(lks) = span.get("links").and_then(Value::as_array) {
                    for lk in lks {
                        let link_attrs = lk.get("attributes").map(otlp_attrs_to_map).unwrap_or_default();
                        links.push(SpanLinkRow {
                            trace_id: trace_id.clone(),
                            span_id: span_id.clone(),
                            service_name: service_name.clone(),
                            span_name: span_name.clone(),
                            linked_trace_id: lk.get("traceId").and_then(Value::as_str).unwrap_or_default().to_string(),
                            linked_span_id: lk.get("spanId").and_then(Value::as_str).unwrap_or_default().to_string(),
                            linked_trace_state: lk.get("traceState").and_then(Value::as_str).unwrap_or_default().to_string(),
                            link_attributes_json: attrs_to_json_string(&link_attrs),
                        });
                    }
                }

                out.push(DecodedSpan { span: span_row, events, links });
            }
        }
    }
    out
}

fn decode_span_event(ev: &Value, trace_id: &str, span_id: &str, service_name: &str, span_name: &str) -> SpanEventRow {
    let attrs = ev.get("attributes").map(otlp_attrs_to_map).unwrap_or_default();
    let timestamp_nanos = ev.get("timeUnixNano").map(safe_int).unwrap_or(0);
    let get = |k: &str| attrs.get(k).map(|v| v.to_flat_string()).unwrap_or_default();
    let get_int = |k: &str| attrs.get(k).map(|v| v.to_flat_string().parse().unwrap_or(0)).unwrap_or(0);

    SpanEventRow {
        timestamp: nanos_to_datetime(timestamp_nanos),
        trace_id: trace_id.to_string(),
        span_id: span_id.to_string(),
        service_name: service_name.to_string(),
        span_name: span_name.to_string(),
        event_name: ev.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
        event_attributes_json: attrs_to_json_string(&attrs),
        exception_type: get("exception.type"),
        exception_message: get("exception.message"),
        exception_stacktrace: get("exception.stacktrace"),
        gen_ai_system: get("gen_ai.system"),
        gen_ai_request_model: get("gen_ai.request.model"),
        gen_ai_usage_input_tokens: get_int("gen_ai.usage.input_tokens"),
        gen_ai_usage_output_tokens: get_int("gen_ai.usage.output_tokens"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn safe_int_coerces_string_and_float_and_null() {
        assert_eq!(safe_int(&json!("42")), 42);
        assert_eq!(safe_int(&json!(42.0)), 42);
        assert_eq!(safe_int(&json!(null)), 0);
        assert_eq!(safe_int(&json!("garbage")), 0);
    }

    #[test]
    fn safe_float_coerces_string_and_int_and_null() {
        assert_eq!(safe_float(&json!("3.5")), 3.5);
        assert_eq!(safe_float(&json!(3)), 3.0);
        assert_eq!(safe_float(&json!(null)), 0.0);
    }

    #[test]
    fn any_value_parses_nested_kvlist() {
        let v = json!({
            "kvlistValue": {
                "values": [
                    {"key": "a", "value": {"stringValue": "x"}},
                    {"key": "b", "value": {"intValue": "7"}}
                ]
            }
        });
        let parsed = AnyValue::from_json(&v);
        match parsed {
            AnyValue::KvList(m) => {
                assert_eq!(m.get("a"), Some(&AnyValue::String("x".into())));
                assert_eq!(m.get("b"), Some(&AnyValue::Int64(7)));
            }
            _ => panic!("expected kvlist"),
        }
    }

    #[test]
    fn attrs_flat_string_is_sorted_regardless_of_input_order() {
        let mut m1 = BTreeMap::new();
        m1.insert("zeta".to_string(), AnyValue::String("1".into()));
        m1.insert("alpha".to_string(), AnyValue::String("2".into()));
        assert_eq!(attrs_to_flat_string(&m1), "alpha=2,zeta=1");
    }

    fn log_request(body: &str, severity: i64) -> Value {
        json!({
            "resourceLogs": [{
                "resource": {"attributes": [{"key": "service.name", "value": {"stringValue": "checkout"}}]},
                "scopeLogs": [{
                    "scope": {"name": "mylib", "version": "1.0"},
                    "logRecords": [{
                        "timeUnixNano": "1700000000000000000",
                        "severityNumber": severity,
                        "severityText": "ERROR",
                        "body": {"stringValue": body},
                        "traceId": "abc123",
                        "spanId": "def456",
                        "attributes": []
                    }]
                }]
            }]
        })
    }

    #[test]
    fn decode_logs_extracts_service_name_and_removes_from_attrs() {
        let req = log_request("boom", 17);
        let rows = decode_logs(&req);
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.service_name, "checkout");
        assert_eq!(row.severity_number, 17);
        assert_eq!(row.body_text, "boom");
        assert_eq!(row.trace_id, "abc123");
        assert!(!row.attributes_json.contains("service.name"));
        assert!(row.attributes_json.contains("otel.scope.name"));
    }

    #[test]
    fn decode_logs_is_idempotent_across_repeated_parses() {
        let req = log_request("steady", 9);
        let first = decode_logs(&req);
        let second = decode_logs(&req);
        assert_eq!(first.len(), second.len());
        assert_eq!(first[0].body_text, second[0].body_text);
        assert_eq!(first[0].trace_id, second[0].trace_id);
    }

    #[test]
    fn decode_metrics_fans_out_histogram_into_four_rows() {
        let req = json!({
            "resourceMetrics": [{
                "resource": {"attributes": [{"key": "service.name", "value": {"stringValue": "frontend"}}]},
                "scopeMetrics": [{
                    "metrics": [{
                        "name": "http.server.duration",
                        "unit": "ms",
                        "histogram": {
                            "dataPoints": [{
                                "timeUnixNano": "1700000000000000000",
                                "count": "100",
                                "sum": 250.5,
                                "min": 1.0,
                                "max": 10.0,
                                "attributes": [
                                    {"key": "http.method", "value": {"stringValue": "GET"}},
                                    {"key": "http.route", "value": {"stringValue": "/x"}}
                                ]
                            }]
                        }
                    }]
                }]
            }]
        });
        let rows = decode_metrics(&req);
        assert_eq!(rows.len(), 4);
        let names: Vec<_> = rows.iter().map(|r| r.metric_name.as_str()).collect();
        assert!(names.contains(&"http.server.duration.count"));
        assert!(names.contains(&"http.server.duration.sum"));
        assert!(names.contains(&"http.server.duration.min"));
        assert!(names.contains(&"http.server.duration.max"));
        for row in &rows {
            assert_eq!(row.attributes_flat, "http.method=GET,http.route=/x");
        }
        let count_row = rows.iter().find(|r| r.metric_name.ends_with(".count")).unwrap();
        assert_eq!(count_row.value_double, 100.0);
    }

    #[test]
    fn decode_traces_computes_duration_and_promotes_http_status() {
        let req = json!({
            "resourceSpans": [{
                "resource": {"attributes": [{"key": "service.name", "value": {"stringValue": "checkout"}}]},
                "scopeSpans": [{
                    "spans": [{
                        "traceId": "t1",
                        "spanId": "s1",
                        "parentSpanId": "",
                        "name": "POST /cart",
                        "kind": 2,
                        "startTimeUnixNano": "1000",
                        "endTimeUnixNano": "5000",
                        "status": {"code": 2},
                        "attributes": [
                            {"key": "http.status_code", "value": {"intValue": "500"}}
                        ],
                        "events": [{
                            "timeUnixNano": "2000",
                            "name": "exception",
                            "attributes": [
                                {"key": "exception.type", "value": {"stringValue": "NullPointerException"}},
                                {"key": "exception.message", "value": {"stringValue": "npe"}}
                            ]
                        }],
                        "links": []
                    }]
                }]
            }]
        });
        let decoded = decode_traces(&req);
        assert_eq!(decoded.len(), 1);
        let d = &decoded[0];
        assert_eq!(d.span.duration_ns, 4000);
        assert_eq!(d.span.span_kind, "SERVER");
        assert_eq!(d.span.status_code, "ERROR");
        assert_eq!(d.span.http_status, 500);
        assert_eq!(d.events.len(), 1);
        assert_eq!(d.events[0].exception_type, "NullPointerException");
        assert_eq!(d.events[0].exception_message, "npe");
        assert!(d.links.is_empty());
    }

    #[test]
    fn decode_traces_skips_missing_arrays_without_panicking() {
        let req = json!({"resourceSpans": [{"scopeSpans": [{"spans": []}]}]});
        let decoded = decode_traces(&req);
        assert!(decoded.is_empty());
    }

    #[test]
    fn decode_traces_drops_span_missing_trace_or_span_id() {
        let req = json!({
            "resourceSpans": [{
                "scopeSpans": [{
                    "spans": [{"name": "orphan", "startTimeUnixNano": "1000", "endTimeUnixNano": "2000"}]
                }]
            }]
        });
        assert!(decode_traces(&req).is_empty());
    }

    #[test]
    fn decode_logs_drops_degenerate_record() {
        let req = json!({
            "resourceLogs": [{
                "resource": {"attributes": []},
                "scopeLogs": [{"logRecords": [{}]}]
            }]
        });
        assert!(decode_logs(&req).is_empty());
    }

    #[test]
    fn decode_metrics_drops_unrecognized_metric_and_valueless_point() {
        let req = json!({
            "resourceMetrics": [{
                "scopeMetrics": [{
                    "metrics": [
                        {"name": "no.points"},
                        {"name": "http.requests", "gauge": {"dataPoints": [{"attributes": []}]}}
                    ]
                }]
            }]
        });
        assert!(decode_metrics(&req).is_empty());
    }
}
