use clickhouse::Client;

/// Ordered list of DDL statements for the analytic + engine schema. Every
/// statement is idempotent (`IF NOT EXISTS`) so it is safe to run on every
/// startup, the same contract as the teacher's `migrations.rs`.
const MIGRATIONS: &[&str] = &[
    "CREATE DATABASE IF NOT EXISTS observability",

    // ── logs ──
    r"CREATE TABLE IF NOT EXISTS observability.logs
(
    timestamp        DateTime64(9, 'UTC') CODEC(Delta, ZSTD(1)),
    service_name     LowCardinality(String) CODEC(ZSTD(1)),
    severity_number  Int32 CODEC(ZSTD(1)),
    severity_text    LowCardinality(String) CODEC(ZSTD(1)),
    body_text        String CODEC(ZSTD(1)),
    trace_id         String CODEC(ZSTD(1)),
    span_id          String CODEC(ZSTD(1)),
    attributes_json  String CODEC(ZSTD(1)),
    INDEX idx_trace_id trace_id TYPE bloom_filter(0.001) GRANULARITY 1
)
ENGINE = MergeTree
PARTITION BY toDate(timestamp)
ORDER BY (service_name, timestamp)
SETTINGS index_granularity = 8192, ttl_only_drop_parts = 1",

    // ── metrics (one row per fanned-out data point) ──
    r"CREATE TABLE IF NOT EXISTS observability.metrics
(
    timestamp        DateTime64(9, 'UTC') CODEC(Delta, ZSTD(1)),
    service_name     LowCardinality(String) CODEC(ZSTD(1)),
    metric_name      LowCardinality(String) CODEC(ZSTD(1)),
    metric_unit      LowCardinality(String) CODEC(ZSTD(1)),
    value_double     Float64 CODEC(Gorilla, ZSTD(1)),
    attributes_flat  String CODEC(ZSTD(1))
)
ENGINE = MergeTree
PARTITION BY toDate(timestamp)
ORDER BY (service_name, metric_name, timestamp)
SETTINGS index_granularity = 8192, ttl_only_drop_parts = 1",

    // ── spans ──
    r"CREATE TABLE IF NOT EXISTS observability.spans
(
    trace_id         String CODEC(ZSTD(1)),
    span_id          String CODEC(ZSTD(1)),
    parent_span_id   String CODEC(ZSTD(1)),
    start_time       DateTime64(9, 'UTC') CODEC(Delta, ZSTD(1)),
    duration_ns      Int64 CODEC(ZSTD(1)),
    service_name     LowCardinality(String) CODEC(ZSTD(1)),
    span_name        LowCardinality(String) CODEC(ZSTD(1)),
    span_kind        LowCardinality(String) CODEC(ZSTD(1)),
    status_code      LowCardinality(String) CODEC(ZSTD(1)),
    http_status      Int32 CODEC(ZSTD(1)),
    db_system        LowCardinality(String) CODEC(ZSTD(1)),
    INDEX idx_trace_id trace_id TYPE bloom_filter(0.001) GRANULARITY 1,
    INDEX idx_parent_span parent_span_id TYPE bloom_filter(0.001) GRANULARITY 1
)
ENGINE = MergeTree
PARTITION BY toDate(start_time)
ORDER BY (service_name, span_name, start_time)
SETTINGS index_granularity = 8192, ttl_only_drop_parts = 1",

    // ── span_events ──
    r"CREATE TABLE IF NOT EXISTS observability.span_events
(
    timestamp              DateTime64(9, 'UTC') CODEC(Delta, ZSTD(1)),
    trace_id               String CODEC(ZSTD(1)),
    span_id                String CODEC(ZSTD(1)),
    service_name           LowCardinality(String) CODEC(ZSTD(1)),
    span_name              LowCardinality(String) CODEC(ZSTD(1)),
    event_name             LowCardinality(String) CODEC(ZSTD(1)),
    event_attributes_json  String CODEC(ZSTD(1)),
    exception_type         String CODEC(ZSTD(1)),
    exception_message      String CODEC(ZSTD(1)),
    exception_stacktrace   String CODEC(ZSTD(1)),
    gen_ai_system               LowCardinality(String) CODEC(ZSTD(1)),
    gen_ai_request_model        LowCardinality(String) CODEC(ZSTD(1)),
    gen_ai_usage_input_tokens   Int32 CODEC(ZSTD(1)),
    gen_ai_usage_output_tokens  Int32 CODEC(ZSTD(1)),
    INDEX idx_trace_id trace_id TYPE bloom_filter(0.001) GRANULARITY 1,
    INDEX idx_exception_type exception_type TYPE bloom_filter(0.01) GRANULARITY 1
)
ENGINE = MergeTree
PARTITION BY toDate(timestamp)
ORDER BY (service_name, timestamp)
SETTINGS index_granularity = 8192, ttl_only_drop_parts = 1",

    // ── span_links ──
    r"CREATE TABLE IF NOT EXISTS observability.span_links
(
    trace_id             String CODEC(ZSTD(1)),
    span_id              String CODEC(ZSTD(1)),
    service_name         LowCardinality(String) CODEC(ZSTD(1)),
    span_name            LowCardinality(String) CODEC(ZSTD(1)),
    linked_trace_id      String CODEC(ZSTD(1)),
    linked_span_id       String CODEC(ZSTD(1)),
    linked_trace_state   String CODEC(ZSTD(1)),
    link_attributes_json String CODEC(ZSTD(1))
)
ENGINE = MergeTree
PARTITION BY toDate(now())
ORDER BY (trace_id, span_id)
SETTINGS index_granularity = 8192",

    // ── service_baselines (append-only, latest row per service/metric_type wins) ──
    r"CREATE TABLE IF NOT EXISTS observability.service_baselines
(
    computed_at                DateTime64(9, 'UTC') CODEC(Delta, ZSTD(1)),
    service_name               LowCardinality(String) CODEC(ZSTD(1)),
    metric_type                LowCardinality(String) CODEC(ZSTD(1)),
    baseline_mean              Float64 CODEC(ZSTD(1)),
    baseline_stddev            Float64 CODEC(ZSTD(1)),
    baseline_min               Float64 CODEC(ZSTD(1)),
    baseline_max               Float64 CODEC(ZSTD(1)),
    baseline_p50               Float64 CODEC(ZSTD(1)),
    baseline_p95               Float64 CODEC(ZSTD(1)),
    baseline_p99               Float64 CODEC(ZSTD(1)),
    sample_count               Int32 CODEC(ZSTD(1)),
    window_hours               Int32 CODEC(ZSTD(1)),
    known_exception_types_json String CODEC(ZSTD(1))
)
ENGINE = MergeTree
PARTITION BY toYYYYMM(computed_at)
ORDER BY (service_name, metric_type, computed_at)
SETTINGS index_granularity = 8192",

    // ── anomaly_scores ──
    r"CREATE TABLE IF NOT EXISTS observability.anomaly_scores
(
    timestamp        DateTime64(9, 'UTC') CODEC(Delta, ZSTD(1)),
    service_name     LowCardinality(String) CODEC(ZSTD(1)),
    metric_type      LowCardinality(String) CODEC(ZSTD(1)),
    current_value    Float64 CODEC(ZSTD(1)),
    expected_value   Float64 CODEC(ZSTD(1)),
    baseline_mean    Float64 CODEC(ZSTD(1)),
    baseline_stddev  Float64 CODEC(ZSTD(1)),
    z_score          Float64 CODEC(ZSTD(1)),
    anomaly_score    Float64 CODEC(ZSTD(1)),
    is_anomaly       Bool CODEC(ZSTD(1)),
    detection_method LowCardinality(String) CODEC(ZSTD(1))
)
ENGINE = MergeTree
PARTITION BY toDate(timestamp)
ORDER BY (service_name, metric_type, timestamp)
SETTINGS index_granularity = 8192, ttl_only_drop_parts = 1",

    // ── alerts (the one table the engine UPDATEs) ──
    r"CREATE TABLE IF NOT EXISTS observability.alerts
(
    alert_id        String,
    created_at      DateTime64(9, 'UTC') CODEC(Delta, ZSTD(1)),
    updated_at      DateTime64(9, 'UTC') CODEC(Delta, ZSTD(1)),
    service_name    LowCardinality(String) CODEC(ZSTD(1)),
    alert_type      LowCardinality(String) CODEC(ZSTD(1)),
    severity        LowCardinality(String) CODEC(ZSTD(1)),
    title           String CODEC(ZSTD(1)),
    description     String CODEC(ZSTD(1)),
    metric_type     LowCardinality(String) CODEC(ZSTD(1)),
    current_value   Float64 CODEC(ZSTD(1)),
    threshold_value Float64 CODEC(ZSTD(1)),
    baseline_value  Float64 CODEC(ZSTD(1)),
    z_score         Float64 CODEC(ZSTD(1)),
    status          LowCardinality(String) CODEC(ZSTD(1)),
    resolved_at     Nullable(DateTime64(9, 'UTC')) CODEC(ZSTD(1)),
    auto_resolved   Bool CODEC(ZSTD(1))
)
ENGINE = ReplacingMergeTree(updated_at)
ORDER BY alert_id
SETTINGS index_granularity = 8192",

    // ── alert_investigations (appended once per alert) ──
    r"CREATE TABLE IF NOT EXISTS observability.alert_investigations
(
    investigation_id    String,
    alert_id            String CODEC(ZSTD(1)),
    investigated_at     DateTime64(9, 'UTC') CODEC(Delta, ZSTD(1)),
    service_name        LowCardinality(String) CODEC(ZSTD(1)),
    alert_type          LowCardinality(String) CODEC(ZSTD(1)),
    model_used          LowCardinality(String) CODEC(ZSTD(1)),
    root_cause_summary  String CODEC(ZSTD(1)),
    recommended_actions String CODEC(ZSTD(1)),
    supporting_evidence String CODEC(ZSTD(1)),
    queries_executed    Int32 CODEC(ZSTD(1)),
    tokens_used         Int32 CODEC(ZSTD(1)),
    INDEX idx_alert_id alert_id TYPE bloom_filter(0.001) GRANULARITY 1
)
ENGINE = MergeTree
ORDER BY (alert_id, investigated_at)
SETTINGS index_granularity = 8192",
];

/// Run all migrations against ClickHouse. Connects without a default database
/// first so `CREATE DATABASE` succeeds on a fresh instance; every later
/// statement is `IF NOT EXISTS` so re-running this on every startup is a no-op.
pub async fn run(url: &str, user: &str, password: &str) -> anyhow::Result<()> {
    let client = Client::default()
        .with_url(url)
        .with_user(user)
        .with_password(password);

    tracing::info!("running clickhouse migrations ({} statements)", MIGRATIONS.len());

    for (i, sql) in MIGRATIONS.iter().enumerate() {
        let preview: String = sql.chars().take(80).collect();
        tracing::debug!("migration {}/{}: {}...", i + 1, MIGRATIONS.len(), preview);
        client.query(sql).execute().await.map_err(|e| {
            tracing::error!("migration {}/{} failed: {e}", i + 1, MIGRATIONS.len());
            e
        })?;
    }

    tracing::info!("clickhouse migrations complete");
    Ok(())
}
