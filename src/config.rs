use std::collections::HashMap;

/// Top-level config, assembled entirely from the environment (see `Config::from_env`).
/// Mirrors the env-var-with-defaults style the teacher's `main.rs` uses for its
/// ClickHouse/SMTP settings, centralized into one constructor instead of scattered
/// `std::env::var` calls at each call site.
#[derive(Debug, Clone)]
pub struct Config {
    pub bus: BusConfig,
    pub store: StoreConfig,
    pub batch: BatchConfig,
    pub detection: DetectionConfig,
    pub thresholds: ThresholdConfig,
    pub root_cause: RootCauseConfig,
    pub llm: LlmConfig,
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    pub bootstrap_servers: Vec<String>,
    pub group_id: String,
    pub logs_topic: String,
    pub traces_topic: String,
    pub metrics_topic: String,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub url: String,
    pub database: String,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub batch_timeout: std::time::Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct DetectionConfig {
    pub detection_interval_secs: u64,
    pub baseline_interval_secs: u64,
    pub baseline_window_hours: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct ThresholdConfig {
    pub zscore_threshold: f64,
    pub error_rate_warning: f64,
    pub error_rate_critical: f64,
    pub min_samples_for_baseline: usize,
    pub alert_cooldown_minutes: i64,
}

#[derive(Debug, Clone)]
pub struct RootCauseConfig {
    pub enabled: bool,
    /// Empty = all categories enabled.
    pub enabled_types: Vec<String>,
    pub threshold_multipliers: HashMap<String, f64>,
    pub adaptive_thresholds_enabled: bool,
    pub adaptive_threshold_adjustment: f64,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub max_investigations_per_hour: usize,
    pub investigation_service_cooldown_minutes: i64,
    pub investigate_critical_only: bool,
    pub max_tokens: u32,
}

impl LlmConfig {
    pub fn enabled(&self) -> bool {
        self.api_key.is_some()
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// `key:value,key:value` → map, tolerant of blanks and unparsable entries (skipped, not fatal).
fn parse_multiplier_csv(raw: &str) -> HashMap<String, f64> {
    raw.split(',')
        .filter_map(|pair| {
            let (k, v) = pair.split_once(':')?;
            let k = k.trim();
            let v: f64 = v.trim().parse().ok()?;
            if k.is_empty() {
                return None;
            }
            Some((k.to_string(), v))
        })
        .collect()
}

fn parse_csv_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    /// Load config from the environment. A missing/unparsable required value
    /// (store endpoint, bus bootstrap servers) is a configuration error —
    /// the caller is expected to abort the process with exit code 1.
    pub fn from_env() -> anyhow::Result<Self> {
        let bootstrap_servers = parse_csv_list(&env_or("OTEL_BUS_BOOTSTRAP_SERVERS", "localhost:9092"));
        if bootstrap_servers.is_empty() {
            anyhow::bail!("OTEL_BUS_BOOTSTRAP_SERVERS must name at least one broker");
        }

        let bus = BusConfig {
            bootstrap_servers,
            group_id: env_or("OTEL_BUS_GROUP_ID", "wide-telemetry-engine"),
            logs_topic: env_or("OTEL_BUS_LOGS_TOPIC", "otel-logs"),
            traces_topic: env_or("OTEL_BUS_TRACES_TOPIC", "otel-traces"),
            metrics_topic: env_or("OTEL_BUS_METRICS_TOPIC", "otel-metrics"),
        };

        let store = StoreConfig {
            url: env_or("CLICKHOUSE_URL", "http://localhost:8123"),
            database: env_or("CLICKHOUSE_DATABASE", "observability"),
            user: env_or("CLICKHOUSE_USER", "default"),
            password: std::env::var("CLICKHOUSE_PASSWORD").unwrap_or_default(),
        };

        let batch = BatchConfig {
            batch_size: env_parse("WIDE_BATCH_SIZE", 1000),
            batch_timeout: std::time::Duration::from_secs_f64(env_parse("WIDE_BATCH_TIMEOUT_SECONDS", 5.0)),
        };

        let detection = DetectionConfig {
            detection_interval_secs: env_parse("WIDE_DETECTION_INTERVAL", 60),
            baseline_interval_secs: env_parse("WIDE_BASELINE_INTERVAL", 3600),
            baseline_window_hours: env_parse("WIDE_BASELINE_WINDOW_HOURS", 24),
        };

        let thresholds = ThresholdConfig {
            zscore_threshold: env_parse("WIDE_ZSCORE_THRESHOLD", 3.0),
            error_rate_warning: env_parse("WIDE_ERROR_RATE_WARNING", 0.05),
            error_rate_critical: env_parse("WIDE_ERROR_RATE_CRITICAL", 0.20),
            min_samples_for_baseline: env_parse("WIDE_MIN_SAMPLES_FOR_BASELINE", 10),
            alert_cooldown_minutes: env_parse("WIDE_ALERT_COOLDOWN_MINUTES", 15),
        };

        let root_cause = RootCauseConfig {
            enabled: env_parse("WIDE_ROOT_CAUSE_ENABLED", true),
            enabled_types: parse_csv_list(&env_or("WIDE_ROOT_CAUSE_TYPES", "")),
            threshold_multipliers: parse_multiplier_csv(&env_or(
                "WIDE_ROOT_CAUSE_THRESHOLD_MULTIPLIERS",
                "",
            )),
            adaptive_thresholds_enabled: env_parse("WIDE_ADAPTIVE_THRESHOLDS_ENABLED", true),
            adaptive_threshold_adjustment: env_parse("WIDE_ADAPTIVE_THRESHOLD_ADJUSTMENT", 0.1),
        };

        let llm = LlmConfig {
            base_url: env_or("LLM_BASE_URL", "https://api.openai.com"),
            api_key: std::env::var("LLM_API_KEY").ok().filter(|k| !k.is_empty()),
            model: env_or("LLM_MODEL", "gpt-5"),
            max_investigations_per_hour: env_parse("WIDE_MAX_INVESTIGATIONS_PER_HOUR", 5),
            investigation_service_cooldown_minutes: env_parse(
                "WIDE_INVESTIGATION_SERVICE_COOLDOWN_MINUTES",
                30,
            ),
            investigate_critical_only: env_parse("WIDE_INVESTIGATE_CRITICAL_ONLY", false),
            max_tokens: env_parse("WIDE_LLM_MAX_TOKENS", 4096),
        };

        Ok(Self {
            bus,
            store,
            batch,
            detection,
            thresholds,
            root_cause,
            llm,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiplier_csv_parses_and_skips_garbage() {
        let m = parse_multiplier_csv("db_error:0.8,dependency_error:0.9,garbage,:1.0,empty_val:");
        assert_eq!(m.get("db_error"), Some(&0.8));
        assert_eq!(m.get("dependency_error"), Some(&0.9));
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn csv_list_trims_and_drops_blanks() {
        let l = parse_csv_list(" a, b ,, c");
        assert_eq!(l, vec!["a", "b", "c"]);
    }

    #[test]
    fn empty_csv_list_is_empty() {
        assert!(parse_csv_list("").is_empty());
    }
}
