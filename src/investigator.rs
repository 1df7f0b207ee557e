//! Investigator (C9): LLM-driven root-cause investigation for newly-created
//! alerts. Talks to any OpenAI chat-completions-shaped endpoint the way the
//! teacher's anomaly handler does (same URL shape, Bearer auth, `choices[0]
//! .message.content` extraction), extended with a bounded `execute_sql` tool
//! loop so the model can pull its own supporting evidence instead of relying
//! on whatever context was stuffed into the prompt up front.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::config::LlmConfig;
use crate::rows::{AlertInvestigationRow, AlertRow};
use crate::store::Store;

const MAX_TOOL_ITERATIONS: usize = 5;
const SQL_ROW_LIMIT: usize = 20;

pub struct Investigator {
    cfg: LlmConfig,
    client: reqwest::Client,
    recent_dispatches: Mutex<VecDeque<OffsetDateTime>>,
    last_per_service: Mutex<HashMap<String, OffsetDateTime>>,
}

impl Investigator {
    pub fn new(cfg: LlmConfig) -> Self {
        Self {
            cfg,
            client: reqwest::Client::new(),
            recent_dispatches: Mutex::new(VecDeque::new()),
            last_per_service: Mutex::new(HashMap::new()),
        }
    }

    fn should_investigate(&self, alert: &AlertRow) -> bool {
        if !self.cfg.enabled() {
            return false;
        }
        if self.cfg.investigate_critical_only && alert.severity != "critical" {
            return false;
        }
        let now = OffsetDateTime::now_utc();
        {
            let mut recent = self.recent_dispatches.lock().unwrap();
            while let Some(front) = recent.front() {
                if now - *front > time::Duration::hours(1) {
                    recent.pop_front();
                } else {
                    break;
                }
            }
            if recent.len() >= self.cfg.max_investigations_per_hour {
                tracing::debug!("investigator: hourly cap reached, skipping alert {}", alert.alert_id);
                return false;
            }
        }
        {
            let last = self.last_per_service.lock().unwrap();
            if let Some(t) = last.get(&alert.service_name)
                && now - *t < time::Duration::minutes(self.cfg.investigation_service_cooldown_minutes) {
                    tracing::debug!("investigator: {} in cooldown, skipping alert {}", alert.service_name, alert.alert_id);
                    return false;
                }
        }
        true
    }

    fn record_dispatch(&self, alert: &AlertRow) {
        let now = OffsetDateTime::now_utc();
        self.recent_dispatches.lock().unwrap().push_back(now);
        self.last_per_service.lock().unwrap().insert(alert.service_name.clone(), now);
    }

    /// Investigates one newly-created alert, persisting exactly one
    /// `alert_investigations` row if it runs. A no-op if gated, if an
    /// investigation for this `alert_id` already exists, or if the LLM call
    /// fails outright (logged, not retried — the alert itself still stands).
    pub async fn investigate(&self, store: &Store, alert: &AlertRow) {
        if !self.should_investigate(alert) {
            return;
        }

        let existing = store
            .execute_read_json(
                &format!(
                    "SELECT count() AS c FROM observability.alert_investigations WHERE alert_id = '{}'",
                    sql_escape(&alert.alert_id)
                ),
                1,
            )
            .await
            .unwrap_or_default();
        let already_investigated = existing.first().and_then(|v| v.get("c")).and_then(|c| c.as_u64()).unwrap_or(0) > 0;
        if already_investigated {
            return;
        }

        self.record_dispatch(alert);

        match self.run(store, alert).await {
            Ok(outcome) => {
                let row = AlertInvestigationRow {
                    investigation_id: Uuid::new_v4().simple().to_string()[..8].to_string(),
                    alert_id: alert.alert_id.clone(),
                    investigated_at: OffsetDateTime::now_utc(),
                    service_name: alert.service_name.clone(),
                    alert_type: alert.alert_type.clone(),
                    model_used: self.cfg.model.clone(),
                    root_cause_summary: outcome.root_cause,
                    recommended_actions: outcome.actions,
                    supporting_evidence: outcome.evidence,
                    queries_executed: outcome.queries_executed as i32,
                    tokens_used: outcome.tokens_used as i32,
                };
                if let Err(e) = store.append("alert_investigations", std::slice::from_ref(&row)).await {
                    tracing::error!("failed to persist investigation for alert {}: {e}", alert.alert_id);
                }
            }
            Err(e) => tracing::error!("investigation failed for alert {}: {e}", alert.alert_id),
        }
    }

    async fn run(&self, store: &Store, alert: &AlertRow) -> anyhow::Result<Outcome> {
        let system_prompt = "You are an observability expert investigating an alert from a telemetry monitoring \
            system. You have a execute_sql tool that runs read-only SELECT statements against the ClickHouse \
            tables logs, metrics, spans, span_events, span_links, service_baselines, and anomaly_scores, all in \
            the observability database. Use it to gather supporting evidence — recent errors, slow spans, \
            exception stacktraces — before concluding. When you are done, respond with no further tool calls and \
            structure your final answer as:\n\
            ROOT CAUSE: <one or two sentence diagnosis>\n\
            EVIDENCE: <the specific data points that support it>\n\
            RECOMMENDED ACTIONS: <concrete next steps>";

        let user_msg = format!(
            "## Alert\n\
             - **Service**: {}\n\
             - **Type**: {}\n\
             - **Metric**: {}\n\
             - **Severity**: {}\n\
             - **Current value**: {:.4}\n\
             - **Baseline**: {:.4}\n\
             - **Z-score**: {:.2}\n\
             - **Title**: {}\n\
             - **Description**: {}\n",
            alert.service_name, alert.alert_type, alert.metric_type, alert.severity,
            alert.current_value, alert.baseline_value, alert.z_score,
            alert.title, alert.description,
        );

        let tools = json!([{
            "type": "function",
            "function": {
                "name": "execute_sql",
                "description": "Run a read-only SELECT against the observability ClickHouse database. Results truncate to 20 rows.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "sql": { "type": "string", "description": "A single SELECT statement." }
                    },
                    "required": ["sql"]
                }
            }
        }]);

        let mut messages = vec![
            json!({"role": "system", "content": system_prompt}),
            json!({"role": "user", "content": user_msg}),
        ];

        let llm_url = format!("{}/v1/chat/completions", self.cfg.base_url.trim_end_matches('/'));
        let api_key = self.cfg.api_key.as_deref().unwrap_or_default();
        let mut queries_executed = 0usize;
        let mut tokens_used = 0usize;

        for _ in 0..MAX_TOOL_ITERATIONS {
            let body = json!({
                "model": self.cfg.model,
                "messages": messages,
                "tools": tools,
                "max_completion_tokens": self.cfg.max_tokens,
            });

            let resp = self
                .client
                .post(&llm_url)
                .header("Authorization", format!("Bearer {api_key}"))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await?;

            if !resp.status().is_success() {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                anyhow::bail!("llm returned {status}: {text}");
            }

            let parsed: serde_json::Value = resp.json().await?;
            tokens_used += parsed["usage"]["total_tokens"].as_u64().unwrap_or(0) as usize;
            let message = parsed["choices"][0]["message"].clone();
            let tool_calls = message["tool_calls"].as_array().cloned().unwrap_or_default();

            if tool_calls.is_empty() {
                let content = message["content"].as_str().unwrap_or("No analysis returned from the model");
                let (root_cause, evidence, actions) = parse_structured(content);
                return Ok(Outcome { root_cause, evidence, actions, queries_executed, tokens_used });
            }

            messages.push(message);
            for call in &tool_calls {
                let call_id = call["id"].as_str().unwrap_or_default().to_string();
                let args: serde_json::Value = call["function"]["arguments"]
                    .as_str()
                    .and_then(|s| serde_json::from_str(s).ok())
                    .unwrap_or_else(|| json!({}));
                let sql = strip_trailing_semicolon(args["sql"].as_str().unwrap_or_default());

                let result_json = if is_select_only(sql) {
                    queries_executed += 1;
                    match store.execute_read_json(sql, SQL_ROW_LIMIT).await {
                        Ok(rows) => serde_json::to_string(&rows).unwrap_or_else(|_| "[]".to_string()),
                        Err(e) => json!({"error": e.to_string()}).to_string(),
                    }
                } else {
                    json!({"error": "only SELECT statements are permitted"}).to_string()
                };

                messages.push(json!({
                    "role": "tool",
                    "tool_call_id": call_id,
                    "content": result_json,
                }));
            }
        }

        anyhow::bail!("investigation of alert {} exceeded {MAX_TOOL_ITERATIONS} tool iterations", alert.alert_id)
    }
}

struct Outcome {
    root_cause: String,
    evidence: String,
    actions: String,
    queries_executed: usize,
    tokens_used: usize,
}

fn is_select_only(sql: &str) -> bool {
    sql.trim_start().get(..6).map(|s| s.eq_ignore_ascii_case("select")).unwrap_or(false)
}

fn strip_trailing_semicolon(sql: &str) -> &str {
    sql.trim_end().trim_end_matches(';')
}

/// Splits the model's final answer on its three section markers. Falls back
/// to the first sentence as the root cause if the model didn't follow the
/// requested structure.
fn parse_structured(content: &str) -> (String, String, String) {
    const MARKERS: [&str; 3] = ["ROOT CAUSE:", "EVIDENCE:", "RECOMMENDED ACTIONS:"];
    let mut sections: HashMap<&str, String> = HashMap::new();

    let upper = content.to_ascii_uppercase();
    let mut positions: Vec<(usize, &str)> = MARKERS
        .iter()
        .filter_map(|m| upper.find(m).map(|pos| (pos, *m)))
        .collect();
    positions.sort_by_key(|(pos, _)| *pos);

    for (i, (pos, marker)) in positions.iter().enumerate() {
        let start = pos + marker.len();
        let end = positions.get(i + 1).map(|(p, _)| *p).unwrap_or(content.len());
        sections.insert(marker, content[start..end].trim().to_string());
    }

    let root_cause = sections.get("ROOT CAUSE:").cloned().unwrap_or_else(|| {
        content.split(['\n']).next().unwrap_or(content).split('.').next().unwrap_or(content).trim().to_string()
    });
    let evidence = sections.get("EVIDENCE:").cloned().unwrap_or_default();
    let actions = sections.get("RECOMMENDED ACTIONS:").cloned().unwrap_or_default();
    (root_cause, evidence, actions)
}

fn sql_escape(s: &str) -> String {
    s.replace('\'', "''")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_structured_sections() {
        let content = "ROOT CAUSE: the database connection pool was exhausted.\n\
            EVIDENCE: 40 timeout errors in the last 5 minutes.\n\
            RECOMMENDED ACTIONS: increase pool size and add retry backoff.";
        let (rc, ev, act) = parse_structured(content);
        assert_eq!(rc, "the database connection pool was exhausted.");
        assert_eq!(ev, "40 timeout errors in the last 5 minutes.");
        assert_eq!(act, "increase pool size and add retry backoff.");
    }

    #[test]
    fn falls_back_to_first_sentence_when_unstructured() {
        let (rc, ev, act) = parse_structured("The checkout service is slow because of a downstream timeout. More detail follows.");
        assert_eq!(rc, "The checkout service is slow because of a downstream timeout");
        assert!(ev.is_empty());
        assert!(act.is_empty());
    }

    #[test]
    fn rejects_non_select_sql() {
        assert!(is_select_only("SELECT 1"));
        assert!(is_select_only("  select count() from logs"));
        assert!(!is_select_only("DROP TABLE logs"));
        assert!(!is_select_only("INSERT INTO logs VALUES (1)"));
    }

    #[test]
    fn strips_trailing_semicolon_and_whitespace() {
        assert_eq!(strip_trailing_semicolon("SELECT 1;"), "SELECT 1");
        assert_eq!(strip_trailing_semicolon("SELECT 1;  "), "SELECT 1");
        assert_eq!(strip_trailing_semicolon("SELECT 1"), "SELECT 1");
    }
}
