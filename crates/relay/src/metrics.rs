use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, OnceLock,
    },
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointMetricKey {
    endpoint: String,
    method: String,
}

type LabelCounters = Mutex<HashMap<String, u64>>;

#[derive(Default)]
pub struct ChatMetrics {
    request_duration_count: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_duration_sum_ms: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_errors_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_rate_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    ws_duration_count: LabelCounters,
    ws_duration_sum_ms: LabelCounters,
    ws_errors_total: LabelCounters,
    ws_rate_total: LabelCounters,
    cache_fallbacks_total: LabelCounters,
    room_joins_total: LabelCounters,
    broadcast_deliveries_total: AtomicU64,
    broadcast_dropped_total: AtomicU64,
    active_connections: AtomicI64,
}

const JOIN_OUTCOMES: [&str; 4] = ["joined", "restored", "rejoined", "failed"];
static GLOBAL_METRICS: OnceLock<Arc<ChatMetrics>> = OnceLock::new();

pub fn set_global_metrics(metrics: Arc<ChatMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

fn global_metrics() -> Option<&'static Arc<ChatMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_http_request(method: &str, path: &str, status_code: u16, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_http_request(method, path, status_code, latency_ms);
    }
}

pub fn record_ws_request(event: &str, is_error: bool, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_ws_request(event, is_error, latency_ms);
    }
}

pub fn record_cache_fallback(operation: &str) {
    if let Some(metrics) = global_metrics() {
        metrics.record_cache_fallback(operation);
    }
}

pub fn record_room_join(outcome: &str) {
    if let Some(metrics) = global_metrics() {
        metrics.record_room_join(outcome);
    }
}

pub fn record_broadcast(delivered: u64, dropped: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_broadcast(delivered, dropped);
    }
}

pub fn adjust_active_connections(delta: i64) {
    if let Some(metrics) = global_metrics() {
        metrics.active_connections.fetch_add(delta, Ordering::SeqCst);
    }
}

impl ChatMetrics {
    pub fn record_http_request(&self, method: &str, path: &str, status_code: u16, latency_ms: u64) {
        let key = EndpointMetricKey {
            endpoint: normalize_endpoint(path),
            method: method.to_ascii_uppercase(),
        };

        increment_counter(&self.request_rate_total, &key, 1);
        increment_counter(&self.request_duration_sum_ms, &key, latency_ms);
        increment_counter(&self.request_duration_count, &key, 1);
        if status_code >= 400 {
            increment_counter(&self.request_errors_total, &key, 1);
        }
    }

    pub fn record_ws_request(&self, event: &str, is_error: bool, latency_ms: u64) {
        let label = normalize_label(event);
        increment_label_counter(&self.ws_rate_total, &label, 1);
        increment_label_counter(&self.ws_duration_sum_ms, &label, latency_ms);
        increment_label_counter(&self.ws_duration_count, &label, 1);
        if is_error {
            increment_label_counter(&self.ws_errors_total, &label, 1);
        }
    }

    pub fn record_cache_fallback(&self, operation: &str) {
        increment_label_counter(&self.cache_fallbacks_total, &normalize_label(operation), 1);
    }

    pub fn record_room_join(&self, outcome: &str) {
        let normalized = normalize_label(outcome);
        let label = if JOIN_OUTCOMES.contains(&normalized.as_str()) { normalized } else { "unknown".into() };
        increment_label_counter(&self.room_joins_total, &label, 1);
    }

    pub fn record_broadcast(&self, delivered: u64, dropped: u64) {
        self.broadcast_deliveries_total.fetch_add(delivered, Ordering::SeqCst);
        self.broadcast_dropped_total.fetch_add(dropped, Ordering::SeqCst);
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP parley_request_rate_total Total HTTP requests by endpoint.\n");
        output.push_str("# TYPE parley_request_rate_total counter\n");
        append_counter_lines(&mut output, "parley_request_rate_total", &self.request_rate_total);

        output.push_str("# HELP parley_request_errors_total Total HTTP error responses by endpoint.\n");
        output.push_str("# TYPE parley_request_errors_total counter\n");
        append_counter_lines(&mut output, "parley_request_errors_total", &self.request_errors_total);

        output.push_str("# HELP parley_request_duration_ms_sum Sum of HTTP request latency in milliseconds by endpoint.\n");
        output.push_str("# TYPE parley_request_duration_ms_sum counter\n");
        append_counter_lines(
            &mut output,
            "parley_request_duration_ms_sum",
            &self.request_duration_sum_ms,
        );

        output.push_str("# HELP parley_request_duration_ms_count Count of HTTP request latency samples by endpoint.\n");
        output.push_str("# TYPE parley_request_duration_ms_count counter\n");
        append_counter_lines(
            &mut output,
            "parley_request_duration_ms_count",
            &self.request_duration_count,
        );

        output.push_str("# HELP parley_ws_rate_total Total websocket events by type.\n");
        output.push_str("# TYPE parley_ws_rate_total counter\n");
        append_label_counter_lines(&mut output, "parley_ws_rate_total", "event", &self.ws_rate_total);

        output.push_str("# HELP parley_ws_errors_total Total websocket events answered with an error.\n");
        output.push_str("# TYPE parley_ws_errors_total counter\n");
        append_label_counter_lines(&mut output, "parley_ws_errors_total", "event", &self.ws_errors_total);

        output.push_str("# HELP parley_ws_duration_ms_sum Sum of websocket event latency in milliseconds.\n");
        output.push_str("# TYPE parley_ws_duration_ms_sum counter\n");
        append_label_counter_lines(
            &mut output,
            "parley_ws_duration_ms_sum",
            "event",
            &self.ws_duration_sum_ms,
        );

        output.push_str("# HELP parley_ws_duration_ms_count Count of websocket latency samples.\n");
        output.push_str("# TYPE parley_ws_duration_ms_count counter\n");
        append_label_counter_lines(
            &mut output,
            "parley_ws_duration_ms_count",
            "event",
            &self.ws_duration_count,
        );

        output.push_str("# HELP parley_cache_fallbacks_total Cache calls that degraded to the durable store.\n");
        output.push_str("# TYPE parley_cache_fallbacks_total counter\n");
        append_label_counter_lines(
            &mut output,
            "parley_cache_fallbacks_total",
            "operation",
            &self.cache_fallbacks_total,
        );

        output.push_str("# HELP parley_room_joins_total Room join attempts by outcome.\n");
        output.push_str("# TYPE parley_room_joins_total counter\n");
        {
            let guard = lock(&self.room_joins_total);
            for outcome in JOIN_OUTCOMES.iter().copied().chain(["unknown"]) {
                let value = guard.get(outcome).copied().unwrap_or(0);
                output.push_str(&format!("parley_room_joins_total{{outcome=\"{outcome}\"}} {value}\n"));
            }
        }

        output.push_str("# HELP parley_broadcast_deliveries_total Events handed to subscriber queues.\n");
        output.push_str("# TYPE parley_broadcast_deliveries_total counter\n");
        output.push_str(&format!(
            "parley_broadcast_deliveries_total {}\n",
            self.broadcast_deliveries_total.load(Ordering::SeqCst)
        ));

        output.push_str("# HELP parley_broadcast_dropped_total Events dropped because the subscriber was gone.\n");
        output.push_str("# TYPE parley_broadcast_dropped_total counter\n");
        output.push_str(&format!(
            "parley_broadcast_dropped_total {}\n",
            self.broadcast_dropped_total.load(Ordering::SeqCst)
        ));

        output.push_str("# HELP parley_active_connections Open websocket connections.\n");
        output.push_str("# TYPE parley_active_connections gauge\n");
        output.push_str(&format!(
            "parley_active_connections {}\n",
            self.active_connections.load(Ordering::SeqCst).max(0)
        ));

        output
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn normalize_endpoint(path: &str) -> String {
    let segments: Vec<&str> = path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            if uuid::Uuid::parse_str(segment).is_ok() {
                "{uuid}"
            } else if segment.chars().all(|character| character.is_ascii_digit()) {
                "{number}"
            } else {
                segment
            }
        })
        .collect();

    format!("/{}", segments.join("/"))
}

fn normalize_label(value: &str) -> String {
    let normalized = value.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        "unknown".to_string()
    } else {
        normalized
    }
}

fn increment_counter(
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
    key: &EndpointMetricKey,
    delta: u64,
) {
    let mut guard = lock(map);
    let value = guard.entry(key.clone()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn increment_label_counter(map: &LabelCounters, label: &str, delta: u64) {
    let mut guard = lock(map);
    let value = guard.entry(label.to_string()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
) {
    let guard = lock(map);
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left_key, _), (right_key, _)| {
        left_key
            .method
            .cmp(&right_key.method)
            .then_with(|| left_key.endpoint.cmp(&right_key.endpoint))
    });

    for (key, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{method=\"{}\",endpoint=\"{}\"}} {value}\n",
            escape_label_value(&key.method),
            escape_label_value(&key.endpoint),
        ));
    }
}

fn append_label_counter_lines(
    output: &mut String,
    metric_name: &str,
    label_name: &str,
    map: &LabelCounters,
) {
    let guard = lock(map);
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (label, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{{label_name}=\"{}\"}} {value}\n",
            escape_label_value(label),
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::ChatMetrics;

    #[test]
    fn render_prometheus_includes_http_ws_and_room_metrics() {
        let metrics = ChatMetrics::default();
        metrics.record_http_request("post", "/v1/sessions", 201, 12);
        metrics.record_http_request("DELETE", "/v1/sessions", 503, 30);
        metrics.record_ws_request("join_room", false, 11);
        metrics.record_ws_request("join_room", true, 19);
        metrics.record_cache_fallback("session_load");
        metrics.record_room_join("joined");
        metrics.record_room_join("rejoined");
        metrics.record_room_join("bogus");
        metrics.record_broadcast(3, 1);

        let rendered = metrics.render_prometheus();

        assert!(rendered.contains("parley_request_rate_total{method=\"POST\",endpoint=\"/v1/sessions\"} 1"));
        assert!(rendered.contains("parley_request_errors_total{method=\"DELETE\",endpoint=\"/v1/sessions\"} 1"));
        assert!(rendered.contains("parley_ws_rate_total{event=\"join_room\"} 2"));
        assert!(rendered.contains("parley_ws_errors_total{event=\"join_room\"} 1"));
        assert!(rendered.contains("parley_cache_fallbacks_total{operation=\"session_load\"} 1"));
        assert!(rendered.contains("parley_room_joins_total{outcome=\"joined\"} 1"));
        assert!(rendered.contains("parley_room_joins_total{outcome=\"failed\"} 0"));
        assert!(rendered.contains("parley_room_joins_total{outcome=\"unknown\"} 1"));
        assert!(rendered.contains("parley_broadcast_deliveries_total 3"));
        assert!(rendered.contains("parley_broadcast_dropped_total 1"));
        assert!(rendered.contains("parley_active_connections 0"));
    }

    #[test]
    fn endpoint_normalization_collapses_ids() {
        let metrics = ChatMetrics::default();
        metrics.record_http_request(
            "GET",
            "/v1/rooms/00000000-0000-0000-0000-000000000001/messages/42",
            200,
            1,
        );

        let rendered = metrics.render_prometheus();
        assert!(rendered.contains("endpoint=\"/v1/rooms/{uuid}/messages/{number}\""));
    }
}
