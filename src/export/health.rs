use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::engine::SyncStatsSnapshot;
use crate::notification::stats::NotificationStatsSnapshot;

const NAMESPACE: &str = "mgmt_aggregator";

/// Prometheus metrics for agent health and observability.
///
/// All metrics use the "mgmt_aggregator" namespace and carry a `resource`
/// label.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Raw transport messages received.
    pub notifications_received: CounterVec,
    /// Messages dropped (unparseable, foreign component, no sequence number).
    pub notifications_dropped: CounterVec,
    /// Notifications delivered to listeners, by measurement kind.
    pub notifications_dispatched: CounterVec,
    /// Per-attribute accept failures during fan-out.
    pub attribute_failures: CounterVec,
    /// Attribute declarations that failed to connect.
    pub attribute_connect_failures: CounterVec,
    /// Snapshot exchanges with the cluster store.
    pub sync_exchanges: CounterVec,
    /// Holders replaced by a fresher cluster snapshot.
    pub sync_loads: CounterVec,
    /// Failed snapshot exchanges.
    pub sync_failures: CounterVec,
    /// Periodic aggregator notifications emitted.
    pub aggregator_notifications_emitted: CounterVec,
    /// Attributes currently connected.
    pub attributes_connected: GaugeVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str, labels: &[&str]| -> Result<CounterVec> {
            let metric = CounterVec::new(Opts::new(name, help).namespace(NAMESPACE), labels)?;
            registry.register(Box::new(metric.clone()))?;
            Ok(metric)
        };

        let notifications_received = counter(
            "notifications_received_total",
            "Total raw measurement messages received.",
            &["resource"],
        )?;
        let notifications_dropped = counter(
            "notifications_dropped_total",
            "Total measurement messages dropped.",
            &["resource"],
        )?;
        let notifications_dispatched = counter(
            "notifications_dispatched_total",
            "Total notifications delivered, by measurement kind.",
            &["resource", "kind"],
        )?;
        let attribute_failures = counter(
            "attribute_failures_total",
            "Total per-attribute failures while applying notifications.",
            &["resource"],
        )?;
        let attribute_connect_failures = counter(
            "attribute_connect_failures_total",
            "Total attribute declarations that failed to connect.",
            &["resource"],
        )?;
        let sync_exchanges = counter(
            "sync_exchanges_total",
            "Total snapshot exchanges with the cluster store.",
            &["resource"],
        )?;
        let sync_loads = counter(
            "sync_loads_total",
            "Total metric holders replaced by a cluster snapshot.",
            &["resource"],
        )?;
        let sync_failures = counter(
            "sync_failures_total",
            "Total failed snapshot exchanges.",
            &["resource"],
        )?;
        let aggregator_notifications_emitted = counter(
            "aggregator_notifications_emitted_total",
            "Total periodic aggregator notifications emitted.",
            &["resource"],
        )?;

        let attributes_connected = GaugeVec::new(
            Opts::new("attributes_connected", "Number of connected attributes.")
                .namespace(NAMESPACE),
            &["resource"],
        )?;
        registry.register(Box::new(attributes_connected.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            notifications_received,
            notifications_dropped,
            notifications_dispatched,
            attribute_failures,
            attribute_connect_failures,
            sync_exchanges,
            sync_loads,
            sync_failures,
            aggregator_notifications_emitted,
            attributes_connected,
        })
    }

    /// Adds one drained notification statistics snapshot.
    pub fn record_notifications(&self, resource: &str, stats: &NotificationStatsSnapshot) {
        self.notifications_received
            .with_label_values(&[resource])
            .inc_by(stats.received as f64);
        self.notifications_dropped
            .with_label_values(&[resource])
            .inc_by(stats.dropped as f64);
        self.attribute_failures
            .with_label_values(&[resource])
            .inc_by(stats.attribute_failures as f64);
        for (kind, count) in &stats.delivered {
            if *count > 0 {
                self.notifications_dispatched
                    .with_label_values(&[resource, kind.as_str()])
                    .inc_by(*count as f64);
            }
        }
    }

    /// Adds one drained synchronization statistics snapshot.
    pub fn record_sync(&self, resource: &str, stats: &SyncStatsSnapshot) {
        self.sync_exchanges
            .with_label_values(&[resource])
            .inc_by(stats.exchanges as f64);
        self.sync_loads
            .with_label_values(&[resource])
            .inc_by(stats.loads as f64);
        self.sync_failures
            .with_label_values(&[resource])
            .inc_by(stats.failures as f64);
    }

    /// Renders every registered metric in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let bind_addr = bind_address(&self.addr, ":9090");

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Expands the ":port" shorthand to a wildcard bind address.
pub(crate) fn bind_address(addr: &str, default: &str) -> String {
    let addr = if addr.is_empty() { default } else { addr };
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

fn encode(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::MeasurementKind;

    #[test]
    fn test_bind_address_shorthand() {
        assert_eq!(bind_address(":9090", ":1"), "0.0.0.0:9090");
        assert_eq!(bind_address("", ":9090"), "0.0.0.0:9090");
        assert_eq!(bind_address("127.0.0.1:80", ":9090"), "127.0.0.1:80");
    }

    #[test]
    fn test_record_notifications_renders_labels() {
        let metrics = HealthMetrics::new(":0").expect("metrics");
        metrics.record_notifications(
            "orders",
            &NotificationStatsSnapshot {
                received: 3,
                dropped: 1,
                attribute_failures: 0,
                delivered: vec![
                    (MeasurementKind::ValueChanged, 2),
                    (MeasurementKind::Stopwatch, 0),
                ],
            },
        );
        metrics.record_sync(
            "orders",
            &SyncStatsSnapshot {
                exchanges: 4,
                loads: 1,
                failures: 0,
            },
        );
        metrics.attributes_connected.with_label_values(&["orders"]).set(2.0);

        let text = metrics.render().expect("render");
        assert!(text.contains("mgmt_aggregator_notifications_received_total{resource=\"orders\"} 3"));
        assert!(text.contains(
            "mgmt_aggregator_notifications_dispatched_total{kind=\"value_changed\",resource=\"orders\"} 2"
        ));
        assert!(!text.contains("kind=\"stopwatch\""));
        assert!(text.contains("mgmt_aggregator_sync_exchanges_total{resource=\"orders\"} 4"));
        assert!(text.contains("mgmt_aggregator_attributes_connected{resource=\"orders\"} 2"));
    }

    #[tokio::test]
    async fn test_server_serves_healthz() {
        let metrics = HealthMetrics::new("127.0.0.1:0").expect("metrics");
        metrics.start().await.expect("start");
        metrics.stop().await.expect("stop");
    }
}
