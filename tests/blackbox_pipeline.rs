use std::sync::Arc;

use parking_lot::Mutex;

use mgmt_aggregator::cluster::{ClusterContext, InMemorySnapshotStore, LocalCounter};
use mgmt_aggregator::descriptor::{keys, Descriptor};
use mgmt_aggregator::engine::MessageDrivenResource;
use mgmt_aggregator::error::AttributeError;
use mgmt_aggregator::notification::dispatcher::Headers;
use mgmt_aggregator::notification::listener::NotificationListener;
use mgmt_aggregator::notification::MeasurementNotification;
use mgmt_aggregator::value::Value;

fn declare(kind: &str) -> Descriptor {
    Descriptor::new().with(keys::NAME, kind)
}

async fn resource_with(params: &Descriptor, decls: &[(&str, &str)]) -> MessageDrivenResource {
    let resource = MessageDrivenResource::new("orders", params, &ClusterContext::local(true))
        .expect("resource");
    for (id, kind) in decls {
        resource.connect(id, &declare(kind)).await.expect("connect");
    }
    resource
}

async fn field(resource: &MessageDrivenResource, attribute: &str, name: &str) -> Value {
    match resource.get_value(attribute).await.expect("value") {
        Value::Composite(view) => view.get(name).cloned().expect("field present"),
        other => panic!("expected composite view, got {other:?}"),
    }
}

#[derive(Default)]
struct SequenceRecorder {
    sequences: Mutex<Vec<u64>>,
}

impl NotificationListener for SequenceRecorder {
    fn handle_notification(&self, notification: &MeasurementNotification) {
        self.sequences.lock().push(notification.sequence);
    }
}

#[tokio::test]
async fn test_raw_messages_drive_every_metric() {
    let resource = resource_with(
        &Descriptor::new(),
        &[
            ("hits", "gauge64"),
            ("latency", "timer"),
            ("traffic", "rate"),
            ("healthy", "flag"),
            ("status", "stringGauge"),
        ],
    )
    .await;
    let headers = Headers::new();

    for body in [
        r#"{"kind":"valueChanged","integer":5}"#,
        r#"{"kind":"valueChanged","integer":9}"#,
        r#"{"kind":"stopwatch","durationMs":120}"#,
        r#"{"kind":"flag","value":true}"#,
        r#"{"kind":"flag","value":false}"#,
        r#"{"kind":"text","value":"degraded"}"#,
    ] {
        assert!(resource.handle(&headers, body.as_bytes()).await, "{body}");
    }

    assert_eq!(field(&resource, "hits", "lastValue").await, Value::Int(9));
    assert_eq!(field(&resource, "hits", "maxValue").await, Value::Int(9));
    assert_eq!(field(&resource, "hits", "count").await, Value::Int(2));
    assert_eq!(field(&resource, "latency", "lastValue").await, Value::Int(120));
    assert_eq!(field(&resource, "traffic", "totalRate").await, Value::Int(6));
    assert_eq!(field(&resource, "healthy", "trueCount").await, Value::Int(1));
    assert_eq!(field(&resource, "healthy", "falseCount").await, Value::Int(1));
    assert_eq!(
        field(&resource, "status", "lastValue").await,
        Value::Text("degraded".to_string())
    );

    let stats = resource.dispatcher().stats().snapshot();
    assert_eq!(stats.received, 6);
    assert_eq!(stats.dropped, 0);
    assert_eq!(stats.delivered_total(), 6);

    resource.close().await;
}

#[tokio::test]
async fn test_identity_resolution_and_drops() {
    let params = Descriptor::new()
        .with(keys::COMPONENT_NAME, "db")
        .with(keys::COMPONENT_INSTANCE, "primary");
    let resource = resource_with(&params, &[("hits", "gauge64")]).await;
    let recorder = Arc::new(ConsumerRecorder::default());
    resource.add_listener(Arc::clone(&recorder) as Arc<dyn NotificationListener>);

    let mut headers = Headers::new();
    headers.insert("ComponentInstance".to_string(), "replica".to_string());
    headers.insert("Message".to_string(), "from header".to_string());
    let body = br#"{"kind":"valueChanged","integer":1}"#;
    assert!(resource.handle(&headers, body).await);

    // Payload identity wins over headers.
    let body = br#"{"kind":"valueChanged","integer":2,"componentInstance":"other","message":"inline"}"#;
    assert!(resource.handle(&headers, body).await);

    // Other components, empty bodies and garbage are dropped.
    let foreign = br#"{"kind":"valueChanged","integer":3,"componentName":"cache"}"#;
    assert!(!resource.handle(&Headers::new(), foreign).await);
    assert!(!resource.handle(&Headers::new(), b"").await);
    assert!(!resource.handle(&Headers::new(), b"null").await);
    assert!(!resource.handle(&Headers::new(), b"{\"kind\":").await);

    let seen = recorder.seen.lock().clone();
    assert_eq!(
        seen,
        vec![
            ("replica".to_string(), "from header".to_string()),
            ("other".to_string(), "inline".to_string()),
        ]
    );
    assert_eq!(field(&resource, "hits", "count").await, Value::Int(2));

    let stats = resource.dispatcher().stats().snapshot();
    assert_eq!(stats.received, 6);
    assert_eq!(stats.dropped, 4);

    resource.close().await;
}

#[derive(Default)]
struct ConsumerRecorder {
    seen: Mutex<Vec<(String, String)>>,
}

impl NotificationListener for ConsumerRecorder {
    fn handle_notification(&self, notification: &MeasurementNotification) {
        self.seen.lock().push((
            notification.source.component_instance.clone(),
            notification.message.clone(),
        ));
    }
}

#[tokio::test]
async fn test_regex_parser_resource() {
    let params = Descriptor::new()
        .with(keys::PARSER_LANGUAGE, "regex")
        .with(
            keys::PARSER_SCRIPT,
            r"^(?P<kind>\w+)=(?P<value>\S+)(?: (?P<message>.*))?$",
        );
    let resource = resource_with(&params, &[("hits", "gauge64"), ("latency", "timer")]).await;

    assert!(resource.handle(&Headers::new(), b"valueChanged=12 checkout").await);
    assert!(resource.handle(&Headers::new(), b"stopwatch=40").await);
    assert!(!resource.handle(&Headers::new(), b"no match here").await);

    assert_eq!(field(&resource, "hits", "lastValue").await, Value::Int(12));
    assert_eq!(field(&resource, "latency", "count").await, Value::Int(1));

    resource.close().await;
}

#[tokio::test]
async fn test_filter_and_extraction() {
    let resource = resource_with(&Descriptor::new(), &[]).await;
    resource
        .connect(
            "checkout",
            &declare("gauge64").with(keys::FILTER, "^checkout"),
        )
        .await
        .expect("connect");
    resource
        .connect("lastCheckout", &declare("get lastValue of gauge64 checkout"))
        .await
        .expect("connect");

    let body = |v: i64, message: &str| {
        format!(r#"{{"kind":"valueChanged","integer":{v},"message":"{message}"}}"#)
    };
    assert!(resource.handle(&Headers::new(), body(4, "checkout ok").as_bytes()).await);
    assert!(resource.handle(&Headers::new(), body(99, "login").as_bytes()).await);

    assert_eq!(resource.get_value("lastCheckout").await, Ok(Value::Int(4)));

    assert!(matches!(
        resource
            .connect("bad", &declare("get median of gauge64 checkout"))
            .await,
        Err(AttributeError::UnrecognizedExtractor { .. })
    ));
    assert!(matches!(
        resource.connect("bad", &declare("bogus")).await,
        Err(AttributeError::UnrecognizedAttributeType(_))
    ));
    assert!(resource.registry().get("bad").is_none());

    resource.close().await;
}

#[tokio::test]
async fn test_reset_operations() {
    let resource = resource_with(&Descriptor::new(), &[("a", "gauge64"), ("b", "rate")]).await;
    resource
        .connect("view", &declare("get count of gauge64 a"))
        .await
        .expect("connect");
    let body = br#"{"kind":"valueChanged","integer":7}"#;
    assert!(resource.handle(&Headers::new(), body).await);

    assert!(resource.reset_metric("a"));
    assert!(!resource.reset_metric("view"));
    assert!(!resource.reset_metric("missing"));
    assert_eq!(field(&resource, "a", "count").await, Value::Int(0));
    assert_eq!(field(&resource, "b", "totalRate").await, Value::Int(1));

    assert_eq!(resource.reset_all_metrics(), 2);
    assert_eq!(field(&resource, "b", "totalRate").await, Value::Int(0));

    resource.close().await;
    assert_eq!(
        resource.get_value("a").await,
        Err(AttributeError::AttributeNotFound("a".to_string()))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_transport_keeps_order_and_counts() {
    let resource = Arc::new(
        resource_with(
            &Descriptor::new().with(keys::WORKERS, "8"),
            &[("hits", "gauge64"), ("latency", "timer")],
        )
        .await,
    );
    let recorder = Arc::new(SequenceRecorder::default());
    resource.add_listener(Arc::clone(&recorder) as Arc<dyn NotificationListener>);

    let mut tasks = Vec::new();
    for task in 0..8i64 {
        let resource = Arc::clone(&resource);
        tasks.push(tokio::spawn(async move {
            for i in 0..50i64 {
                let body = format!(r#"{{"kind":"valueChanged","integer":{}}}"#, task * 100 + i);
                assert!(resource.handle(&Headers::new(), body.as_bytes()).await);
            }
        }));
    }
    for task in tasks {
        task.await.expect("sender task");
    }

    assert_eq!(field(&resource, "hits", "count").await, Value::Int(400));
    assert_eq!(field(&resource, "hits", "maxValue").await, Value::Int(749));
    assert_eq!(field(&resource, "latency", "count").await, Value::Int(0));

    let sequences = recorder.sequences.lock().clone();
    assert_eq!(sequences.len(), 400);
    assert!(sequences.windows(2).all(|w| w[0] < w[1]));

    resource.close().await;
}

#[tokio::test]
async fn test_two_nodes_converge_through_shared_store() {
    let store = Arc::new(InMemorySnapshotStore::new());
    let counter = Arc::new(LocalCounter::new());
    let node = |active: bool| ClusterContext {
        counter: counter.clone(),
        store: store.clone(),
        ..ClusterContext::local(active)
    };

    let standby = MessageDrivenResource::new("orders", &Descriptor::new(), &node(false))
        .expect("standby");
    standby.connect("hits", &declare("gauge64")).await.expect("connect");
    let active = MessageDrivenResource::new("orders", &Descriptor::new(), &node(true))
        .expect("active");
    active.connect("hits", &declare("gauge64")).await.expect("connect");

    for v in [3, 8] {
        let body = format!(r#"{{"kind":"valueChanged","integer":{v}}}"#);
        assert!(active.handle(&Headers::new(), body.as_bytes()).await);
    }

    let report = active.synchronizer().synchronize_once().await;
    assert_eq!(report.exchanged, 1);
    let report = standby.synchronizer().synchronize_once().await;
    assert_eq!(report.loaded, 1);

    assert_eq!(field(&standby, "hits", "count").await, Value::Int(2));
    assert_eq!(field(&standby, "hits", "lastValue").await, Value::Int(8));
    assert_eq!(store.len(), 1);

    active.close().await;
    standby.close().await;
}
