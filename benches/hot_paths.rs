use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use mgmt_aggregator::aggregator::strategy::{binary_percent, Comparison};
use mgmt_aggregator::attribute::pool::WorkerPool;
use mgmt_aggregator::attribute::AttributeRegistry;
use mgmt_aggregator::descriptor::{keys, Descriptor};
use mgmt_aggregator::engine::MetricFactory;
use mgmt_aggregator::metrics::{now_millis, Gauge, Metric, Timer};
use mgmt_aggregator::notification::parse::{JsonParser, NotificationParser, RegexParser};
use mgmt_aggregator::notification::{
    Measurement, MeasurementNotification, SourceIdentity, ValueChange,
};
use mgmt_aggregator::value::Number;

const JSON_BODY: &[u8] =
    br#"{"kind":"valueChanged","integer":4242,"componentInstance":"db-1","message":"checkout"}"#;
const REGEX_BODY: &[u8] = b"stopwatch=125 checkout";

fn notification(v: i64) -> MeasurementNotification {
    MeasurementNotification::new(
        SourceIdentity::new("orders", "db-1"),
        Measurement::ValueChanged(ValueChange::Integer(v)),
    )
}

fn bench_parse(c: &mut Criterion) {
    let regex = RegexParser::new(r"^(?P<kind>\w+)=(?P<value>\S+)(?: (?P<message>.*))?$")
        .expect("valid script");

    c.bench_function("parse/json_value_changed", |b| {
        b.iter(|| JsonParser.parse(black_box(JSON_BODY)).expect("parse json"))
    });

    c.bench_function("parse/regex_stopwatch", |b| {
        b.iter(|| regex.parse(black_box(REGEX_BODY)).expect("parse regex"))
    });
}

fn bench_metric_update(c: &mut Criterion) {
    let now = now_millis();
    let gauge = Gauge::<i64>::new(now);
    let timer = Timer::new(now);
    let sample = notification(17);

    c.bench_function("metric/gauge64_update", |b| {
        b.iter(|| gauge.update(black_box(&sample), now))
    });

    c.bench_function("metric/timer_view", |b| {
        b.iter(|| black_box(timer.view_at(now)))
    });
}

fn bench_strategies(c: &mut Criterion) {
    c.bench_function("strategy/binary_percent", |b| {
        b.iter(|| binary_percent(black_box(Number::Integer(1)), black_box(Number::Integer(3))))
    });

    c.bench_function("strategy/comparison", |b| {
        b.iter(|| {
            Comparison::GreaterThanOrEqual
                .compare(black_box(Number::Integer(5)), black_box(Number::Float(4.5)))
        })
    });
}

fn bench_fan_out(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("runtime");

    let registry = rt.block_on(async {
        let pool = Arc::new(WorkerPool::new(4));
        let registry = Arc::new_cyclic(|weak| {
            AttributeRegistry::new("bench", Arc::new(MetricFactory::new(weak.clone())), pool)
        });
        for i in 0..32 {
            let kind = if i % 2 == 0 { "gauge64" } else { "rate" };
            registry
                .connect(&format!("a{i}"), &Descriptor::new().with(keys::NAME, kind))
                .await
                .expect("connect");
        }
        registry
    });
    let sample = Arc::new(notification(99));

    c.bench_function("registry/dispatch_32_attributes", |b| {
        b.iter(|| rt.block_on(registry.dispatch(Arc::clone(&sample))))
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_parse(c);
    bench_metric_update(c);
    bench_strategies(c);
    bench_fan_out(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
