use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use replayoor::config::{Config, MonitorConfig};
use replayoor::export::health::{MonitorMetrics, WorkerMetrics};
use replayoor::monitor::{sample, DivergenceMonitor, FamilyHealth};
use replayoor::recipe::Recipe;
use replayoor::synth::FamilySynthesizer;
use replayoor::wire::parse::parse_text;
use replayoor::wire::Record;
use replayoor::worker::buffer::BatchBuffer;
use replayoor::worker::conn::ConnectionManager;
use replayoor::worker::emit::Emitter;
use replayoor::worker::Worker;

fn e2e_recipe_json(family_id: &str, base_rate: f64) -> serde_json::Value {
    serde_json::json!({
        "family_id": family_id,
        "metric_name": "api.requests",
        "schema": {
            "kind": "metric",
            "tags": { "env": { "presence": 1.0 } }
        },
        "statistics": {
            "value_distribution": {
                "quantiles": { "p01": 10.0, "p05": 20.0, "p50": 50.0, "p95": 90.0, "p99": 99.0 }
            },
            "source_distribution": {
                "top_values": [ { "value": "edge-1", "frequency": 1.0 } ]
            },
            "tag_distributions": {
                "env": { "top_values": [ { "value": "prod", "frequency": 1.0 } ] }
            },
            "size_quantiles": [ 40.0, 45.0, 50.0, 55.0, 60.0 ]
        },
        "temporal": { "base_rate": base_rate }
    })
}

#[derive(Clone)]
struct StubPlane {
    assignment: Arc<serde_json::Value>,
    recipe: Arc<serde_json::Value>,
}

async fn spawn_control_plane(assignment: serde_json::Value, recipe: serde_json::Value) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");

    let state = StubPlane {
        assignment: Arc::new(assignment),
        recipe: Arc::new(recipe),
    };

    let app = Router::new()
        .route(
            "/api/v1/workers/:id/assignment",
            get(|State(plane): State<StubPlane>| async move {
                Json(plane.assignment.as_ref().clone())
            }),
        )
        .route(
            "/api/v1/recipes/:family_id",
            get(|State(plane): State<StubPlane>| async move {
                Json(plane.recipe.as_ref().clone())
            }),
        )
        .route(
            "/api/v1/recipes",
            get(|| async { Json(serde_json::json!([])) }),
        )
        .with_state(state);

    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("control plane");
    });

    format!("http://{addr}")
}

/// Accepts sink connections and accumulates everything received.
fn spawn_sink(listener: TcpListener, collected: Arc<parking_lot::Mutex<String>>) {
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let collected = Arc::clone(&collected);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if let Ok(text) = std::str::from_utf8(&buf[..n]) {
                                collected.lock().push_str(text);
                            }
                        }
                    }
                }
            });
        }
    });
}

async fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind")
        .local_addr()
        .expect("addr")
        .port()
}

#[tokio::test(flavor = "multi_thread")]
async fn worker_end_to_end_emits_conformant_traffic() {
    let sink_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind sink");
    let sink_addr = sink_listener.local_addr().expect("addr").to_string();
    let collected = Arc::new(parking_lot::Mutex::new(String::new()));
    spawn_sink(sink_listener, Arc::clone(&collected));

    let assignment = serde_json::json!({
        "worker_id": "w-e2e",
        "families": ["fam-e2e"],
        "multiplier": 1.0,
        "burst_factor": 1.0,
        "endpoints": [sink_addr],
    });
    let control_plane_url =
        spawn_control_plane(assignment, e2e_recipe_json("fam-e2e", 50.0)).await;

    let worker_port = free_port().await;
    let monitor_port = free_port().await;
    let metrics_port = free_port().await;

    let cfg = Config {
        worker_id: "w-e2e".to_string(),
        control_plane_url,
        port: worker_port,
        metrics_port,
        poll_interval: Duration::from_millis(200),
        flush_interval: Duration::from_millis(100),
        rate_refresh: Duration::from_millis(100),
        seed: 7,
        monitor: MonitorConfig {
            port: monitor_port,
            ..Default::default()
        },
        ..Default::default()
    };
    cfg.validate().expect("valid config");

    let worker = Worker::new(cfg).expect("worker");
    worker.start().await.expect("start");

    let http = reqwest::Client::new();

    // /ready responds immediately after startup.
    let ready = http
        .get(format!("http://127.0.0.1:{worker_port}/ready"))
        .send()
        .await
        .expect("ready request");
    assert_eq!(ready.status(), 200);
    assert_eq!(ready.text().await.expect("body"), "READY");

    // /health flips to 200 once the assignment lands and the synthesizer
    // is loaded.
    let mut healthy = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let response = http
            .get(format!("http://127.0.0.1:{worker_port}/health"))
            .send()
            .await
            .expect("health request");
        if response.status() == 200 {
            healthy = true;
            break;
        }
    }
    assert!(healthy, "worker never became healthy");

    // Let it emit for a while.
    tokio::time::sleep(Duration::from_secs(2)).await;

    let status: serde_json::Value = http
        .get(format!("http://127.0.0.1:{worker_port}/status"))
        .send()
        .await
        .expect("status request")
        .json()
        .await
        .expect("status json");
    assert_eq!(status["worker_id"], "w-e2e");
    assert_eq!(status["has_assignment"], true);
    assert_eq!(status["synthesizers"], 1);

    // Trigger a monitor pass and read back the family status.
    let compute = http
        .post(format!("http://127.0.0.1:{monitor_port}/compute"))
        .send()
        .await
        .expect("compute request");
    assert_eq!(compute.status(), 202);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let families: serde_json::Value = http
        .get(format!("http://127.0.0.1:{monitor_port}/families"))
        .send()
        .await
        .expect("families request")
        .json()
        .await
        .expect("families json");
    let families = families.as_array().expect("array");
    assert_eq!(families.len(), 1);
    assert_eq!(families[0]["family_id"], "fam-e2e");
    assert!(families[0]["samples"].as_u64().expect("samples") > 0);

    worker.stop().await.expect("stop");

    // Let the sink drain the final flush.
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Every received line must conform to the wire grammar and carry the
    // recipe's schema.
    let text = collected.lock().clone();
    assert!(!text.is_empty(), "sink received nothing");
    let records = parse_text(&text).expect("all emitted lines parse");
    assert!(records.len() > 20, "only {} records", records.len());

    let mut last_ts = 0u64;
    for record in &records {
        let Record::Metric(m) = record else {
            panic!("unexpected record kind: {record:?}");
        };
        assert_eq!(m.name, "api.requests");
        assert_eq!(m.source, "edge-1");
        assert_eq!(
            m.tags,
            vec![("env".to_string(), "prod".to_string())],
        );
        let ts = m.timestamp.expect("timestamp");
        assert!(ts >= last_ts, "timestamps regressed: {last_ts} -> {ts}");
        last_ts = ts;
    }

    // Base rate 50/s, multiplier 1, flat intensity: the 2 s steady window
    // should carry roughly 100 lines. Allow generous slack for startup.
    assert!(
        records.len() >= 50 && records.len() <= 400,
        "implausible record count {}",
        records.len(),
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn emitter_recovers_once_endpoint_comes_alive() {
    // Reserve a port, then close it so the endpoint starts dead.
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let cancel = CancellationToken::new();
    let health = Arc::new(WorkerMetrics::new("127.0.0.1:0").expect("metrics"));
    let pool = ConnectionManager::connect(
        addr.to_string(),
        8192,
        Duration::from_millis(20),
        Duration::from_millis(200),
        Some(Arc::clone(&health)),
        cancel.clone(),
    )
    .await;

    // The initial synchronous build plus backoff attempts each count one
    // error; wait for three.
    let errors = health.http_errors.with_label_values(&[&addr.to_string()]);
    for _ in 0..300 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if errors.get() >= 3.0 {
            break;
        }
    }
    assert!(errors.get() >= 3.0, "saw {} errors", errors.get());

    // Bring the endpoint live; the next backoff attempt succeeds.
    let listener = TcpListener::bind(addr).await.expect("rebind");
    let collected = Arc::new(parking_lot::Mutex::new(String::new()));
    spawn_sink(listener, Arc::clone(&collected));

    for _ in 0..300 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if pool.is_healthy() {
            break;
        }
    }
    assert!(pool.is_healthy(), "pool never recovered");

    // The next batch goes through.
    let buffer = Arc::new(BatchBuffer::new(100, 65536));
    buffer
        .add("api.requests 1.0 source=edge-1".to_string())
        .expect("add");
    let emitter = Emitter::new(
        vec![pool],
        Arc::clone(&buffer),
        Arc::clone(&health),
        Duration::from_millis(500),
        3,
    );
    emitter.flush_once().await;

    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if !collected.lock().is_empty() {
            break;
        }
    }
    assert_eq!(
        collected.lock().as_str(),
        "api.requests 1.0 source=edge-1\n",
    );
    assert_eq!(health.batches_dropped.get(), 0.0);
    cancel.cancel();
}

#[tokio::test]
async fn divergence_red_on_collapsed_tag_distribution() {
    let recipe_json = serde_json::json!({
        "family_id": "fam-red",
        "metric_name": "api.requests",
        "schema": {
            "kind": "metric",
            "tags": { "env": { "presence": 1.0 } }
        },
        "statistics": {
            "value_distribution": {
                "quantiles": { "p01": 10.0, "p05": 20.0, "p50": 50.0, "p95": 90.0, "p99": 99.0 }
            },
            "tag_distributions": {
                "env": { "top_values": [
                    { "value": "prod", "frequency": 0.7 },
                    { "value": "staging", "frequency": 0.2 },
                    { "value": "dev", "frequency": 0.1 }
                ] }
            },
            "size_quantiles": [ 40.0, 45.0, 50.0, 55.0, 60.0 ]
        },
        "temporal": {}
    });
    let recipe =
        Recipe::from_json(recipe_json.to_string().as_bytes()).expect("recipe");

    let metrics = Arc::new(MonitorMetrics::new().expect("metrics"));
    let monitor = DivergenceMonitor::new(&MonitorConfig::default(), metrics);
    monitor.register_family(&recipe);

    // 1,000 samples whose env tag is 100% prod.
    for i in 0..1000u64 {
        monitor.ingest(
            "fam-red",
            sample(
                UNIX_EPOCH + Duration::from_secs(1_700_000_000 + i),
                50.0,
                "edge-1",
                &[("env", "prod")],
                50,
            ),
        );
    }

    monitor.compute_all();

    let js_env = monitor
        .metrics()
        .divergence_js
        .with_label_values(&["fam-red", "tag_env"])
        .get();
    assert!((js_env - 0.1692).abs() < 0.001, "js_env={js_env}");

    let status = monitor
        .metrics()
        .family_status
        .with_label_values(&["fam-red", "api.requests"])
        .get();
    assert_eq!(status, FamilyHealth::Red.as_f64());
}

#[tokio::test]
async fn synthesizer_to_emitter_pipeline_preserves_grammar() {
    let recipe = Recipe::from_json(e2e_recipe_json("fam-pipe", 1.0).to_string().as_bytes())
        .expect("recipe");
    let mut synthesizer = FamilySynthesizer::new(Arc::new(recipe), 99).expect("synth");

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();
    let collected = Arc::new(parking_lot::Mutex::new(String::new()));
    spawn_sink(listener, Arc::clone(&collected));

    let cancel = CancellationToken::new();
    let health = Arc::new(WorkerMetrics::new("127.0.0.1:0").expect("metrics"));
    let pool = ConnectionManager::connect(
        addr,
        8192,
        Duration::from_millis(20),
        Duration::from_millis(200),
        Some(Arc::clone(&health)),
        cancel.clone(),
    )
    .await;

    let buffer = Arc::new(BatchBuffer::new(1000, 1024 * 1024));
    let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
    for i in 0..200u64 {
        let emission = synthesizer.next_record(start + Duration::from_millis(i * 20), 1.0);
        buffer.add(emission.text).expect("add");
    }

    let emitter = Emitter::new(
        vec![pool],
        Arc::clone(&buffer),
        health,
        Duration::from_millis(500),
        3,
    );
    emitter.flush_once().await;

    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if collected.lock().lines().count() >= 200 {
            break;
        }
    }

    let text = collected.lock().clone();
    let records = parse_text(&text).expect("grammar holds end to end");
    assert_eq!(records.len(), 200);
    cancel.cancel();
}
