use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use stampede::job::{JobContainer, Payload};
use stampede::settings::Settings;
use stampede::worker::WorkerManager;

fn test_settings(worker_timeout: i64) -> Settings {
    Settings {
        master: "127.0.0.1".to_string(),
        master_port: 0,
        slaves: vec!["127.0.0.1".to_string()],
        worker_timeout,
        worker_check_interval: 1,
        test_duration: 2,
    }
}

// --- Single worker HTTP GET against a 200-always server ---

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_worker_get_measures_a_three_second_run() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut manager = WorkerManager::new(Some(1), &test_settings(3));
    manager
        .dispatch(&JobContainer::http_get(&format!("{}/ok", server.uri())))
        .unwrap();
    manager.start().unwrap();
    assert_eq!(manager.active_workers(), 1);

    // let the worker's own timeout trigger fire
    tokio::time::sleep(Duration::from_millis(3600)).await;
    let result = manager.stop().unwrap();

    assert!(result.total_request > 0, "no requests issued");
    assert_eq!(
        result.success_request, result.total_request,
        "every request should have succeeded"
    );
    let drift = result.latency.abs_diff(3000);
    assert!(drift < 500, "latency {} not within 500ms of 3s", result.latency);
}

// --- POST with body cycling ---

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn post_bodies_cycle_through_the_payload_list() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let container = JobContainer::http_post(&format!("{}/api", server.uri()))
        .with_data(Payload::Cycle(vec![json!({"i": 0}), json!({"i": 1})]));
    let mut manager = WorkerManager::new(Some(1), &test_settings(2));
    manager.dispatch(&container).unwrap();
    manager.start().unwrap();

    tokio::time::sleep(Duration::from_millis(2600)).await;
    let result = manager.stop().unwrap();
    assert!(result.total_request >= 2);

    let bodies: Vec<String> = server
        .received_requests()
        .await
        .expect("request recording is on")
        .iter()
        .map(|r| String::from_utf8_lossy(&r.body).into_owned())
        .collect();
    assert!(bodies.iter().any(|b| b.contains(r#""i":0"#)), "first payload never sent");
    assert!(bodies.iter().any(|b| b.contains(r#""i":1"#)), "second payload never sent");
}

// --- No payload still issues requests ---

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_payload_still_issues_requests() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/bare"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut manager = WorkerManager::new(Some(1), &test_settings(2));
    manager
        .dispatch(&JobContainer::http_get(&format!("{}/bare", server.uri())))
        .unwrap();
    manager.start().unwrap();

    tokio::time::sleep(Duration::from_millis(2500)).await;
    let result = manager.stop().unwrap();
    assert!(result.total_request > 0);
}

// --- Fan-out across workers ---

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fan_out_descriptor_loads_every_worker() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fan"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let container =
        JobContainer::http_get(&format!("{}/fan", server.uri())).with_reuse_job(false);
    let mut manager = WorkerManager::new(Some(4), &test_settings(-1));
    manager.dispatch(&container).unwrap();
    manager.start().unwrap();
    assert_eq!(manager.active_workers(), 4);

    tokio::time::sleep(Duration::from_secs(2)).await;
    let result = manager.stop().unwrap();

    // each of the four workers must have contributed at least one request
    assert!(
        result.total_request >= 4,
        "expected all 4 workers to drive requests, got {}",
        result.total_request
    );
    assert_eq!(result.success_request, result.total_request);
}

// --- Infinite timeout runs until an explicit stop ---

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn negative_timeout_waits_for_the_stop_signal() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/forever"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut manager = WorkerManager::new(Some(1), &test_settings(-1));
    manager
        .dispatch(&JobContainer::http_get(&format!("{}/forever", server.uri())))
        .unwrap();
    manager.start().unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let result = manager.stop().unwrap();
    assert!(result.total_request > 0);
}

// --- Failures are counted, not propagated ---

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connection_errors_become_failed_sessions() {
    // nothing listens on this port
    let container = JobContainer::http_get("http://127.0.0.1:1/unreachable");
    let mut manager = WorkerManager::new(Some(1), &test_settings(-1));
    manager.dispatch(&container).unwrap();
    manager.start().unwrap();

    tokio::time::sleep(Duration::from_millis(1200)).await;
    let result = manager.stop().unwrap();
    assert!(result.total_request > 0, "failed requests still count");
    assert_eq!(result.success_request, 0);
}

// --- Server errors are counted as failures ---

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn http_500_counts_as_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/boom"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let mut manager = WorkerManager::new(Some(1), &test_settings(-1));
    manager
        .dispatch(&JobContainer::http_get(&format!("{}/boom", server.uri())))
        .unwrap();
    manager.start().unwrap();

    tokio::time::sleep(Duration::from_millis(1200)).await;
    let result = manager.stop().unwrap();
    assert!(result.total_request > 0);
    assert_eq!(result.success_request, 0);
}

// --- Callbacks observe status code and body ---

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn callback_sees_each_response() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cb"))
        .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
        .mount(&server)
        .await;

    let seen = Arc::new(AtomicUsize::new(0));
    let seen_by_callback = seen.clone();
    let container = JobContainer::http_get(&format!("{}/cb", server.uri())).with_callback(
        move |status, body| {
            if status == 200 && body == "pong" {
                seen_by_callback.fetch_add(1, Ordering::Relaxed);
            }
        },
    );

    let mut manager = WorkerManager::new(Some(1), &test_settings(-1));
    manager.dispatch(&container).unwrap();
    manager.start().unwrap();

    tokio::time::sleep(Duration::from_millis(1200)).await;
    let result = manager.stop().unwrap();
    assert!(seen.load(Ordering::Relaxed) > 0, "callback never fired");
    assert!(result.total_request > 0);
}
