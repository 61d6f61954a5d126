use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use stampede::analyse::AnalyseResult;
use stampede::job::JobContainer;
use stampede::launcher::Launcher;
use stampede::master::Master;
use stampede::settings::Settings;
use stampede::slave::Slave;

fn test_settings() -> Settings {
    Settings {
        master: "127.0.0.1".to_string(),
        master_port: 0,
        slaves: vec!["127.0.0.1".to_string()],
        worker_timeout: -1,
        worker_check_interval: 1,
        test_duration: 2,
    }
}

/// Runs a slave on its own thread and hands back its final result.
fn spawn_slave(settings: Settings) -> mpsc::Receiver<Option<AnalyseResult>> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("slave".to_string())
        .spawn(move || {
            let runtime = tokio::runtime::Runtime::new().unwrap();
            let mut slave = Slave::new(settings);
            let outcome = runtime.block_on(slave.run());
            assert!(outcome.is_ok(), "slave failed: {:?}", outcome);
            let _ = tx.send(slave.result().cloned());
        })
        .unwrap();
    rx
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn master_aggregate_matches_the_slave_report() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/b"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut master = Master::new(test_settings(), Some(2));
    master.dispatch(vec![
        JobContainer::http_get(&format!("{}/a", server.uri())),
        JobContainer::http_get(&format!("{}/b", server.uri())),
    ]);
    let addr = master.start().unwrap();

    let mut slave_settings = test_settings();
    slave_settings.master_port = addr.port();
    let slave_result = spawn_slave(slave_settings);

    tokio::time::sleep(Duration::from_secs(2)).await;
    let aggregate = master.stop().unwrap();

    assert_eq!(aggregate.id, "master");
    assert!(aggregate.total_request > 0);
    assert_eq!(aggregate.success_request, aggregate.total_request);

    let reported = slave_result
        .recv_timeout(Duration::from_secs(10))
        .unwrap()
        .expect("slave should hold its report");
    assert_eq!(aggregate.total_request, reported.total_request);
    assert_eq!(aggregate.success_request, reported.success_request);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stopping_a_master_that_never_started_is_an_error() {
    let mut master = Master::new(test_settings(), Some(1));
    assert!(master.stop().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn master_refuses_a_second_start() {
    let mut master = Master::new(test_settings(), Some(1));
    master.start().unwrap();
    assert!(master.start().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn local_launcher_runs_the_whole_pipeline() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut launcher = Launcher::new(test_settings(), Some(2), Duration::from_secs(2));
    launcher.dispatch(JobContainer::http_get(&format!("{}/ok", server.uri())));
    let result = tokio::task::spawn_blocking(move || launcher.launch())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(result.id, "master");
    assert!(result.total_request > 0);
    assert_eq!(result.success_request, result.total_request);
    assert!(result.stop_time >= result.start_time);
}
