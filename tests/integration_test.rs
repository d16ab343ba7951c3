//! End-to-end coverage of the request lifecycle -> stats aggregator flow
//! against a real (mocked) HTTP server, exercising the scenarios the
//! engine is expected to get right: happy path, mixed failure rates,
//! renaming, explicit error overrides, assertions overriding status, and
//! hard connect failures.

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use rust_loadtest::{InstrumentedSession, RequestOptions, StatsAggregator};

fn session_for(server: &MockServer, stats: &StatsAggregator) -> InstrumentedSession {
    InstrumentedSession::new(reqwest::Client::new(), stats.handle()).with_base_url(server.uri())
}

#[tokio::test]
async fn happy_path_records_one_successful_row() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let stats = StatsAggregator::new();
    let session = session_for(&server, &stats);

    for _ in 0..3 {
        let _scope = session.get("/", RequestOptions::default()).await.unwrap();
    }

    let snapshot = stats.handle().snapshot_cumulative();
    let name = format!("{}/", server.uri());
    let entry = snapshot.entry(&name).expect("row for base url");
    assert_eq!(entry.count, 3);
    assert_eq!(entry.error_count, 0);
    assert!((entry.error_percentage() - 0.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn mixed_success_and_404_yields_fifty_percent_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/404"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let stats = StatsAggregator::new();
    let session = session_for(&server, &stats);
    let opts = RequestOptions::named("mixed");

    for _ in 0..2 {
        let _ok = session.get("/", opts.clone()).await.unwrap();
        let _bad = session.get("/404", opts.clone()).await.unwrap();
    }

    let snapshot = stats.handle().snapshot_cumulative();
    let entry = snapshot.entry("mixed").unwrap();
    assert_eq!(entry.count, 4);
    assert_eq!(entry.error_count, 2);
    assert!((entry.error_percentage() - 50.0).abs() < f64::EPSILON);

    let errors = stats.handle().error_signatures();
    assert!(errors
        .iter()
        .any(|(sig, count)| sig.starts_with("404,") && *count == 2));
}

#[tokio::test]
async fn renamed_request_with_explicit_error_is_all_failures() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let stats = StatsAggregator::new();
    let session = session_for(&server, &stats);

    {
        let mut scope = session
            .get("/", RequestOptions::named("renamed"))
            .await
            .unwrap();
        scope.set_error("Oh no");
    }

    let snapshot = stats.handle().snapshot_cumulative();
    let entry = snapshot.entry("renamed").unwrap();
    assert_eq!(entry.count, 1);
    assert_eq!(entry.error_count, 1);
    assert!((entry.error_percentage() - 100.0).abs() < f64::EPSILON);

    let errors = stats.handle().error_signatures();
    assert!(errors.iter().any(|(sig, count)| sig == "Oh no" && *count == 1));
}

#[tokio::test]
async fn assertion_inside_scope_overrides_status_and_aborts_remaining_work() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/500"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let stats = StatsAggregator::new();
    let base_url = server.uri();
    let handle = stats.handle();

    // Runs the failing assertion on its own thread so `catch_unwind` can
    // observe the panic without tearing down the outer test's own runtime.
    let joined = std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let mut unreached = false;
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            rt.block_on(async {
                let session = InstrumentedSession::new(reqwest::Client::new(), handle.clone())
                    .with_base_url(base_url);
                let scope = session.get("/500", RequestOptions::default()).await.unwrap();
                assert_eq!(scope.status(), 200, "expected success but got {}", scope.status());
                unreached = true;
            })
        }));
        (result.is_err(), unreached)
    })
    .join()
    .unwrap();

    assert!(joined.0, "the assertion should have panicked");
    assert!(!joined.1, "code after the failing assertion must not run");

    let errors = stats.handle().error_signatures();
    assert!(errors.iter().any(|(sig, _)| sig.contains("AssertionError")));
}

#[tokio::test]
async fn hard_connect_failure_is_recorded_and_the_loop_can_continue() {
    let stats = StatsAggregator::new();
    let session = InstrumentedSession::new(
        reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_millis(200))
            .build()
            .unwrap(),
        stats.handle(),
    );

    let result = session
        .get(
            "http://127.0.0.1:1/unreachable",
            RequestOptions::default().raise_for_status(true),
        )
        .await;
    assert!(result.is_err());

    let snapshot = stats.handle().snapshot_cumulative();
    let entry = snapshot.entry("http://127.0.0.1:1/unreachable").unwrap();
    assert_eq!(entry.count, 1);
    assert_eq!(entry.error_count, 1);

    // The user loop survives: a second request against a real endpoint
    // still gets recorded under its own name.
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    let session2 = InstrumentedSession::new(reqwest::Client::new(), stats.handle());
    let _scope = session2.get(&format!("{}/ok", server.uri()), RequestOptions::default())
        .await
        .unwrap();
    let snapshot = stats.handle().snapshot_cumulative();
    assert_eq!(
        snapshot
            .entry(&format!("{}/ok", server.uri()))
            .unwrap()
            .count,
        1
    );
}

#[tokio::test]
async fn error_signature_overflow_folds_excess_into_other() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let stats = StatsAggregator::new();
    let session = session_for(&server, &stats);

    for i in 0..300 {
        let mut scope = session.get("/", RequestOptions::default()).await.unwrap();
        scope.set_error(format!("unique error number {i}"));
    }

    let errors = stats.handle().error_signatures();
    assert_eq!(errors.len(), 201, "200 distinct keys plus OTHER");
    let other = errors.iter().find(|(sig, _)| sig == "OTHER").unwrap();
    assert_eq!(other.1, 100);
}
