//! Service behavior against a scripted multiplexer.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::Poll;
use std::time::{Duration, Instant};

use chatcube_net::dns::{HostLookup, HostResolver};
use chatcube_net::transport::{ScriptedMultiplexer, TransferBody};
use chatcube_net::{
    Failure, HttpMethod, HttpService, NetworkError, Request, RetryPolicy, ServiceConfig,
    StreamRecord, TransportError,
};
use parking_lot::Mutex;

type Log = Arc<Mutex<Vec<String>>>;

const BACKEND_IP: [u8; 4] = [203, 0, 113, 7];

fn config() -> ServiceConfig {
    ServiceConfig::new()
        .with_base_url("https://chat.example")
        .with_auth_token("t0k3n")
        .with_retry(
            RetryPolicy::new()
                .max_attempts(3)
                .initial_delay(Duration::ZERO)
                .jitter(false),
        )
}

/// A resolver whose answer is controlled by `online`.
fn switchable_resolver(online: Arc<AtomicBool>) -> HostResolver {
    HostResolver::from_fn(move |host| {
        if online.load(Ordering::SeqCst) {
            Ok(vec![IpAddr::from(BACKEND_IP)])
        } else {
            Err(NetworkError::Resolution {
                host: host.to_string(),
                message: "no route".to_string(),
            })
        }
    })
}

/// A lookup that stays unanswered until `answer` is set.
struct StalledLookup {
    answer: Arc<AtomicBool>,
}

impl HostLookup for StalledLookup {
    fn poll_lookup(&mut self, _host: &str) -> Poll<chatcube_net::Result<Vec<IpAddr>>> {
        if self.answer.load(Ordering::SeqCst) {
            Poll::Ready(Ok(vec![IpAddr::from(BACKEND_IP)]))
        } else {
            Poll::Pending
        }
    }
}

fn service_with(config: ServiceConfig, mux: &ScriptedMultiplexer) -> HttpService<ScriptedMultiplexer> {
    HttpService::with_parts(
        config,
        mux.clone(),
        switchable_resolver(Arc::new(AtomicBool::new(true))),
    )
    .expect("valid config")
}

fn online_service(mux: &ScriptedMultiplexer) -> HttpService<ScriptedMultiplexer> {
    let mut service = service_with(config(), mux);
    service.process();
    assert!(service.is_online());
    service
}

/// A request that records its terminal callbacks into `log`.
fn logged(request: Request, log: &Log) -> Request {
    let (success, fail, finally) = (log.clone(), log.clone(), log.clone());
    request
        .on_success(move |response| success.lock().push(format!("success {}", response.status())))
        .on_fail(move |failure| fail.lock().push(format!("fail {failure}")))
        .on_finally(move || finally.lock().push("finally".to_string()))
}

#[test]
fn test_ping_round_trip() {
    let mux = ScriptedMultiplexer::new();
    let mut service = service_with(config(), &mux);
    let log: Log = Arc::default();
    let pong = Arc::new(Mutex::new(None));

    let pong_clone = pong.clone();
    let success_log = log.clone();
    let finally_log = log.clone();
    service.submit(
        Request::post("/ping")
            .on_success(move |response| {
                *pong_clone.lock() = response.json().cloned();
                success_log.lock().push("success".to_string());
            })
            .on_fail(|failure| panic!("ping failed: {failure}"))
            .on_finally(move || finally_log.lock().push("finally".to_string())),
    );

    // Nothing leaves before the first tick resolves the backend.
    assert_eq!(mux.added(), 0);
    service.process();

    let transfer = mux.last_to("/api/ping").expect("ping submitted");
    assert_eq!(transfer.spec.url, "https://chat.example/en/api/ping");
    assert_eq!(transfer.spec.method, HttpMethod::Post);
    assert_eq!(transfer.spec.body, TransferBody::Empty);
    assert_eq!(transfer.spec.header("Authorization"), Some("Token t0k3n"));
    assert!(transfer.spec.header("User-Agent").is_some_and(|ua| ua.starts_with("ChatCube/")));
    assert_eq!(transfer.spec.timeout, Some(Duration::from_secs(60)));

    let pin = transfer.spec.pin.as_ref().expect("backend requests are pinned");
    assert_eq!(pin.host, "chat.example");
    assert_eq!(pin.addr.to_string(), "203.0.113.7:443");

    mux.respond(transfer.id, 200, r#"{"pong":true}"#);
    service.process();

    assert_eq!(*log.lock(), vec!["success".to_string(), "finally".to_string()]);
    assert_eq!(*pong.lock(), Some(serde_json::json!({"pong": true})));
    assert_eq!(service.in_flight(), 0);
    assert!(mux.live().is_empty());
}

#[test]
fn test_no_auth_header_without_token() {
    let mux = ScriptedMultiplexer::new();
    let mut config = config();
    config.auth_token = None;
    let mut service = service_with(config, &mux);

    service.submit(Request::get("/rooms"));
    service.process();

    let transfer = mux.last_to("/api/rooms").unwrap();
    assert_eq!(transfer.spec.header("Authorization"), None);
    assert_eq!(transfer.spec.body, TransferBody::None);
}

#[test]
fn test_request_header_wins_over_default() {
    let mux = ScriptedMultiplexer::new();
    let config = config().with_default_header("X-Client", "desktop");
    let mut service = service_with(config, &mux);

    service.submit(Request::get("/a").header("x-client", "mobile"));
    service.submit(Request::get("/b"));
    service.process();

    assert_eq!(mux.last_to("/api/a").unwrap().spec.header("X-Client"), Some("mobile"));
    assert_eq!(mux.last_to("/api/b").unwrap().spec.header("X-Client"), Some("desktop"));
}

#[test]
fn test_completion_fires_at_most_once() {
    let mux = ScriptedMultiplexer::new();
    let mut service = online_service(&mux);
    let log: Log = Arc::default();

    service.submit(logged(Request::get("/once"), &log));
    let id = mux.last_to("/once").unwrap().id;

    mux.respond(id, 200, "{}");
    mux.complete(id, 500);
    service.process();
    service.process();

    assert_eq!(*log.lock(), vec!["success 200".to_string(), "finally".to_string()]);
}

#[test]
fn test_http_error_status_is_not_retried() {
    let mux = ScriptedMultiplexer::new();
    let mut service = online_service(&mux);
    let status = Arc::new(Mutex::new(None));

    let status_clone = status.clone();
    service.submit(
        Request::get("/missing")
            .on_success(|_| panic!("404 is not a success"))
            .on_fail(move |failure| *status_clone.lock() = failure.status()),
    );
    let id = mux.last_to("/missing").unwrap().id;
    mux.respond(id, 404, r#"{"error":"not found"}"#);
    service.process();

    assert_eq!(*status.lock(), Some(404));
    assert_eq!(mux.added(), 1);
}

#[test]
fn test_transport_failures_are_resubmitted_with_fresh_transfers() {
    let mux = ScriptedMultiplexer::new();
    let mut service = online_service(&mux);
    let log: Log = Arc::default();

    service.submit(logged(Request::get("/flaky"), &log));
    let first = mux.last_to("/flaky").unwrap().id;

    mux.fail(first, TransportError::Timeout);
    service.process();

    let second = mux.last_to("/flaky").unwrap().id;
    assert_ne!(first, second);
    assert_eq!(mux.live().len(), 1);
    assert!(log.lock().is_empty());

    mux.respond(second, 200, "");
    service.process();
    assert_eq!(*log.lock(), vec!["success 200".to_string(), "finally".to_string()]);
}

#[test]
fn test_retries_exhausted() {
    let mux = ScriptedMultiplexer::new();
    let mut service = online_service(&mux);
    let outcome = Arc::new(Mutex::new(None));

    let outcome_clone = outcome.clone();
    service.submit(Request::get("/down").on_fail(move |failure| {
        if let Failure::RetriesExhausted {
            attempts,
            last_error,
        } = failure
        {
            *outcome_clone.lock() = Some((*attempts, last_error.clone()));
        }
    }));

    for _ in 0..3 {
        let id = mux.last_to("/down").unwrap().id;
        mux.fail(id, TransportError::Protocol("connection reset".into()));
        service.process();
    }

    assert_eq!(mux.added(), 3);
    assert_eq!(
        *outcome.lock(),
        Some((3, TransportError::Protocol("connection reset".into())))
    );
    assert_eq!(service.pending(), 0);
    assert!(mux.live().is_empty());
}

#[test]
fn test_backoff_delays_resubmission() {
    let mux = ScriptedMultiplexer::new();
    let config = config().with_retry(
        RetryPolicy::new()
            .initial_delay(Duration::from_secs(60))
            .jitter(false),
    );
    let mut service = service_with(config, &mux);
    service.process();

    service.submit(Request::get("/slow"));
    let id = mux.last_to("/slow").unwrap().id;
    mux.fail(id, TransportError::Timeout);
    service.process();
    service.process();

    assert_eq!(mux.added(), 1);
    assert_eq!(service.pending(), 1);
}

#[test]
fn test_offline_requests_wait_for_resolution() {
    let mux = ScriptedMultiplexer::new();
    let online = Arc::new(AtomicBool::new(false));
    let mut service =
        HttpService::with_parts(config(), mux.clone(), switchable_resolver(online.clone())).unwrap();
    let log: Log = Arc::default();

    service.submit(logged(Request::get("/later"), &log));
    service.process();
    service.process();

    assert!(!service.is_online());
    assert_eq!(mux.added(), 0);
    assert_eq!(mux.perform_calls(), 0);
    assert_eq!(service.pending(), 1);

    online.store(true, Ordering::SeqCst);
    service.process();
    assert!(service.is_online());
    assert_eq!(mux.added(), 1);

    let id = mux.last_to("/later").unwrap().id;
    mux.respond(id, 204, "");
    service.process();
    assert_eq!(*log.lock(), vec!["success 204".to_string(), "finally".to_string()]);
}

#[test]
fn test_process_returns_while_lookup_unanswered() {
    let mux = ScriptedMultiplexer::new();
    let answer = Arc::new(AtomicBool::new(false));
    let resolver = HostResolver::new(StalledLookup {
        answer: answer.clone(),
    });
    let mut service = HttpService::with_parts(config(), mux.clone(), resolver).unwrap();
    service.submit(Request::get("/rooms"));

    let started = Instant::now();
    for _ in 0..10 {
        service.process();
    }
    assert!(started.elapsed() < Duration::from_millis(500));
    assert!(!service.is_online());
    assert_eq!(service.pending(), 1);
    assert_eq!(mux.added(), 0);

    answer.store(true, Ordering::SeqCst);
    service.process();
    assert!(service.is_online());
    assert_eq!(service.pending(), 0);
    assert!(mux.last_to("/api/rooms").is_some());
}

#[test]
fn test_connection_failure_goes_offline_until_resolved() {
    let mux = ScriptedMultiplexer::new();
    let online = Arc::new(AtomicBool::new(true));
    let mut service =
        HttpService::with_parts(config(), mux.clone(), switchable_resolver(online.clone())).unwrap();
    service.process();

    service.submit(Request::get("/msg"));
    let id = mux.last_to("/msg").unwrap().id;

    online.store(false, Ordering::SeqCst);
    mux.fail(id, TransportError::Connect("connection refused".into()));
    service.process();

    assert!(!service.is_online());
    assert_eq!(mux.added(), 1);
    assert_eq!(service.pending(), 1);

    service.process();
    assert_eq!(mux.added(), 1);

    online.store(true, Ordering::SeqCst);
    service.process();
    assert_eq!(mux.added(), 2);
}

#[test]
fn test_vetoed_request_never_reaches_transport() {
    let mux = ScriptedMultiplexer::new();
    let mut service = online_service(&mux);
    let log: Log = Arc::default();

    service.submit(logged(Request::delete("/rooms/1").before_submit(|_| false), &log));

    assert_eq!(mux.added(), 0);
    assert_eq!(
        *log.lock(),
        vec!["fail Request vetoed before submission".to_string(), "finally".to_string()]
    );
}

#[test]
fn test_before_submit_sees_final_headers() {
    let mux = ScriptedMultiplexer::new();
    let mut service = online_service(&mux);
    let seen = Arc::new(Mutex::new(None));

    let seen_clone = seen.clone();
    service.submit(Request::get("/me").before_submit(move |request| {
        *seen_clone.lock() = request.header_value("Authorization").map(str::to_string);
        true
    }));

    assert_eq!(seen.lock().as_deref(), Some("Token t0k3n"));
    assert_eq!(mux.added(), 1);
}

#[test]
fn test_cancelled_transfer_is_terminal() {
    let mux = ScriptedMultiplexer::new();
    let mut service = online_service(&mux);
    let log: Log = Arc::default();

    let request = logged(Request::get("/big-download"), &log);
    let cancel = request.cancel_flag();
    service.submit(request);

    let transfer = mux.last_to("/big-download").unwrap();
    cancel.cancel();
    assert!(transfer.spec.cancel.is_cancelled());

    mux.fail(transfer.id, TransportError::Cancelled);
    service.process();

    assert_eq!(mux.added(), 1);
    assert_eq!(
        *log.lock(),
        vec!["fail Transfer was cancelled".to_string(), "finally".to_string()]
    );
}

#[test]
fn test_hourglass_tracks_flagged_requests() {
    let mux = ScriptedMultiplexer::new();
    let mut service = online_service(&mux);

    service.submit(Request::get("/quiet"));
    assert!(!service.hourglass_active());

    service.submit(Request::post("/send").hourglass(true));
    assert!(service.hourglass_active());

    let id = mux.last_to("/send").unwrap().id;
    mux.respond(id, 200, "");
    service.process();
    assert!(!service.hourglass_active());
    assert_eq!(service.in_flight(), 1);
}

#[test]
fn test_progress_reports_end_at_one_hundred() {
    let mux = ScriptedMultiplexer::new();
    let mut service = online_service(&mux);
    let reports = Arc::new(Mutex::new(Vec::new()));

    let reports_clone = reports.clone();
    service.submit(
        Request::get("/avatar.png")
            .progress(true)
            .on_progress(move |progress| {
                reports_clone
                    .lock()
                    .push((progress.bytes_transferred, progress.percent()))
            }),
    );
    let id = mux.last_to("/avatar.png").unwrap().id;
    mux.push_data(id, vec![0u8; 10]);
    mux.push_data(id, vec![0u8; 6]);
    mux.complete(id, 200);
    service.process();

    assert_eq!(*reports.lock(), vec![(10, None), (16, None), (16, Some(100))]);
}

#[test]
fn test_shutdown_fails_everything_outstanding() {
    let mux = ScriptedMultiplexer::new();
    let online = Arc::new(AtomicBool::new(true));
    let mut service =
        HttpService::with_parts(config(), mux.clone(), switchable_resolver(online.clone())).unwrap();
    service.process();
    let log: Log = Arc::default();

    service.submit(logged(Request::get("/in-flight"), &log));
    let id = mux.last_to("/in-flight").unwrap().id;
    mux.fail(id, TransportError::Connect("refused".into()));
    online.store(false, Ordering::SeqCst);
    service.process();
    service.submit(logged(Request::get("/second"), &log));
    assert_eq!(service.pending(), 2);

    service.shutdown();
    assert_eq!(
        *log.lock(),
        vec![
            "fail Service shut down".to_string(),
            "finally".to_string(),
            "fail Service shut down".to_string(),
            "finally".to_string(),
        ]
    );
    assert_eq!(service.pending(), 0);

    log.lock().clear();
    service.submit(logged(Request::get("/too-late"), &log));
    service.shutdown();
    assert_eq!(
        *log.lock(),
        vec!["fail Service shut down".to_string(), "finally".to_string()]
    );
}

#[test]
fn test_handle_submissions_after_shutdown_fail_on_next_tick() {
    let mux = ScriptedMultiplexer::new();
    let mut service = online_service(&mux);
    let handle = service.handle();
    let log: Log = Arc::default();

    service.shutdown();
    assert!(handle.submit(logged(Request::get("/late"), &log)).is_ok());
    assert!(handle.start_event_stream("42", None));
    assert!(log.lock().is_empty());

    service.process();
    assert_eq!(
        *log.lock(),
        vec!["fail Service shut down".to_string(), "finally".to_string()]
    );
    assert_eq!(mux.added(), 0);
    assert!(!service.connected());
}

#[test]
fn test_drop_releases_in_flight_requests() {
    let mux = ScriptedMultiplexer::new();
    let log: Log = Arc::default();
    {
        let mut service = online_service(&mux);
        service.submit(logged(Request::get("/pending-on-drop"), &log));
        assert_eq!(mux.live().len(), 1);
    }
    assert!(mux.live().is_empty());
    assert_eq!(
        *log.lock(),
        vec!["fail Service shut down".to_string(), "finally".to_string()]
    );
}

#[test]
fn test_refused_transfer_is_reported() {
    let mux = ScriptedMultiplexer::new();
    let mut service = online_service(&mux);
    let log: Log = Arc::default();

    mux.refuse_next(TransportError::Local("too many transfers".into()));
    service.submit(logged(Request::get("/refused"), &log));

    assert_eq!(mux.added(), 0);
    assert_eq!(
        *log.lock(),
        vec![
            "fail Local error: too many transfers".to_string(),
            "finally".to_string()
        ]
    );
}

#[test]
fn test_init_switches_backend() {
    let mux = ScriptedMultiplexer::new();
    let lookups: Log = Arc::default();
    let lookups_clone = lookups.clone();
    let resolver = HostResolver::from_fn(move |host| {
        lookups_clone.lock().push(host.to_string());
        Ok(vec![IpAddr::from(BACKEND_IP)])
    });
    let mut service = HttpService::with_parts(config(), mux.clone(), resolver).unwrap();
    service.process();

    service
        .init("https://other.example", "de", "ChatCube-Test/2.0")
        .expect("valid backend");
    assert!(!service.is_online());
    assert!(service.init("ftp://nowhere", "en", "x").is_err());

    service.submit(Request::get("/rooms"));
    service.process();

    let transfer = mux.last_to("/api/rooms").unwrap();
    assert_eq!(transfer.spec.url, "https://other.example/de/api/rooms");
    assert_eq!(transfer.spec.header("User-Agent"), Some("ChatCube-Test/2.0"));
    assert_eq!(
        *lookups.lock(),
        vec!["chat.example".to_string(), "other.example".to_string()]
    );
}

#[test]
fn test_absolute_urls_are_not_pinned() {
    let mux = ScriptedMultiplexer::new();
    let mut service = online_service(&mux);

    service.submit(Request::get("https://cdn.example/files/cat.png"));
    let transfer = mux.last_to("cdn.example").unwrap();
    assert_eq!(transfer.spec.url, "https://cdn.example/files/cat.png");
    assert!(transfer.spec.pin.is_none());
}

#[test]
fn test_handle_commands_apply_on_next_tick() {
    let mux = ScriptedMultiplexer::new();
    let mut service = online_service(&mux);
    let handle = service.handle();

    let worker = {
        let handle = handle.clone();
        std::thread::spawn(move || {
            assert!(handle.set_auth_token(Some("fresh".into())));
            handle.submit(Request::get("/from-worker")).is_ok()
        })
    };
    assert!(worker.join().unwrap());
    assert_eq!(mux.added(), 0);

    service.process();
    let transfer = mux.last_to("/from-worker").unwrap();
    assert_eq!(transfer.spec.header("Authorization"), Some("Token fresh"));

    drop(service);
    assert!(handle.submit(Request::get("/orphan")).is_err());
    assert!(!handle.stop_event_stream());
}

#[test]
fn test_callback_can_chain_requests() {
    let mux = ScriptedMultiplexer::new();
    let mut service = online_service(&mux);
    let handle = service.handle();

    service.submit(Request::post("/login").on_success(move |_| {
        let _ = handle.submit(Request::get("/rooms"));
    }));
    let id = mux.last_to("/login").unwrap().id;
    mux.respond(id, 200, "{}");
    service.process();
    assert!(mux.last_to("/rooms").is_none());

    service.process();
    assert!(mux.last_to("/rooms").is_some());
}

mod event_stream {
    use super::*;

    fn recording(service: &mut HttpService<ScriptedMultiplexer>) -> Arc<Mutex<Vec<StreamRecord>>> {
        let records = Arc::new(Mutex::new(Vec::new()));
        let records_clone = records.clone();
        service.set_events_handler(move |record| records_clone.lock().push(record.clone()));
        records
    }

    #[test]
    fn test_records_delivered_across_chunks() {
        let mux = ScriptedMultiplexer::new();
        let mut service = service_with(config(), &mux);
        let records = recording(&mut service);

        service.start_event_stream("42", None);
        assert!(!service.connected());
        service.process();

        let stream = mux.last_to("/ev/42").expect("stream armed");
        assert_eq!(stream.spec.url, "https://chat.example/ev/42");
        assert_eq!(stream.spec.header("Accept"), Some("text/event-stream"));
        assert_eq!(stream.spec.header("Authorization"), Some("Token t0k3n"));
        assert_eq!(stream.spec.timeout, None);

        mux.push_data(stream.id, r#"data: {"id":1,"ti"#);
        service.process();
        assert!(records.lock().is_empty());

        mux.push_data(stream.id, "me\":\"T1\",\"text\":\"hi\"}\n\n");
        service.process();

        let delivered = records.lock().clone();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].id, 1);
        assert_eq!(delivered[0].time, "T1");
        assert_eq!(delivered[0].text_str(), Some("hi"));
        assert_eq!(service.resume_cursor(), Some("T1"));
        assert!(service.connected());
    }

    #[test]
    fn test_reconnect_resumes_from_cursor() {
        let mux = ScriptedMultiplexer::new();
        let mut service = service_with(config(), &mux);
        let _records = recording(&mut service);

        service.start_event_stream("42", None);
        service.process();
        let first = mux.last_to("/ev/42").unwrap();
        mux.push_data(first.id, "data: {\"id\":7,\"time\":\"2024-05-01 12:00:00\"}\n\n");
        mux.complete(first.id, 200);
        service.process();

        let second = mux.last_to("/ev/42").unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(
            second.spec.url,
            "https://chat.example/ev/42?time=2024-05-01+12%3A00%3A00"
        );
        assert_eq!(mux.live().len(), 1);
    }

    #[test]
    fn test_resume_from_given_cursor() {
        let mux = ScriptedMultiplexer::new();
        let mut service = service_with(config(), &mux);

        service.start_event_stream("9", Some("T5".into()));
        service.process();
        assert_eq!(
            mux.last_to("/ev/9").unwrap().spec.url,
            "https://chat.example/ev/9?time=T5"
        );
    }

    #[test]
    fn test_malformed_records_are_isolated() {
        let mux = ScriptedMultiplexer::new();
        let mut service = service_with(config(), &mux);
        let records = recording(&mut service);

        service.start_event_stream("42", None);
        service.process();
        let stream = mux.last_to("/ev/42").unwrap();

        mux.push_data(
            stream.id,
            "data: {\"id\":2}\n\ndata: not json\n\ndata: {\"id\":3,\"time\":\"T3\"}\n\n",
        );
        service.process();

        let ids: Vec<i64> = records.lock().iter().map(|record| record.id).collect();
        assert_eq!(ids, vec![3]);
        assert_eq!(service.resume_cursor(), Some("T3"));
    }

    #[test]
    fn test_stop_closes_without_reconnect() {
        let mux = ScriptedMultiplexer::new();
        let mut service = service_with(config(), &mux);

        service.start_event_stream("42", None);
        service.process();
        assert_eq!(mux.live().len(), 1);

        service.stop_event_stream();
        service.process();
        service.process();

        assert!(mux.live().is_empty());
        assert_eq!(mux.added(), 1);
        assert!(!service.connected());
    }

    #[test]
    fn test_stream_waits_for_resolution() {
        let mux = ScriptedMultiplexer::new();
        let online = Arc::new(AtomicBool::new(false));
        let mut service =
            HttpService::with_parts(config(), mux.clone(), switchable_resolver(online.clone()))
                .unwrap();

        service.start_event_stream("42", None);
        service.process();
        assert_eq!(mux.added(), 0);

        online.store(true, Ordering::SeqCst);
        service.process();
        assert!(mux.last_to("/ev/42").is_some());
    }

    #[test]
    fn test_inactive_stream_is_restarted() {
        let mux = ScriptedMultiplexer::new();
        let config = config().with_stream_inactivity(Duration::from_secs(1));
        let mut service = service_with(config, &mux);

        service.start_event_stream("42", None);
        service.process();
        let first = mux.last_to("/ev/42").unwrap();

        service.process();
        assert_eq!(mux.added(), 1);

        std::thread::sleep(Duration::from_millis(1100));
        service.process();

        let second = mux.last_to("/ev/42").unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(mux.live().len(), 1);
        assert_eq!(mux.live()[0].id, second.id);
    }

    #[test]
    fn test_handle_starts_stream() {
        let mux = ScriptedMultiplexer::new();
        let mut service = service_with(config(), &mux);
        let handle = service.handle();

        assert!(handle.start_event_stream("77", None));
        service.process();
        assert!(mux.last_to("/ev/77").is_some());

        assert!(handle.stop_event_stream());
        service.process();
        assert!(mux.live().is_empty());
    }
}
