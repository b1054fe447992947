//! End-to-end tests for the fitting fabric.
//!
//! These tests exercise the complete flow:
//! 1. Producers push request lines into the balancer's `request_in`
//! 2. The balancer hands them to whichever workers are ready
//! 3. Workers push responses into `response_in`
//! 4. Producers collect from `response_out` and reconcile by count
//!
//! Every balancer here binds ephemeral loopback ports, so the tests can
//! run in parallel; only the timing-sensitive loss tests are serialized.
//!
//! # Running with tracing
//!
//! ```bash
//! RUST_LOG=gantry=trace cargo test --features tracing -- --nocapture
//! ```

use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::TcpStream;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;
use serial_test::serial;

use gantry::balancer::{Balancer, BalancerConfig, Endpoints};
use gantry::dispatch::Dispatcher;
use gantry::net::Endpoint;
use gantry::wire::{self, CorrelationKey, DistanceSample, FitRequest, FitResult, Spectrum};
use gantry::worker::{EngineError, FitEngine, FitOutcome, Worker};

const TIMEOUT: Duration = Duration::from_secs(2);

fn spawn_balancer() -> Balancer {
    Balancer::spawn(BalancerConfig::ephemeral()).expect("spawn balancer")
}

fn connect(endpoint: Endpoint) -> TcpStream {
    TcpStream::connect(endpoint.as_socket_addr()).expect("connect")
}

/// Reads one line, returning `None` on timeout or a closed channel.
fn read_line_within(reader: &mut BufReader<TcpStream>, timeout: Duration) -> Option<String> {
    reader
        .get_ref()
        .set_read_timeout(Some(timeout))
        .expect("set read timeout");
    let mut line = String::new();
    match reader.read_line(&mut line) {
        Ok(0) => None,
        Ok(_) => Some(line.trim_end().to_owned()),
        Err(ref e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => None,
        Err(e) => panic!("read failed: {e}"),
    }
}

/// Reads lines until the channel stays idle for `idle`.
fn count_lines(reader: &mut BufReader<TcpStream>, idle: Duration) -> usize {
    let mut count = 0;
    while read_line_within(reader, idle).is_some() {
        count += 1;
    }
    count
}

fn wait_for(mut pred: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    pred()
}

/// Engine that answers every spectrum with an empty result.
struct EchoEngine;

impl FitEngine for EchoEngine {
    fn fit(&mut self, _spectrum: &Spectrum) -> Result<FitOutcome, EngineError> {
        Ok(FitOutcome::default())
    }
}

/// Engine that fails on empty spectra and otherwise reports two peaks and
/// two inter-peak distances.
struct PickyEngine;

impl FitEngine for PickyEngine {
    fn fit(&mut self, spectrum: &Spectrum) -> Result<FitOutcome, EngineError> {
        if spectrum.is_empty() {
            return Err(EngineError::new("nothing to fit"));
        }
        Ok(FitOutcome {
            peaks: vec![300.0, 372.0],
            distances: vec![
                DistanceSample(72.0, json!(0.5)),
                DistanceSample(71.8, json!(0.6)),
            ],
        })
    }
}

fn spawn_worker<E: FitEngine + Send + 'static>(
    endpoints: Endpoints,
    mut engine: E,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut worker =
            Worker::connect_with_retry(endpoints.request_out, endpoints.response_in, TIMEOUT)
                .expect("worker connect");
        worker.run(&mut engine).expect("worker run");
    })
}

/// Property 1: messages pushed while the outbound endpoint has no consumer
/// must come out in order, without drops or duplicates, once one appears.
#[test]
fn fifo_preserved_through_unready_outbound() {
    let balancer = spawn_balancer();
    let endpoints = balancer.endpoints();

    let mut producer = connect(endpoints.request_in);
    for i in 0..5 {
        writeln!(producer, "m{i}").unwrap();
    }

    // Ingested but not deliverable: no worker is connected yet.
    assert!(
        wait_for(|| balancer.stats().requests_in == 5, TIMEOUT),
        "balancer never ingested the burst"
    );
    assert_eq!(balancer.stats().requests_out, 0);

    let mut worker = BufReader::new(connect(endpoints.request_out));
    let mut got = Vec::new();
    for _ in 0..5 {
        got.push(read_line_within(&mut worker, TIMEOUT).expect("forwarded line"));
    }
    assert_eq!(got, ["m0", "m1", "m2", "m3", "m4"]);
    assert!(
        read_line_within(&mut worker, Duration::from_millis(200)).is_none(),
        "balancer produced a duplicate"
    );

    balancer.shutdown();
}

/// Property 2: the request and response planes never leak into each other.
#[test]
fn no_cross_endpoint_leakage() {
    let balancer = spawn_balancer();
    let endpoints = balancer.endpoints();

    let mut producer_push = connect(endpoints.request_in);
    let mut worker_push = connect(endpoints.response_in);
    let mut worker_pull = BufReader::new(connect(endpoints.request_out));
    let mut producer_pull = BufReader::new(connect(endpoints.response_out));

    writeln!(producer_push, "a-request").unwrap();
    writeln!(worker_push, "a-response").unwrap();

    // Each plane delivers to its own consumer...
    assert_eq!(
        read_line_within(&mut worker_pull, TIMEOUT).as_deref(),
        Some("a-request")
    );
    assert_eq!(
        read_line_within(&mut producer_pull, TIMEOUT).as_deref(),
        Some("a-response")
    );

    // ...and nothing crosses over.
    assert!(read_line_within(&mut worker_pull, Duration::from_millis(300)).is_none());
    assert!(read_line_within(&mut producer_pull, Duration::from_millis(300)).is_none());

    balancer.shutdown();
}

/// Property 3: with two idle workers connected, a large burst reaches both
/// of them (no idle-worker starvation), and nothing is lost.
#[test]
fn work_queue_spreads_across_idle_workers() {
    let balancer = spawn_balancer();
    let endpoints = balancer.endpoints();

    let mut first = BufReader::new(connect(endpoints.request_out));
    let mut second = BufReader::new(connect(endpoints.request_out));
    // Let the balancer register both consumers before the burst.
    thread::sleep(Duration::from_millis(100));

    let mut producer = connect(endpoints.request_in);
    for i in 0..100 {
        writeln!(producer, "job-{i}").unwrap();
    }

    let first_count = count_lines(&mut first, Duration::from_millis(300));
    let second_count = count_lines(&mut second, Duration::from_millis(300));

    assert!(first_count > 0, "first worker starved");
    assert!(second_count > 0, "second worker starved");
    assert_eq!(first_count + second_count, 100);

    balancer.shutdown();
}

/// Property 4: N sent with e fitter failures reconciles to N-e results,
/// sent=N, received=N-e, errors=e.
#[test]
fn batch_reconciliation_counts_errors() {
    let balancer = spawn_balancer();
    let endpoints = balancer.endpoints();
    let worker = spawn_worker(endpoints, PickyEngine);

    let mut dispatcher =
        Dispatcher::connect_with_retry(endpoints.request_in, endpoints.response_out, TIMEOUT)
            .expect("dispatcher connect");

    let key = CorrelationKey::from("crt-0/sipm-7");
    let spectra = [
        Spectrum::from_counts(&[5, 9, 3]),
        Spectrum::new(), // no bins -> ERR
        Spectrum::from_counts(&[1]),
        Spectrum::new(), // no bins -> ERR
        Spectrum::from_counts(&[2, 2]),
        Spectrum::from_counts(&[8]),
    ];
    let outcome = dispatcher.dispatch_and_collect(&key, &spectra).unwrap();

    assert_eq!(outcome.stats.sent, 6);
    assert_eq!(outcome.stats.received, 4);
    assert_eq!(outcome.stats.errors, 2);
    assert!(!outcome.stats.timed_out);
    assert_eq!(outcome.distances.len(), 8); // two per successful fit
    assert_eq!(outcome.peaks.len(), 8);

    balancer.shutdown();
    worker.join().unwrap();
}

/// Property 5: a response missing the `distances` field is counted and
/// skipped; the collect loop keeps going.
#[test]
fn malformed_response_is_counted_not_fatal() {
    let balancer = spawn_balancer();
    let endpoints = balancer.endpoints();

    // Hand-rolled worker: answers the first request without `distances`,
    // echoes the second one properly.
    let raw_worker = thread::spawn(move || {
        let mut input = BufReader::new(connect(endpoints.request_out));
        let mut output = connect(endpoints.response_in);

        let first = read_line_within(&mut input, TIMEOUT).expect("first request");
        let _: FitRequest = serde_json::from_str(&first).unwrap();
        writeln!(output, r#"{{"key":"A","peaks":[1.0]}}"#).unwrap();

        let second = read_line_within(&mut input, TIMEOUT).expect("second request");
        let request: FitRequest = serde_json::from_str(&second).unwrap();
        let reply = wire::encode_response(&FitResult {
            key: request.key,
            peaks: vec![2.5],
            distances: vec![DistanceSample(70.0, json!(0.3))],
        })
        .unwrap();
        writeln!(output, "{reply}").unwrap();
    });

    let mut dispatcher =
        Dispatcher::connect_with_retry(endpoints.request_in, endpoints.response_out, TIMEOUT)
            .expect("dispatcher connect");

    let key = CorrelationKey::from("A");
    let outcome = dispatcher
        .dispatch_and_collect(
            &key,
            &[Spectrum::from_counts(&[1]), Spectrum::from_counts(&[2])],
        )
        .unwrap();

    assert_eq!(outcome.stats.sent, 2);
    assert_eq!(outcome.stats.received, 1);
    assert_eq!(outcome.stats.errors, 1);
    assert_eq!(outcome.distances, vec![DistanceSample(70.0, json!(0.3))]);
    assert_eq!(outcome.peaks, vec![2.5]);

    raw_worker.join().unwrap();
    balancer.shutdown();
}

/// Property 6: if a response is lost outright, the collect loop blocks.
/// The timeout below is the harness guard documenting that hang; the
/// fabric itself enforces no bound.
#[test]
#[serial]
fn lost_response_blocks_forever() {
    let balancer = spawn_balancer();
    let endpoints = balancer.endpoints();

    // Worker that answers the first request and swallows the second.
    let swallow = thread::spawn(move || {
        let mut input = BufReader::new(connect(endpoints.request_out));
        let mut output = connect(endpoints.response_in);

        let first = read_line_within(&mut input, TIMEOUT).expect("first request");
        let request: FitRequest = serde_json::from_str(&first).unwrap();
        let reply = wire::encode_response(&FitResult {
            key: request.key,
            peaks: Vec::new(),
            distances: Vec::new(),
        })
        .unwrap();
        writeln!(output, "{reply}").unwrap();

        let _ = read_line_within(&mut input, TIMEOUT); // pulled, never answered
        thread::park(); // hold the connections open
    });

    let (done_tx, done_rx) = mpsc::channel();
    let dispatch = thread::spawn(move || {
        let mut dispatcher =
            Dispatcher::connect_with_retry(endpoints.request_in, endpoints.response_out, TIMEOUT)
                .expect("dispatcher connect");
        let result = dispatcher.dispatch_and_collect(
            &CorrelationKey::from("A"),
            &[Spectrum::from_counts(&[1]), Spectrum::from_counts(&[2])],
        );
        let _ = done_tx.send(result);
    });

    assert!(
        done_rx.recv_timeout(Duration::from_secs(1)).is_err(),
        "dispatch_and_collect returned despite a lost response"
    );

    // Tearing the fabric down is what finally unblocks the dispatcher,
    // with a channel error rather than a result.
    balancer.shutdown();
    let result = done_rx
        .recv_timeout(TIMEOUT)
        .expect("dispatcher never unblocked");
    assert!(result.is_err());

    dispatch.join().unwrap();
    swallow.thread().unpark();
    swallow.join().unwrap();
}

/// The redesign escape hatch for property 6: a configured deadline turns
/// the hang into a partial result flagged `timed_out`.
#[test]
#[serial]
fn deadline_returns_partial_results() {
    let balancer = spawn_balancer();
    let endpoints = balancer.endpoints();

    let swallow = thread::spawn(move || {
        let mut input = BufReader::new(connect(endpoints.request_out));
        let mut output = connect(endpoints.response_in);

        let first = read_line_within(&mut input, TIMEOUT).expect("first request");
        let request: FitRequest = serde_json::from_str(&first).unwrap();
        let reply = wire::encode_response(&FitResult {
            key: request.key,
            peaks: vec![5.0],
            distances: vec![DistanceSample(70.0, json!(0.1))],
        })
        .unwrap();
        writeln!(output, "{reply}").unwrap();

        let _ = read_line_within(&mut input, TIMEOUT); // pulled, never answered
        thread::park();
    });

    let mut dispatcher =
        Dispatcher::connect_with_retry(endpoints.request_in, endpoints.response_out, TIMEOUT)
            .expect("dispatcher connect");
    dispatcher.set_deadline(Some(Duration::from_millis(400)));

    let key = CorrelationKey::from("A");
    let outcome = dispatcher
        .dispatch_and_collect(
            &key,
            &[Spectrum::from_counts(&[1]), Spectrum::from_counts(&[2])],
        )
        .unwrap();

    assert_eq!(outcome.stats.sent, 2);
    assert_eq!(outcome.stats.received, 1);
    assert_eq!(outcome.stats.errors, 0);
    assert!(outcome.stats.timed_out);
    assert_eq!(outcome.distances.len(), 1);

    balancer.shutdown();
    swallow.thread().unpark();
    swallow.join().unwrap();
}

/// Property 7: three producers, two echo workers, five requests each;
/// every producer reconciles cleanly no matter which worker served what.
#[test]
fn three_producers_two_workers_reconcile_cleanly() {
    let balancer = spawn_balancer();
    let endpoints = balancer.endpoints();

    // Connect all three producers before any traffic flows so each owns
    // its response channel from the start.
    let dispatchers: Vec<(CorrelationKey, Dispatcher)> = ["A", "B", "C"]
        .iter()
        .map(|&name| {
            let dispatcher =
                Dispatcher::connect_with_retry(endpoints.request_in, endpoints.response_out, TIMEOUT)
                    .expect("dispatcher connect");
            (CorrelationKey::from(name), dispatcher)
        })
        .collect();

    let workers: Vec<_> = (0..2).map(|_| spawn_worker(endpoints, EchoEngine)).collect();

    let producers: Vec<_> = dispatchers
        .into_iter()
        .map(|(key, mut dispatcher)| {
            thread::spawn(move || {
                let spectra = vec![Spectrum::from_counts(&[3, 1, 4]); 5];
                dispatcher
                    .dispatch_and_collect(&key, &spectra)
                    .expect("dispatch")
            })
        })
        .collect();

    for producer in producers {
        let outcome = producer.join().unwrap();
        assert_eq!(outcome.stats.sent, 5);
        assert_eq!(outcome.stats.received, 5);
        assert_eq!(outcome.stats.errors, 0);
        assert!(outcome.distances.is_empty());
        assert!(outcome.peaks.is_empty());
    }

    let stats = balancer.stats();
    assert_eq!(stats.requests_in, 15);
    assert_eq!(stats.requests_out, 15);
    assert_eq!(stats.responses_in, 15);
    assert_eq!(stats.responses_out, 15);

    balancer.shutdown();
    for worker in workers {
        worker.join().unwrap();
    }
}
