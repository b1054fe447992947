//! Worker-side harness: pull one request, fit, push one response.
//!
//! The harness owns the protocol plumbing; the numerics live behind the
//! [`FitEngine`] trait (in production a peak-finder process links one in).
//! Per accepted request the worker emits at most one response: a
//! [`FitResult`] echoing the request key, or the bare `ERR` token when the
//! engine found nothing usable. A worker that dies between pull and push
//! loses the request silently; the dispatcher's accounting is the only
//! place that loss shows up.

use std::io::{self, BufRead, BufReader, Write};
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::net::Endpoint;
use crate::trace::{debug, info, warn};
use crate::wire::{self, DistanceSample, FitResult, Spectrum};

/// Interval between connection attempts in [`Worker::connect_with_retry`].
const RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// What a fitting engine produced for one spectrum.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FitOutcome {
    /// Fitted peak positions.
    pub peaks: Vec<f64>,
    /// Inter-peak distances with their opaque pair identifiers.
    pub distances: Vec<DistanceSample>,
}

/// Failure reported by a fitting engine.
///
/// The worker answers it with the wire-level `ERR` token; the reason never
/// leaves the worker process except through its own logs.
#[derive(Debug, Error)]
#[error("fit failed: {reason}")]
pub struct EngineError {
    reason: String,
}

impl EngineError {
    /// Creates an error with a human-readable reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// The seam between the fabric and the fitting numerics.
///
/// Implementations fit peaks in one spectrum and derive inter-peak
/// distances. They may keep state (warm caches, fit parameter seeds)
/// across calls; the harness calls `fit` strictly sequentially.
pub trait FitEngine {
    /// Fits one spectrum.
    ///
    /// # Errors
    ///
    /// Returns an error when no usable peak structure was found; the
    /// harness reports it as the wire-level failure token.
    fn fit(&mut self, spectrum: &Spectrum) -> Result<FitOutcome, EngineError>;
}

/// Error in the worker's protocol plumbing.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Could not reach one of the balancer's worker-facing endpoints.
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: Endpoint,
        source: io::Error,
    },
    /// Response serialization failed.
    #[error("failed to encode response: {0}")]
    Encode(#[from] serde_json::Error),
    /// Socket failure on either channel.
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

/// One worker's connection pair to the balancer.
pub struct Worker {
    input: BufReader<TcpStream>,
    output: TcpStream,
}

impl Worker {
    /// Connects to the balancer's request-pull and response-push endpoints.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Connect`] naming the endpoint that refused.
    pub fn connect(input: Endpoint, output: Endpoint) -> Result<Self, WorkerError> {
        let input_stream =
            TcpStream::connect(input.as_socket_addr()).map_err(|source| WorkerError::Connect {
                endpoint: input,
                source,
            })?;
        let output_stream =
            TcpStream::connect(output.as_socket_addr()).map_err(|source| WorkerError::Connect {
                endpoint: output,
                source,
            })?;
        output_stream.set_nodelay(true)?;
        debug!(input = %input, output = %output, "worker connected");
        Ok(Self {
            input: BufReader::new(input_stream),
            output: output_stream,
        })
    }

    /// Like [`Worker::connect`], retrying until `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns the last connection error once the timeout is exhausted.
    pub fn connect_with_retry(
        input: Endpoint,
        output: Endpoint,
        timeout: Duration,
    ) -> Result<Self, WorkerError> {
        let give_up = Instant::now() + timeout;
        loop {
            match Self::connect(input, output) {
                Ok(worker) => return Ok(worker),
                Err(e) => {
                    if Instant::now() >= give_up {
                        return Err(e);
                    }
                    thread::sleep(RETRY_INTERVAL);
                }
            }
        }
    }

    /// Serves requests until the input channel closes.
    ///
    /// # Errors
    ///
    /// Returns an error on socket failure; a closed input channel is a
    /// normal exit.
    pub fn run<E: FitEngine>(&mut self, engine: &mut E) -> Result<(), WorkerError> {
        info!("worker serving");
        while self.serve_one(engine)? {}
        info!("worker input closed, exiting");
        Ok(())
    }

    /// Serves a single request.
    ///
    /// Returns `false` when the input channel has closed. Undecodable
    /// requests are logged and skipped rather than killing the worker;
    /// either way the producer only sees the missing response.
    ///
    /// # Errors
    ///
    /// Returns an error on socket failure or unserializable output.
    pub fn serve_one<E: FitEngine>(&mut self, engine: &mut E) -> Result<bool, WorkerError> {
        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Ok(false);
        }
        let line = line.trim_end();
        if line.is_empty() {
            return Ok(true);
        }

        let request = match wire::decode_request(line) {
            Ok(request) => request,
            Err(_e) => {
                warn!(error = %_e, "skipping undecodable request");
                return Ok(true);
            }
        };

        let reply = match engine.fit(&request.spectrum) {
            Ok(outcome) => {
                debug!(
                    key = %request.key,
                    peaks = outcome.peaks.len(),
                    distances = outcome.distances.len(),
                    "fit complete"
                );
                wire::encode_response(&FitResult {
                    key: request.key,
                    peaks: outcome.peaks,
                    distances: outcome.distances,
                })?
            }
            Err(_e) => {
                debug!(key = %request.key, error = %_e, "fit failed");
                wire::ERR_SENTINEL.to_owned()
            }
        };

        self.output.write_all(reply.as_bytes())?;
        self.output.write_all(b"\n")?;
        Ok(true)
    }
}
