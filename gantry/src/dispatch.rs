//! Dispatch/correlate client.
//!
//! A producer submits a batch of spectra under one correlation key, then
//! reconciles the response stream against the batch by *count*: exactly as
//! many receives as sends, with explicit fitter failures tallied and
//! skipped. The balancer in between guarantees nothing about ordering
//! across workers, so the key embedded in each response is what files a
//! result with its batch.
//!
//! The receive loop deliberately does not verify that every consumed
//! response belongs to its own key; each producer is expected to own a
//! private response endpoint (single tenant). A response that never
//! arrives (worker crash) blocks the loop forever by default; callers can
//! bound the wait with [`Dispatcher::set_deadline`] and accept partial
//! results instead.

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Write};
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::net::Endpoint;
use crate::trace::{debug, info, warn};
use crate::wire::{self, CorrelationKey, DistanceSample, FitRequest, Spectrum};

/// Interval between connection attempts in [`Dispatcher::connect_with_retry`].
const RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Reconciliation counters for one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    /// Work items submitted.
    pub sent: usize,
    /// Well-formed responses consumed.
    pub received: usize,
    /// Error sentinels and malformed responses consumed.
    pub errors: usize,
    /// True if a configured deadline expired before the batch converged.
    pub timed_out: bool,
}

/// Everything collected for one batch key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    /// Inter-peak distances accumulated across the batch.
    pub distances: Vec<DistanceSample>,
    /// Peak positions accumulated across the batch.
    pub peaks: Vec<f64>,
    /// Reconciliation counters.
    pub stats: BatchStats,
}

/// Error submitting or collecting a batch.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Could not reach one of the balancer's producer-facing endpoints.
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: Endpoint,
        source: io::Error,
    },
    /// The response channel closed mid-batch: outstanding responses can
    /// never arrive.
    #[error("response channel closed")]
    ChannelClosed,
    /// Request serialization failed.
    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
    /// Socket failure on either channel.
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

/// Producer-side client: one connection pair to the balancer.
pub struct Dispatcher {
    submit: TcpStream,
    collect: BufReader<TcpStream>,
    deadline: Option<Duration>,
}

impl Dispatcher {
    /// Connects to the balancer's request-submit and response-receive
    /// endpoints.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Connect`] naming the endpoint that refused.
    pub fn connect(submit: Endpoint, collect: Endpoint) -> Result<Self, DispatchError> {
        let submit_stream =
            TcpStream::connect(submit.as_socket_addr()).map_err(|source| {
                DispatchError::Connect {
                    endpoint: submit,
                    source,
                }
            })?;
        submit_stream.set_nodelay(true)?;
        let collect_stream =
            TcpStream::connect(collect.as_socket_addr()).map_err(|source| {
                DispatchError::Connect {
                    endpoint: collect,
                    source,
                }
            })?;
        debug!(submit = %submit, collect = %collect, "dispatcher connected");
        Ok(Self {
            submit: submit_stream,
            collect: BufReader::new(collect_stream),
            deadline: None,
        })
    }

    /// Like [`Dispatcher::connect`], retrying until `timeout` elapses.
    ///
    /// Useful when the balancer is being brought up concurrently.
    ///
    /// # Errors
    ///
    /// Returns the last connection error once the timeout is exhausted.
    pub fn connect_with_retry(
        submit: Endpoint,
        collect: Endpoint,
        timeout: Duration,
    ) -> Result<Self, DispatchError> {
        let give_up = Instant::now() + timeout;
        loop {
            match Self::connect(submit, collect) {
                Ok(dispatcher) => return Ok(dispatcher),
                Err(e) => {
                    if Instant::now() >= give_up {
                        return Err(e);
                    }
                    thread::sleep(RETRY_INTERVAL);
                }
            }
        }
    }

    /// Bounds the collect phase of subsequent batches.
    ///
    /// `None` (the default) preserves the historical behavior: the collect
    /// loop blocks until every response arrives, forever if one was lost.
    /// With a deadline, an expired batch returns whatever was collected so
    /// far, flagged with `stats.timed_out`.
    pub fn set_deadline(&mut self, deadline: Option<Duration>) {
        self.deadline = deadline;
    }

    /// Submits one batch of spectra under `key` and collects its responses.
    ///
    /// Sends one request per spectrum, then performs exactly that many
    /// line-receives. Every error sentinel or malformed response is counted
    /// and skipped; well-formed results are filed under the key embedded in
    /// the response and the accumulation for the batch key is returned. A
    /// result set smaller than expected means partial data, not failure;
    /// downstream decides what is statistically usable.
    ///
    /// # Errors
    ///
    /// Returns an error on socket failure or if the response channel
    /// closes while responses are still outstanding. Lost responses do not
    /// error: without a deadline the call simply never returns.
    pub fn dispatch_and_collect(
        &mut self,
        key: &CorrelationKey,
        spectra: &[Spectrum],
    ) -> Result<BatchOutcome, DispatchError> {
        let mut stats = BatchStats::default();

        for spectrum in spectra {
            let request = FitRequest {
                key: key.clone(),
                spectrum: spectrum.clone(),
            };
            let line = wire::encode_request(&request)?;
            self.submit.write_all(line.as_bytes())?;
            self.submit.write_all(b"\n")?;
            stats.sent += 1;
        }
        self.submit.flush()?;
        debug!(key = %key, sent = stats.sent, "batch submitted");

        let started = Instant::now();
        let mut by_key: HashMap<CorrelationKey, (Vec<DistanceSample>, Vec<f64>)> = HashMap::new();
        let mut line = String::new();

        for _ in 0..stats.sent {
            if let Some(limit) = self.deadline {
                let Some(remaining) = limit.checked_sub(started.elapsed()) else {
                    stats.timed_out = true;
                    break;
                };
                self.collect
                    .get_ref()
                    .set_read_timeout(Some(remaining.max(Duration::from_millis(1))))?;
            }

            line.clear();
            match self.collect.read_line(&mut line) {
                Ok(0) => return Err(DispatchError::ChannelClosed),
                Ok(_) => absorb(&line, &mut stats, &mut by_key),
                Err(e)
                    if self.deadline.is_some()
                        && (e.kind() == io::ErrorKind::WouldBlock
                            || e.kind() == io::ErrorKind::TimedOut) =>
                {
                    stats.timed_out = true;
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }

        if self.deadline.is_some() {
            self.collect.get_ref().set_read_timeout(None)?;
        }

        info!(
            key = %key,
            sent = stats.sent,
            received = stats.received,
            errors = stats.errors,
            timed_out = stats.timed_out,
            "batch reconciled"
        );

        let (distances, peaks) = by_key.remove(key).unwrap_or_default();
        Ok(BatchOutcome {
            distances,
            peaks,
            stats,
        })
    }
}

/// Consumes one response line into the counters and the per-key bins.
fn absorb(
    line: &str,
    stats: &mut BatchStats,
    by_key: &mut HashMap<CorrelationKey, (Vec<DistanceSample>, Vec<f64>)>,
) {
    match wire::decode_response(line) {
        Ok(result) => {
            stats.received += 1;
            let (distances, peaks) = by_key.entry(result.key).or_default();
            distances.extend(result.distances);
            peaks.extend(result.peaks);
        }
        Err(_e) => {
            warn!(error = %_e, "discarding fitter response");
            stats.errors += 1;
        }
    }
}
