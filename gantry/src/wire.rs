//! Wire message formats for the fitting fabric.
//!
//! ## Wire Format
//!
//! All messages are single lines of UTF-8 text, newline-delimited. The
//! balancer never looks inside a line; only the dispatcher and the worker
//! harness decode them.
//!
//! | Message            | Layout |
//! |--------------------|--------|
//! | Request            | `{"key": "<opaque>", "spectrum": {"<bin>": <count>, ...}}` |
//! | Response (success) | `{"key": "<echoed>", "peaks": [..], "distances": [[<f64>, <pair-id>], ..]}` |
//! | Response (failure) | the literal token `ERR` (not JSON) |
//!
//! A JSON response lacking the `distances` field is treated the same as the
//! failure token: counted as an error and skipped by the dispatcher.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure token a fitter emits when it found nothing to fit.
pub const ERR_SENTINEL: &str = "ERR";

/// Opaque client-chosen token that lets a producer regroup responses
/// belonging to one logical unit of work.
///
/// The balancer never interprets it; uniqueness across concurrent batches
/// is the producer's responsibility.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationKey(String);

impl CorrelationKey {
    /// Creates a key from any string-like value.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CorrelationKey {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl std::fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A histogram payload: sparse map of bin index to event count.
///
/// Serialized as a JSON object with stringified bin indices
/// (`{"300": 17, ...}`), which is what the fitter expects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Spectrum(BTreeMap<u32, u64>);

impl Spectrum {
    /// Creates an empty spectrum.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a spectrum from a dense slice of counts, binned from zero.
    #[must_use]
    pub fn from_counts(counts: &[u64]) -> Self {
        Self(
            counts
                .iter()
                .enumerate()
                .map(|(bin, &count)| (bin as u32, count))
                .collect(),
        )
    }

    /// Sets the count for one bin.
    pub fn insert(&mut self, bin: u32, count: u64) {
        self.0.insert(bin, count);
    }

    /// Returns the number of populated bins.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if no bin is populated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the total number of events across all bins.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    /// Iterates over `(bin, count)` pairs in bin order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, u64)> + '_ {
        self.0.iter().map(|(&bin, &count)| (bin, count))
    }
}

/// One inter-peak distance paired with an opaque pair identifier.
///
/// The second element is whatever the fitter attached to the distance
/// (historically the fit uncertainty); the fabric carries it untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistanceSample(pub f64, pub serde_json::Value);

/// A unit of fitting work submitted by a producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitRequest {
    /// Correlation key echoed back in the response.
    pub key: CorrelationKey,
    /// Histogram to fit.
    pub spectrum: Spectrum,
}

/// A successful fitter response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FitResult {
    /// Correlation key copied from the request.
    pub key: CorrelationKey,
    /// Fitted peak positions.
    pub peaks: Vec<f64>,
    /// Inter-peak distances.
    pub distances: Vec<DistanceSample>,
}

/// Raw deserialization target: `distances` is what gates well-formedness,
/// `peaks` may legitimately be absent.
#[derive(Deserialize)]
struct RawResponse {
    key: CorrelationKey,
    #[serde(default)]
    peaks: Vec<f64>,
    distances: Option<Vec<DistanceSample>>,
}

/// Errors decoding a fitter response at the client boundary.
///
/// The dispatcher counts every variant as one error and keeps consuming;
/// none of them aborts a batch.
#[derive(Debug, Error)]
pub enum ResponseError {
    /// The fitter reported failure with the explicit sentinel token.
    #[error("fitter reported failure")]
    Fitter,
    /// Well-formed JSON, but the `distances` field is missing.
    #[error("response missing distances field")]
    MissingDistances,
    /// The line is neither the sentinel nor valid JSON.
    #[error("malformed response: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encodes a request as one wire line (without the trailing newline).
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn encode_request(request: &FitRequest) -> Result<String, serde_json::Error> {
    serde_json::to_string(request)
}

/// Decodes a request line.
///
/// # Errors
///
/// Returns an error if the line is not a valid request object.
pub fn decode_request(line: &str) -> Result<FitRequest, serde_json::Error> {
    serde_json::from_str(line)
}

/// Encodes a successful response as one wire line.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn encode_response(result: &FitResult) -> Result<String, serde_json::Error> {
    serde_json::to_string(result)
}

/// Decodes a response line at the client boundary.
///
/// # Errors
///
/// - [`ResponseError::Fitter`] for the literal `ERR` token
/// - [`ResponseError::MissingDistances`] for JSON without `distances`
/// - [`ResponseError::Json`] for anything unparseable
pub fn decode_response(line: &str) -> Result<FitResult, ResponseError> {
    let line = line.trim_end();
    if line == ERR_SENTINEL {
        return Err(ResponseError::Fitter);
    }
    let raw: RawResponse = serde_json::from_str(line)?;
    match raw.distances {
        Some(distances) => Ok(FitResult {
            key: raw.key,
            peaks: raw.peaks,
            distances,
        }),
        None => Err(ResponseError::MissingDistances),
    }
}

/// Splits complete newline-terminated lines out of `buf`.
///
/// Returned lines exclude the terminator. Any trailing partial line stays
/// in the buffer until the rest of it arrives.
pub fn drain_lines(buf: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut lines = Vec::new();
    let mut start = 0;
    while let Some(pos) = buf[start..].iter().position(|&b| b == b'\n') {
        lines.push(buf[start..start + pos].to_vec());
        start += pos + 1;
    }
    buf.drain(..start);
    lines
}
