//! Fitter pool process management.
//!
//! Launches a fixed number of fitter subprocesses, each told where to pull
//! requests and push responses via `--input`/`--output` arguments. The
//! pool never restarts or resizes: a crashed fitter simply stops pulling
//! and its in-flight request is lost (the dispatcher's accounting is where
//! that shows up).

use std::io;
use std::process::{Child, Command};

use thiserror::Error;

use crate::net::Endpoint;
use crate::trace::{debug, info, warn};

/// Configuration for a fitter pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of fitter processes to launch.
    pub fitters: usize,
    /// Fitter executable.
    pub command: String,
    /// Endpoint the fitters pull requests from (the balancer's
    /// `request_out`).
    pub input: Endpoint,
    /// Endpoint the fitters push responses to (the balancer's
    /// `response_in`).
    pub output: Endpoint,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            fitters: 4,
            command: "./fitter".to_owned(),
            input: Endpoint::localhost(7001),
            output: Endpoint::localhost(8001),
        }
    }
}

/// Error launching the pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A fitter process could not be started.
    #[error("failed to launch {command}: {source}")]
    Spawn { command: String, source: io::Error },
}

/// A running pool of fitter subprocesses.
#[derive(Debug)]
pub struct FitterPool {
    children: Vec<Child>,
}

impl FitterPool {
    /// Launches the configured number of fitter processes.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Spawn`] on the first launch failure; fitters
    /// already started keep running and are reaped when the pool drops.
    pub fn spawn(config: &PoolConfig) -> Result<Self, PoolError> {
        let mut pool = Self {
            children: Vec::with_capacity(config.fitters),
        };
        for _ in 0..config.fitters {
            let child = Command::new(&config.command)
                .arg("--input")
                .arg(config.input.connectable().to_string())
                .arg("--output")
                .arg(config.output.connectable().to_string())
                .spawn()
                .map_err(|source| PoolError::Spawn {
                    command: config.command.clone(),
                    source,
                })?;
            debug!(pid = child.id(), "fitter started");
            pool.children.push(child);
        }
        info!(
            fitters = pool.children.len(),
            command = %config.command,
            input = %config.input.connectable(),
            output = %config.output.connectable(),
            "fitter pool running"
        );
        Ok(pool)
    }

    /// Returns the number of fitters launched.
    #[must_use]
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Returns `true` if the pool holds no fitters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Kills and reaps every fitter.
    pub fn shutdown(mut self) {
        self.kill_all();
    }

    fn kill_all(&mut self) {
        for mut child in self.children.drain(..) {
            if let Err(_e) = child.kill() {
                warn!(pid = child.id(), error = %_e, "failed to kill fitter");
            }
            let _ = child.wait();
        }
    }
}

impl Drop for FitterPool {
    fn drop(&mut self) {
        self.kill_all();
    }
}
