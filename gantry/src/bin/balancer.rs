//! Balancer daemon.
//!
//! Binds the four fabric endpoints and, optionally, launches the fitter
//! pool pointed at the worker-facing pair.
//!
//! # Usage
//!
//! ```sh
//! gantry-balancer --fitters 4 --fitter-cmd ./fitter
//! ```
//!
//! # Signals
//!
//! `SIGTERM` / `SIGINT` terminate the process; queued messages are
//! stranded (the fabric defines no graceful drain).

use std::time::Duration;

use gantry::balancer::{Balancer, BalancerConfig};
use gantry::net::Endpoint;
use gantry::pool::{FitterPool, PoolConfig};

struct Args {
    config: BalancerConfig,
    fitters: usize,
    fitter_cmd: String,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("gantry-balancer: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    let args = parse_args(&args)?;

    gantry::init_tracing();

    let balancer = Balancer::spawn(args.config)?;
    let endpoints = balancer.endpoints();
    eprintln!(
        "gantry-balancer: requests {} -> {}, responses {} -> {}",
        endpoints.request_in,
        endpoints.request_out,
        endpoints.response_in,
        endpoints.response_out
    );

    let pool = if args.fitters > 0 {
        Some(FitterPool::spawn(&PoolConfig {
            fitters: args.fitters,
            command: args.fitter_cmd,
            input: endpoints.request_out,
            output: endpoints.response_in,
        })?)
    } else {
        None
    };

    eprintln!("gantry-balancer: ready");

    // Block until the process is terminated. SIGINT/SIGTERM kill us; the
    // Drop impls on Balancer and FitterPool signal the loop thread and
    // reap the fitters on the way out. For clean systemd stop semantics,
    // wire up the signal-hook crate here.
    loop {
        std::thread::sleep(Duration::from_secs(3600));
        if let Some(pool) = &pool {
            eprintln!("gantry-balancer: {} fitter(s) under management", pool.len());
        }
    }
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut config = BalancerConfig::default();
    let mut fitters = 0usize;
    let mut fitter_cmd = "./fitter".to_owned();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--request-in" => {
                i += 1;
                config.request_in = endpoint_value(args, i, "--request-in")?;
            }
            "--request-out" => {
                i += 1;
                config.request_out = endpoint_value(args, i, "--request-out")?;
            }
            "--response-in" => {
                i += 1;
                config.response_in = endpoint_value(args, i, "--response-in")?;
            }
            "--response-out" => {
                i += 1;
                config.response_out = endpoint_value(args, i, "--response-out")?;
            }
            "--fitters" => {
                i += 1;
                let value = flag_value(args, i, "--fitters")?;
                fitters = value
                    .parse()
                    .map_err(|e| format!("invalid value for --fitters: {e}"))?;
            }
            "--fitter-cmd" => {
                i += 1;
                fitter_cmd = flag_value(args, i, "--fitter-cmd")?.clone();
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
        i += 1;
    }

    Ok(Args {
        config,
        fitters,
        fitter_cmd,
    })
}

fn flag_value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a String, String> {
    args.get(i).ok_or_else(|| format!("missing value for {flag}"))
}

fn endpoint_value(args: &[String], i: usize, flag: &str) -> Result<Endpoint, String> {
    flag_value(args, i, flag)?
        .parse()
        .map_err(|e| format!("invalid value for {flag}: {e}"))
}

fn print_usage() {
    eprintln!(
        r#"gantry-balancer - histogram fitting task balancer

USAGE:
    gantry-balancer [OPTIONS]

OPTIONS:
    --request-in <ADDR>     Producers push requests here (default: 0.0.0.0:7000)
    --request-out <ADDR>    Fitters pull requests from here (default: 0.0.0.0:7001)
    --response-in <ADDR>    Fitters push responses here (default: 0.0.0.0:8001)
    --response-out <ADDR>   Producers pull responses from here (default: 0.0.0.0:8000)
    --fitters <N>           Number of fitter processes to launch (default: 0, external)
    --fitter-cmd <PATH>     Fitter executable (default: ./fitter)
    -h, --help              Print this help message

EXAMPLE:
    gantry-balancer --fitters 4 --fitter-cmd ./fitter
    gantry-balancer --request-in 0.0.0.0:7100 --response-out 0.0.0.0:8100
"#
    );
}
