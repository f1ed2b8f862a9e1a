use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use clap::{Parser, ValueEnum};
use hdrhistogram::Histogram;
use tracing_subscriber::EnvFilter;

use qps_flowcontrol::{
    AdmissionOutcome, CallContext, ConfigChange, FlowControl, FlowControlError,
    FlowControlOptions, FlowDirection, OperationIdentity, Pipeline, QualifiedKey,
    SOURCE_MICROSERVICE_ATTRIBUTE, SystemTimeSource, WindowSizeMs,
};

#[derive(Clone, Copy, Debug, PartialEq, ValueEnum)]
enum Direction {
    Provider,
    Consumer,
}

impl From<Direction> for FlowDirection {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Provider => FlowDirection::Provider,
            Direction::Consumer => FlowDirection::Consumer,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum KeyDist {
    Hot,
    Uniform,
    Skewed,
}

#[derive(Clone, Copy, Debug, PartialEq, ValueEnum)]
enum Mode {
    Max,
    TargetQps,
}

#[derive(Clone, Copy, Debug, PartialEq, ValueEnum)]
enum LimitLevel {
    /// One limit shared by every call.
    Global,
    /// One limit per microservice.
    Microservice,
    /// One limit per microservice schema.
    Schema,
    /// One limit per operation.
    Operation,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "qps-flowcontrol-stress",
    about = "Load test / benchmark harness for qps-flowcontrol"
)]
struct Args {
    #[arg(long, value_enum, default_value_t = Direction::Consumer)]
    direction: Direction,

    #[arg(long, value_enum, default_value_t = KeyDist::Hot)]
    key_dist: KeyDist,

    #[arg(long, value_enum, default_value_t = Mode::Max)]
    mode: Mode,

    #[arg(long, value_enum, default_value_t = LimitLevel::Operation)]
    limit_level: LimitLevel,

    #[arg(long, default_value_t = 8)]
    threads: usize,

    #[arg(long, default_value_t = 10)]
    duration_s: u64,

    #[arg(long, default_value_t = 1000)]
    window_ms: u64,

    #[arg(long, default_value_t = 1000)]
    key_space: usize,

    #[arg(long, default_value_t = 0.8)]
    hot_fraction: f64,

    #[arg(long, default_value_t = 100)]
    sample_every: u64,

    /// Limit configured for every key at `--limit-level`.
    #[arg(long, default_value_t = 1000)]
    limit: i64,

    /// Alternate the limit between `--limit` and half of it at this interval.
    #[arg(long)]
    reconfigure_every_ms: Option<u64>,

    #[arg(long)]
    target_qps: Option<u64>,

    #[arg(long)]
    burst_qps: Option<u64>,

    #[arg(long, default_value_t = 30_000)]
    burst_period_ms: u64,

    #[arg(long, default_value_t = 5_000)]
    burst_duration_ms: u64,
}

#[derive(Default)]
struct Counts {
    forwarded: AtomicU64,
    rejected: AtomicU64,
}

struct Call<'a> {
    source: Option<&'a str>,
    operation: &'a OperationIdentity,
}

impl CallContext for Call<'_> {
    fn attribute(&self, name: &str) -> Option<&str> {
        (name == SOURCE_MICROSERVICE_ATTRIBUTE)
            .then_some(self.source)
            .flatten()
    }

    fn operation(&self) -> Option<&OperationIdentity> {
        Some(self.operation)
    }
}

/// Terminal stage: only counts what reaches it.
struct Sink<'a> {
    counts: &'a Counts,
}

impl<'a> Pipeline<Call<'a>> for Sink<'_> {
    fn proceed(&mut self, _call: Call<'a>) {
        self.counts.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    fn fail(&mut self, _call: Call<'a>, _error: FlowControlError) {
        self.counts.rejected.fetch_add(1, Ordering::Relaxed);
    }
}

fn build_operations(args: &Args) -> Vec<OperationIdentity> {
    let n = match args.key_dist {
        KeyDist::Hot => 1,
        _ => args.key_space.max(1),
    };

    (0..n)
        .map(|i| OperationIdentity::new(format!("svc_{}", i % 64), format!("schema_{i}"), "op"))
        .collect()
}

fn caller_name(thread: usize) -> String {
    format!("caller_{thread}")
}

/// Key a configured limit must use to govern `operation` called by `caller`.
///
/// Provider-side keys name the calling microservice, consumer-side keys the
/// target one.
fn limit_key(args: &Args, caller: &str, operation: &OperationIdentity) -> QualifiedKey {
    let microservice = match args.direction {
        Direction::Provider => caller,
        Direction::Consumer => operation.microservice.as_str(),
    };

    match args.limit_level {
        LimitLevel::Global => QualifiedKey::global(),
        LimitLevel::Microservice => QualifiedKey::microservice(microservice),
        LimitLevel::Schema => QualifiedKey::schema(microservice, &operation.schema),
        LimitLevel::Operation => {
            QualifiedKey::operation(microservice, &operation.schema, &operation.operation)
        }
    }
}

fn limit_changes(fc: &FlowControl, args: &Args, operations: &[OperationIdentity], limit: i64) {
    let handler = fc.handler(args.direction.into());
    let names = handler.registry().property_names();

    let callers: Vec<String> = match args.direction {
        Direction::Provider => (0..args.threads).map(caller_name).collect(),
        Direction::Consumer => vec![String::new()],
    };

    let mut keys: Vec<QualifiedKey> = callers
        .iter()
        .flat_map(|caller| operations.iter().map(move |op| limit_key(args, caller, op)))
        .collect();
    keys.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    keys.dedup();

    for key in keys {
        fc.apply_change(&ConfigChange::set(names.limit_for(&key), limit));
    }
}

fn should_sample(iter: u64, sample_every: u64) -> bool {
    if sample_every <= 1 {
        return true;
    }

    iter.is_multiple_of(sample_every)
}

fn qps_for_now(args: &Args, started: Instant) -> Option<u64> {
    if args.mode == Mode::Max {
        return None;
    }

    let base = args.target_qps?;

    if let Some(burst_qps) = args.burst_qps {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let in_period = elapsed_ms % args.burst_period_ms.max(1);
        if in_period < args.burst_duration_ms {
            return Some(burst_qps);
        }
    }

    Some(base)
}

fn pick_operation<'a>(
    args: &Args,
    operations: &'a [OperationIdentity],
    rng: &mut impl FnMut() -> u64,
) -> &'a OperationIdentity {
    match args.key_dist {
        KeyDist::Hot => &operations[0],
        KeyDist::Uniform => &operations[(rng() as usize) % operations.len()],
        KeyDist::Skewed => {
            let r = (rng() % 10_000) as f64 / 10_000.0;
            if r < args.hot_fraction {
                &operations[0]
            } else {
                let tail = operations.len().saturating_sub(1).max(1);
                &operations[(1 + (rng() as usize) % tail) % operations.len()]
            }
        }
    }
}

fn print_results(
    args: &Args,
    elapsed: Duration,
    ops: u64,
    hist: &Histogram<u64>,
    counts: &Counts,
    controllers: usize,
) {
    println!(
        "direction={:?} mode={:?} limit_level={:?} limit={}",
        args.direction, args.mode, args.limit_level, args.limit
    );
    println!(
        "threads={} duration_s={} window_ms={} key_dist={:?} key_space={} controllers={}",
        args.threads,
        args.duration_s,
        args.window_ms,
        args.key_dist,
        args.key_space,
        controllers
    );
    println!(
        "elapsed_s={:.3} ops={} ops_per_s={:.0}",
        elapsed.as_secs_f64(),
        ops,
        ops as f64 / elapsed.as_secs_f64()
    );
    println!(
        "forwarded={} rejected={}",
        counts.forwarded.load(Ordering::Relaxed),
        counts.rejected.load(Ordering::Relaxed)
    );

    if hist.is_empty() {
        println!("no latency samples collected");
        return;
    }

    println!(
        "lat_ns p50={} p95={} p99={} p999={} max={}",
        hist.value_at_quantile(0.50),
        hist.value_at_quantile(0.95),
        hist.value_at_quantile(0.99),
        hist.value_at_quantile(0.999),
        hist.max()
    );
    println!("sample_every={} samples={}", args.sample_every, hist.len());
}

fn run(args: Args) -> Result<(), String> {
    let window_size_ms = WindowSizeMs::try_from(args.window_ms)?;
    let fc = Arc::new(FlowControl::new(FlowControlOptions {
        window_size_ms,
        time_source: Arc::new(SystemTimeSource),
        ..FlowControlOptions::default()
    }));

    let operations = Arc::new(build_operations(&args));
    limit_changes(&fc, &args, &operations, args.limit);

    let stop = Arc::new(AtomicBool::new(false));
    let counts = Arc::new(Counts::default());
    let total_ops = Arc::new(AtomicU64::new(0));

    let started = Instant::now();
    let deadline = started + Duration::from_secs(args.duration_s);

    let mut handles = Vec::with_capacity(args.threads);
    for t in 0..args.threads {
        let fc = Arc::clone(&fc);
        let operations = Arc::clone(&operations);
        let stop = Arc::clone(&stop);
        let counts = Arc::clone(&counts);
        let total_ops = Arc::clone(&total_ops);
        let args = args.clone();

        handles.push(std::thread::spawn(move || {
            let mut hist = Histogram::<u64>::new_with_bounds(1, 60_000_000_000, 3)
                .map_err(|err| err.to_string())?;
            let handler = fc.handler(args.direction.into());
            let mut sink = Sink { counts: &counts };
            let source = caller_name(t);
            let mut i = 0_u64;
            let mut seed = (t as u64 + 1) * 0x9E37_79B9_7F4A_7C15;
            let mut next_deadline = Instant::now();

            let mut rng_u64 = || {
                // xorshift64*
                seed ^= seed >> 12;
                seed ^= seed << 25;
                seed ^= seed >> 27;
                seed = seed.wrapping_mul(0x2545_F491_4F6C_DD1D);
                seed
            };

            while !stop.load(Ordering::Relaxed) && Instant::now() < deadline {
                if let Some(qps) = qps_for_now(&args, started) {
                    let per_op_ns = 1_000_000_000u64 / qps.max(1);
                    let now = Instant::now();
                    if now < next_deadline {
                        std::thread::sleep(next_deadline - now);
                    }
                    next_deadline += Duration::from_nanos(per_op_ns);
                }

                i = i.wrapping_add(1);
                let operation = pick_operation(&args, &operations, &mut rng_u64);
                let call = Call {
                    source: Some(source.as_str()),
                    operation,
                };

                let t0 = should_sample(i, args.sample_every).then(Instant::now);
                let outcome = handler.handle(call, &mut sink);

                if let Some(t0) = t0 {
                    let ns = t0.elapsed().as_nanos() as u64;
                    let _ = hist.record(ns.max(1));
                }

                total_ops.fetch_add(1, Ordering::Relaxed);
                if outcome == AdmissionOutcome::FailureSignaled {
                    tracing::trace!(thread = t, "stress.rejected");
                }
            }

            Ok::<_, String>(hist)
        }));
    }

    match args.reconfigure_every_ms {
        Some(every_ms) => {
            let mut low = false;
            while Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(every_ms.max(1)));
                low = !low;
                let limit = if low { args.limit / 2 } else { args.limit };
                tracing::info!(limit, "stress.reconfigure");
                limit_changes(&fc, &args, &operations, limit);
            }
        }
        None => std::thread::sleep(Duration::from_secs(args.duration_s)),
    }
    stop.store(true, Ordering::Relaxed);

    let mut merged =
        Histogram::<u64>::new_with_bounds(1, 60_000_000_000, 3).map_err(|err| err.to_string())?;
    for h in handles {
        let hist = h.join().map_err(|_| "worker thread panicked".to_string())??;
        merged.add(&hist).map_err(|err| err.to_string())?;
    }

    let controllers = fc.handler(args.direction.into()).registry().len();
    print_results(
        &args,
        started.elapsed(),
        total_ops.load(Ordering::Relaxed),
        &merged,
        &counts,
        controllers,
    );

    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    if let Err(err) = run(args) {
        eprintln!("error: {err}");
        std::process::exit(2);
    }
}

#[cfg(test)]
mod tests {
    use qps_flowcontrol::KeyResolver;

    use super::*;

    fn args(direction: &str) -> Args {
        Args::parse_from([
            "qps-flowcontrol-stress",
            "--direction",
            direction,
            "--limit-level",
            "microservice",
        ])
    }

    #[test]
    fn provider_limits_are_keyed_on_caller() {
        let operation = OperationIdentity::new("svc_1", "schema_1", "op");

        let provider = limit_key(&args("provider"), &caller_name(3), &operation);
        let consumer = limit_key(&args("consumer"), &caller_name(3), &operation);

        assert_eq!(provider.as_str(), "caller_3");
        assert_eq!(consumer.as_str(), "svc_1");
    }

    #[test]
    fn provider_limits_govern_generated_calls() {
        let args = args("provider");
        let fc = FlowControl::new(FlowControlOptions::default());
        let operations = build_operations(&args);
        limit_changes(&fc, &args, &operations, 1);

        let registry = fc.provider().registry();
        let caller = caller_name(0);
        let candidates = KeyResolver::candidates(
            Some(caller.as_str()),
            Some(operations[0].schema.as_str()),
            Some(operations[0].operation.as_str()),
        );

        assert_eq!(registry.governing_key(&candidates).as_str(), "caller_0");
    }
}
