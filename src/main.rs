use std::net::IpAddr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use mtr_trace::report;
use mtr_trace::target::{DEFAULT_MAX_TTL, outbound_source};
use mtr_trace::tracer::DEFAULT_BATCH_SIZE;
use mtr_trace::{ProbeProtocol, ResolvedTarget, Target, TraceResult, Tracer, TracerConfig};

mod logging;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Every probe attempt
    Raw,
    /// One line per TTL
    Aggregate,
    Both,
    Table,
    /// JSON lines, one result each
    Json,
}

#[derive(Parser, Debug)]
#[clap(
    author,
    version,
    about = "Traces the route to many targets at once over raw sockets."
)]
struct CliArgs {
    /// Source address; the outbound interface address is used if unset
    #[clap(short, long, env = "MTR_SOURCE", default_value = "0.0.0.0")]
    source: String,

    /// Destination address to trace, may be repeated
    #[clap(short = 'd', long = "target", env = "MTR_TARGET", required = true, num_args = 1.., value_delimiter = ',')]
    targets: Vec<String>,

    #[clap(long, env = "MTR_SOURCE_PORT", default_value_t = 65533)]
    source_port: u16,

    #[clap(long, env = "MTR_TARGET_PORT", default_value_t = 65535)]
    target_port: u16,

    /// Probes per TTL
    #[clap(short, long, env = "MTR_RETRY", default_value_t = 1)]
    retry: u32,

    /// Consecutive silent TTLs before a target is given up
    #[clap(long, env = "MTR_MAX_UNREPLY", default_value_t = 8)]
    max_unreply: u32,

    #[clap(long = "type", env = "MTR_TYPE", value_enum, default_value_t = ProbeProtocol::Icmp)]
    protocol: ProbeProtocol,

    /// Wait for each probe's answer, in milliseconds
    #[clap(short = 't', long, env = "MTR_TIMEOUT_PER_HOP", default_value_t = 200)]
    timeout_per_hop: u64,

    #[clap(long, env = "MTR_START_TTL", default_value_t = 1)]
    start_ttl: u8,

    #[clap(short, long, env = "MTR_MAX_TTL", default_value_t = DEFAULT_MAX_TTL)]
    max_ttl: u8,

    /// Targets traced concurrently
    #[clap(long, env = "MTR_BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    #[clap(short, long, env = "MTR_FORMAT", value_enum, default_value_t = OutputFormat::Both)]
    format: OutputFormat,

    #[clap(flatten)]
    logging: logging::Params,
}

fn main() -> Result<()> {
    let args = CliArgs::parse();
    let logger_handle = logging::configure_from(&args.logging)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start Tokio runtime")?;
    let result = runtime.block_on(run(args));

    runtime.shutdown_timeout(Duration::from_secs(2));
    // Handle needs to be kept alive until the end with async write mode
    logger_handle.flush();
    result
}

async fn run(args: CliArgs) -> Result<()> {
    let targets = resolve_targets(&args)?;
    info!(
        "Tracing {} targets with {} probes, start ttl {}, max ttl {}",
        targets.len(),
        args.protocol,
        args.start_ttl,
        args.max_ttl
    );

    let config = TracerConfig {
        protocol: Some(args.protocol),
        max_unreply: args.max_unreply,
        next_hop_wait: Duration::from_millis(args.timeout_per_hop),
        batch_size: args.batch_size,
        ..TracerConfig::default()
    };
    let tracer = Tracer::new(config).context("Invalid tracer configuration")?;
    tracer
        .listen()
        .context("Failed to open the ICMP receive socket. Raw sockets need root or CAP_NET_RAW.")?;

    let interrupted = CancellationToken::new();
    let on_interrupt = interrupted.clone();
    ctrlc::set_handler(move || on_interrupt.cancel())
        .context("Failed to install Ctrl-C handler")?;

    let results = tokio::select! {
        results = tracer.batch_trace(&targets, args.start_ttl) => results?,
        _ = interrupted.cancelled() => {
            warn!("Interrupted, abandoning running traces");
            tracer.close();
            bail!("interrupted");
        }
    };
    debug!("{:?}", tracer.debug_info());
    tracer.close();

    print_results(&results, args.format)
}

fn resolve_targets(args: &CliArgs) -> Result<Vec<ResolvedTarget>> {
    args.targets
        .iter()
        .map(|dst| {
            let resolved = Target::new(args.source.clone(), dst.clone())
                .ports(args.source_port, args.target_port)
                .max_ttl(args.max_ttl)
                .retry(args.retry)
                .resolve()
                .with_context(|| format!("Cannot trace {}", dst))?;
            with_outbound_source(resolved)
        })
        .collect()
}

/// Replies are matched on the exact source address, so an unspecified one is made concrete.
fn with_outbound_source(mut target: ResolvedTarget) -> Result<ResolvedTarget> {
    if target.src_ip().is_unspecified() {
        let src: IpAddr = outbound_source(target.dst_ip())
            .with_context(|| format!("No route to {}", target.dst_ip()))?;
        debug!("Using source {} for {}", src, target.dst_ip());
        target.src.set_ip(src);
    }
    Ok(target)
}

fn print_results(results: &[TraceResult], format: OutputFormat) -> Result<()> {
    for result in results {
        match format {
            OutputFormat::Raw => println!("{}", result.marshal()),
            OutputFormat::Aggregate => println!("{}", result.marshal_aggregate()),
            OutputFormat::Both => {
                println!("{}", result.marshal());
                println!("{}", result.marshal_aggregate());
            }
            OutputFormat::Table => {
                println!("Trace to {} ({}):", result.target.dst_ip(), result.key);
                println!("{}", report::table(result));
                println!(
                    "{} ({:.2}% loss)",
                    if result.done { "reached" } else { "not reached" },
                    result.avg_pkt_loss * 100.0
                );
            }
            // One object per line, so a long batch can be streamed into jq
            OutputFormat::Json => println!(
                "{}",
                serde_json::to_string(result).context("Failed to serialize result")?
            ),
        }
    }
    Ok(())
}
