use std::io;

use anyhow::Context;
use clap::Parser;
use flowsock::flow::tcp::TcpFlow;
use flowsock::flow::{FlowConfig, FlowProperties};
use flowsock::relay::{run_relay, RelayConfig};
use tracing::level_filters::LevelFilter;
use tracing::{info, subscriber};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, Registry};

/// Relay standard input to a flow and the flow's data to standard output
#[derive(Parser, Debug)]
#[command(name = "flow-client", version, long_about = None)]
struct Args {
    /// Flow properties, comma separated
    #[arg(short = 'P', default_value = "TCP_REQUIRED,IPV4_REQUIRED")]
    properties: FlowProperties,

    /// Receive buffer size
    #[arg(short = 'R', default_value_t = 256, value_parser = clap::value_parser!(u32).range(1..))]
    recv_buffer_size: u32,

    /// Send buffer size, also the standard input chunk size
    #[arg(short = 'S', default_value_t = 128, value_parser = clap::value_parser!(u32).range(1..))]
    send_buffer_size: u32,

    /// Log level, 0 warnings only, 1 info, 2 or more everything
    #[arg(short = 'v', default_value_t = 1)]
    verbosity: u8,

    host: String,

    port: u16,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_log(args.verbosity)?;

    let mut flow_config = FlowConfig::default();
    flow_config
        .properties(args.properties)
        .send_buffer_size(args.send_buffer_size as usize);

    let mut relay_config = RelayConfig::default();
    relay_config
        .recv_buffer_size(args.recv_buffer_size as usize)
        .send_buffer_size(args.send_buffer_size as usize);

    let flow = TcpFlow::connect(&args.host, args.port, &flow_config)
        .with_context(|| format!("open flow to {}:{} failed", args.host, args.port))?;

    info!(host = %args.host, port = args.port, properties = ?args.properties, "flow opened");

    run_relay(&relay_config, Box::new(flow), io::stdin(), io::stdout())
}

fn init_log(verbosity: u8) -> anyhow::Result<()> {
    let level = match verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        _ => LevelFilter::TRACE,
    };

    let layer = fmt::layer()
        .pretty()
        .with_target(true)
        .with_writer(io::stderr);

    let layered = Registry::default().with(layer).with(level);

    subscriber::set_global_default(layered).with_context(|| "install log subscriber failed")
}
