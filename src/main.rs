#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use prism_gateway::observe::monitor::detect_cpu_limit;
use prism_gateway::server;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "prism-gateway", about = "Multiplexing gateway for LLM backends")]
struct Cli {
    /// Path to the gateway config file (provider table + subsystem settings)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Listen address; defaults to 0.0.0.0:{PORT}
    #[arg(short, long)]
    listen: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let worker_threads = detect_cpu_limit();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    rt.block_on(server::bootstrap::run(server::bootstrap::BootstrapArgs {
        config_path: cli.config,
        listen: cli.listen,
    }))
}
