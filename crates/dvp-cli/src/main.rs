//! CLI entry point for DVP.
//!
//! The `dvp` binary inspects the registered graph managers and runs a demo
//! graph through the boss.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use dvp_kernel::{
    Boss, BossConfig, CoreType, Dispatch, Image, KernelGraph, KernelId, KernelNode, NodeArray,
    SectionCompletion, kernels,
};
use dvp_mem::{Buffer, MemType};
use futures::StreamExt;
use tracing::info;
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// DVP: heterogeneous-core kernel graph execution.
#[derive(Parser)]
#[command(
    name = "dvp",
    version,
    about = "Inspect and exercise the DVP kernel graph boss"
)]
struct Cli {
    /// TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered managers, their kernels and core capacities.
    Cores {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Build a demo graph and process it.
    Run {
        /// Number of sections.
        #[arg(long, default_value_t = 2)]
        sections: usize,

        /// Nodes per section.
        #[arg(long, default_value_t = 3)]
        nodes: usize,

        /// Core affinity for every node.
        #[arg(long, default_value = "any")]
        core: CoreType,

        /// Image edge length in pixels.
        #[arg(long, default_value_t = 64)]
        size: u32,

        /// Give every section its own order rank instead of running them
        /// all concurrently.
        #[arg(long)]
        serial: bool,

        /// Dispatch asynchronously and stream completions.
        #[arg(long = "async")]
        stream: bool,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing("warn");

    let config = match &cli.config {
        Some(path) => BossConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => BossConfig::default(),
    };
    let boss = Boss::init(config).await.context("failed to initialize boss")?;

    let result = match cli.command {
        Commands::Cores { json } => cmd_cores(&boss, json),
        Commands::Run {
            sections,
            nodes,
            core,
            size,
            serial,
            stream,
        } => cmd_run(&boss, sections, nodes, core, size, serial, stream).await,
    };

    boss.deinit().await;
    result
}

// ---------------------------------------------------------------------------
// Subcommand: cores
// ---------------------------------------------------------------------------

fn cmd_cores(boss: &Boss, json: bool) -> Result<()> {
    let cores: Vec<_> = CoreType::CONCRETE
        .iter()
        .filter_map(|core| boss.query_core(*core))
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&cores)?);
        return Ok(());
    }

    println!();
    println!("  DVP cores");
    println!("  =========");
    println!();
    for info in &cores {
        println!(
            "  {:<6} capacity {:>4}/1000   max load {:>4}   in use {}",
            info.core, info.load.limit, info.load.maximum, info.load.current
        );
        for manager in &info.managers {
            let kernels: Vec<String> = manager.kernels.iter().map(KernelId::to_string).collect();
            let state = if manager.enabled { "enabled" } else { "disabled" };
            println!(
                "    - {} (priority {}, {state}{}): {}",
                manager.name,
                manager.priority,
                manager
                    .remote
                    .map(|r| format!(", remote {r}"))
                    .unwrap_or_default(),
                kernels.join(", ")
            );
        }
    }
    if cores.is_empty() {
        println!("  No graph managers initialized.");
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: run
// ---------------------------------------------------------------------------

/// Kernels cycled through along each section's chain.
const DEMO_CHAIN: [KernelId; 3] = [kernels::COPY, kernels::INVERT, kernels::THRESHOLD];

async fn cmd_run(
    boss: &Boss,
    sections: usize,
    per_section: usize,
    core: CoreType,
    size: u32,
    serial: bool,
    stream: bool,
) -> Result<()> {
    if sections == 0 || per_section == 0 {
        bail!("--sections and --nodes must both be at least 1");
    }

    let (graph, nodes, buffers) = build_demo(boss, sections, per_section, core, size)?;
    if serial {
        let order: Vec<u32> = (0..sections as u32).collect();
        graph.set_order(&order)?;
    }

    let valid = boss.verify_graph(&graph)?;
    info!(valid, total = sections * per_section, "demo graph verified");

    let completions = if stream {
        let mut completions = Vec::with_capacity(sections);
        let mut events = boss.process(&graph, Dispatch::Async).await?;
        while let Some(completion) = events.next().await {
            print_completion(&graph, &completion);
            completions.push(completion);
        }
        completions
    } else {
        let completions = boss.process_sync(&graph).await?;
        completions
            .iter()
            .for_each(|completion| print_completion(&graph, completion));
        completions
    };

    let executed: usize = completions.iter().map(|c| c.executed).sum();
    let perf = graph.perf();
    println!();
    println!(
        "  graph {}: {executed}/{} nodes executed in {:?}",
        graph.id(),
        sections * per_section,
        perf.last().unwrap_or_default()
    );
    for (index, node) in nodes.snapshot().iter().enumerate() {
        if node.status.is_error() {
            println!("    node {index}: {} on {} -> {:?}", node.kernel, node.affinity, node.status);
        }
    }
    println!();

    drop(nodes);
    boss.free_graph(graph).await?;
    for buffer in buffers {
        boss.free_buffer(buffer)?;
    }
    Ok(())
}

/// Each section is a chain over `per_section + 1` images: node `i` reads
/// image `i` and writes image `i + 1`.
fn build_demo(
    boss: &Boss,
    sections: usize,
    per_section: usize,
    core: CoreType,
    size: u32,
) -> Result<(KernelGraph, NodeArray, Vec<Buffer>)> {
    let mut buffers = Vec::new();
    let mut list = Vec::with_capacity(sections * per_section);

    for section in 0..sections {
        let mut images: Vec<Image> = Vec::with_capacity(per_section + 1);
        for _ in 0..=per_section {
            let (buffer, image) = boss
                .alloc_image(MemType::Tiled2dCached, size, size)
                .context("failed to allocate demo image")?;
            buffers.push(buffer);
            images.push(image);
        }
        if let Some(source) = images.first() {
            let pixels: Vec<u8> = (0..source.width() as usize * source.height() as usize)
                .map(|i| (i + section * 17) as u8)
                .collect();
            source.write_pixels(&pixels);
        }
        for (i, pair) in images.windows(2).enumerate() {
            let kernel = DEMO_CHAIN[i % DEMO_CHAIN.len()];
            list.push(
                KernelNode::new(kernel, core)
                    .with_images(pair.to_vec())
                    .with_value(128),
            );
        }
    }

    let nodes = NodeArray::from_nodes(list);
    let graph = boss.alloc_graph(sections)?;
    for section in 0..sections {
        boss.init_section(&graph, section, &nodes, section * per_section, per_section)?;
    }
    Ok((graph, nodes, buffers))
}

fn print_completion(graph: &KernelGraph, completion: &SectionCompletion) {
    let perf = graph
        .section(completion.section)
        .map(|s| s.perf())
        .unwrap_or_default();
    println!(
        "  section {:>3}: {}/{} executed   {:?}",
        completion.section,
        completion.executed,
        completion.nodes,
        perf.last().unwrap_or_default()
    );
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber with the given default log level.
fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
