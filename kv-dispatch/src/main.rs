use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use kv_dispatch::{
    bench,
    cli::{BenchArgs, Cli, ClusterArgs, Command, GetArgs, SetArgs},
    facade::{self, ClientHandle},
    settings::Settings,
    testkit::TestCluster,
    topology::TopologySnapshot,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let mut settings = match &cli.config {
        Some(path) => Settings::from_json_file(path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?,
        None => Settings::default(),
    };
    for option in &cli.options {
        settings
            .apply_pair(option)
            .with_context(|| format!("invalid option {option:?}"))?;
    }
    settings.validate().context("invalid settings")?;
    Ok(settings)
}

fn connect(map: &Path, settings: Settings) -> Result<ClientHandle> {
    let raw = std::fs::read(map).with_context(|| format!("failed to read {}", map.display()))?;
    let topology = TopologySnapshot::from_json(&raw).context("failed to parse cluster map")?;
    facade::spawn_client(topology, settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let settings = load_settings(&cli)?;
    match cli.command {
        Command::Cluster(args) => run_cluster(args).await?,
        Command::Get(args) => blocking(move || run_get(args, settings)).await?,
        Command::Set(args) => blocking(move || run_set(args, settings)).await?,
        Command::Bench(args) => blocking(move || run_bench(args, settings)).await?,
    }

    Ok(())
}

async fn blocking<F>(job: F) -> Result<()>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .context("client task panicked")?
}

async fn run_cluster(args: ClusterArgs) -> Result<()> {
    let cluster = TestCluster::start(args.nodes, args.partitions, args.replicas).await?;
    let map = cluster.topology().await.to_json()?;
    if let Some(path) = &args.map_out {
        tokio::fs::write(path, &map)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!(path = %path.display(), "cluster map written");
    }
    println!("{}", String::from_utf8_lossy(&map));
    for addr in cluster.addrs() {
        info!("node listening on {}", addr);
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = ?err, "failed to install ctrl-c handler");
    }
    cluster.shutdown().await
}

fn run_get(args: GetArgs, settings: Settings) -> Result<()> {
    let client = connect(&args.map, settings)?;
    let result = client.get(args.key.clone());
    client.shutdown()?;
    match result? {
        Some(item) => println!(
            "{} flags={} cas={} value={}",
            args.key,
            item.flags,
            item.cas,
            String::from_utf8_lossy(&item.value)
        ),
        None => println!("{}: not found", args.key),
    }
    Ok(())
}

fn run_set(args: SetArgs, settings: Settings) -> Result<()> {
    let client = connect(&args.map, settings)?;
    let result = client.upsert(args.key.clone(), args.value);
    client.shutdown()?;
    println!("{} stored cas={}", args.key, result?);
    Ok(())
}

fn run_bench(args: BenchArgs, settings: Settings) -> Result<()> {
    let client = connect(&args.map, settings)?;
    if !args.no_population {
        bench::populate(&client, &args)?;
    }
    let report = bench::run(&client, &args);
    client.shutdown()?;
    let report = report?;
    println!(
        "ops={} gets={} sets={} misses={} errors={} elapsed={:.3}s ops/s={:.0}",
        report.totals.ops(),
        report.totals.gets,
        report.totals.sets,
        report.totals.misses,
        report.totals.errors,
        report.elapsed.as_secs_f64(),
        report.ops_per_sec()
    );
    Ok(())
}
