use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// JSON file with client settings.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override one setting, as `name=value`. May be repeated.
    #[arg(short = 'o', long = "option", global = true)]
    pub options: Vec<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a local test cluster and print its cluster map.
    Cluster(ClusterArgs),
    /// Fetch one key.
    Get(GetArgs),
    /// Store one key.
    Set(SetArgs),
    /// Run a mixed get/set workload and report throughput.
    Bench(BenchArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ClusterArgs {
    /// Number of nodes to start.
    #[arg(long, default_value_t = 3)]
    pub nodes: usize,

    /// Number of partitions in the map.
    #[arg(long, default_value_t = 64)]
    pub partitions: usize,

    /// Replicas per partition.
    #[arg(long, default_value_t = 1)]
    pub replicas: usize,

    /// Write the cluster map here as well as to stdout.
    #[arg(long)]
    pub map_out: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct GetArgs {
    /// Cluster map file, as printed by `kvd cluster`.
    #[arg(long)]
    pub map: PathBuf,

    pub key: String,
}

#[derive(Args, Debug, Clone)]
pub struct SetArgs {
    /// Cluster map file, as printed by `kvd cluster`.
    #[arg(long)]
    pub map: PathBuf,

    pub key: String,

    pub value: String,
}

#[derive(Args, Debug, Clone)]
pub struct BenchArgs {
    /// Cluster map file, as printed by `kvd cluster`.
    #[arg(long)]
    pub map: PathBuf,

    /// Number of distinct keys to operate on.
    #[arg(short = 'I', long, default_value_t = 1000)]
    pub num_items: usize,

    /// Prefix for every generated key.
    #[arg(short = 'p', long, default_value = "")]
    pub key_prefix: String,

    /// Worker threads, each issuing operations back to back.
    #[arg(short = 't', long, default_value_t = 1)]
    pub num_threads: usize,

    /// Operations per thread.
    #[arg(long, default_value_t = 10_000)]
    pub ops: usize,

    /// Percentage of operations that are mutations.
    #[arg(short = 'r', long, default_value_t = 33, value_parser = clap::value_parser!(u8).range(0..=100))]
    pub set_pct: u8,

    /// Minimum payload size in bytes.
    #[arg(short = 'm', long, default_value_t = 50)]
    pub min_size: usize,

    /// Maximum payload size in bytes.
    #[arg(short = 'M', long, default_value_t = 5120)]
    pub max_size: usize,

    /// Seed for key and payload choice; 0 picks one at random.
    #[arg(short = 's', long, default_value_t = 0)]
    pub random_seed: u64,

    /// Skip storing every key once before the timed run.
    #[arg(short = 'n', long)]
    pub no_population: bool,
}
