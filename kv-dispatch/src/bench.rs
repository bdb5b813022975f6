//! Mixed get/set load generator over the blocking façade.

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use rand::{Rng, SeedableRng, rngs::StdRng};
use tracing::{debug, info};

use crate::cli::BenchArgs;
use crate::facade::ClientHandle;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadReport {
    pub gets: u64,
    pub sets: u64,
    pub misses: u64,
    pub errors: u64,
}

impl ThreadReport {
    fn merge(&mut self, other: ThreadReport) {
        self.gets += other.gets;
        self.sets += other.sets;
        self.misses += other.misses;
        self.errors += other.errors;
    }

    pub fn ops(&self) -> u64 {
        self.gets + self.sets
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BenchReport {
    pub totals: ThreadReport,
    pub elapsed: Duration,
}

impl BenchReport {
    pub fn ops_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.totals.ops() as f64 / secs
    }
}

/// Chooses keys, payloads and operation kinds for one thread.
struct Workload {
    rng: StdRng,
    prefix: String,
    num_items: usize,
    set_pct: u8,
    min_size: usize,
    max_size: usize,
}

impl Workload {
    fn new(args: &BenchArgs, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            prefix: args.key_prefix.clone(),
            num_items: args.num_items.max(1),
            set_pct: args.set_pct,
            min_size: args.min_size.min(args.max_size),
            max_size: args.max_size.max(args.min_size),
        }
    }

    fn key(&self, index: usize) -> String {
        format!("{}{:020}", self.prefix, index)
    }

    fn next_key(&mut self) -> String {
        let index = self.rng.gen_range(0..self.num_items);
        self.key(index)
    }

    fn next_is_set(&mut self) -> bool {
        self.rng.gen_range(0..100u8) < self.set_pct
    }

    fn next_value(&mut self) -> Bytes {
        let len = self.rng.gen_range(self.min_size..=self.max_size);
        let fill = b'a' + self.rng.gen_range(0..26u8);
        Bytes::from(vec![fill; len])
    }
}

/// Stores every key once so reads in the timed run hit.
pub fn populate(handle: &ClientHandle, args: &BenchArgs) -> Result<()> {
    let mut workload = Workload::new(args, 1);
    for index in 0..args.num_items {
        let key = workload.key(index);
        let value = workload.next_value();
        handle
            .upsert(key.clone(), value)
            .with_context(|| format!("failed to populate {key}"))?;
    }
    info!(items = args.num_items, "population done");
    Ok(())
}

pub fn run(handle: &ClientHandle, args: &BenchArgs) -> Result<BenchReport> {
    let base_seed = if args.random_seed == 0 {
        rand::random::<u64>()
    } else {
        args.random_seed
    };
    let started = Instant::now();
    let workers = (0..args.num_threads.max(1))
        .map(|index| {
            let handle = handle.clone();
            let args = args.clone();
            thread::Builder::new()
                .name(format!("bench-{index}"))
                .spawn(move || run_thread(&handle, &args, base_seed.wrapping_add(index as u64)))
                .context("failed to spawn bench thread")
        })
        .collect::<Result<Vec<_>>>()?;

    let mut totals = ThreadReport::default();
    for worker in workers {
        let report = worker
            .join()
            .map_err(|_| anyhow!("bench thread panicked"))?;
        totals.merge(report);
    }
    Ok(BenchReport {
        totals,
        elapsed: started.elapsed(),
    })
}

fn run_thread(handle: &ClientHandle, args: &BenchArgs, seed: u64) -> ThreadReport {
    let mut workload = Workload::new(args, seed);
    let mut report = ThreadReport::default();
    for _ in 0..args.ops {
        let key = workload.next_key();
        let outcome = if workload.next_is_set() {
            report.sets += 1;
            let value = workload.next_value();
            handle.upsert(key, value).map(|_| ())
        } else {
            report.gets += 1;
            match handle.get(key) {
                Ok(None) => {
                    report.misses += 1;
                    Ok(())
                }
                Ok(Some(_)) => Ok(()),
                Err(err) => Err(err),
            }
        };
        if let Err(err) = outcome {
            debug!(error = ?err, "operation failed");
            report.errors += 1;
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn args(set_pct: u8) -> BenchArgs {
        BenchArgs {
            map: PathBuf::from("map.json"),
            num_items: 10,
            key_prefix: "bench:".to_string(),
            num_threads: 1,
            ops: 100,
            set_pct,
            min_size: 8,
            max_size: 16,
            random_seed: 7,
            no_population: true,
        }
    }

    #[test]
    fn keys_stay_within_item_range() {
        let mut workload = Workload::new(&args(50), 7);
        for _ in 0..200 {
            let key = workload.next_key();
            let index: usize = key.trim_start_matches("bench:").parse().expect("numeric suffix");
            assert!(index < 10);
        }
    }

    #[test]
    fn set_percentage_bounds_are_exact() {
        let mut never = Workload::new(&args(0), 1);
        let mut always = Workload::new(&args(100), 1);
        assert!((0..500).all(|_| !never.next_is_set()));
        assert!((0..500).all(|_| always.next_is_set()));
    }

    #[test]
    fn payload_sizes_respect_bounds() {
        let mut workload = Workload::new(&args(50), 3);
        for _ in 0..100 {
            let len = workload.next_value().len();
            assert!((8..=16).contains(&len));
        }
    }
}
