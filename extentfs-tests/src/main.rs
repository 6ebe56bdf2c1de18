//! Workload runner: drives an `ExtentClient` against the in-process mock
//! cluster and verifies every byte against an in-memory model file.

use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use extentfs::{ExtentClient, ExtentConfig};
use extentfs_tests::mock::MockCluster;

#[derive(Parser, Debug)]
#[command(about = "Randomized workload against the extent client data plane")]
struct Args {
    /// Number of data nodes to start.
    #[arg(long, default_value_t = 3)]
    nodes: usize,

    /// Number of data partitions to register.
    #[arg(long, default_value_t = 6)]
    partitions: u64,

    /// Number of inodes to exercise.
    #[arg(long, default_value_t = 4)]
    inodes: u64,

    /// Operations per inode.
    #[arg(long, default_value_t = 200)]
    ops: usize,

    /// Largest single write, in bytes.
    #[arg(long, default_value_t = 256 * 1024)]
    max_write: usize,

    /// Buffer small writes client-side.
    #[arg(long)]
    write_cache: bool,

    /// Disallow in-place overwrites.
    #[arg(long)]
    force_row: bool,

    /// RNG seed, for reproducible runs.
    #[arg(long, default_value_t = 1)]
    seed: u64,
}

/// Model file contents the cluster must agree with.
struct Model {
    data: Vec<u8>,
}

impl Model {
    fn write(&mut self, offset: usize, bytes: &[u8]) {
        let end = offset + bytes.len();
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[offset..end].copy_from_slice(bytes);
    }

    fn truncate(&mut self, size: usize) {
        self.data.resize(size, 0);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let cluster = MockCluster::start(args.nodes).await;
    for id in 1..=args.partitions {
        cluster.add_partition(id, &[(id as usize - 1) % args.nodes]);
    }
    cluster.master.vol.lock().force_row = args.force_row;

    let mut config = ExtentConfig::new("mock-vol");
    config.write_cache = args.write_cache;
    let client = Arc::new(
        ExtentClient::new(cluster.master.clone(), cluster.meta.clone(), config)
            .await
            .context("client bootstrap")?,
    );

    let mut tasks = Vec::new();
    for inode in 1..=args.inodes {
        let client = client.clone();
        let seed = args.seed.wrapping_add(inode);
        let ops = args.ops;
        let max_write = args.max_write;
        tasks.push(tokio::spawn(async move {
            run_workload(client, inode, seed, ops, max_write).await
        }));
    }

    let mut failures = 0;
    for task in tasks {
        match task.await {
            Ok(Ok(stats)) => info!(
                "inode {}: {} writes / {} reads / {} truncates verified, {} bytes",
                stats.inode, stats.writes, stats.reads, stats.truncates, stats.final_size
            ),
            Ok(Err(e)) => {
                failures += 1;
                eprintln!("workload failed: {e:#}");
            }
            Err(e) => {
                failures += 1;
                eprintln!("workload panicked: {e}");
            }
        }
    }

    client.close().await.context("client shutdown")?;
    if failures > 0 {
        bail!("{failures} workload(s) failed");
    }
    println!("all {} workloads verified", args.inodes);
    Ok(())
}

struct Stats {
    inode: u64,
    writes: usize,
    reads: usize,
    truncates: usize,
    final_size: usize,
}

async fn run_workload(
    client: Arc<ExtentClient>,
    inode: u64,
    seed: u64,
    ops: usize,
    max_write: usize,
) -> anyhow::Result<Stats> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut model = Model { data: Vec::new() };
    let mut stats = Stats {
        inode,
        writes: 0,
        reads: 0,
        truncates: 0,
        final_size: 0,
    };

    client.open_stream(inode).await?;
    for op in 0..ops {
        match rng.random_range(0..10u32) {
            // Mostly writes: appends and overwrites in one distribution.
            0..=5 => {
                let len = rng.random_range(1..=max_write);
                let max_off = model.data.len() + max_write;
                let offset = rng.random_range(0..=max_off);
                let bytes: Vec<u8> = (0..len)
                    .map(|i| (i as u8).wrapping_add(op as u8).wrapping_mul(13))
                    .collect();
                let n = client.write(inode, offset as u64, &bytes, false).await?;
                if n != bytes.len() {
                    bail!("short write: {n} of {}", bytes.len());
                }
                model.write(offset, &bytes);
                stats.writes += 1;
            }
            6..=7 => {
                client.flush(inode).await?;
                if model.data.is_empty() {
                    continue;
                }
                let offset = rng.random_range(0..model.data.len());
                let len = rng.random_range(1..=(model.data.len() - offset).min(max_write));
                let mut buf = vec![0u8; len];
                let n = client.read(inode, offset as u64, &mut buf).await?;
                if buf[..n] != model.data[offset..offset + n] {
                    bail!("read mismatch at {offset}+{n} (op {op})");
                }
                stats.reads += 1;
            }
            8 => {
                client.flush(inode).await?;
            }
            _ => {
                let size = rng.random_range(0..=model.data.len().max(1));
                client.flush(inode).await?;
                client.truncate(inode, size as u64).await?;
                model.truncate(size);
                stats.truncates += 1;
            }
        }
    }

    // Full-file verification after a final flush.
    client.flush(inode).await?;
    let mut buf = vec![0u8; model.data.len()];
    let n = client.read(inode, 0, &mut buf).await?;
    if buf[..n] != model.data[..n] {
        bail!("final verification mismatch over {n} bytes");
    }
    if n != model.data.len() {
        bail!("final size {n}, model has {}", model.data.len());
    }
    stats.final_size = n;
    client.close_stream(inode).await?;
    Ok(stats)
}
