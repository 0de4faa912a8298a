//! StripeIO Bench - exercise the engine against a loopback cluster
//!
//! Each round writes every object, optionally fails a target, reads the
//! objects back and compares the bytes, then runs a client-wide sync.

use anyhow::{Context, Result, bail};
use clap::Parser;
use rand::RngCore;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use stripeio_client::{
    Client, Collaborators, IoOpcode, LoopbackCluster, MemIndexService, Obj, Op, OpState, StateMask,
};
use stripeio_common::{BufVec, Config, EntityId, IndexVec, TargetId};
use stripeio_layout::StaticPools;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "stripeio-bench")]
#[command(about = "StripeIO loopback benchmark")]
#[command(version)]
struct Args {
    /// Configuration file path (defaults plus STRIPEIO__* variables when absent)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Objects written and read per round
    #[arg(long, default_value = "8")]
    objects: u64,

    /// Parity groups per object
    #[arg(long, default_value = "4")]
    groups: u64,

    /// Bytes per extent; a multiple of the block size
    #[arg(long, default_value = "65536")]
    extent: u64,

    #[arg(long, default_value = "3")]
    rounds: u32,

    /// Fail this target after the first round's writes
    #[arg(long)]
    fail_target: Option<u32>,

    /// Print the summary as JSON
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Default, Serialize)]
struct Summary {
    rounds: u32,
    objects: u64,
    bytes_written: u64,
    bytes_read: u64,
    write_secs: f64,
    read_secs: f64,
    sync_secs: f64,
    degraded_reads: u64,
    failed_ops: u64,
    sync_errors: u64,
    io_requests: u64,
    fsync_requests: u64,
}

async fn finish(op: &Op, deadline: Duration) -> Result<OpState> {
    Op::launch(std::slice::from_ref(op))?;
    let state = op
        .wait(StateMask::DONE, Some(tokio::time::Instant::now() + deadline))
        .await?;
    Ok(state)
}

fn extents(size: u64, extent: u64) -> IndexVec {
    (0..size / extent).map(|i| (i * extent, extent)).collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load(args.config.as_deref()).context("loading configuration")?;
    let group = config.layout.group_size();
    if args.extent == 0 || group % args.extent != 0 || args.extent % config.client.block_size() != 0 {
        bail!(
            "extent {} must divide the group size {} and be a multiple of the block size {}",
            args.extent,
            group,
            config.client.block_size()
        );
    }
    let size = group * args.groups;
    let deadline = config.rpc.timeout() * 4;

    info!("Starting StripeIO bench");
    info!(
        "Layout: {}+{} units of {} bytes over {} targets",
        config.layout.data_units, config.layout.parity_units, config.layout.unit_size, config.layout.pool_width
    );

    let pools = Arc::new(StaticPools::from_config(&config));
    let cluster = LoopbackCluster::new();
    let client = Client::init(config)?;
    client.attach(Collaborators {
        transport: Arc::new(cluster.clone()),
        layouts: pools,
        index: Arc::new(MemIndexService::new()),
    })?;
    client.run()?;

    let objects: Vec<Obj> = (0..args.objects)
        .map(|i| client.obj(EntityId::from_parts(0, EntityId::APP_MIN.lo() + i)))
        .collect();
    for obj in &objects {
        let op = obj.create(None)?;
        if finish(&op, deadline).await? != OpState::Stable {
            bail!("create of {} failed: rc {}", obj.id(), op.rc());
        }
    }

    let mut summary = Summary {
        rounds: args.rounds,
        objects: args.objects,
        ..Summary::default()
    };
    let mut rng = rand::thread_rng();

    for round in 0..args.rounds {
        let mut payloads = Vec::with_capacity(objects.len());
        let started = Instant::now();
        let ops: Vec<Op> = objects
            .iter()
            .map(|obj| {
                let mut bytes = vec![0u8; size as usize];
                rng.fill_bytes(&mut bytes);
                let mut data = BufVec::new();
                data.push(bytes.clone());
                payloads.push(bytes);
                obj.io_op(IoOpcode::Write, extents(size, args.extent), data, BufVec::new(), 0, None)
            })
            .collect::<stripeio_common::Result<_>>()?;
        Op::launch(&ops)?;
        for op in &ops {
            let state = op
                .wait(StateMask::DONE, Some(tokio::time::Instant::now() + deadline))
                .await?;
            if state == OpState::Failed {
                warn!("write op {} failed: rc {}", op.id(), op.rc());
                summary.failed_ops += 1;
            } else {
                summary.bytes_written += size;
                if op.sync_rc() != 0 {
                    summary.sync_errors += 1;
                }
            }
        }
        summary.write_secs += started.elapsed().as_secs_f64();

        if round == 0
            && let Some(t) = args.fail_target
        {
            info!("Failing target {}", t);
            cluster.fail_target(TargetId::new(t));
        }

        let started = Instant::now();
        for (obj, expected) in objects.iter().zip(&payloads) {
            let op = obj.io_op(
                IoOpcode::Read,
                extents(size, args.extent),
                BufVec::alloc(1, size as usize),
                BufVec::new(),
                0,
                None,
            )?;
            if finish(&op, deadline).await? == OpState::Failed {
                warn!("read of {} failed: rc {}", obj.id(), op.rc());
                summary.failed_ops += 1;
                continue;
            }
            if let Some(trace) = op.io_trace()
                && !trace.degraded_groups.is_empty()
            {
                summary.degraded_reads += 1;
            }
            let data = op.data().map(|d| d.to_flat()).unwrap_or_default();
            if &data != expected {
                bail!("round {}: {} read back different bytes", round, obj.id());
            }
            summary.bytes_read += size;
        }
        summary.read_secs += started.elapsed().as_secs_f64();

        let started = Instant::now();
        if let Err(e) = client.sync().await {
            warn!("sync after round {} failed: {}", round, e);
            summary.sync_errors += 1;
        }
        summary.sync_secs += started.elapsed().as_secs_f64();
        info!("Round {} done", round);
    }

    summary.io_requests = cluster.io_requests();
    summary.fsync_requests = cluster.fsync_requests();
    client.detach()?;
    client.fini()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "{} rounds x {} objects: wrote {} bytes in {:.3}s, read {} bytes in {:.3}s, sync {:.3}s",
            summary.rounds,
            summary.objects,
            summary.bytes_written,
            summary.write_secs,
            summary.bytes_read,
            summary.read_secs,
            summary.sync_secs
        );
        println!(
            "degraded reads: {}, failed ops: {}, sync errors: {}, fops: {}, fsyncs: {}",
            summary.degraded_reads,
            summary.failed_ops,
            summary.sync_errors,
            summary.io_requests,
            summary.fsync_requests
        );
    }
    Ok(())
}
