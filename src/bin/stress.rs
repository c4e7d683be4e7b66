//! AtlasTable Stress Binary
//!
//! Drives an engine with concurrent writers and readers, then prints the
//! memory and flush counters it observed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use atlastable::{
    ClusteringKey, ColumnKind, ColumnType, Config, DecoratedKey, Engine, Mutation, MutationReader,
    PartitionRange, SchemaBuilder,
};
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

/// AtlasTable stress driver
#[derive(Parser, Debug)]
#[command(name = "atlastable-stress")]
#[command(about = "Concurrent write/read load against an AtlasTable engine")]
#[command(version)]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "./atlastable_stress")]
    data_dir: String,

    /// Writer threads
    #[arg(short, long, default_value = "4")]
    writers: usize,

    /// Reader threads
    #[arg(short, long, default_value = "2")]
    readers: usize,

    /// Mutations per writer
    #[arg(short = 'n', long, default_value = "50000")]
    mutations: u64,

    /// Distinct partition keys
    #[arg(short, long, default_value = "1000")]
    partitions: u64,

    /// Soft dirty-memory limit in MB
    #[arg(short = 's', long, default_value = "16")]
    soft_limit_mb: usize,
}

fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,atlastable=info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    tracing::info!("AtlasTable stress v{}", atlastable::VERSION);
    tracing::info!("Data directory: {}", args.data_dir);

    let soft = args.soft_limit_mb * 1024 * 1024;
    let config = Config::builder()
        .data_dir(&args.data_dir)
        .sync_segments(false)
        .dirty_soft_limit(soft)
        .dirty_hard_limit(soft * 2)
        .reclaim_threshold(soft / 2)
        .build();

    let schema = SchemaBuilder::new("stress", "events")
        .with_column("ck", ColumnType::Int, ColumnKind::ClusteringKey)
        .with_column("payload", ColumnType::Bytes, ColumnKind::Regular)
        .with_column("owner", ColumnType::Text, ColumnKind::Static)
        .build();

    let engine = match Engine::open(config, schema.clone()) {
        Ok(e) => Arc::new(e),
        Err(e) => {
            tracing::error!("Failed to open engine: {}", e);
            std::process::exit(1);
        }
    };

    let started = Instant::now();
    let stop = Arc::new(AtomicBool::new(false));
    let rejected = Arc::new(AtomicU64::new(0));
    let fragments_read = Arc::new(AtomicU64::new(0));

    let mut writers = Vec::with_capacity(args.writers);
    for writer_id in 0..args.writers {
        let engine = Arc::clone(&engine);
        let schema = schema.clone();
        let rejected = Arc::clone(&rejected);
        let (count, partitions) = (args.mutations, args.partitions);
        writers.push(thread::spawn(move || {
            for i in 0..count {
                let seq = writer_id as u64 * count + i;
                let key = DecoratedKey::from_bytes(format!("pk-{}", seq % partitions).into_bytes());
                let mut m = Mutation::new(schema.clone(), key);
                let ck = ClusteringKey::single((seq % 64).to_be_bytes().to_vec());
                let written = m
                    .set_clustered_cell(ck, "payload", vec![0u8; 64], seq as i64)
                    .and_then(|_| m.set_static_cell("owner", format!("w{}", writer_id), seq as i64));
                if let Err(e) = written {
                    tracing::error!("Failed to build mutation: {}", e);
                    return;
                }
                loop {
                    match engine.apply(&m) {
                        Ok(()) => break,
                        Err(atlastable::AtlasError::Backpressure { .. }) => {
                            rejected.fetch_add(1, Ordering::Relaxed);
                            thread::sleep(Duration::from_millis(1));
                        }
                        Err(e) => {
                            tracing::error!("Write failed: {}", e);
                            return;
                        }
                    }
                }
            }
        }));
    }

    let mut readers = Vec::with_capacity(args.readers);
    for _ in 0..args.readers {
        let engine = Arc::clone(&engine);
        let stop = Arc::clone(&stop);
        let fragments_read = Arc::clone(&fragments_read);
        readers.push(thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                let mut reader = match engine.make_reader(engine.schema(), PartitionRange::full()) {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::error!("Failed to create reader: {}", e);
                        return;
                    }
                };
                loop {
                    match reader.next_fragment() {
                        Ok(Some(_)) => {
                            fragments_read.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::error!("Read failed: {}", e);
                            return;
                        }
                    }
                }
            }
        }));
    }

    for handle in writers {
        let _ = handle.join();
    }
    stop.store(true, Ordering::Relaxed);
    for handle in readers {
        let _ = handle.join();
    }

    let compaction = engine.full_compaction();
    let manager = engine.memory_manager();
    println!("elapsed:            {:?}", started.elapsed());
    println!("segments:           {}", engine.segment_count());
    println!("rejected writes:    {}", rejected.load(Ordering::Relaxed));
    println!("fragments read:     {}", fragments_read.load(Ordering::Relaxed));
    println!("real dirty bytes:   {}", manager.real_dirty_memory());
    println!("virtual dirty bytes:{}", manager.virtual_dirty_memory());
    println!("versions merged:    {}", compaction.versions_merged);

    match Arc::try_unwrap(engine) {
        Ok(engine) => {
            if let Err(e) = engine.close() {
                tracing::error!("Failed to close engine: {}", e);
                std::process::exit(1);
            }
        }
        Err(_) => tracing::warn!("engine still shared at exit, skipping final flush"),
    }
}
