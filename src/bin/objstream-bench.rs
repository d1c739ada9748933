//! objstream-bench - push synthetic objects through one stream and report
//! throughput and stream stats.
//!
//! Runs an in-process TCP receiver on loopback unless `--dry-run` is given.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use objstream::config::{Compression, MuxConfig, StreamConfig};
use objstream::streaming::{
    CodecKind, Handler, Header, Mux, ObjectReader, SendRequest, Stream, TcpDialer,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "objstream-bench", version, about = "Object stream throughput harness")]
struct Cli {
    /// Number of objects to send
    #[arg(short = 'n', long, default_value_t = 10_000)]
    objects: u64,

    /// Payload size per object in bytes (0 = header-only)
    #[arg(short, long, default_value_t = 64 * 1024)]
    size: usize,

    /// Stream config file (TOML); flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    burst: Option<usize>,

    /// Block-compress the stream
    #[arg(long)]
    compress: bool,

    /// lz4 or zstd
    #[arg(long, default_value = "lz4")]
    codec: String,

    #[arg(long)]
    block_size: Option<usize>,

    /// Consume requests without network I/O
    #[arg(long)]
    dry_run: bool,

    /// Print stats as JSON
    #[arg(long)]
    json: bool,
}

/// Counts what arrives.
#[derive(Default)]
struct Counter {
    objects: AtomicU64,
    bytes: AtomicU64,
}

#[async_trait]
impl Handler for Counter {
    async fn receive(&self, _hdr: Header, body: &mut ObjectReader<'_>) -> anyhow::Result<()> {
        let n = tokio::io::copy(body, &mut tokio::io::sink()).await?;
        self.objects.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(n, Ordering::Relaxed);
        Ok(())
    }
}

fn stream_config(cli: &Cli) -> Result<StreamConfig> {
    let mut cfg = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            StreamConfig::from_toml_str(&text)?
        }
        None => StreamConfig::default(),
    }
    .with_env_overrides()?;

    if let Some(burst) = cli.burst {
        cfg.burst = burst;
    }
    if cli.compress {
        cfg.compression = Compression::Always;
    }
    cfg.codec = match cli.codec.as_str() {
        "lz4" => CodecKind::Lz4,
        "zstd" => CodecKind::Zstd,
        other => bail!("unknown codec {:?} (expected lz4 or zstd)", other),
    };
    if let Some(bs) = cli.block_size {
        cfg.block_max_size = bs;
    }
    cfg.dry_run |= cli.dry_run;
    cfg.validate()?;
    Ok(cfg)
}

/// Half-compressible filler: repeated text interleaved with counter bytes.
fn payload(size: usize) -> Bytes {
    let text = b"the quick brown fox jumps over the lazy dog ";
    let data: Vec<u8> = (0..size)
        .map(|i| if i % 2 == 0 { text[(i / 2) % text.len()] } else { (i / 7) as u8 })
        .collect();
    Bytes::from(data)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let cfg = stream_config(&cli)?;
    let counter = Arc::new(Counter::default());

    let stream: Stream = if cfg.dry_run {
        Stream::dry_run("/v1/bench/dry", cfg.clone())?
    } else {
        let mux = Arc::new(Mux::new(MuxConfig::default()));
        let route = mux.register("bench", "objects", counter.clone())?;
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(mux.serve(listener));
        let dialer = TcpDialer::for_config(addr.to_string(), &cfg);
        Stream::new(Arc::new(dialer), route, cfg.clone())?
    };
    info!(
        stream = %stream,
        objects = cli.objects,
        size = cli.size,
        burst = cfg.burst,
        compressed = cfg.compressed(),
        "starting"
    );

    let data = payload(cli.size);
    let started = Instant::now();
    for i in 0..cli.objects {
        let hdr = Header::new("bench", format!("obj-{:08}", i), cli.size as u64);
        let mut req = SendRequest::new(hdr);
        if cli.size > 0 {
            req = req.with_bytes(data.clone());
        }
        stream.send(req).await?;
    }
    stream.fin().await?;
    let elapsed = started.elapsed();

    let stats = stream.stats();
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    let mib_s = stats.size as f64 / (1024.0 * 1024.0) / secs;
    let obj_s = stats.num as f64 / secs;

    if cli.json {
        let out = serde_json::json!({
            "objects": stats.num,
            "bytes": stats.size,
            "compressed_bytes": stats.compressed_size,
            "compression_ratio": stats.compression_ratio(),
            "idle_pct": stats.idle_pct,
            "elapsed_secs": secs,
            "mib_per_sec": mib_s,
            "objects_per_sec": obj_s,
            "received_objects": counter.objects.load(Ordering::Relaxed),
            "received_bytes": counter.bytes.load(Ordering::Relaxed),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("objects:      {}", stats.num);
        println!("bytes:        {}", stats.size);
        if stats.compressed_size > 0 {
            println!(
                "compressed:   {} ({:.2}x)",
                stats.compressed_size,
                stats.compression_ratio()
            );
        }
        println!("idle:         {:.1}%", stats.idle_pct);
        println!("elapsed:      {:.3}s", secs);
        println!("throughput:   {:.1} MiB/s, {:.0} obj/s", mib_s, obj_s);
        if !cfg.dry_run {
            println!(
                "received:     {} objects, {} bytes",
                counter.objects.load(Ordering::Relaxed),
                counter.bytes.load(Ordering::Relaxed)
            );
        }
    }
    Ok(())
}
