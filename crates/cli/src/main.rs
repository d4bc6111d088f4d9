//! wikivec command line tools.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wikivec_core::EmbeddingRecord;
use wikivec_storage::{
    Column, ColumnData, PartitionFile, PartitionWriter, StorageError, WriterConfig,
};

#[derive(Parser, Debug)]
#[command(name = "wikivec")]
#[command(about = "Build and inspect wikivec embedding partition files")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Stream JSONL embedding records into partition files
    Ingest {
        /// JSONL file, one embedding record per line
        #[arg(long)]
        input: PathBuf,
        /// Directory partition files are written to
        #[arg(long)]
        out_dir: PathBuf,
        /// Writer configuration (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Records buffered per partition before a flush
        #[arg(long)]
        flush_size: Option<usize>,
        /// Split partitions by article type
        #[arg(long)]
        by_type: bool,
        /// Records handed to the writer per call
        #[arg(long, default_value = "256")]
        batch_size: usize,
    },
    /// Print header, metadata and footer of a partition file
    Inspect {
        file: PathBuf,
    },
    /// Print the values of a single column
    Dump {
        file: PathBuf,
        /// Column name (id, title, type, chunk_index, text_preview, embedding, model, created_at)
        #[arg(long, default_value = "title")]
        column: String,
        /// Maximum rows to print
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Find the rows nearest to an existing record
    Search {
        file: PathBuf,
        /// Id of the record to use as the query
        #[arg(long)]
        like: String,
        /// Number of results
        #[arg(short, long, default_value = "10")]
        k: usize,
        /// IVF partitions to scan
        #[arg(long, default_value = "8")]
        nprobe: usize,
    },
}

#[derive(Debug, Default)]
struct IngestSummary {
    lines: usize,
    accepted: usize,
    skipped: usize,
    interrupted: bool,
}

async fn ingest(
    input: PathBuf,
    out_dir: PathBuf,
    config: Option<PathBuf>,
    flush_size: Option<usize>,
    by_type: bool,
    batch_size: usize,
) -> Result<()> {
    let mut config = match config {
        Some(path) => WriterConfig::load(&path)
            .with_context(|| format!("loading writer config {}", path.display()))?,
        None => WriterConfig::default(),
    };
    config.base_dir = out_dir;
    if let Some(flush_size) = flush_size {
        config.flush_size = flush_size;
    }
    if by_type {
        config.partition_by_type = true;
    }

    let writer = Arc::new(PartitionWriter::new(config));
    let stop = Arc::new(AtomicBool::new(false));
    let start = Instant::now();

    let mut task = tokio::task::spawn_blocking({
        let writer = writer.clone();
        let stop = stop.clone();
        move || read_records(&input, &writer, &stop, batch_size.max(1))
    });

    let read = tokio::select! {
        res = &mut task => res?,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, finalizing buffered records");
            stop.store(true, Ordering::Relaxed);
            task.await?
        }
    };

    // buffered records are written even when reading failed part way
    let finalized = tokio::task::spawn_blocking({
        let writer = writer.clone();
        move || writer.finalize()
    })
    .await?;

    let summary = read?;
    let stats = finalized?;

    println!(
        "Read {} lines: {} records accepted, {} skipped{}",
        summary.lines,
        summary.accepted,
        summary.skipped,
        if summary.interrupted { " (interrupted)" } else { "" }
    );
    println!("Finished in {:.2?}", start.elapsed());
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

/// Read JSONL records and feed them to the writer in batches.
fn read_records(
    input: &Path,
    writer: &PartitionWriter,
    stop: &AtomicBool,
    batch_size: usize,
) -> Result<IngestSummary> {
    let file = File::open(input).with_context(|| format!("opening {}", input.display()))?;
    let reader = BufReader::new(file);

    let mut summary = IngestSummary::default();
    let mut batch = Vec::with_capacity(batch_size);

    for (n, line) in reader.lines().enumerate() {
        if stop.load(Ordering::Relaxed) {
            summary.interrupted = true;
            break;
        }
        let line = line?;
        summary.lines += 1;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<EmbeddingRecord>(&line) {
            Ok(record) => batch.push(record),
            Err(e) => {
                tracing::warn!("Skipping line {}: {}", n + 1, e);
                summary.skipped += 1;
            }
        }
        if batch.len() >= batch_size {
            write_batch(writer, std::mem::take(&mut batch), &mut summary)?;
        }
    }
    write_batch(writer, batch, &mut summary)?;
    Ok(summary)
}

/// A batch rejected for its dimensions is retried record by record so only
/// the offending records are dropped. `DimensionMismatch` is only raised
/// before anything is queued; a failed flush is returned as is.
fn write_batch(
    writer: &PartitionWriter,
    batch: Vec<EmbeddingRecord>,
    summary: &mut IngestSummary,
) -> Result<()> {
    let n = batch.len();
    match writer.write_batch(batch.clone()) {
        Ok(()) => {
            summary.accepted += n;
            Ok(())
        }
        Err(StorageError::DimensionMismatch { .. }) => {
            for record in batch {
                let id = record.id.clone();
                match writer.write(record) {
                    Ok(()) => summary.accepted += 1,
                    Err(StorageError::DimensionMismatch { expected, got }) => {
                        tracing::warn!(
                            "Skipping record {}: dimension {} (expected {})",
                            id,
                            got,
                            expected
                        );
                        summary.skipped += 1;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn inspect(path: &Path) -> Result<()> {
    let file = PartitionFile::open(path)?;
    let header = file.header();

    println!("File:      {}", path.display());
    println!("Size:      {} bytes", file.file_len());
    println!("Version:   {}", header.version);
    println!("Index:     {}", if header.has_index() { "present" } else { "absent" });
    let model = file.metadata().model;
    if file.row_count() > 0 && file.dimension() != model.native_dimension() {
        println!(
            "Note:      {} embeddings are {}-d, model publishes {}-d",
            model,
            file.dimension(),
            model.native_dimension()
        );
    }
    println!();
    println!("Metadata:");
    println!("{}", serde_json::to_string_pretty(file.metadata())?);
    println!();
    println!("{:<14} {:>12} {:>12}", "COLUMN", "OFFSET", "BYTES");
    println!("{}", "-".repeat(40));
    for column in Column::ALL {
        let (start, end) = file.column_range(column)?;
        println!("{:<14} {:>12} {:>12}", column.name(), start, end - start);
    }
    Ok(())
}

fn dump(path: &Path, column: &str, limit: usize) -> Result<()> {
    let column = Column::from_name(column).ok_or_else(|| anyhow!("unknown column '{}'", column))?;
    let file = PartitionFile::open(path)?;

    match file.column(column)? {
        ColumnData::Strings(values) => {
            for (row, v) in values.iter().take(limit).enumerate() {
                println!("{:>6}  {}", row, v);
            }
        }
        ColumnData::Int32(values) => {
            for (row, v) in values.iter().take(limit).enumerate() {
                println!("{:>6}  {}", row, v);
            }
        }
        ColumnData::Vectors(values) => {
            for (row, v) in values.iter().take(limit).enumerate() {
                let head: Vec<String> = v.iter().take(6).map(|x| format!("{:.4}", x)).collect();
                let more = if v.len() > 6 { ", ..." } else { "" };
                println!("{:>6}  [{}{}] (dim {})", row, head.join(", "), more, v.len());
            }
        }
    }
    if file.row_count() > limit {
        println!("... {} more rows", file.row_count() - limit);
    }
    Ok(())
}

fn search(path: &Path, like: &str, k: usize, nprobe: usize) -> Result<()> {
    let file = PartitionFile::open(path)?;
    let ids = file.strings(Column::Id)?;
    let row = ids
        .iter()
        .position(|id| id == like)
        .ok_or_else(|| anyhow!("no record with id '{}' in {}", like, path.display()))?;

    let dim = file.dimension();
    if dim == 0 {
        bail!("{} has no embeddings", path.display());
    }
    let embeddings = file.embeddings_flat()?;
    let query = &embeddings[row * dim..(row + 1) * dim];

    let method = if file.header().has_index() { "IVF-PQ" } else { "flat scan" };
    let start = Instant::now();
    let hits = file.search(query, k, nprobe)?;
    let elapsed = start.elapsed();

    let titles = file.strings(Column::Title)?;
    println!("Nearest to '{}' ({}, {:.2?}):", like, method, elapsed);
    println!("{:<6} {:<24} {:<40} {:>10}", "RANK", "ID", "TITLE", "DISTANCE");
    println!("{}", "-".repeat(84));
    for (rank, hit) in hits.iter().enumerate() {
        let r = hit.row as usize;
        println!(
            "{:<6} {:<24} {:<40} {:>10.4}",
            rank + 1,
            ids[r],
            titles[r],
            hit.distance
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wikivec=info,wikivec_storage=info,wikivec_index=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Ingest {
            input,
            out_dir,
            config,
            flush_size,
            by_type,
            batch_size,
        } => {
            ingest(input, out_dir, config, flush_size, by_type, batch_size).await?;
        }
        Commands::Inspect { file } => {
            inspect(&file)?;
        }
        Commands::Dump {
            file,
            column,
            limit,
        } => {
            dump(&file, &column, limit)?;
        }
        Commands::Search {
            file,
            like,
            k,
            nprobe,
        } => {
            search(&file, &like, k, nprobe)?;
        }
    }

    Ok(())
}
