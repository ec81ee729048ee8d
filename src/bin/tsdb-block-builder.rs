//! Build one TSDB block from a plan file.
//!
//! Wiring only: flag parsing, logger setup, and the choice of concrete
//! chunk store and uploader. The build itself lives in the library.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{format_err, Error};
use clap::Parser;
use log::info;

use tsdb_block_builder::builder::{
    build_plan, cleanup_output_dir, CopyUploader, FileBlockBuilder, LocalChunkStore, Uploader,
};
use tsdb_block_builder::config::BuilderConfig;
use tsdb_block_builder::plan::Plan;
use tsdb_block_builder::schema::{schema_for_day, SchemaConfig};

#[derive(Parser, Debug)]
#[command(
    name = "tsdb-block-builder",
    about = "Convert per-series chunk objects into one TSDB block per plan"
)]
struct Args {
    /// Plan file to build.
    #[arg(long)]
    plan: PathBuf,

    /// Workspace root for temporary blocks and spills.
    #[arg(long)]
    output_dir: PathBuf,

    /// Chunk store root directory.
    #[arg(long, conflicts_with = "schema_config")]
    chunk_dir: Option<PathBuf>,

    /// Schema config file (JSON) mapping days to chunk store locations.
    #[arg(long)]
    schema_config: Option<PathBuf>,

    /// Number of fetch-and-build workers.
    #[arg(long, default_value_t = tsdb_block_builder::config::DEFAULT_CONCURRENCY)]
    concurrency: usize,

    /// Upload the finished block into this directory.
    #[arg(long)]
    upload_dir: Option<PathBuf>,

    /// Keep the local block directory after a successful upload.
    #[arg(long)]
    keep_local_blocks: bool,

    /// Series held in memory before spilling a sorted run file.
    #[arg(long, default_value_t = tsdb_block_builder::config::DEFAULT_SERIES_BATCH_SIZE)]
    series_batch_size: usize,

    /// Max per-sample timestamp shift (ms) when aligning to whole
    /// seconds; 0 disables the re-quantization.
    #[arg(long, default_value_t = 0)]
    timestamp_tolerance_ms: i64,
}

fn chunk_store_root(args: &Args, plan: &Plan) -> Result<PathBuf, Error> {
    if let Some(dir) = &args.chunk_dir {
        return Ok(dir.clone());
    }
    let path = args
        .schema_config
        .as_ref()
        .ok_or_else(|| format_err!("either --chunk-dir or --schema-config is required"))?;
    let raw = std::fs::read(path)
        .map_err(|err| format_err!("unable to read schema config {:?} - {}", path, err))?;
    let configs: Vec<SchemaConfig> = serde_json::from_slice(&raw)
        .map_err(|err| format_err!("unable to parse schema config {:?} - {}", path, err))?;
    let schema = schema_for_day(&configs, plan.header.day)?;
    Ok(PathBuf::from(&schema.store))
}

async fn run() -> Result<(), Error> {
    env_logger::init();
    let args = Args::parse();

    std::fs::create_dir_all(&args.output_dir)?;
    let removed = cleanup_output_dir(&args.output_dir)?;
    if removed > 0 {
        info!("reclaimed {} interrupted build(s)", removed);
    }

    let plan = Plan::load(&args.plan)?;
    info!(
        "building plan for tenant '{}', day {} ({} series)",
        plan.header.tenant,
        plan.header.day,
        plan.entries.len()
    );

    let store = Arc::new(LocalChunkStore::new(chunk_store_root(&args, &plan)?));

    let config = BuilderConfig::new(&args.output_dir)
        .concurrency(args.concurrency)
        .upload(args.upload_dir.is_some())
        .delete_local_blocks(!args.keep_local_blocks)
        .series_batch_size(args.series_batch_size)
        .timestamp_tolerance_ms(args.timestamp_tolerance_ms);

    let uploader: Option<Arc<dyn Uploader>> = args
        .upload_dir
        .as_ref()
        .map(|dir| Arc::new(CopyUploader::new(dir)) as Arc<dyn Uploader>);

    let tenant = plan.header.tenant.clone();
    let (_, entries) = plan.into_channel(config.concurrency);

    match build_plan(
        &config,
        &tenant,
        entries,
        store,
        &FileBlockBuilder::factory,
        uploader,
    )
    .await?
    {
        Some(ulid) => println!("{}", ulid),
        None => info!("plan produced no block"),
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("Error: {}", err);
        std::process::exit(1);
    }
}
