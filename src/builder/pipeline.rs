use std::sync::Arc;

use anyhow::{bail, format_err, Error};
use futures::stream::{StreamExt, TryStreamExt};
use log::{info, warn};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use ulid::Ulid;

use super::block::{BlockBuilderFactory, BlockWriter, BLOCK_SOURCE};
use super::chunk::Chunk;
use super::fetcher::{ChunkFetcher, ChunkStore};
use super::labels::{normalize, Labels};
use super::merge::SeriesMerger;
use super::series_file::SeriesWriter;
use super::upload::{block_size, delete_local_block, upload_block, Uploader};
use crate::config::BuilderConfig;
use crate::metrics;
use crate::plan::PlanEntry;
use crate::tools::with_backoff;

struct InProgressGuard;

impl InProgressGuard {
    fn start() -> Self {
        metrics::IN_PROGRESS.set(1);
        Self
    }
}

impl Drop for InProgressGuard {
    fn drop(&mut self) {
        metrics::IN_PROGRESS.set(0);
    }
}

/// Funnels finished series from the async workers into the spill writer.
///
/// A single dedicated thread owns the writer, so batch content is decided
/// by the sort at spill time, never by arrival order, and workers only
/// ever block on the channel.
struct SeriesFunnel {
    input: Option<crossbeam_channel::Sender<(Labels, Vec<Chunk>)>>,
    handle: Option<std::thread::JoinHandle<(SeriesWriter, Result<(), Error>)>>,
}

impl SeriesFunnel {
    fn new(writer: SeriesWriter, buffer: usize) -> Self {
        let (input, output) = crossbeam_channel::bounded(buffer);
        let handle = std::thread::spawn(move || {
            let mut writer = writer;
            for (labels, chunks) in output {
                if let Err(err) = writer.add_series(labels, chunks) {
                    // dropping the receiver makes every pending send fail,
                    // which aborts the workers
                    return (writer, Err(err));
                }
            }
            (writer, Ok(()))
        });
        Self {
            input: Some(input),
            handle: Some(handle),
        }
    }

    fn sender(&self) -> crossbeam_channel::Sender<(Labels, Vec<Chunk>)> {
        self.input.clone().expect("funnel already completed")
    }

    fn complete(mut self) -> Result<SeriesWriter, Error> {
        drop(self.input.take());
        let (writer, result) = self
            .handle
            .take()
            .expect("funnel already completed")
            .join()
            .map_err(|_| format_err!("series writer thread panicked"))?;
        result?;
        Ok(writer)
    }
}

async fn process_entry(
    fetcher: &ChunkFetcher,
    entry: &PlanEntry,
    series_sink: &crossbeam_channel::Sender<(Labels, Vec<Chunk>)>,
) -> Result<(), Error> {
    let mut chunks = with_backoff("fetching chunks", || fetcher.fetch(&entry.chunks)).await?;

    let missing = entry.chunks.len().saturating_sub(chunks.len());
    if missing > 0 {
        metrics::CHUNKS_NOT_FOUND_TOTAL.inc_by(missing as u64);
    }
    if chunks.is_empty() {
        warn!(
            "no chunks found for series '{}' ({} requested), skipping series",
            entry.series_id,
            entry.chunks.len()
        );
        return Ok(());
    }
    if missing > 0 {
        warn!(
            "{} of {} chunks not found for series '{}'",
            missing,
            entry.chunks.len(),
            entry.series_id
        );
    }

    let labels = normalize(chunks[0].metric.clone())?;
    for chunk in chunks[1..].iter() {
        if normalize(chunk.metric.clone())? != labels {
            bail!(
                "chunks disagree on series labels: {} != {}",
                chunk.metric,
                labels
            );
        }
    }
    // every chunk now carries the canonical label set
    for chunk in chunks.iter_mut() {
        chunk.metric = labels.clone();
    }

    tokio::task::block_in_place(|| series_sink.send((labels, chunks)))
        .map_err(|_| format_err!("series writer terminated"))?;
    Ok(())
}

/// Build one plan into one block.
///
/// Fans out over `concurrency` fetch-and-build workers, spills sorted
/// series batches, then merges them into the block writer. The first
/// worker error cancels the remaining work and is returned wrapped with
/// the offending series id. Dropping the returned future cancels the
/// build; a later [`cleanup_output_dir`](super::upload::cleanup_output_dir)
/// reclaims its partial `.tmp` directory.
///
/// Returns the ULID of the produced block, or None for a plan that yields
/// no series at all (nothing is produced or uploaded then).
pub async fn build_plan(
    config: &BuilderConfig,
    tenant: &str,
    entries: mpsc::Receiver<PlanEntry>,
    store: Arc<dyn ChunkStore>,
    builder_factory: &BlockBuilderFactory,
    uploader: Option<Arc<dyn Uploader>>,
) -> Result<Option<Ulid>, Error> {
    let _in_progress = InProgressGuard::start();
    let concurrency = config.concurrency.max(1);

    let mut block = BlockWriter::open(
        &config.output_dir,
        tenant,
        config.timestamp_tolerance_ms,
        builder_factory,
    )?;
    let writer = SeriesWriter::new(&block.spill_dir(), config.series_batch_size)?;
    let funnel = SeriesFunnel::new(writer, concurrency);
    let sender = funnel.sender();

    let fetcher = ChunkFetcher::new(store, tenant);

    ReceiverStream::new(entries)
        .map(Ok::<_, Error>)
        .map_ok(|entry| {
            let fetcher = fetcher.clone();
            let sender = sender.clone();
            async move {
                process_entry(&fetcher, &entry, &sender)
                    .await
                    .map_err(|err| {
                        format_err!("failed to build series '{}' - {}", entry.series_id, err)
                    })
            }
        })
        .try_buffer_unordered(concurrency)
        .try_for_each(|_| futures::future::ok(()))
        .await?;
    drop(sender);

    let writer = funnel.complete()?;
    let mut merger = SeriesMerger::new(writer.finish()?)?;

    let mut series_count = 0u64;
    while let Some(series) = merger.next_series()? {
        block.write_series(series)?;
        series_count += 1;
    }

    if series_count == 0 {
        info!(
            "plan for tenant '{}' yielded no series, not producing a block",
            tenant
        );
        block.abandon()?;
        return Ok(None);
    }

    let (block_dir, ulid) = block.finalize(BLOCK_SOURCE)?;

    let size = block_size(&block_dir)?;
    metrics::BLOCK_SIZE_BYTES_TOTAL.inc_by(size);
    info!(
        "wrote block {} for tenant '{}' ({} series, {} bytes)",
        ulid, tenant, series_count, size
    );

    if config.upload {
        let uploader = uploader
            .ok_or_else(|| format_err!("upload requested but no uploader configured"))?;
        upload_block(&uploader, &block_dir).await?;
        if config.delete_local_blocks {
            delete_local_block(&block_dir);
        }
    }

    Ok(Some(ulid))
}
