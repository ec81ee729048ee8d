use std::cmp::Ordering;
use std::collections::BinaryHeap;

use anyhow::Error;
use log::warn;
use thiserror::Error as ThisError;

use super::series_file::{Series, SeriesReader, SeriesSources};

/// Two sources produced the same `(hash, labels)` key. Plans are
/// deduplicated upstream, so this always indicates a plan bug.
#[derive(Debug, ThisError)]
#[error("duplicate series in merge input: {labels}")]
pub struct InternalDuplicateSeries {
    pub labels: String,
}

enum Source {
    File(SeriesReader),
    Memory(std::vec::IntoIter<Series>),
}

impl Source {
    /// Next series from this source; file sources are unlinked as soon as
    /// they run dry.
    fn next_series(&mut self) -> Result<Option<Series>, Error> {
        match self {
            Source::Memory(iter) => Ok(iter.next()),
            Source::File(reader) => {
                let series = reader.next_series()?;
                if series.is_none() {
                    if let Err(err) = std::fs::remove_file(reader.path()) {
                        warn!("unable to remove drained series file {:?} - {}", reader.path(), err);
                    }
                }
                Ok(series)
            }
        }
    }
}

struct HeapEntry {
    series: Series,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.series.sort_key() == other.series.sort_key()
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // reversed, BinaryHeap is a max-heap
    fn cmp(&self, other: &Self) -> Ordering {
        other.series.sort_key().cmp(&self.series.sort_key())
    }
}

/// K-way merge over spilled run files and the residual in-memory batch.
///
/// Yields series ordered by `(hash, labels)`: non-strictly increasing by
/// hash, strictly increasing by labels within one hash. The merge is
/// finite, non-restartable and single-consumer.
pub struct SeriesMerger {
    heap: BinaryHeap<HeapEntry>,
    sources: Vec<Source>,
    last_key: Option<(u64, super::labels::Labels)>,
}

impl SeriesMerger {
    pub fn new(sources: SeriesSources) -> Result<Self, Error> {
        let mut merger = Self {
            heap: BinaryHeap::new(),
            sources: Vec::new(),
            last_key: None,
        };

        for path in &sources.run_files {
            merger.sources.push(Source::File(SeriesReader::open(path)?));
        }
        if !sources.rest.is_empty() {
            merger
                .sources
                .push(Source::Memory(sources.rest.into_iter()));
        }

        for index in 0..merger.sources.len() {
            merger.refill(index)?;
        }
        Ok(merger)
    }

    fn refill(&mut self, source: usize) -> Result<(), Error> {
        if let Some(series) = self.sources[source].next_series()? {
            self.heap.push(HeapEntry { series, source });
        }
        Ok(())
    }

    /// Next series in merged order, or None once every source is drained.
    pub fn next_series(&mut self) -> Result<Option<Series>, Error> {
        let entry = match self.heap.pop() {
            Some(entry) => entry,
            None => return Ok(None),
        };
        self.refill(entry.source)?;

        let series = entry.series;
        if let Some((hash, labels)) = &self.last_key {
            if *hash == series.hash && *labels == series.labels {
                return Err(Error::new(InternalDuplicateSeries {
                    labels: series.labels.to_string(),
                }));
            }
        }
        self.last_key = Some((series.hash, series.labels.clone()));
        Ok(Some(series))
    }
}
