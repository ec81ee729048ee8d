use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{format_err, Error};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use super::chunk::{align_timestamps, Chunk};
use super::series_file::Series;
use crate::metrics;

/// Label key scoping a block to one tenant in `meta.json`. The rest of the
/// metrics store matches on this exact name, never change it.
pub const TENANT_EXTERNAL_LABEL: &str = "__org_id__";

/// Value of the `source` field written by this builder.
pub const BLOCK_SOURCE: &str = "tsdb-block-builder";

pub const META_FILENAME: &str = "meta.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockStats {
    #[serde(rename = "numSamples")]
    pub num_samples: u64,
    #[serde(rename = "numSeries")]
    pub num_series: u64,
    #[serde(rename = "numChunks")]
    pub num_chunks: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThanosMeta {
    pub labels: BTreeMap<String, String>,
    pub source: String,
}

/// The `meta.json` model shared by builder implementations and readers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockMeta {
    pub ulid: String,
    #[serde(rename = "minTime")]
    pub min_time: i64,
    #[serde(rename = "maxTime")]
    pub max_time: i64,
    pub version: u32,
    pub stats: BlockStats,
    pub thanos: ThanosMeta,
}

impl BlockMeta {
    pub fn write(&self, block_dir: &Path) -> Result<(), Error> {
        let path = block_dir.join(META_FILENAME);
        let data = serde_json::to_vec_pretty(self)?;
        std::fs::write(&path, data)
            .map_err(|err| format_err!("unable to write {:?} - {}", path, err))?;
        Ok(())
    }

    pub fn load(block_dir: &Path) -> Result<Self, Error> {
        let path = block_dir.join(META_FILENAME);
        let data = std::fs::read(&path)
            .map_err(|err| format_err!("unable to read {:?} - {}", path, err))?;
        Ok(serde_json::from_slice(&data)?)
    }
}

/// The two-operation contract of a TSDB block builder.
///
/// `add_series` is fed in `(hash, labels)` order; `finalize` writes
/// `index`, `chunks/` and `meta.json` into the working directory it was
/// constructed over. Renaming the directory into place is the driver's
/// job, not the builder's.
pub trait BlockBuilder: Send {
    fn add_series(&mut self, series: &Series) -> Result<(), Error>;

    fn finalize(
        self: Box<Self>,
        source: &str,
        external_labels: BTreeMap<String, String>,
    ) -> Result<(), Error>;
}

/// Constructs a [`BlockBuilder`] over a block working directory.
pub type BlockBuilderFactory =
    dyn Fn(&Path, Ulid) -> Result<Box<dyn BlockBuilder>, Error> + Send + Sync;

/// Drives a [`BlockBuilder`] over the merged series stream.
///
/// Mints the block ULID, owns the `<ulid>.tmp` working directory, injects
/// the tenant external label and applies the configured timestamp
/// re-quantization before handing chunks to the builder.
pub struct BlockWriter {
    output_dir: PathBuf,
    workdir: PathBuf,
    ulid: Ulid,
    tenant: String,
    timestamp_tolerance_ms: i64,
    builder: Box<dyn BlockBuilder>,
}

impl BlockWriter {
    pub fn open(
        output_dir: &Path,
        tenant: &str,
        timestamp_tolerance_ms: i64,
        factory: &BlockBuilderFactory,
    ) -> Result<Self, Error> {
        let ulid = Ulid::new();
        let workdir = output_dir.join(format!("{}.tmp", ulid));
        std::fs::create_dir_all(&workdir)
            .map_err(|err| format_err!("unable to create block dir {:?} - {}", workdir, err))?;
        let builder = factory(&workdir, ulid)?;
        Ok(Self {
            output_dir: output_dir.to_owned(),
            workdir,
            ulid,
            tenant: tenant.to_string(),
            timestamp_tolerance_ms,
            builder,
        })
    }

    pub fn ulid(&self) -> Ulid {
        self.ulid
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Where run files are spilled while the block is under construction.
    pub fn spill_dir(&self) -> PathBuf {
        self.workdir.join("series")
    }

    pub fn write_series(&mut self, mut series: Series) -> Result<(), Error> {
        let mut sample_count = 0u64;
        for chunk in series.chunks.iter_mut() {
            if self.timestamp_tolerance_ms > 0 {
                let mut samples = chunk.samples()?;
                sample_count += samples.len() as u64;
                if align_timestamps(&mut samples, self.timestamp_tolerance_ms) {
                    *chunk = Chunk::from_samples(chunk.metric.clone(), &samples)?;
                }
            } else {
                sample_count += chunk.sample_count()? as u64;
            }
        }

        self.builder.add_series(&series)?;

        metrics::SERIES_TOTAL.inc();
        metrics::WRITTEN_SAMPLES_TOTAL.inc_by(sample_count);
        Ok(())
    }

    /// Finalize the block and strip the `.tmp` suffix.
    ///
    /// The spill directory is removed before the rename; a finished block
    /// never contains one.
    pub fn finalize(self, source: &str) -> Result<(PathBuf, Ulid), Error> {
        let mut external_labels = BTreeMap::new();
        external_labels.insert(TENANT_EXTERNAL_LABEL.to_string(), self.tenant.clone());
        self.builder.finalize(source, external_labels)?;

        let spill_dir = self.workdir.join("series");
        if spill_dir.exists() {
            std::fs::remove_dir_all(&spill_dir)?;
        }

        let block_dir = self.output_dir.join(self.ulid.to_string());
        std::fs::rename(&self.workdir, &block_dir).map_err(|err| {
            format_err!("atomic rename to {:?} failed - {}", block_dir, err)
        })?;
        Ok((block_dir, self.ulid))
    }

    /// Drop the working directory without producing a block. Used when a
    /// plan turns out to contain no series at all.
    pub fn abandon(self) -> Result<(), Error> {
        std::fs::remove_dir_all(&self.workdir)
            .map_err(|err| format_err!("unable to remove {:?} - {}", self.workdir, err))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::builder::chunk::Sample;
    use crate::builder::labels::{Label, Labels};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingBuilder {
        series: Arc<Mutex<Vec<Series>>>,
        finalized: Arc<Mutex<Option<BTreeMap<String, String>>>>,
    }

    impl BlockBuilder for RecordingBuilder {
        fn add_series(&mut self, series: &Series) -> Result<(), Error> {
            self.series.lock().unwrap().push(series.clone());
            Ok(())
        }

        fn finalize(
            self: Box<Self>,
            _source: &str,
            external_labels: BTreeMap<String, String>,
        ) -> Result<(), Error> {
            *self.finalized.lock().unwrap() = Some(external_labels);
            Ok(())
        }
    }

    fn test_series(timestamps: &[i64]) -> Series {
        let labels = Labels::new(vec![Label::new("__name__", "up")]);
        let samples: Vec<Sample> = timestamps
            .iter()
            .map(|t| Sample { timestamp: *t, value: 1.0 })
            .collect();
        let chunk = Chunk::from_samples(labels.clone(), &samples).unwrap();
        Series::new(labels, vec![chunk])
    }

    #[test]
    fn finalize_renames_and_injects_tenant_label() {
        let dir = tempfile::tempdir().unwrap();
        let series = Arc::new(Mutex::new(Vec::new()));
        let finalized = Arc::new(Mutex::new(None));
        let (series2, finalized2) = (series.clone(), finalized.clone());

        let factory = move |_workdir: &Path, _ulid: Ulid| {
            Ok(Box::new(RecordingBuilder {
                series: series2.clone(),
                finalized: finalized2.clone(),
            }) as Box<dyn BlockBuilder>)
        };

        let mut writer = BlockWriter::open(dir.path(), "tenant-1", 0, &factory).unwrap();
        assert!(writer.workdir().exists());
        writer.write_series(test_series(&[0, 10_000])).unwrap();

        let (block_dir, ulid) = writer.finalize(BLOCK_SOURCE).unwrap();
        assert_eq!(block_dir, dir.path().join(ulid.to_string()));
        assert!(block_dir.exists());
        assert!(!dir.path().join(format!("{}.tmp", ulid)).exists());

        assert_eq!(series.lock().unwrap().len(), 1);
        let labels = finalized.lock().unwrap().clone().unwrap();
        assert_eq!(labels.get(TENANT_EXTERNAL_LABEL).unwrap(), "tenant-1");
    }

    #[test]
    fn tolerance_requantizes_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let series = Arc::new(Mutex::new(Vec::new()));
        let series2 = series.clone();
        let factory = move |_workdir: &Path, _ulid: Ulid| {
            Ok(Box::new(RecordingBuilder {
                series: series2.clone(),
                finalized: Default::default(),
            }) as Box<dyn BlockBuilder>)
        };

        let mut writer = BlockWriter::open(dir.path(), "tenant-1", 10, &factory).unwrap();
        writer.write_series(test_series(&[999, 10_005])).unwrap();
        writer.finalize(BLOCK_SOURCE).unwrap();

        let written = series.lock().unwrap();
        let samples = written[0].chunks[0].samples().unwrap();
        assert_eq!(samples[0].timestamp, 1000);
        assert_eq!(samples[1].timestamp, 10_000);
    }

    #[test]
    fn abandon_leaves_no_tmp_dir() {
        let dir = tempfile::tempdir().unwrap();
        let factory = |_workdir: &Path, _ulid: Ulid| {
            Ok(Box::new(RecordingBuilder::default()) as Box<dyn BlockBuilder>)
        };
        let writer = BlockWriter::open(dir.path(), "tenant-1", 0, &factory).unwrap();
        let workdir = writer.workdir().to_owned();
        writer.abandon().unwrap();
        assert!(!workdir.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
