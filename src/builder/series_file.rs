use std::convert::TryInto;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};
use log::debug;

use super::chunk::Chunk;
use super::labels::{Label, Labels};
use crate::metrics;

// openssl::sha::sha256(b"tsdb-series-run-file-v1")[0..8]
pub const RUN_FILE_MAGIC_1_0: [u8; 8] = [55, 95, 64, 217, 65, 159, 68, 61];

const MAX_RECORD_SIZE: usize = 256 * 1024 * 1024;

/// One series as accumulated by the build: canonical labels, their hash,
/// and the fetched chunks in storage order.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub hash: u64,
    pub labels: Labels,
    pub chunks: Vec<Chunk>,
}

impl Series {
    pub fn new(labels: Labels, chunks: Vec<Chunk>) -> Self {
        Self {
            hash: labels.hash(),
            labels,
            chunks,
        }
    }

    /// Sort key used by spills, the merge, and the block index.
    pub fn sort_key(&self) -> (u64, &Labels) {
        (self.hash, &self.labels)
    }
}

fn write_u32<W: Write>(writer: &mut W, value: u32) -> Result<(), Error> {
    writer.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn encode_record(series: &Series) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&(series.labels.len() as u32).to_le_bytes());
    for label in &series.labels {
        payload.extend_from_slice(&(label.name.len() as u32).to_le_bytes());
        payload.extend_from_slice(label.name.as_bytes());
        payload.extend_from_slice(&(label.value.len() as u32).to_le_bytes());
        payload.extend_from_slice(label.value.as_bytes());
    }
    payload.extend_from_slice(&(series.chunks.len() as u32).to_le_bytes());
    for chunk in &series.chunks {
        payload.extend_from_slice(&chunk.from.to_le_bytes());
        payload.extend_from_slice(&chunk.through.to_le_bytes());
        payload.extend_from_slice(&(chunk.encoded.len() as u32).to_le_bytes());
        payload.extend_from_slice(&chunk.encoded);
    }
    payload
}

/// Cursor over one decoded record payload.
pub(crate) struct PayloadReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> PayloadReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub(crate) fn take(&mut self, len: usize) -> Result<&'a [u8], Error> {
        if self.offset + len > self.data.len() {
            bail!("truncated record");
        }
        let slice = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32, Error> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub(crate) fn read_u64(&mut self) -> Result<u64, Error> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub(crate) fn read_i64(&mut self) -> Result<i64, Error> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub(crate) fn read_string(&mut self) -> Result<String, Error> {
        let len = self.read_u32()? as usize;
        Ok(std::str::from_utf8(self.take(len)?)?.to_string())
    }
}

fn decode_record(payload: &[u8]) -> Result<Series, Error> {
    let mut reader = PayloadReader::new(payload);

    let label_count = reader.read_u32()? as usize;
    let mut labels = Vec::with_capacity(label_count);
    for _ in 0..label_count {
        let name = reader.read_string()?;
        let value = reader.read_string()?;
        labels.push(Label { name, value });
    }
    let labels = Labels::new(labels);

    let chunk_count = reader.read_u32()? as usize;
    let mut chunks = Vec::with_capacity(chunk_count);
    for _ in 0..chunk_count {
        let from = reader.read_i64()?;
        let through = reader.read_i64()?;
        let len = reader.read_u32()? as usize;
        let encoded = reader.take(len)?.to_vec();
        chunks.push(Chunk {
            metric: labels.clone(),
            from,
            through,
            encoded: encoded.into(),
        });
    }

    if reader.remaining() != 0 {
        bail!("trailing garbage in series record");
    }

    // the hash is a pure function of the labels, recompute instead of storing
    Ok(Series::new(labels, chunks))
}

/// Streaming reader over one run file.
pub struct SeriesReader {
    path: PathBuf,
    reader: BufReader<File>,
}

impl SeriesReader {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)
            .map_err(|err| format_err!("unable to open series file {:?} - {}", path, err))?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 8];
        reader
            .read_exact(&mut magic)
            .map_err(|err| format_err!("unable to read series file {:?} - {}", path, err))?;
        if magic != RUN_FILE_MAGIC_1_0 {
            bail!("series file {:?} has wrong magic number", path);
        }

        Ok(Self {
            path: path.to_owned(),
            reader,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Next series, or None at the end of the file.
    pub fn next_series(&mut self) -> Result<Option<Series>, Error> {
        let mut header = [0u8; 8];
        match self.reader.read_exact(&mut header[..4]) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => {
                return Err(format_err!(
                    "unable to read series file {:?} - {}",
                    self.path,
                    err
                ))
            }
        }
        self.reader.read_exact(&mut header[4..])?;

        let len = u32::from_le_bytes(header[..4].try_into().unwrap()) as usize;
        let expected_crc = u32::from_le_bytes(header[4..].try_into().unwrap());
        if len > MAX_RECORD_SIZE {
            bail!("series record too large ({} bytes)", len);
        }

        let mut payload = vec![0u8; len];
        self.reader.read_exact(&mut payload)?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&payload);
        if hasher.finalize() != expected_crc {
            bail!("series record in {:?} has wrong CRC checksum", self.path);
        }

        decode_record(&payload).map(Some)
    }
}

/// What the writer hands to the merge: the spilled run files plus the
/// residual in-memory batch, already sorted.
pub struct SeriesSources {
    pub run_files: Vec<PathBuf>,
    pub rest: Vec<Series>,
}

/// Accumulates series in memory and spills sorted batches to numbered run
/// files under `<dir>/`. All per-series work funnels through here; input
/// arrival order is irrelevant because every spill is sort-defined.
pub struct SeriesWriter {
    dir: PathBuf,
    batch_size: usize,
    buffer: Vec<Series>,
    run_files: Vec<PathBuf>,
}

impl SeriesWriter {
    pub fn new(dir: &Path, batch_size: usize) -> Result<Self, Error> {
        if batch_size == 0 {
            bail!("series batch size must be positive");
        }
        std::fs::create_dir_all(dir)
            .map_err(|err| format_err!("unable to create spill dir {:?} - {}", dir, err))?;
        Ok(Self {
            dir: dir.to_owned(),
            batch_size,
            buffer: Vec::new(),
            run_files: Vec::new(),
        })
    }

    /// Queue one series, spilling the batch when it is full.
    pub fn add_series(&mut self, labels: Labels, chunks: Vec<Chunk>) -> Result<(), Error> {
        self.buffer.push(Series::new(labels, chunks));
        metrics::SERIES_IN_MEMORY.set(self.buffer.len() as i64);
        if self.buffer.len() >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    fn sort_buffer(buffer: &mut [Series]) {
        buffer.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    }

    fn flush(&mut self) -> Result<(), Error> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        Self::sort_buffer(&mut self.buffer);

        let path = self.dir.join(format!("{:06}", self.run_files.len()));
        let file = File::create(&path)
            .map_err(|err| format_err!("unable to create series file {:?} - {}", path, err))?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&RUN_FILE_MAGIC_1_0)?;

        for series in self.buffer.drain(..) {
            let payload = encode_record(&series);
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&payload);
            write_u32(&mut writer, payload.len() as u32)?;
            write_u32(&mut writer, hasher.finalize())?;
            writer.write_all(&payload)?;
        }
        writer.into_inner()?.sync_all()?;

        debug!("spilled series batch to {:?}", path);
        self.run_files.push(path);
        metrics::SERIES_IN_MEMORY.set(0);
        Ok(())
    }

    /// Sort the residual batch and hand everything to the merge phase.
    pub fn finish(mut self) -> Result<SeriesSources, Error> {
        Self::sort_buffer(&mut self.buffer);
        metrics::SERIES_IN_MEMORY.set(0);
        Ok(SeriesSources {
            run_files: self.run_files,
            rest: self.buffer,
        })
    }
}
