use std::collections::BTreeMap;
use std::convert::TryInto;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};
use ulid::Ulid;

use super::block::{BlockBuilder, BlockMeta, BlockStats, ThanosMeta};
use super::labels::{Label, Labels};
use super::series_file::{PayloadReader, Series};

// openssl::sha::sha256(b"tsdb-block-index-v1")[0..8]
pub const INDEX_MAGIC_1_0: [u8; 8] = [74, 196, 131, 32, 136, 246, 107, 140];
// openssl::sha::sha256(b"tsdb-block-chunks-v1")[0..8]
pub const CHUNK_SEGMENT_MAGIC_1_0: [u8; 8] = [146, 220, 151, 192, 22, 200, 74, 138];

pub const INDEX_FILENAME: &str = "index";
pub const CHUNKS_DIRNAME: &str = "chunks";

const MAX_SEGMENT_SIZE: u64 = 512 * 1024 * 1024;

/// Where one encoded chunk lives inside the block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkRef {
    pub segment: u32,
    pub offset: u64,
    pub len: u32,
    pub from: i64,
    pub through: i64,
}

/// Writes `chunks/<nnnnnn>` segment files, rotating at 512 MiB.
struct SegmentWriter {
    dir: PathBuf,
    writer: BufWriter<File>,
    segment: u32,
    offset: u64,
}

impl SegmentWriter {
    fn new(block_dir: &Path) -> Result<Self, Error> {
        let dir = block_dir.join(CHUNKS_DIRNAME);
        std::fs::create_dir_all(&dir)?;
        let (writer, offset) = Self::open_segment(&dir, 1)?;
        Ok(Self {
            dir,
            writer,
            segment: 1,
            offset,
        })
    }

    fn open_segment(dir: &Path, segment: u32) -> Result<(BufWriter<File>, u64), Error> {
        let path = dir.join(format!("{:06}", segment));
        let file = File::create(&path)
            .map_err(|err| format_err!("unable to create segment {:?} - {}", path, err))?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&CHUNK_SEGMENT_MAGIC_1_0)?;
        Ok((writer, CHUNK_SEGMENT_MAGIC_1_0.len() as u64))
    }

    fn append(&mut self, data: &[u8]) -> Result<(u32, u64), Error> {
        if self.offset + data.len() as u64 > MAX_SEGMENT_SIZE {
            self.writer.flush()?;
            self.segment += 1;
            let (writer, offset) = Self::open_segment(&self.dir, self.segment)?;
            self.writer = writer;
            self.offset = offset;
        }
        let position = (self.segment, self.offset);
        self.writer.write_all(data)?;
        self.offset += data.len() as u64;
        Ok(position)
    }

    fn finish(mut self) -> Result<(), Error> {
        self.writer.flush()?;
        self.writer.into_inner()?.sync_all()?;
        Ok(())
    }
}

/// [`BlockBuilder`] writing the block file set directly.
///
/// `index` holds one length-prefixed, crc-protected record per series with
/// the labels and chunk references; chunk payloads are concatenated into
/// `chunks/` segments. `meta.json` is written at finalize.
pub struct FileBlockBuilder {
    block_dir: PathBuf,
    ulid: Ulid,
    index: BufWriter<File>,
    segments: SegmentWriter,
    stats: BlockStats,
    min_time: i64,
    max_time: i64,
}

impl FileBlockBuilder {
    pub fn new(block_dir: &Path, ulid: Ulid) -> Result<Self, Error> {
        let index_path = block_dir.join(INDEX_FILENAME);
        let file = File::create(&index_path)
            .map_err(|err| format_err!("unable to create index {:?} - {}", index_path, err))?;
        let mut index = BufWriter::new(file);
        index.write_all(&INDEX_MAGIC_1_0)?;

        Ok(Self {
            block_dir: block_dir.to_owned(),
            ulid,
            index,
            segments: SegmentWriter::new(block_dir)?,
            stats: BlockStats::default(),
            min_time: i64::MAX,
            max_time: i64::MIN,
        })
    }

    /// Factory with the signature expected by the block writer driver.
    pub fn factory(block_dir: &Path, ulid: Ulid) -> Result<Box<dyn BlockBuilder>, Error> {
        Ok(Box::new(FileBlockBuilder::new(block_dir, ulid)?))
    }

    fn encode_index_record(series: &Series, refs: &[ChunkRef]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&series.hash.to_le_bytes());
        payload.extend_from_slice(&(series.labels.len() as u32).to_le_bytes());
        for label in &series.labels {
            payload.extend_from_slice(&(label.name.len() as u32).to_le_bytes());
            payload.extend_from_slice(label.name.as_bytes());
            payload.extend_from_slice(&(label.value.len() as u32).to_le_bytes());
            payload.extend_from_slice(label.value.as_bytes());
        }
        payload.extend_from_slice(&(refs.len() as u32).to_le_bytes());
        for chunk_ref in refs {
            payload.extend_from_slice(&chunk_ref.segment.to_le_bytes());
            payload.extend_from_slice(&chunk_ref.offset.to_le_bytes());
            payload.extend_from_slice(&chunk_ref.len.to_le_bytes());
            payload.extend_from_slice(&chunk_ref.from.to_le_bytes());
            payload.extend_from_slice(&chunk_ref.through.to_le_bytes());
        }
        payload
    }
}

impl BlockBuilder for FileBlockBuilder {
    fn add_series(&mut self, series: &Series) -> Result<(), Error> {
        let mut refs = Vec::with_capacity(series.chunks.len());
        for chunk in &series.chunks {
            let samples = chunk.sample_count()? as u64;
            let (segment, offset) = self.segments.append(&chunk.encoded)?;
            refs.push(ChunkRef {
                segment,
                offset,
                len: chunk.encoded.len() as u32,
                from: chunk.from,
                through: chunk.through,
            });
            self.min_time = std::cmp::min(self.min_time, chunk.from);
            self.max_time = std::cmp::max(self.max_time, chunk.through);
            self.stats.num_chunks += 1;
            self.stats.num_samples += samples;
        }

        let payload = Self::encode_index_record(series, &refs);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&payload);
        self.index.write_all(&(payload.len() as u32).to_le_bytes())?;
        self.index.write_all(&hasher.finalize().to_le_bytes())?;
        self.index.write_all(&payload)?;

        self.stats.num_series += 1;
        Ok(())
    }

    fn finalize(
        self: Box<Self>,
        source: &str,
        external_labels: BTreeMap<String, String>,
    ) -> Result<(), Error> {
        let mut index = self.index;
        index.flush()?;
        index.into_inner()?.sync_all()?;
        self.segments.finish()?;

        let (min_time, max_time) = if self.stats.num_series == 0 {
            (0, 0)
        } else {
            (self.min_time, self.max_time)
        };

        let meta = BlockMeta {
            ulid: self.ulid.to_string(),
            min_time,
            max_time,
            version: 1,
            stats: self.stats,
            thanos: ThanosMeta {
                labels: external_labels,
                source: source.to_string(),
            },
        };
        meta.write(&self.block_dir)
    }
}

/// One decoded index entry.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub hash: u64,
    pub labels: Labels,
    pub chunks: Vec<ChunkRef>,
}

/// Streaming reader over a block `index` file.
pub struct IndexReader {
    reader: BufReader<File>,
    path: PathBuf,
}

impl IndexReader {
    pub fn open(block_dir: &Path) -> Result<Self, Error> {
        let path = block_dir.join(INDEX_FILENAME);
        let file = File::open(&path)
            .map_err(|err| format_err!("unable to open index {:?} - {}", path, err))?;
        let mut reader = BufReader::new(file);
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if magic != INDEX_MAGIC_1_0 {
            bail!("index {:?} has wrong magic number", path);
        }
        Ok(Self { reader, path })
    }

    pub fn next_entry(&mut self) -> Result<Option<IndexEntry>, Error> {
        let mut header = [0u8; 8];
        match self.reader.read_exact(&mut header[..4]) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err.into()),
        }
        self.reader.read_exact(&mut header[4..])?;
        let len = u32::from_le_bytes(header[..4].try_into().unwrap()) as usize;
        let expected_crc = u32::from_le_bytes(header[4..].try_into().unwrap());

        let mut payload = vec![0u8; len];
        self.reader.read_exact(&mut payload)?;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&payload);
        if hasher.finalize() != expected_crc {
            bail!("index record in {:?} has wrong CRC checksum", self.path);
        }

        let mut record = PayloadReader::new(&payload);
        let hash = record.read_u64()?;
        let label_count = record.read_u32()? as usize;
        let mut labels = Vec::with_capacity(label_count);
        for _ in 0..label_count {
            let name = record.read_string()?;
            let value = record.read_string()?;
            labels.push(Label { name, value });
        }
        let chunk_count = record.read_u32()? as usize;
        let mut chunks = Vec::with_capacity(chunk_count);
        for _ in 0..chunk_count {
            chunks.push(ChunkRef {
                segment: record.read_u32()?,
                offset: record.read_u64()?,
                len: record.read_u32()?,
                from: record.read_i64()?,
                through: record.read_i64()?,
            });
        }
        if record.remaining() != 0 {
            bail!("trailing garbage in index record");
        }

        Ok(Some(IndexEntry {
            hash,
            labels: Labels::new(labels),
            chunks,
        }))
    }
}

/// Read one chunk payload back out of a block.
pub fn read_chunk_data(block_dir: &Path, chunk_ref: &ChunkRef) -> Result<Vec<u8>, Error> {
    use std::io::{Seek, SeekFrom};

    let path = block_dir
        .join(CHUNKS_DIRNAME)
        .join(format!("{:06}", chunk_ref.segment));
    let mut file = File::open(&path)
        .map_err(|err| format_err!("unable to open segment {:?} - {}", path, err))?;
    file.seek(SeekFrom::Start(chunk_ref.offset))?;
    let mut data = vec![0u8; chunk_ref.len as usize];
    file.read_exact(&mut data)?;
    Ok(data)
}

/// Integrity check over a finished block directory.
///
/// Verifies the meta/index/chunks files agree: magic numbers, record
/// checksums, index ordering, series count, and that every chunk
/// reference points inside an existing segment.
pub fn verify_block(block_dir: &Path) -> Result<BlockMeta, Error> {
    let meta = BlockMeta::load(block_dir)?;

    let mut segment_sizes = BTreeMap::new();
    let chunks_dir = block_dir.join(CHUNKS_DIRNAME);
    for entry in std::fs::read_dir(&chunks_dir)
        .map_err(|err| format_err!("unable to read {:?} - {}", chunks_dir, err))?
    {
        let entry = entry?;
        let name = entry.file_name();
        let segment: u32 = name
            .to_string_lossy()
            .parse()
            .map_err(|_| format_err!("unexpected file {:?} in chunks dir", name))?;
        segment_sizes.insert(segment, entry.metadata()?.len());
    }

    let mut reader = IndexReader::open(block_dir)?;
    let mut series = 0u64;
    let mut last_key: Option<(u64, Labels)> = None;
    while let Some(entry) = reader.next_entry()? {
        let key = (entry.hash, entry.labels.clone());
        if let Some(last) = &last_key {
            if *last >= key {
                bail!("index is not sorted at series {}", entry.labels);
            }
        }
        last_key = Some(key);

        for chunk_ref in &entry.chunks {
            let size = segment_sizes
                .get(&chunk_ref.segment)
                .ok_or_else(|| format_err!("missing chunk segment {}", chunk_ref.segment))?;
            if chunk_ref.offset + chunk_ref.len as u64 > *size {
                bail!("chunk reference outside segment {}", chunk_ref.segment);
            }
        }
        series += 1;
    }

    if series != meta.stats.num_series {
        bail!(
            "index has {} series but meta.json claims {}",
            series,
            meta.stats.num_series
        );
    }
    Ok(meta)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::builder::chunk::{Chunk, Sample};

    fn series(name: &str, timestamps: &[i64]) -> Series {
        let labels = Labels::new(vec![Label::new("__name__", name)]);
        let samples: Vec<Sample> = timestamps
            .iter()
            .map(|t| Sample { timestamp: *t, value: 0.5 })
            .collect();
        let chunk = Chunk::from_samples(labels.clone(), &samples).unwrap();
        Series::new(labels, vec![chunk])
    }

    #[test]
    fn block_files_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let ulid = Ulid::new();
        let mut builder = FileBlockBuilder::new(dir.path(), ulid).unwrap();

        let mut input = vec![series("a", &[0, 10_000]), series("b", &[20_000, 30_000])];
        input.sort_by(|x, y| x.sort_key().cmp(&y.sort_key()));
        for s in &input {
            builder.add_series(s).unwrap();
        }

        let mut external_labels = BTreeMap::new();
        external_labels.insert("__org_id__".to_string(), "tenant-1".to_string());
        Box::new(builder)
            .finalize("test", external_labels)
            .unwrap();

        let meta = verify_block(dir.path()).unwrap();
        assert_eq!(meta.ulid, ulid.to_string());
        assert_eq!(meta.stats.num_series, 2);
        assert_eq!(meta.stats.num_chunks, 2);
        assert_eq!(meta.stats.num_samples, 4);
        assert_eq!(meta.min_time, 0);
        assert_eq!(meta.max_time, 30_000);
        assert_eq!(meta.thanos.labels.get("__org_id__").unwrap(), "tenant-1");

        let mut reader = IndexReader::open(dir.path()).unwrap();
        let first = reader.next_entry().unwrap().unwrap();
        let data = read_chunk_data(dir.path(), &first.chunks[0]).unwrap();
        let original = input
            .iter()
            .find(|s| s.labels == first.labels)
            .unwrap();
        assert_eq!(&data[..], &original.chunks[0].encoded[..]);
    }

    #[test]
    fn unsorted_index_fails_verification() {
        let dir = tempfile::tempdir().unwrap();
        let ulid = Ulid::new();
        let mut builder = FileBlockBuilder::new(dir.path(), ulid).unwrap();

        let mut input = vec![series("a", &[0]), series("b", &[0])];
        input.sort_by(|x, y| x.sort_key().cmp(&y.sort_key()));
        input.reverse();
        for s in &input {
            builder.add_series(s).unwrap();
        }
        Box::new(builder).finalize("test", BTreeMap::new()).unwrap();

        let err = verify_block(dir.path()).unwrap_err();
        assert!(err.to_string().contains("not sorted"), "{}", err);
    }
}
