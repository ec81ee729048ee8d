use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{format_err, Error};
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

use super::chunk::{Chunk, ChunkId};
use super::labels::{Label, Labels};
use crate::metrics;

/// Signalled by a [`ChunkStore`] when a whole batch of chunk objects does
/// not exist. Callers treat this as "no data", not as a failure.
#[derive(Debug, ThisError)]
#[error("chunk object not found")]
pub struct ChunkNotFound;

/// The ChunkStore trait allows fetching chunk objects (local or remote).
///
/// A partial miss is reported by returning fewer chunks than requested;
/// a miss of the whole batch either way, as an empty vec or a
/// [`ChunkNotFound`] error. Any other error is considered transient and
/// subject to retry by the caller.
pub trait ChunkStore: Send + Sync {
    fn fetch_chunks<'a>(
        &'a self,
        tenant: &'a str,
        ids: &'a [ChunkId],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Chunk>, Error>> + Send + 'a>>;
}

/// Tenant-scoped chunk retrieval with fetch accounting.
#[derive(Clone)]
pub struct ChunkFetcher {
    store: Arc<dyn ChunkStore>,
    tenant: String,
}

impl ChunkFetcher {
    /// The tenant is bound here, not per call.
    pub fn new(store: Arc<dyn ChunkStore>, tenant: &str) -> Self {
        Self {
            store,
            tenant: tenant.to_string(),
        }
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// Fetch a batch of chunks.
    ///
    /// Missing chunks are not fatal: a fully vanished batch yields an empty
    /// vec, a partial miss yields what was found. The caller compares
    /// requested and returned counts to account for the misses.
    pub async fn fetch(&self, ids: &[ChunkId]) -> Result<Vec<Chunk>, Error> {
        let chunks = match self.store.fetch_chunks(&self.tenant, ids).await {
            Ok(chunks) => chunks,
            Err(err) if err.downcast_ref::<ChunkNotFound>().is_some() => Vec::new(),
            Err(err) => return Err(err),
        };

        let bytes: usize = chunks.iter().map(|c| c.encoded_len()).sum();
        metrics::FETCHED_CHUNKS_TOTAL.inc_by(chunks.len() as u64);
        metrics::FETCHED_CHUNKS_BYTES_TOTAL.inc_by(bytes as u64);

        Ok(chunks)
    }
}

/// On-disk chunk object layout used by [`LocalChunkStore`].
#[derive(Serialize, Deserialize)]
struct ChunkObject {
    metric: Vec<(String, String)>,
    from: i64,
    through: i64,
    data: String, // base64 of the encoded sample payload
}

/// Chunk store backed by a plain directory tree.
///
/// Objects live at `<root>/<tenant>/<chunk id>` as JSON envelopes. Used by
/// store tooling and for driving builds without an object-store client.
pub struct LocalChunkStore {
    root: PathBuf,
}

impl LocalChunkStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    fn chunk_path(&self, tenant: &str, id: &str) -> PathBuf {
        self.root.join(tenant).join(id)
    }

    /// Write one chunk object, creating the tenant directory on demand.
    pub fn put_chunk(&self, tenant: &str, id: &str, chunk: &Chunk) -> Result<(), Error> {
        let object = ChunkObject {
            metric: chunk
                .metric
                .iter()
                .map(|l| (l.name.clone(), l.value.clone()))
                .collect(),
            from: chunk.from,
            through: chunk.through,
            data: base64::encode(&chunk.encoded),
        };
        let path = self.chunk_path(tenant, id);
        std::fs::create_dir_all(self.root.join(tenant))?;
        std::fs::write(&path, serde_json::to_vec(&object)?)?;
        Ok(())
    }

    fn load_chunk(&self, tenant: &str, id: &str) -> Result<Option<Chunk>, Error> {
        let path = self.chunk_path(tenant, id);
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(format_err!("unable to read chunk {:?} - {}", path, err)),
        };
        let object: ChunkObject = serde_json::from_slice(&raw)
            .map_err(|err| format_err!("unable to parse chunk {:?} - {}", path, err))?;
        let encoded = base64::decode(&object.data)
            .map_err(|err| format_err!("unable to decode chunk {:?} - {}", path, err))?;
        Ok(Some(Chunk {
            metric: Labels::new(
                object
                    .metric
                    .into_iter()
                    .map(|(name, value)| Label { name, value })
                    .collect(),
            ),
            from: object.from,
            through: object.through,
            encoded: encoded.into(),
        }))
    }
}

impl ChunkStore for LocalChunkStore {
    fn fetch_chunks<'a>(
        &'a self,
        tenant: &'a str,
        ids: &'a [ChunkId],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Chunk>, Error>> + Send + 'a>> {
        Box::pin(async move {
            let mut chunks = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(chunk) = self.load_chunk(tenant, id)? {
                    chunks.push(chunk);
                }
            }
            Ok(chunks)
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::builder::chunk::Sample;

    fn test_chunk(value: f64) -> Chunk {
        let metric = Labels::new(vec![Label::new("__name__", "up")]);
        Chunk::from_samples(metric, &[Sample { timestamp: 1000, value }]).unwrap()
    }

    #[tokio::test]
    async fn local_store_round_trips_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalChunkStore::new(dir.path());
        let chunk = test_chunk(4.2);
        store.put_chunk("tenant-1", "c1", &chunk).unwrap();

        let fetched = store
            .fetch_chunks("tenant-1", &["c1".to_string()])
            .await
            .unwrap();
        assert_eq!(fetched, vec![chunk]);
    }

    #[tokio::test]
    async fn missing_chunks_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalChunkStore::new(dir.path());
        store.put_chunk("tenant-1", "c1", &test_chunk(1.0)).unwrap();

        let fetched = store
            .fetch_chunks("tenant-1", &["c0".to_string(), "c1".to_string()])
            .await
            .unwrap();
        assert_eq!(fetched.len(), 1);
    }

    #[tokio::test]
    async fn fetcher_maps_not_found_to_empty() {
        struct AlwaysMissing;
        impl ChunkStore for AlwaysMissing {
            fn fetch_chunks<'a>(
                &'a self,
                _tenant: &'a str,
                _ids: &'a [ChunkId],
            ) -> Pin<Box<dyn Future<Output = Result<Vec<Chunk>, Error>> + Send + 'a>>
            {
                Box::pin(async { Err(Error::new(ChunkNotFound)) })
            }
        }

        let fetcher = ChunkFetcher::new(Arc::new(AlwaysMissing), "tenant-1");
        let chunks = fetcher.fetch(&["c1".to_string()]).await.unwrap();
        assert!(chunks.is_empty());
    }
}
