//! Bounded-memory streaming of inbound bytes into the object store.
//!
//! The inbound stream is read exactly once. [`read_preview`] pulls just
//! enough leading chunks to fill the validation window and keeps them;
//! [`Preview::replay`] chains those chunks back in front of the unread
//! remainder so the bytes that were validated are the bytes that get stored.
//!
//! [`TransferEngine::upload`] then slices the stream into fixed-size parts
//! and pushes them through a multipart upload with a bounded number of parts
//! in flight. The upload only becomes visible when it is completed; any
//! failure, size overrun or cancellation aborts it.

use crate::{
    models::object::ObjectKey,
    services::{
        backend::ObjectBackend,
        error_translator::{PipelineError, render_chain, translate},
        retry::RetryPolicy,
    },
};
use bytes::{Bytes, BytesMut};
use futures::{
    FutureExt, Stream, StreamExt,
    future::{self, BoxFuture},
    stream::{self, FuturesUnordered},
};
use object_store::{MultipartUpload, PutResult, UploadPart};
use std::{io, sync::Arc};
use tokio::{runtime::Handle, time::sleep};
use tracing::{debug, error, instrument, warn};

/// S3 rejects non-final parts below 5 MiB.
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Part size and parallelism of a single transfer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferSettings {
    pub part_size: usize,
    pub max_in_flight: usize,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            part_size: MIN_PART_SIZE,
            max_in_flight: 4,
        }
    }
}

/// Outcome of a completed transfer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transferred {
    pub size: u64,
    pub parts: usize,
    pub e_tag: Option<String>,
}

/// Leading chunks of an inbound stream, held for validation.
#[derive(Debug, Default)]
pub struct Preview {
    chunks: Vec<Bytes>,
    head: Bytes,
}

impl Preview {
    /// The validation window: at most `window` leading bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.head
    }

    /// Bytes buffered so far, which may exceed the window by up to one chunk.
    pub fn buffered_len(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }

    /// Put the buffered chunks back in front of the unread remainder.
    pub fn replay<S>(self, rest: S) -> impl Stream<Item = io::Result<Bytes>> + Send
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        stream::iter(self.chunks.into_iter().map(Ok)).chain(rest)
    }
}

/// Read leading chunks until `window` bytes are available or the stream ends.
///
/// Fails with `SizeExceeded` as soon as the buffered bytes pass `max_size`.
pub async fn read_preview<S>(
    source: &mut S,
    window: usize,
    max_size: u64,
) -> Result<Preview, PipelineError>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    let mut chunks = Vec::new();
    let mut head = BytesMut::with_capacity(window);
    let mut buffered: u64 = 0;

    while head.len() < window {
        let Some(chunk) = source.next().await else {
            break;
        };
        let chunk = chunk.map_err(|source| PipelineError::Interrupted { source })?;

        buffered += chunk.len() as u64;
        if buffered > max_size {
            return Err(PipelineError::size_exceeded(max_size));
        }

        let take = chunk.len().min(window - head.len());
        head.extend_from_slice(&chunk[..take]);
        chunks.push(chunk);
    }

    Ok(Preview {
        chunks,
        head: head.freeze(),
    })
}

/// Streams accepted payloads to the backend.
#[derive(Clone, Debug)]
pub struct TransferEngine {
    backend: Arc<dyn ObjectBackend>,
    settings: TransferSettings,
    retry: RetryPolicy,
}

impl TransferEngine {
    pub fn new(backend: Arc<dyn ObjectBackend>, settings: TransferSettings, retry: RetryPolicy) -> Self {
        Self {
            backend,
            settings,
            retry,
        }
    }

    /// Stream `source` to `key`, refusing anything larger than `max_size`.
    ///
    /// On success exactly one complete object exists at `key`. On failure
    /// the multipart upload is aborted, so no object becomes visible.
    #[instrument(skip(self, key, source), fields(key = %key))]
    pub async fn upload<S>(
        &self,
        key: &ObjectKey,
        source: S,
        content_type: &str,
        max_size: u64,
    ) -> Result<Transferred, PipelineError>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let upload = self
            .backend
            .begin_upload(key, content_type)
            .await
            .map_err(|err| translate(err, key.as_str()))?;
        let mut pending = PendingUpload::new(key.clone(), upload);

        match self.push_parts(&mut pending, source, max_size).await {
            Ok((size, parts)) => {
                let result = pending
                    .complete()
                    .await
                    .map_err(|err| translate(err, key.as_str()))?;
                debug!(size, parts, "multipart upload completed");
                Ok(Transferred {
                    size,
                    parts,
                    e_tag: result.e_tag,
                })
            }
            Err(err) => {
                warn!(error = %render_chain(&err), "transfer failed, aborting multipart upload");
                pending.abort(&self.retry).await;
                Err(err)
            }
        }
    }

    /// Read `source` and upload its parts concurrently.
    ///
    /// Completed parts are drained while the source is still being read, so
    /// dispatched parts make progress during slow reads. At most one part is
    /// buffered beyond what is already in flight, and the source is not read
    /// while a full part waits for a slot.
    async fn push_parts<S>(
        &self,
        pending: &mut PendingUpload,
        source: S,
        max_size: u64,
    ) -> Result<(u64, usize), PipelineError>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let part_size = self.settings.part_size.max(1);
        let max_in_flight = self.settings.max_in_flight.max(1);
        let mut buffer = BytesMut::with_capacity(part_size);
        let mut in_flight: FuturesUnordered<UploadPart> = FuturesUnordered::new();
        let mut total: u64 = 0;
        let mut parts = 0usize;
        let mut exhausted = false;

        futures::pin_mut!(source);
        loop {
            while in_flight.len() < max_in_flight
                && (buffer.len() >= part_size || (exhausted && !buffer.is_empty()))
            {
                let part = buffer.split_to(part_size.min(buffer.len())).freeze();
                debug!(len = part.len(), in_flight = in_flight.len(), "dispatching part");
                in_flight.push(pending.put_part(part));
                parts += 1;
            }

            tokio::select! {
                biased;

                Some(result) = in_flight.next(), if !in_flight.is_empty() => {
                    result.map_err(|err| translate(err, pending.key.as_str()))?;
                }
                chunk = source.next(), if !exhausted && buffer.len() < part_size => {
                    match chunk {
                        Some(chunk) => {
                            let chunk =
                                chunk.map_err(|source| PipelineError::Interrupted { source })?;
                            total += chunk.len() as u64;
                            if total > max_size {
                                return Err(PipelineError::size_exceeded(max_size));
                            }
                            buffer.extend_from_slice(&chunk);
                        }
                        None => exhausted = true,
                    }
                }
                else => break,
            }
        }

        Ok((total, parts))
    }
}

/// A multipart upload that is aborted unless it is explicitly completed.
///
/// Dropping it unsettled (e.g. because the request future was cancelled when
/// the client disconnected) schedules the abort on the current runtime.
struct PendingUpload {
    key: ObjectKey,
    upload: Option<Box<dyn MultipartUpload>>,
}

impl PendingUpload {
    fn new(key: ObjectKey, upload: Box<dyn MultipartUpload>) -> Self {
        Self {
            key,
            upload: Some(upload),
        }
    }

    fn put_part(&mut self, part: Bytes) -> UploadPart {
        match self.upload.as_mut() {
            Some(upload) => upload.put_part(part.into()),
            None => future::ready(Err(object_store::Error::Generic {
                store: "transfer-engine",
                source: "multipart upload already settled".into(),
            }))
            .boxed(),
        }
    }

    async fn complete(mut self) -> object_store::Result<PutResult> {
        let Some(mut upload) = self.upload.take() else {
            return Err(object_store::Error::Generic {
                store: "transfer-engine",
                source: "multipart upload already settled".into(),
            });
        };
        match upload.complete().await {
            Ok(result) => Ok(result),
            Err(err) => {
                // a failed completion may leave parts behind
                self.upload = Some(upload);
                Err(err)
            }
        }
    }

    /// Abort, retrying transient failures. Failures are logged, not returned:
    /// the caller is already reporting the error that caused the abort.
    async fn abort(mut self, retry: &RetryPolicy) {
        let Some(mut upload) = self.upload.take() else {
            return;
        };
        let mut attempt = 1;
        loop {
            match upload.abort().await {
                Ok(()) => {
                    debug!(key = %self.key, "multipart upload aborted");
                    return;
                }
                Err(err) => {
                    let translated = translate(err, self.key.as_str());
                    if translated.is_retryable() && attempt < retry.max_attempts {
                        sleep(retry.delay_after(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    error!(
                        key = %self.key,
                        error = %render_chain(&translated),
                        "failed to abort multipart upload, parts may be orphaned"
                    );
                    return;
                }
            }
        }
    }
}

impl Drop for PendingUpload {
    fn drop(&mut self) {
        let Some(mut upload) = self.upload.take() else {
            return;
        };
        let key = self.key.clone();
        match Handle::try_current() {
            Ok(handle) => {
                warn!(%key, "multipart upload dropped unsettled, aborting");
                let abort: BoxFuture<'static, ()> = Box::pin(async move {
                    if let Err(err) = upload.abort().await {
                        error!(%key, error = %err, "failed to abort dropped multipart upload");
                    }
                });
                handle.spawn(abort);
            }
            Err(_) => {
                error!(%key, "no runtime to abort dropped multipart upload, parts may be orphaned");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::backend::StoreBackend;
    use async_trait::async_trait;
    use axum::http::Method;
    use object_store::{ListResult, ObjectMeta};
    use std::{
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };
    use url::Url;

    fn memory() -> StoreBackend {
        StoreBackend::in_memory(
            Url::parse("http://localhost/objects").unwrap(),
            b"secret".to_vec(),
        )
    }

    fn key(raw: &str) -> ObjectKey {
        raw.parse().unwrap()
    }

    fn chunks(sizes: &[usize]) -> impl Stream<Item = io::Result<Bytes>> + Send + Unpin + use<> {
        let items: Vec<io::Result<Bytes>> = sizes
            .iter()
            .enumerate()
            .map(|(i, size)| Ok(Bytes::from(vec![i as u8; *size])))
            .collect();
        stream::iter(items)
    }

    fn small_parts() -> TransferSettings {
        TransferSettings {
            part_size: 16,
            max_in_flight: 2,
        }
    }

    /// Records part sizes and peak concurrency, optionally failing a part.
    #[derive(Debug, Default)]
    struct Recorder {
        part_sizes: Mutex<Vec<usize>>,
        in_flight: AtomicUsize,
        started: AtomicUsize,
        peak: AtomicUsize,
        aborted: AtomicUsize,
        completed: AtomicUsize,
        fail_part: Option<usize>,
    }

    #[derive(Debug)]
    struct RecordingUpload {
        recorder: Arc<Recorder>,
        inner: Box<dyn MultipartUpload>,
    }

    #[async_trait]
    impl MultipartUpload for RecordingUpload {
        fn put_part(&mut self, data: object_store::PutPayload) -> UploadPart {
            let recorder = self.recorder.clone();
            let index = {
                let mut sizes = recorder.part_sizes.lock().unwrap();
                sizes.push(data.content_length());
                sizes.len() - 1
            };
            let inner = self.inner.put_part(data);
            Box::pin(async move {
                recorder.started.fetch_add(1, Ordering::SeqCst);
                let now = recorder.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                recorder.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                recorder.in_flight.fetch_sub(1, Ordering::SeqCst);
                if recorder.fail_part == Some(index) {
                    return Err(object_store::Error::Generic {
                        store: "recorder",
                        source: "<Code>AccessDenied</Code>".into(),
                    });
                }
                inner.await
            })
        }

        async fn complete(&mut self) -> object_store::Result<PutResult> {
            self.recorder.completed.fetch_add(1, Ordering::SeqCst);
            self.inner.complete().await
        }

        async fn abort(&mut self) -> object_store::Result<()> {
            self.recorder.aborted.fetch_add(1, Ordering::SeqCst);
            self.inner.abort().await
        }
    }

    #[derive(Debug)]
    struct RecordingBackend {
        inner: StoreBackend,
        recorder: Arc<Recorder>,
    }

    #[async_trait]
    impl ObjectBackend for RecordingBackend {
        async fn begin_upload(
            &self,
            key: &ObjectKey,
            content_type: &str,
        ) -> object_store::Result<Box<dyn MultipartUpload>> {
            let inner = self.inner.begin_upload(key, content_type).await?;
            Ok(Box::new(RecordingUpload {
                recorder: self.recorder.clone(),
                inner,
            }))
        }

        async fn signed_url(
            &self,
            method: Method,
            key: &ObjectKey,
            expires_in: Duration,
        ) -> object_store::Result<Url> {
            self.inner.signed_url(method, key, expires_in).await
        }

        async fn head(&self, key: &ObjectKey) -> object_store::Result<ObjectMeta> {
            self.inner.head(key).await
        }

        async fn delete(&self, key: &ObjectKey) -> object_store::Result<()> {
            self.inner.delete(key).await
        }

        async fn list_prefix(&self, prefix: &str) -> object_store::Result<ListResult> {
            self.inner.list_prefix(prefix).await
        }
    }

    fn recorded(fail_part: Option<usize>) -> (Arc<RecordingBackend>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder {
            fail_part,
            ..Recorder::default()
        });
        let backend = Arc::new(RecordingBackend {
            inner: memory(),
            recorder: recorder.clone(),
        });
        (backend, recorder)
    }

    #[tokio::test]
    async fn preview_covers_window_and_replays_everything() {
        let mut source = chunks(&[3, 3, 3, 3]);
        let preview = read_preview(&mut source, 5, 1024).await.unwrap();

        assert_eq!(preview.bytes(), &[0, 0, 0, 1, 1]);
        assert_eq!(preview.buffered_len(), 6);

        let replayed: Vec<u8> = preview
            .replay(source)
            .map(|chunk| chunk.unwrap().to_vec())
            .concat()
            .await;
        assert_eq!(replayed, vec![0, 0, 0, 1, 1, 1, 2, 2, 2, 3, 3, 3]);
    }

    #[tokio::test]
    async fn preview_of_short_stream_is_whole_stream() {
        let mut source = chunks(&[2]);
        let preview = read_preview(&mut source, 8, 1024).await.unwrap();
        assert_eq!(preview.bytes().len(), 2);
    }

    #[tokio::test]
    async fn preview_enforces_size_limit() {
        let mut source = chunks(&[10]);
        let err = read_preview(&mut source, 64, 5).await.unwrap_err();
        assert!(matches!(err, PipelineError::SizeExceeded { limit: Some(5) }));
    }

    #[tokio::test]
    async fn uploads_in_fixed_size_parts() {
        let (backend, recorder) = recorded(None);
        let engine = TransferEngine::new(backend.clone(), small_parts(), RetryPolicy::none());
        let key = key("documents/parts.bin");

        let done = engine
            .upload(&key, chunks(&[10, 10, 10, 10, 5]), "application/pdf", 1024)
            .await
            .unwrap();

        assert_eq!(done.size, 45);
        assert_eq!(done.parts, 3);
        assert_eq!(*recorder.part_sizes.lock().unwrap(), vec![16, 16, 13]);
        assert_eq!(backend.head(&key).await.unwrap().size, 45);
    }

    #[tokio::test]
    async fn in_flight_parts_are_bounded() {
        let (backend, recorder) = recorded(None);
        let engine = TransferEngine::new(backend, small_parts(), RetryPolicy::none());

        engine
            .upload(&key("documents/many.bin"), chunks(&[16; 12]), "text/plain", 1024)
            .await
            .unwrap();

        assert_eq!(recorder.part_sizes.lock().unwrap().len(), 12);
        assert!(recorder.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn parts_upload_while_the_source_is_still_open() {
        let (backend, recorder) = recorded(None);
        let settings = TransferSettings {
            part_size: 16,
            max_in_flight: 4,
        };
        let engine = TransferEngine::new(backend, settings, RetryPolicy::none());

        // three full parts, then a client that stalls
        let source = chunks(&[16, 16, 16]).chain(stream::pending());
        let slow_key = key("documents/slow.bin");
        let upload = engine.upload(&slow_key, source, "text/plain", 1024);
        let timed_out = tokio::time::timeout(Duration::from_millis(200), upload).await;
        assert!(timed_out.is_err());

        assert_eq!(recorder.part_sizes.lock().unwrap().len(), 3);
        assert_eq!(recorder.started.load(Ordering::SeqCst), 3);
        assert_eq!(recorder.in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn oversize_stream_is_aborted_and_invisible() {
        let (backend, recorder) = recorded(None);
        let engine = TransferEngine::new(backend.clone(), small_parts(), RetryPolicy::none());
        let key = key("documents/big.bin");

        let err = engine
            .upload(&key, chunks(&[20, 20, 20]), "text/plain", 50)
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::SizeExceeded { limit: Some(50) }));
        assert_eq!(recorder.aborted.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.completed.load(Ordering::SeqCst), 0);
        assert!(backend.head(&key).await.is_err());
    }

    #[tokio::test]
    async fn part_failure_aborts_without_retrying() {
        let (backend, recorder) = recorded(Some(1));
        let engine = TransferEngine::new(backend.clone(), small_parts(), RetryPolicy::none());
        let key = key("documents/fail.bin");

        let err = engine
            .upload(&key, chunks(&[16, 16, 16]), "text/plain", 1024)
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Configuration { .. }));
        assert_eq!(recorder.aborted.load(Ordering::SeqCst), 1);
        assert!(backend.head(&key).await.is_err());
    }

    #[tokio::test]
    async fn broken_source_aborts() {
        let (backend, recorder) = recorded(None);
        let engine = TransferEngine::new(backend, small_parts(), RetryPolicy::none());
        let source = stream::iter(vec![
            Ok(Bytes::from_static(b"0123456789abcdefXYZ")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "client went away")),
        ]);

        let err = engine
            .upload(&key("documents/cut.bin"), source, "text/plain", 1024)
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Interrupted { .. }));
        assert_eq!(recorder.aborted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_upload_is_aborted_in_background() {
        let (backend, recorder) = recorded(None);
        let engine = TransferEngine::new(backend.clone(), small_parts(), RetryPolicy::none());
        let key = key("documents/cancelled.bin");

        // a source that yields one part and then never finishes
        let source = stream::iter(vec![Ok(Bytes::from(vec![1u8; 16]))]).chain(stream::pending());
        let upload = engine.upload(&key, source, "text/plain", 1024);
        let timed_out = tokio::time::timeout(Duration::from_millis(50), upload).await;
        assert!(timed_out.is_err());

        // let the spawned abort run
        for _ in 0..10 {
            if recorder.aborted.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(recorder.aborted.load(Ordering::SeqCst), 1);
        assert!(backend.head(&key).await.is_err());
    }

    #[tokio::test]
    async fn empty_stream_creates_empty_object() {
        let backend = Arc::new(memory());
        let engine = TransferEngine::new(backend.clone(), small_parts(), RetryPolicy::none());
        let key = key("documents/empty.txt");

        let done = engine
            .upload(&key, chunks(&[]), "text/plain", 1024)
            .await
            .unwrap();
        assert_eq!(done.size, 0);
        assert_eq!(done.parts, 0);
        assert_eq!(backend.head(&key).await.unwrap().size, 0);
    }
}
