//! Client buffer handles, fences and the per-stream import cache

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::capture::frame::Size;
use crate::pipeline::convert::{DestinationLayout, YcbcrLayout};
use crate::{lock, CaptureError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    Ycbcr(YcbcrLayout),
    Blob,
}

struct BufferInner {
    size: Size,
    kind: BufferKind,
    data: Mutex<Vec<u8>>,
}

/// Shared client memory. Clones refer to the same allocation.
#[derive(Clone)]
pub struct GraphicBuffer {
    inner: Arc<BufferInner>,
}

impl GraphicBuffer {
    /// YUV buffer with the standard packing of `layout`
    pub fn yuv(size: Size, layout: DestinationLayout) -> Self {
        let geometry = layout.layout_for(size);
        Self::with_layout(size, geometry, geometry.required_len(size))
    }

    pub fn with_layout(size: Size, layout: YcbcrLayout, len: usize) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                size,
                kind: BufferKind::Ycbcr(layout),
                data: Mutex::new(vec![0; len]),
            }),
        }
    }

    /// Byte buffer for compressed output
    pub fn blob(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                size: Size::new(capacity as u32, 1),
                kind: BufferKind::Blob,
                data: Mutex::new(vec![0; capacity]),
            }),
        }
    }

    pub fn size(&self) -> Size {
        self.inner.size
    }

    pub fn kind(&self) -> BufferKind {
        self.inner.kind
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.data).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Exclusive CPU access for writing
    pub fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        lock(&self.inner.data)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        lock(&self.inner.data).clone()
    }

    pub fn same_memory(&self, other: &GraphicBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for GraphicBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphicBuffer")
            .field("size", &self.inner.size)
            .field("kind", &self.inner.kind)
            .finish()
    }
}

/// One-shot synchronization point between producer and consumer
#[derive(Clone, Default)]
pub struct Fence {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Fence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signalled() -> Self {
        let fence = Self::new();
        fence.signal();
        fence
    }

    pub fn signal(&self) {
        *lock(&self.inner.0) = true;
        self.inner.1.notify_all();
    }

    pub fn is_signalled(&self) -> bool {
        *lock(&self.inner.0)
    }

    /// Returns whether the fence fired within `timeout`
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut fired = lock(&self.inner.0);
        while !*fired {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            fired = self
                .inner
                .1
                .wait_timeout(fired, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Like [`Fence::wait`], with a timeout reported as an error
    pub fn acquire(&self, timeout: Duration) -> Result<()> {
        if self.wait(timeout) {
            Ok(())
        } else {
            Err(CaptureError::FenceTimeout(timeout))
        }
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fence(signalled: {})", self.is_signalled())
    }
}

/// Brings client handles into the session and releases them again
pub trait BufferImporter: Send + Sync {
    fn import_buffer(&self, handle: &GraphicBuffer) -> Result<GraphicBuffer>;
    fn free_buffer(&self, buffer: GraphicBuffer);
    fn import_fence(&self, fence: &Fence) -> Result<Fence>;
}

/// In-process importer; tracks how many buffers are currently imported
#[derive(Debug, Default)]
pub struct LocalImporter {
    live: AtomicUsize,
}

impl LocalImporter {
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

impl BufferImporter for LocalImporter {
    fn import_buffer(&self, handle: &GraphicBuffer) -> Result<GraphicBuffer> {
        if handle.is_empty() {
            return Err(CaptureError::InvalidArgument("empty buffer handle".into()));
        }
        self.live.fetch_add(1, Ordering::AcqRel);
        Ok(handle.clone())
    }

    fn free_buffer(&self, buffer: GraphicBuffer) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        drop(buffer);
    }

    fn import_fence(&self, fence: &Fence) -> Result<Fence> {
        Ok(fence.clone())
    }
}

/// Imported buffers per stream, keyed by the client's buffer id
pub(crate) struct BufferCache {
    streams: HashMap<i32, HashMap<u64, GraphicBuffer>>,
    importer: Arc<dyn BufferImporter>,
}

impl BufferCache {
    pub fn new(importer: Arc<dyn BufferImporter>) -> Self {
        Self {
            streams: HashMap::new(),
            importer,
        }
    }

    /// Cached buffer for `buffer_id`, importing `handle` on first use
    pub fn resolve(
        &mut self,
        stream_id: i32,
        buffer_id: u64,
        handle: Option<&GraphicBuffer>,
    ) -> Result<GraphicBuffer> {
        if buffer_id == 0 {
            return Err(CaptureError::InvalidArgument("buffer id 0 is reserved".into()));
        }
        let cached = self.streams.entry(stream_id).or_default();
        if let Some(buffer) = cached.get(&buffer_id) {
            return Ok(buffer.clone());
        }
        let handle = handle.ok_or_else(|| {
            CaptureError::InvalidArgument(format!(
                "new buffer {buffer_id} on stream {stream_id} has no handle"
            ))
        })?;
        let imported = self.importer.import_buffer(handle)?;
        debug!("Imported buffer {} for stream {}", buffer_id, stream_id);
        cached.insert(buffer_id, imported.clone());
        Ok(imported)
    }

    pub fn remove(&mut self, stream_id: i32, buffer_id: u64) {
        if let Some(buffer) = self
            .streams
            .get_mut(&stream_id)
            .and_then(|cached| cached.remove(&buffer_id))
        {
            self.importer.free_buffer(buffer);
        }
    }

    pub fn drop_stream(&mut self, stream_id: i32) {
        if let Some(cached) = self.streams.remove(&stream_id) {
            for (_, buffer) in cached {
                self.importer.free_buffer(buffer);
            }
        }
    }

    pub fn clear(&mut self) {
        let ids: Vec<i32> = self.streams.keys().copied().collect();
        for id in ids {
            self.drop_stream(id);
        }
    }

    pub fn len(&self) -> usize {
        self.streams.values().map(HashMap::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn fence_wait_is_bounded() {
        let fence = Fence::new();
        assert!(!fence.wait(Duration::from_millis(10)));
        let signaller = fence.clone();
        let t = thread::spawn(move || signaller.signal());
        assert!(fence.wait(Duration::from_secs(1)));
        t.join().unwrap();
    }

    #[test]
    fn unsignalled_fence_reports_its_timeout() {
        let timeout = Duration::from_millis(5);
        match Fence::new().acquire(timeout) {
            Err(CaptureError::FenceTimeout(waited)) => assert_eq!(waited, timeout),
            other => panic!("expected a fence timeout, got {other:?}"),
        }
        assert!(Fence::signalled().acquire(timeout).is_ok());
    }

    #[test]
    fn cache_imports_once_per_id() {
        let importer = Arc::new(LocalImporter::default());
        let mut cache = BufferCache::new(importer.clone());
        let handle = GraphicBuffer::blob(1024);

        let first = cache.resolve(1, 7, Some(&handle)).unwrap();
        let again = cache.resolve(1, 7, None).unwrap();
        assert!(first.same_memory(&again));
        assert_eq!(importer.live(), 1);

        assert!(cache.resolve(1, 8, None).is_err());
        assert!(cache.resolve(1, 0, Some(&handle)).is_err());
    }

    #[test]
    fn removing_streams_frees_imports() {
        let importer = Arc::new(LocalImporter::default());
        let mut cache = BufferCache::new(importer.clone());
        let handle = GraphicBuffer::blob(16);
        cache.resolve(1, 1, Some(&handle)).unwrap();
        cache.resolve(1, 2, Some(&handle)).unwrap();
        cache.resolve(2, 1, Some(&handle)).unwrap();

        cache.remove(1, 2);
        assert_eq!(importer.live(), 2);
        cache.drop_stream(1);
        assert_eq!(importer.live(), 1);
        cache.clear();
        assert_eq!(importer.live(), 0);
        assert_eq!(cache.len(), 0);
    }
}
