use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, warn};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::task::JoinHandle;

use crate::document::{DocumentSession, RenderedTile, TileStatus};
use crate::error::{AppError, AppResult};

use super::buffer::SharedTile;
use super::cache::{TileCache, TileKey};
use super::request::TileRequest;

enum WorkerRequest {
    Task { task_id: u64, request: TileRequest },
    Shutdown,
}

/// A finished tile. `outcome` carries the same soft-failure statuses as a
/// direct [`DocumentSession::render_tile`] call.
#[derive(Debug)]
pub struct TileResult {
    pub task_id: u64,
    pub request: TileRequest,
    pub outcome: AppResult<CompletedTile>,
    pub elapsed: Duration,
}

/// Pixels delivered by a [`TileWorker`]. Shared so the worker's tile cache
/// and the caller hold the same buffer.
#[derive(Debug, Clone)]
pub struct CompletedTile {
    pub buffer: SharedTile,
    pub status: TileStatus,
    /// Served from the tile cache without touching the backend.
    pub cached: bool,
}

impl CompletedTile {
    fn rendered(tile: RenderedTile) -> Self {
        Self {
            buffer: tile.buffer.into_shared(),
            status: tile.status,
            cached: false,
        }
    }

    pub fn is_rendered(&self) -> bool {
        self.status == TileStatus::Rendered
    }
}

struct WorkerEvent {
    task_id: u64,
    request: TileRequest,
    // document the tile was painted from; `None` if it changed mid-render
    doc_id: Option<u64>,
    outcome: Option<AppResult<RenderedTile>>,
    elapsed: Duration,
}

struct WorkerRuntime {
    _owned: Option<Runtime>,
    handle: Handle,
}

impl WorkerRuntime {
    fn new() -> AppResult<Self> {
        if let Ok(handle) = Handle::try_current() {
            return Ok(Self {
                _owned: None,
                handle,
            });
        }

        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .thread_name("pvt-tiles")
            .build()
            .map_err(|err| AppError::io_with_context(err, "failed to start tile runtime"))?;
        let handle = runtime.handle().clone();
        Ok(Self {
            _owned: Some(runtime),
            handle,
        })
    }

    fn spawn_blocking<F>(&self, task: F) -> JoinHandle<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.spawn_blocking(task)
    }
}

#[derive(Default)]
struct SharedFlags {
    canceled: Mutex<HashSet<u64>>,
    stopping: AtomicBool,
}

impl SharedFlags {
    fn take_canceled(&self, task_id: u64) -> bool {
        self.canceled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&task_id)
    }
}

/// Renders tiles off the caller's thread against one shared session.
///
/// Uses the ambient tokio runtime when there is one and owns a small runtime
/// otherwise. Dropping the worker stops it after the tiles currently being
/// painted. With a [`TileCache`] attached, repeated requests for the same
/// tile of the open document are answered without rendering.
pub struct TileWorker {
    session: Arc<DocumentSession>,
    cache: Option<TileCache>,
    request_tx: UnboundedSender<WorkerRequest>,
    result_rx: UnboundedReceiver<WorkerEvent>,
    flags: Arc<SharedFlags>,
    in_flight: HashSet<u64>,
    ready: VecDeque<TileResult>,
    workers: Vec<JoinHandle<()>>,
    worker_threads: usize,
    next_task_id: u64,
    // declared last so blocking workers are released before the runtime drops
    _runtime: WorkerRuntime,
}

impl TileWorker {
    pub fn spawn(session: Arc<DocumentSession>, worker_threads: usize) -> AppResult<Self> {
        let (request_tx, request_rx) = unbounded_channel();
        let (result_tx, result_rx) = unbounded_channel();
        let runtime = WorkerRuntime::new()?;
        let worker_threads = worker_threads.max(1);
        let request_rx = Arc::new(Mutex::new(request_rx));
        let flags = Arc::new(SharedFlags::default());

        let mut workers = Vec::with_capacity(worker_threads);
        for _ in 0..worker_threads {
            let session = Arc::clone(&session);
            let request_rx = Arc::clone(&request_rx);
            let flags = Arc::clone(&flags);
            let result_tx = result_tx.clone();
            workers.push(runtime.spawn_blocking(move || {
                tile_worker_main(session, request_rx, flags, result_tx)
            }));
        }
        debug!("tile worker started with {worker_threads} threads");

        Ok(Self {
            session,
            cache: None,
            request_tx,
            result_rx,
            flags,
            in_flight: HashSet::new(),
            ready: VecDeque::new(),
            workers,
            worker_threads,
            next_task_id: 1,
            _runtime: runtime,
        })
    }

    pub fn with_cache(mut self, cache: TileCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn cache(&self) -> Option<&TileCache> {
        self.cache.as_ref()
    }

    pub fn cache_mut(&mut self) -> Option<&mut TileCache> {
        self.cache.as_mut()
    }

    fn cached(&mut self, request: &TileRequest) -> Option<SharedTile> {
        let cache = self.cache.as_mut()?;
        let doc_id = self.session.doc_id()?;
        cache.get(&TileKey::new(doc_id, request))
    }

    /// Queues a tile and returns its task id.
    pub fn submit(&mut self, request: TileRequest) -> AppResult<u64> {
        let task_id = self.next_task_id;
        self.next_task_id = self.next_task_id.saturating_add(1);

        if let Some(buffer) = self.cached(&request) {
            self.ready.push_back(TileResult {
                task_id,
                request,
                outcome: Ok(CompletedTile {
                    buffer,
                    status: TileStatus::Rendered,
                    cached: true,
                }),
                elapsed: Duration::ZERO,
            });
            return Ok(task_id);
        }

        self.request_tx
            .send(WorkerRequest::Task { task_id, request })
            .map_err(|_| AppError::unsupported("tile worker has shut down"))?;
        self.in_flight.insert(task_id);
        Ok(task_id)
    }

    /// Returns `false` when the task already finished or was never queued.
    pub fn cancel(&mut self, task_id: u64) -> bool {
        if let Some(at) = self.ready.iter().position(|result| result.task_id == task_id) {
            self.ready.remove(at);
            return true;
        }
        if !self.in_flight.contains(&task_id) {
            return false;
        }
        self.flags
            .canceled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_id)
    }

    pub fn cancel_all(&mut self) -> usize {
        let ready = self.ready.len();
        self.ready.clear();
        let mut canceled = self
            .flags
            .canceled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        ready
            + self
                .in_flight
                .iter()
                .filter(|task_id| canceled.insert(**task_id))
                .count()
    }

    pub fn pending(&self) -> usize {
        self.in_flight.len() + self.ready.len()
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    fn accept(&mut self, event: WorkerEvent) -> Option<TileResult> {
        if !self.in_flight.remove(&event.task_id) {
            return None;
        }
        let canceled = self.flags.take_canceled(event.task_id);
        let outcome = event.outcome?;
        if canceled {
            return None;
        }

        let outcome = outcome.map(CompletedTile::rendered);
        if let (Some(cache), Some(doc_id), Ok(tile)) = (self.cache.as_mut(), event.doc_id, &outcome)
            && tile.is_rendered()
        {
            cache.insert(TileKey::new(doc_id, &event.request), tile.buffer.clone());
        }
        Some(TileResult {
            task_id: event.task_id,
            request: event.request,
            outcome,
            elapsed: event.elapsed,
        })
    }

    pub fn try_recv(&mut self) -> Option<TileResult> {
        if let Some(result) = self.ready.pop_front() {
            return Some(result);
        }
        while let Ok(event) = self.result_rx.try_recv() {
            if let Some(result) = self.accept(event) {
                return Some(result);
            }
        }
        None
    }

    pub async fn recv(&mut self) -> Option<TileResult> {
        if let Some(result) = self.ready.pop_front() {
            return Some(result);
        }
        while let Some(event) = self.result_rx.recv().await {
            if let Some(result) = self.accept(event) {
                return Some(result);
            }
        }
        None
    }

    fn shutdown(&mut self) {
        self.flags.stopping.store(true, Ordering::Release);
        for _ in 0..self.worker_threads {
            let _ = self.request_tx.send(WorkerRequest::Shutdown);
        }
        while let Some(worker) = self.workers.pop() {
            worker.abort();
        }
    }
}

impl Drop for TileWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn tile_worker_main(
    session: Arc<DocumentSession>,
    request_rx: Arc<Mutex<UnboundedReceiver<WorkerRequest>>>,
    flags: Arc<SharedFlags>,
    result_tx: UnboundedSender<WorkerEvent>,
) {
    loop {
        let request = match request_rx.lock() {
            Ok(mut request_rx) => request_rx.blocking_recv(),
            Err(_) => None,
        };
        let Some(WorkerRequest::Task { task_id, request }) = request else {
            break;
        };

        let started = Instant::now();
        let skip = flags.stopping.load(Ordering::Acquire) || {
            let canceled = flags.canceled.lock().unwrap_or_else(PoisonError::into_inner);
            canceled.contains(&task_id)
        };
        let (outcome, doc_id) = if skip {
            (None, None)
        } else {
            let before = session.doc_id();
            let outcome = session.render_tile(&request);
            if let Err(err) = &outcome {
                warn!("tile task {task_id} failed: {err}");
            }
            let doc_id = before.filter(|id| session.doc_id() == Some(*id));
            (Some(outcome), doc_id)
        };

        let event = WorkerEvent {
            task_id,
            request,
            doc_id,
            outcome,
            elapsed: started.elapsed(),
        };
        if result_tx.send(event).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::{TileResult, TileWorker};
    use crate::render::cache::TileCache;
    use crate::backend::RasterBackend;
    use crate::document::{DocumentSession, TileStatus};
    use crate::error::AppError;
    use crate::pixel::PixelFormat;
    use crate::render::request::{TileOrigin, TileRequest};
    use crate::testing::{FakeBackend, FakeDocument};

    fn open_session(pages: usize) -> Arc<DocumentSession> {
        let backend: Arc<dyn RasterBackend> = Arc::new(FakeBackend::new(
            FakeDocument::uniform(pages, 200.0, 200.0).with_ink([0, 0, 0]),
        ));
        let session = Arc::new(DocumentSession::new(backend));
        session.open("worker.pdf").expect("document should open");
        session
    }

    fn request(page: usize) -> TileRequest {
        TileRequest::new(
            page,
            TileOrigin::grid(0.0, 0.0),
            200.0,
            32,
            32,
            1.0,
            PixelFormat::Rgb565,
        )
        .expect("request should be valid")
    }

    fn drain_until(worker: &mut TileWorker, expected: usize) -> Vec<TileResult> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut results = Vec::new();
        while results.len() < expected && Instant::now() < deadline {
            match worker.try_recv() {
                Some(result) => results.push(result),
                None => thread::sleep(Duration::from_millis(2)),
            }
        }
        results
    }

    #[test]
    fn renders_submitted_tiles() {
        let session = open_session(4);
        let mut worker = TileWorker::spawn(Arc::clone(&session), 2).expect("worker should start");

        let ids: Vec<u64> = (0..4)
            .map(|page| worker.submit(request(page)).expect("submit should succeed"))
            .collect();
        let mut results = drain_until(&mut worker, 4);
        results.sort_by_key(|result| result.task_id);

        assert_eq!(results.iter().map(|r| r.task_id).collect::<Vec<_>>(), ids);
        for result in &results {
            let tile = result.outcome.as_ref().expect("tile should render");
            assert_eq!(tile.status, TileStatus::Rendered);
            assert_eq!(tile.buffer.len(), 32 * 32 * 2);
        }
        assert_eq!(worker.pending(), 0);
    }

    #[test]
    fn canceled_task_is_not_delivered() {
        let session = open_session(2);
        let mut worker = TileWorker::spawn(session, 1).expect("worker should start");

        let canceled = worker.submit(request(0)).expect("submit should succeed");
        let kept = worker.submit(request(1)).expect("submit should succeed");
        assert!(worker.cancel(canceled));

        let results = drain_until(&mut worker, 1);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].task_id, kept);

        thread::sleep(Duration::from_millis(20));
        assert!(worker.try_recv().is_none());
        assert!(!worker.cancel(canceled));
    }

    #[test]
    fn closed_session_reports_error_outcome() {
        let session = open_session(1);
        let mut worker = TileWorker::spawn(Arc::clone(&session), 1).expect("worker should start");
        session.close();

        worker.submit(request(0)).expect("submit should succeed");
        let results = drain_until(&mut worker, 1);

        assert!(matches!(results[0].outcome, Err(AppError::NoDocumentOpen)));
    }

    #[test]
    fn dropping_worker_releases_session() {
        let session = open_session(1);
        let worker = TileWorker::spawn(Arc::clone(&session), 2).expect("worker should start");
        drop(worker);

        let deadline = Instant::now() + Duration::from_secs(5);
        while Arc::strong_count(&session) > 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(Arc::strong_count(&session), 1);
    }

    #[test]
    fn repeated_tile_is_served_from_cache() {
        let backend = Arc::new(FakeBackend::new(
            FakeDocument::uniform(2, 200.0, 200.0).with_ink([0, 0, 0]),
        ));
        let session = Arc::new(DocumentSession::new(
            Arc::clone(&backend) as Arc<dyn RasterBackend>
        ));
        session.open("worker.pdf").expect("document should open");
        let mut worker = TileWorker::spawn(Arc::clone(&session), 1)
            .expect("worker should start")
            .with_cache(TileCache::new(8, 1024 * 1024));

        worker.submit(request(0)).expect("submit should succeed");
        let first = drain_until(&mut worker, 1).remove(0);
        let first = first.outcome.expect("tile should render");
        assert!(!first.cached);
        assert_eq!(backend.raster_calls(), 1);

        let repeat_id = worker.submit(request(0)).expect("submit should succeed");
        let repeat = worker.try_recv().expect("cached tile should be ready at once");
        assert_eq!(repeat.task_id, repeat_id);
        let repeat = repeat.outcome.expect("cached tile should be ok");
        assert!(repeat.cached);
        assert!(repeat.buffer.ptr_eq(&first.buffer));
        assert_eq!(backend.raster_calls(), 1);

        let cache = worker.cache().expect("cache should be attached");
        assert_eq!(cache.counters().hits, 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn reopened_document_does_not_hit_old_tiles() {
        let backend = Arc::new(FakeBackend::new(
            FakeDocument::uniform(1, 200.0, 200.0).with_ink([0, 0, 0]),
        ));
        let session = Arc::new(DocumentSession::new(
            Arc::clone(&backend) as Arc<dyn RasterBackend>
        ));
        session.open("first.pdf").expect("document should open");
        let mut worker = TileWorker::spawn(Arc::clone(&session), 1)
            .expect("worker should start")
            .with_cache(TileCache::new(8, 1024 * 1024));

        worker.submit(request(0)).expect("submit should succeed");
        assert_eq!(drain_until(&mut worker, 1).len(), 1);

        session.open("second.pdf").expect("document should reopen");
        worker.submit(request(0)).expect("submit should succeed");
        let result = drain_until(&mut worker, 1).remove(0);
        assert!(!result.outcome.expect("tile should render").cached);
        assert_eq!(backend.raster_calls(), 2);
    }

    #[test]
    fn canceling_cached_tile_drops_it() {
        let session = open_session(1);
        let mut worker = TileWorker::spawn(session, 1)
            .expect("worker should start")
            .with_cache(TileCache::new(8, 1024 * 1024));
        worker.submit(request(0)).expect("submit should succeed");
        assert_eq!(drain_until(&mut worker, 1).len(), 1);

        let cached = worker.submit(request(0)).expect("submit should succeed");
        assert_eq!(worker.pending(), 1);
        assert!(worker.cancel(cached));
        assert_eq!(worker.pending(), 0);
        assert!(worker.try_recv().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn recv_awaits_results_on_ambient_runtime() {
        let session = open_session(1);
        let mut worker = TileWorker::spawn(session, 1).expect("worker should start");

        let task_id = worker.submit(request(0)).expect("submit should succeed");
        let result = tokio::time::timeout(Duration::from_secs(5), worker.recv())
            .await
            .expect("result should arrive")
            .expect("worker should still be running");

        assert_eq!(result.task_id, task_id);
        assert!(result.outcome.expect("tile should render").is_rendered());
    }
}
