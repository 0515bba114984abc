use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::handoff::HandoffQueue;

/// Splits `count` jobs into contiguous ranges of `ceil(count / workers)`.
/// Trailing workers with nothing left to do get no range.
pub fn partition(count: usize, workers: usize) -> Vec<Range<usize>> {
    let workers = workers.max(1);
    let per_worker = count.div_ceil(workers).max(1);
    (0..workers)
        .map(|i| (i * per_worker).min(count)..((i + 1) * per_worker).min(count))
        .filter(|r| !r.is_empty())
        .collect()
}

/// Named worker threads for one phase, joined on drop.
#[derive(Default)]
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    unspawned: usize,
}

impl WorkerPool {
    pub fn spawn<F>(name: &str, ranges: Vec<Range<usize>>, work: F) -> Self
    where
        F: Fn(Range<usize>) + Send + Sync + 'static,
    {
        let work = Arc::new(work);
        let mut handles = Vec::with_capacity(ranges.len());
        let mut unspawned = 0;
        for (i, range) in ranges.into_iter().enumerate() {
            let work = work.clone();
            let jobs = range.len();
            let spawned = thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || work(range));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    tracing::error!("failed to spawn {name} worker {i}: {e}");
                    unspawned += jobs;
                }
            }
        }
        Self { handles, unspawned }
    }

    /// Jobs whose worker could not be started.
    pub fn unspawned(&self) -> usize {
        self.unspawned
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn join(&mut self) {
        for handle in self.handles.drain(..) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                tracing::error!("{name} panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.join();
    }
}

/// Adds the rest of a worker's range to `lost` if the worker unwinds.
struct LostJobs<'a> {
    remaining: usize,
    lost: &'a AtomicUsize,
}

impl Drop for LostJobs<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.lost.fetch_add(self.remaining, Ordering::SeqCst);
        }
    }
}

/// One phase of background work: a pool of workers producing `T` per job
/// id into a bounded hand-off queue drained by the main thread.
///
/// Jobs that can never arrive, because their worker failed to spawn or
/// panicked, count as lost so the phase still completes.
pub struct BatchScheduler<T> {
    name: &'static str,
    queue: Arc<HandoffQueue<T>>,
    pool: WorkerPool,
    lost: Arc<AtomicUsize>,
    running: bool,
    expected: usize,
    delivered: usize,
    starts: usize,
}

impl<T> Drop for BatchScheduler<T> {
    fn drop(&mut self) {
        self.queue.cancel();
        self.pool.join();
    }
}

impl<T: Send + 'static> BatchScheduler<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            queue: Arc::new(HandoffQueue::bounded(1)),
            pool: WorkerPool::default(),
            lost: Arc::new(AtomicUsize::new(0)),
            running: false,
            expected: 0,
            delivered: 0,
            starts: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn delivered(&self) -> usize {
        self.delivered
    }

    /// Jobs of the current run that will never be delivered.
    pub fn lost(&self) -> usize {
        self.lost.load(Ordering::SeqCst) + self.pool.unspawned()
    }

    /// Number of runs started so far.
    pub fn starts(&self) -> usize {
        self.starts
    }

    /// Cancels whatever is in flight, then spawns `threads` workers over
    /// job ids `0..count`. With `stagger = Some(factor)` each worker sleeps
    /// `factor * (start + 20)` ms after every job, `start` being the first
    /// id of its range.
    pub fn start<F>(&mut self, count: usize, threads: usize, stagger: Option<u64>, job: F)
    where
        F: Fn(usize) -> T + Send + Sync + 'static,
    {
        self.cancel();
        self.pool.join();

        let queue = Arc::new(HandoffQueue::bounded(count));
        let lost = Arc::new(AtomicUsize::new(0));
        self.queue = queue.clone();
        self.lost = lost.clone();
        self.expected = count;
        self.delivered = 0;
        self.running = true;
        self.starts += 1;

        let ranges = partition(count, threads);
        tracing::info!(jobs = count, workers = ranges.len(), "starting {}", self.name);
        self.pool = WorkerPool::spawn(self.name, ranges, move |range: Range<usize>| {
            let start = range.start as u64;
            let mut guard = LostJobs { remaining: range.len(), lost: &lost };
            for id in range {
                if queue.is_cancelled() {
                    return;
                }
                let item = job(id);
                if queue.push(item).is_err() {
                    return;
                }
                guard.remaining -= 1;
                if let Some(factor) = stagger {
                    thread::sleep(Duration::from_millis(factor * (start + 20)));
                }
            }
        });
    }

    /// Items finished since the last drain.
    pub fn drain(&mut self) -> Vec<T> {
        let items = self.queue.drain();
        self.delivered += items.len();
        items
    }

    /// True once every job was either delivered or lost.
    pub fn all_delivered(&self) -> bool {
        self.running && self.delivered + self.lost() >= self.expected
    }

    /// Joins the workers and clears the running flag.
    pub fn finish(&mut self) {
        self.pool.join();
        self.running = false;
        let lost = self.lost();
        if lost > 0 {
            tracing::error!(delivered = self.delivered, lost, "{} finished with lost jobs", self.name);
        } else {
            tracing::info!(delivered = self.delivered, "{} finished", self.name);
        }
    }

    pub fn cancel(&mut self) {
        self.queue.cancel();
    }

    /// Cancels and joins; used on teardown.
    pub fn shutdown(&mut self) {
        self.cancel();
        self.pool.join();
        self.running = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn partition_matches_ceil_split() {
        assert_eq!(partition(25, 8), vec![0..4, 4..8, 8..12, 12..16, 16..20, 20..24, 24..25]);
        assert_eq!(partition(1, 1), vec![0..1]);
        assert_eq!(partition(4, 8), vec![0..1, 1..2, 2..3, 3..4]);
        assert!(partition(0, 3).is_empty());
    }

    #[test]
    fn scheduler_delivers_every_job_once() {
        let mut scheduler = BatchScheduler::new("test-jobs");
        scheduler.start(10, 3, None, |id| id * 2);
        let mut seen = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(10);
        while !scheduler.all_delivered() && Instant::now() < deadline {
            seen.extend(scheduler.drain());
            thread::yield_now();
        }
        scheduler.finish();
        seen.sort_unstable();
        assert_eq!(seen, (0..10).map(|i| i * 2).collect::<Vec<_>>());
        assert!(!scheduler.is_running());
    }

    #[test]
    fn panicking_worker_does_not_wedge_the_phase() {
        let mut scheduler = BatchScheduler::new("panicking");
        scheduler.start(10, 2, None, |id| {
            if id == 3 {
                panic!("job {id} failed");
            }
            id
        });
        let mut seen = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(10);
        while !scheduler.all_delivered() && Instant::now() < deadline {
            seen.extend(scheduler.drain());
            thread::yield_now();
        }
        assert!(scheduler.all_delivered());
        // the first worker owns 0..5 and dies on 3
        assert_eq!(scheduler.lost(), 2);
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 5, 6, 7, 8, 9]);
        scheduler.finish();
        assert!(!scheduler.is_running());
    }

    #[test]
    fn restart_and_shutdown_join_workers() {
        let mut scheduler = BatchScheduler::new("restart");
        scheduler.start(2, 1, Some(50), |id| id);
        scheduler.start(40, 4, Some(1), |id| id);
        assert_eq!(scheduler.expected(), 40);
        thread::sleep(Duration::from_millis(20));
        let start = Instant::now();
        scheduler.shutdown();
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(!scheduler.is_running());
    }
}
