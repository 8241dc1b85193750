//! [`QueueBackend`] implementations that run on the host.
//!
//! - [`HostBackend`] executes work asynchronously on a dedicated worker thread, the way a
//!   hardware queue would.
//! - [`ManualBackend`] holds on to work until the caller steps it, which makes fence behavior
//!   and submission order observable one step at a time.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use crate::{
    Error, Result,
    command::Command,
    queue::QueueBackend,
    sync::SharedFence,
};

enum Work {
    Execute(Vec<Vec<Command>>),
    Signal(SharedFence, u64),
}

/// Executes submissions in order on a named worker thread.
///
/// Work is handed to the thread over a channel. Each executed submission optionally takes
/// `latency` to simulate hardware execution time. Dropping the backend disconnects the channel
/// and joins the thread once it has drained the remaining work.
pub struct HostBackend {
    sender: Option<crossbeam_channel::Sender<Work>>,
    worker: Option<JoinHandle<()>>,
    executed: Arc<AtomicU64>,
}

impl HostBackend {
    pub fn new(name: impl Into<String>, latency: Option<Duration>) -> Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded::<Work>();
        let executed = Arc::new(AtomicU64::new(0));
        let counter = executed.clone();
        let worker = std::thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                while let Ok(work) = receiver.recv() {
                    match work {
                        Work::Execute(lists) => {
                            if let Some(latency) = latency {
                                std::thread::sleep(latency);
                            }
                            tracing::trace!(lists = lists.len(), "Executed command lists");
                            counter.fetch_add(lists.len() as u64, Ordering::Release);
                        }
                        Work::Signal(fence, value) => fence.complete(value),
                    }
                }
                // disconnected
            })
            .map_err(|error| Error::SubmissionFailed(error.to_string().into()))?;
        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
            executed,
        })
    }

    /// Number of command lists executed so far.
    pub fn executed_lists(&self) -> u64 {
        self.executed.load(Ordering::Acquire)
    }

    fn send(&self, work: Work) -> Result<()> {
        self.sender
            .as_ref()
            .ok_or_else(|| Error::SubmissionFailed("host backend is shutting down".into()))?
            .send(work)
            .map_err(|_| Error::SubmissionFailed("host backend worker has stopped".into()))
    }
}

impl QueueBackend for HostBackend {
    fn execute(&self, lists: &[&[Command]]) -> Result<()> {
        self.send(Work::Execute(lists.iter().map(|list| list.to_vec()).collect()))
    }

    fn signal(&self, fence: &SharedFence, value: u64) -> Result<()> {
        self.send(Work::Signal(fence.clone(), value))
    }
}

impl Drop for HostBackend {
    fn drop(&mut self) {
        drop(self.sender.take());
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            tracing::error!("Host backend worker panicked");
        }
    }
}

#[derive(Default)]
struct ManualInner {
    queue: VecDeque<Work>,
    journal: Vec<Vec<Command>>,
    fences: Vec<SharedFence>,
    lost: bool,
}

/// Queues work until it is explicitly run.
///
/// Every executed command list is kept in a journal that can be inspected afterwards.
#[derive(Default)]
pub struct ManualBackend {
    inner: Mutex<ManualInner>,
}

impl ManualBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ManualInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of queued work items.
    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    /// Runs the oldest queued work item. Returns `false` when nothing was queued.
    pub fn step(&self) -> bool {
        let mut inner = self.lock();
        match inner.queue.pop_front() {
            Some(Work::Execute(lists)) => {
                inner.journal.extend(lists);
                true
            }
            Some(Work::Signal(fence, value)) => {
                fence.complete(value);
                true
            }
            None => false,
        }
    }

    /// Runs all queued work and returns how many items ran.
    pub fn run_all(&self) -> usize {
        let mut count = 0;
        while self.step() {
            count += 1;
        }
        count
    }

    /// Every command list executed so far, in execution order.
    pub fn journal(&self) -> Vec<Vec<Command>> {
        self.lock().journal.clone()
    }

    /// Simulates a device loss: queued work is discarded, every fence seen so far is marked
    /// lost and later submissions fail.
    pub fn lose_device(&self) {
        let mut inner = self.lock();
        inner.lost = true;
        inner.queue.clear();
        for fence in inner.fences.iter() {
            fence.mark_lost();
        }
        tracing::warn!(fences = inner.fences.len(), "Device lost");
    }
}

impl QueueBackend for ManualBackend {
    fn execute(&self, lists: &[&[Command]]) -> Result<()> {
        let mut inner = self.lock();
        if inner.lost {
            return Err(Error::SubmissionFailed("device lost".into()));
        }
        inner
            .queue
            .push_back(Work::Execute(lists.iter().map(|list| list.to_vec()).collect()));
        Ok(())
    }

    fn signal(&self, fence: &SharedFence, value: u64) -> Result<()> {
        let mut inner = self.lock();
        if inner.lost {
            fence.mark_lost();
            return Err(Error::SubmissionFailed("device lost".into()));
        }
        if !inner.fences.iter().any(|seen| Arc::ptr_eq(seen, fence)) {
            inner.fences.push(fence.clone());
        }
        inner.queue.push_back(Work::Signal(fence.clone(), value));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::Fence;

    fn dispatch() -> Command {
        Command::Dispatch {
            group_count_x: 1,
            group_count_y: 1,
            group_count_z: 1,
        }
    }

    #[test]
    fn host_backend_completes_in_order() {
        let backend = HostBackend::new("test queue", Some(Duration::from_millis(1))).unwrap();
        let fence = Arc::new(Fence::new());
        let list = [dispatch()];
        for _ in 0..8 {
            backend.execute(&[&list[..], &list[..]]).unwrap();
            backend.signal(&fence, fence.signal_next()).unwrap();
        }
        fence.wait(8, Some(Duration::from_secs(5))).unwrap();
        // Signals run after the work queued before them.
        assert_eq!(backend.executed_lists(), 16);
    }

    #[test]
    fn manual_backend_steps_one_item_at_a_time() {
        let backend = ManualBackend::new();
        let fence = Arc::new(Fence::new());
        backend.execute(&[&[dispatch()]]).unwrap();
        let value = fence.signal_next();
        backend.signal(&fence, value).unwrap();
        assert_eq!(backend.pending(), 2);

        assert!(backend.step());
        assert_eq!(backend.journal().len(), 1);
        assert!(!fence.is_reached(value));
        assert!(backend.step());
        assert!(fence.is_reached(value));
        assert!(!backend.step());
    }

    #[test]
    fn lost_device_rejects_work() {
        let backend = ManualBackend::new();
        let fence = Arc::new(Fence::new());
        backend.signal(&fence, fence.signal_next()).unwrap();
        backend.lose_device();
        assert!(fence.is_lost());
        assert_eq!(backend.pending(), 0);
        assert!(matches!(
            backend.execute(&[&[dispatch()]]),
            Err(Error::SubmissionFailed(_))
        ));
    }
}
