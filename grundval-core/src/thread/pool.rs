//! Fixed-size worker pool driven by an MPMC channel of shared tasks.
//!
//! Workers poll the channel without blocking, execute whatever they receive
//! with their own [`TaskContext`], then flag the task completed. Shutdown is
//! cooperative: a worker only exits after an empty poll with the shutdown
//! flag set, so queued work drains before `close` returns.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::utils::Backoff;
use parking_lot::Mutex;
use tracing::{info, trace, warn};

use super::{current_affinity, pin_current_thread, JoinHandle, ThreadBuilder};
use crate::alloc::{AllocatorRef, ThreadSafeAllocator};
use crate::channel::mpmc::{self, Receiver, Transmitter};
use crate::error::{panic_message, AllocError, PoolError};
use crate::make_shared_as;
use crate::shared::Shared;

/// A unit of work executed on a pool worker.
pub trait Task: Send + Sync {
    fn execute(&self, ctx: &TaskContext<'_>);
}

/// A task together with its completion flag.
pub struct TaskState<T: ?Sized> {
    completed: AtomicBool,
    task: T,
}

impl<T> TaskState<T> {
    pub fn new(task: T) -> Self {
        Self {
            completed: AtomicBool::new(false),
            task,
        }
    }
}

impl<T: ?Sized> TaskState<T> {
    #[inline]
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Spins until the task has finished executing.
    pub fn wait_for_completion(&self) {
        let backoff = Backoff::new();
        while !self.is_completed() {
            backoff.snooze();
        }
    }

    pub fn task(&self) -> &T {
        &self.task
    }

    fn mark_completed(&self) {
        self.completed.store(true, Ordering::Release);
    }
}

/// Shared handle to a submitted task.
pub type TaskHandle = Shared<TaskState<dyn Task>>;

/// Adapts a closure into a [`Task`]. The closure runs at most once.
pub struct FunctionTask<F> {
    f: Mutex<Option<F>>,
}

impl<F> FunctionTask<F>
where
    F: FnOnce(&TaskContext<'_>) + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self {
            f: Mutex::new(Some(f)),
        }
    }
}

impl<F> Task for FunctionTask<F>
where
    F: FnOnce(&TaskContext<'_>) + Send + 'static,
{
    fn execute(&self, ctx: &TaskContext<'_>) {
        let f = self.f.lock().take();
        if let Some(f) = f {
            f(ctx);
        }
    }
}

fn make_task<T: Task + 'static>(
    allocator: &AllocatorRef,
    task: T,
) -> Result<TaskHandle, AllocError> {
    make_shared_as!(allocator, TaskState::new(task) => TaskState<dyn Task>)
}

/// What a running task can see of the pool.
pub struct TaskContext<'a> {
    worker_index: Option<usize>,
    transmitter: &'a Transmitter<TaskHandle>,
    allocator: &'a AllocatorRef,
}

impl TaskContext<'_> {
    /// Index of the executing worker; `None` when the task runs on the thread
    /// draining a closed pool.
    pub fn worker_index(&self) -> Option<usize> {
        self.worker_index
    }

    pub fn transmitter(&self) -> &Transmitter<TaskHandle> {
        self.transmitter
    }

    pub fn allocator(&self) -> &AllocatorRef {
        self.allocator
    }

    /// Enqueues a follow-up function task, spinning while the queue is full.
    ///
    /// Only workers drain the queue, so this never returns if every worker
    /// is blocked the same way: a one-worker pool whose task spawns past the
    /// capacity, or a task run by `close` on the draining thread. Use
    /// [`TaskContext::try_spawn`] where that can happen.
    pub fn spawn<F>(&self, f: F) -> Result<TaskHandle, AllocError>
    where
        F: FnOnce(&TaskContext<'_>) + Send + 'static,
    {
        let handle = make_task(self.allocator, FunctionTask::new(f))?;
        self.transmitter.push(handle.clone());
        Ok(handle)
    }

    /// Enqueues a follow-up function task if the queue has room.
    ///
    /// Returns `Ok(None)` when the queue is full; the task is dropped unrun.
    pub fn try_spawn<F>(&self, f: F) -> Result<Option<TaskHandle>, AllocError>
    where
        F: FnOnce(&TaskContext<'_>) + Send + 'static,
    {
        let handle = make_task(self.allocator, FunctionTask::new(f))?;
        Ok(self.transmitter.try_push(handle.clone()).ok().map(|()| handle))
    }
}

fn run_task(task: &TaskHandle, ctx: &TaskContext<'_>) {
    trace!(worker = ?ctx.worker_index, "Executing task");
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| task.task.execute(ctx))) {
        warn!(
            worker = ?ctx.worker_index,
            message = %panic_message(&*payload),
            "Task panicked"
        );
    }
    task.mark_completed();
}

/// Pool sizing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolOptions {
    pub threads: usize,
    /// Requested queue capacity, rounded up to a power of two.
    pub channel_capacity: usize,
    /// Pin worker `i` to the `i`-th core of the process affinity set.
    pub pin_workers: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            threads: num_cpus::get(),
            channel_capacity: 1024,
            pin_workers: false,
        }
    }
}

#[derive(Default)]
struct PoolState {
    shutdown: AtomicBool,
    executed: AtomicUsize,
}

/// Fixed set of worker threads consuming [`Task`]s.
///
/// ```rust,ignore
/// let pool = ThreadPool::new(PoolOptions { threads: 4, ..Default::default() }, &heap)?;
/// let handle = pool.add_function_task(|_| println!("hello from a worker"))?;
/// handle.wait_for_completion();
/// pool.close();
/// ```
pub struct ThreadPool {
    transmitter: Transmitter<TaskHandle>,
    receiver: Receiver<TaskHandle>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    state: Arc<PoolState>,
    allocator: ThreadSafeAllocator,
    threads: usize,
}

impl ThreadPool {
    /// Starts `options.threads` workers. Task storage and the queue are
    /// allocated from `allocator`, which also becomes each worker's default
    /// allocator.
    pub fn new(options: PoolOptions, allocator: &AllocatorRef) -> Result<Self, PoolError> {
        if options.threads == 0 {
            return Err(AllocError::invalid("thread pool needs at least one worker").into());
        }
        let allocator = ThreadSafeAllocator::new(allocator.clone())?;
        let (transmitter, receiver) =
            mpmc::channel::<TaskHandle>(options.channel_capacity, allocator.get())?;

        let cores = if options.pin_workers {
            current_affinity().unwrap_or_else(|e| {
                warn!(error = %e, "Cannot read affinity, workers stay unpinned");
                Vec::new()
            })
        } else {
            Vec::new()
        };

        let pool = Self {
            transmitter,
            receiver,
            workers: Mutex::new(Vec::with_capacity(options.threads)),
            state: Arc::new(PoolState::default()),
            allocator,
            threads: options.threads,
        };

        for index in 0..options.threads {
            let receiver = pool.receiver.clone();
            let transmitter = pool.transmitter.clone();
            let state = pool.state.clone();
            let allocator = pool.allocator.clone();
            let core = (!cores.is_empty()).then(|| cores[index % cores.len()]);

            // On failure `pool` drops here, which joins the workers started so far.
            let handle = ThreadBuilder::new()
                .name(format!("grundval-worker-{index}"))
                .default_allocator(pool.allocator.get().clone())
                .spawn(move || {
                    if let Some(core) = core {
                        if let Err(e) = pin_current_thread(core) {
                            warn!(worker = index, error = %e, "Worker stays unpinned");
                        }
                    }
                    worker_loop(index, &receiver, &transmitter, allocator.get(), &state);
                })?;
            pool.workers.lock().push(handle);
        }

        info!(
            threads = pool.threads,
            capacity = pool.transmitter.capacity(),
            allocator = pool.allocator.get().name(),
            pinned = !cores.is_empty(),
            "Thread pool started"
        );
        Ok(pool)
    }

    /// Submits `task`.
    ///
    /// # Errors
    ///
    /// [`PoolError::Closed`] after [`close`](Self::close); allocation failures
    /// for the task storage.
    pub fn add_task<T: Task + 'static>(&self, task: T) -> Result<TaskHandle, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        let handle = make_task(self.allocator.get(), task)?;
        self.transmitter.push(handle.clone());
        // Raced with `close`: the workers may already be gone.
        if self.is_closed() {
            self.drain();
        }
        Ok(handle)
    }

    /// Wraps `f` in a [`FunctionTask`] and submits it.
    pub fn add_function_task<F>(&self, f: F) -> Result<TaskHandle, PoolError>
    where
        F: FnOnce(&TaskContext<'_>) + Send + 'static,
    {
        self.add_task(FunctionTask::new(f))
    }

    /// Stops the workers after the queue drains and joins them. Idempotent.
    pub fn close(&self) {
        let first = !self.state.shutdown.swap(true, Ordering::SeqCst);
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let name = worker.name().to_owned();
            if let Err(e) = worker.join() {
                warn!(worker = %name, error = %e, "Worker exited abnormally");
            }
        }
        self.drain();
        if first {
            info!(executed = self.tasks_executed(), "Thread pool closed");
        }
    }

    /// Runs whatever is still queued on the calling thread.
    fn drain(&self) {
        let ctx = TaskContext {
            worker_index: None,
            transmitter: &self.transmitter,
            allocator: self.allocator.get(),
        };
        while let Some(task) = self.receiver.try_pop() {
            run_task(&task, &ctx);
            self.state.executed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn is_closed(&self) -> bool {
        self.state.shutdown.load(Ordering::SeqCst)
    }

    /// Tasks run to completion (panicked ones included).
    pub fn tasks_executed(&self) -> usize {
        self.state.executed.load(Ordering::Relaxed)
    }

    /// Approximate number of queued tasks.
    pub fn queued(&self) -> usize {
        self.transmitter.len()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("threads", &self.threads)
            .field("closed", &self.is_closed())
            .field("executed", &self.tasks_executed())
            .finish()
    }
}

fn worker_loop(
    index: usize,
    receiver: &Receiver<TaskHandle>,
    transmitter: &Transmitter<TaskHandle>,
    allocator: &AllocatorRef,
    state: &PoolState,
) {
    let ctx = TaskContext {
        worker_index: Some(index),
        transmitter,
        allocator,
    };
    let backoff = Backoff::new();
    loop {
        match receiver.try_pop() {
            Some(task) => {
                backoff.reset();
                run_task(&task, &ctx);
                state.executed.fetch_add(1, Ordering::Relaxed);
            }
            None if state.shutdown.load(Ordering::SeqCst) => break,
            None => backoff.snooze(),
        }
    }
    trace!(worker = index, "Worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{default_allocator, LinearAllocator, MallocAllocator};
    use tracing_test::traced_test;

    fn heap() -> AllocatorRef {
        Arc::new(MallocAllocator)
    }

    fn pool(threads: usize) -> ThreadPool {
        ThreadPool::new(
            PoolOptions {
                threads,
                channel_capacity: 64,
                pin_workers: false,
            },
            &heap(),
        )
        .unwrap()
    }

    #[test]
    fn rejects_zero_threads() {
        let options = PoolOptions {
            threads: 0,
            ..PoolOptions::default()
        };
        assert!(matches!(
            ThreadPool::new(options, &heap()),
            Err(PoolError::Alloc(AllocError::InvalidArgument(_)))
        ));
    }

    #[test]
    fn rejects_thread_unsafe_allocator() {
        let arena: AllocatorRef = Arc::new(LinearAllocator::new(1 << 20).unwrap());
        assert!(matches!(
            ThreadPool::new(PoolOptions::default(), &arena),
            Err(PoolError::Alloc(AllocError::InvalidArgument(_)))
        ));
    }

    #[test]
    fn every_task_runs_exactly_once() {
        const K: usize = 1_000;
        let pool = pool(4);
        let counter = Arc::new(AtomicUsize::new(0));

        let handles: Vec<TaskHandle> = (0..K)
            .map(|_| {
                let counter = counter.clone();
                pool.add_function_task(move |_| {
                    counter.fetch_add(1, Ordering::Relaxed);
                })
                .unwrap()
            })
            .collect();

        for handle in &handles {
            handle.wait_for_completion();
        }
        assert_eq!(counter.load(Ordering::Relaxed), K);
        assert!(handles.iter().all(|h| h.is_completed()));
    }

    #[traced_test]
    #[test]
    fn close_is_idempotent() {
        let pool = pool(2);
        assert!(logs_contain("Thread pool started"));
        pool.close();
        assert!(pool.is_closed());
        assert!(logs_contain("Thread pool closed"));
        pool.close();
        assert!(matches!(
            pool.add_function_task(|_| {}),
            Err(PoolError::Closed)
        ));
    }

    #[test]
    fn close_drains_queued_tasks() {
        let pool = pool(1);
        let counter = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..50)
            .map(|_| {
                let counter = counter.clone();
                pool.add_function_task(move |_| {
                    std::thread::sleep(std::time::Duration::from_micros(50));
                    counter.fetch_add(1, Ordering::Relaxed);
                })
                .unwrap()
            })
            .collect();

        pool.close();
        assert_eq!(counter.load(Ordering::Relaxed), 50);
        assert_eq!(pool.tasks_executed(), 50);
        assert!(handles.iter().all(|h| h.is_completed()));
    }

    #[test]
    fn tasks_can_enqueue_follow_ups() {
        let pool = pool(2);
        let counter = Arc::new(AtomicUsize::new(0));
        let spawned = Arc::new(Mutex::new(Vec::new()));

        let parent = {
            let counter = counter.clone();
            let spawned = spawned.clone();
            pool.add_function_task(move |ctx| {
                for _ in 0..3 {
                    let counter = counter.clone();
                    let child = ctx
                        .spawn(move |_| {
                            counter.fetch_add(1, Ordering::Relaxed);
                        })
                        .unwrap();
                    spawned.lock().push(child);
                }
            })
            .unwrap()
        };

        parent.wait_for_completion();
        for child in spawned.lock().iter() {
            child.wait_for_completion();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn try_spawn_reports_a_full_queue() {
        let pool = ThreadPool::new(
            PoolOptions {
                threads: 1,
                channel_capacity: 1,
                pin_workers: false,
            },
            &heap(),
        )
        .unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let spawned = Arc::new(Mutex::new(Vec::new()));

        let parent = {
            let counter = counter.clone();
            let spawned = spawned.clone();
            pool.add_function_task(move |ctx| {
                // The only worker is busy here, so nothing drains the queue.
                for _ in 0..2 {
                    let counter = counter.clone();
                    let child = ctx
                        .try_spawn(move |_| {
                            counter.fetch_add(1, Ordering::Relaxed);
                        })
                        .unwrap();
                    spawned.lock().push(child);
                }
            })
            .unwrap()
        };

        parent.wait_for_completion();
        let spawned = std::mem::take(&mut *spawned.lock());
        assert_eq!(
            spawned.iter().map(Option::is_some).collect::<Vec<_>>(),
            vec![true, false]
        );
        for child in spawned.iter().flatten() {
            child.wait_for_completion();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn panicking_task_is_isolated() {
        let pool = pool(1);
        let doomed = pool
            .add_function_task(|_| panic!("task blew up"))
            .unwrap();
        doomed.wait_for_completion();

        let after = Arc::new(AtomicBool::new(false));
        let flag = after.clone();
        pool.add_function_task(move |_| flag.store(true, Ordering::Release))
            .unwrap()
            .wait_for_completion();
        assert!(after.load(Ordering::Acquire));
    }

    type Observation = (Option<usize>, String, Option<String>);

    struct Record {
        seen: Arc<Mutex<Option<Observation>>>,
    }

    impl Task for Record {
        fn execute(&self, ctx: &TaskContext<'_>) {
            let thread = std::thread::current().name().map(str::to_owned);
            let allocator = default_allocator()
                .map(|a| a.name().to_owned())
                .unwrap_or_default();
            *self.seen.lock() = Some((ctx.worker_index(), allocator, thread));
        }
    }

    #[test]
    fn workers_run_with_the_pool_allocator() {
        let pool = pool(2);
        let seen = Arc::new(Mutex::new(None));
        pool.add_task(Record { seen: seen.clone() })
            .unwrap()
            .wait_for_completion();

        let (worker, allocator, thread) = seen.lock().take().unwrap();
        assert!(worker.unwrap() < 2);
        assert_eq!(allocator, "malloc");
        assert!(thread.unwrap().starts_with("grundval-worker-"));
    }
}
