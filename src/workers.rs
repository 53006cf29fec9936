use crate::{commands::CommandBufferAllocator, context::Context};

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Condvar, Mutex,
};
use std::thread::{self, JoinHandle};

use vulkanalia::prelude::v1_0::*;
use anyhow::{anyhow, Result};
use log::*;

/// One-permit semaphore. Each worker parks on its own; the
/// coordinator releases it once per dispatch wave.
pub struct BinarySemaphore {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl BinarySemaphore {
    pub fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    pub fn release(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        *signaled = true;
        self.condvar.notify_one();
    }

    pub fn acquire(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        while !*signaled {
            signaled = self.condvar.wait(signaled).unwrap();
        }
        *signaled = false;
    }
}

/// Counting semaphore the workers release into as they finish a
/// wave; the coordinator acquires the full worker count to know
/// the wave is complete.
pub struct CountingSemaphore {
    count: Mutex<usize>,
    condvar: Condvar,
}

impl CountingSemaphore {
    pub fn new() -> Self {
        Self {
            count: Mutex::new(0),
            condvar: Condvar::new(),
        }
    }

    pub fn release(&self, n: usize) {
        let mut count = self.count.lock().unwrap();
        *count += n;
        self.condvar.notify_all();
    }

    pub fn acquire(&self, n: usize) {
        let mut count = self.count.lock().unwrap();
        while *count < n {
            count = self.condvar.wait(count).unwrap();
        }
        *count -= n;
    }
}

/// A draw batch: a closure recording draw commands into the
/// secondary buffer it is handed. The buffer is already begun
/// with the frame's render pass inheritance and is ended by the
/// worker afterwards.
pub type DrawRecorder = Box<dyn FnOnce(&Device, vk::CommandBuffer) -> Result<()> + Send>;

/// Render-pass scope the secondaries record against, copied per
/// wave from the frame being built.
#[derive(Copy, Clone)]
pub struct RecordScope {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub frame_index: usize,
}

struct Wave {
    scope: RecordScope,
    batches: Vec<DrawRecorder>,
}

struct WorkerShared {
    counting: CountingSemaphore,
    results: Mutex<Vec<vk::CommandBuffer>>,
    error: Mutex<Option<anyhow::Error>>,
    running: AtomicBool,
}

struct Worker {
    thread: Option<JoinHandle<()>>,
    release: Arc<BinarySemaphore>,
    assignment: Arc<Mutex<Option<Wave>>>,
    allocator: Arc<Mutex<CommandBufferAllocator>>,
}

/// A fixed set of recording threads, each owning one secondary
/// command buffer allocator so no pool is shared across threads.
/// Batches handed to [`WorkerPool::dispatch`] are distributed
/// round-robin; results come back in arrival order, which is fine
/// because the submission itself is ordered by the primary buffer
/// and a depth buffer resolves draw order within the pass.
pub struct WorkerPool {
    workers: Vec<Worker>,
    shared: Arc<WorkerShared>,
    device: Arc<Device>,
}

impl WorkerPool {
    /// Spawns `worker_count` threads. `buffer_count` is the frame
    /// slot count; each worker keys its leases on it so a buffer
    /// is never re-recorded while an older frame slot may still
    /// be executing it.
    pub fn new(
        context: &Context,
        parent: &CommandBufferAllocator,
        worker_count: usize,
        buffer_count: usize,
    ) -> Result<Self> {
        let device = Arc::clone(&context.device);
        let shared = Arc::new(WorkerShared {
            counting: CountingSemaphore::new(),
            results: Mutex::new(Vec::new()),
            error: Mutex::new(None),
            running: AtomicBool::new(true),
        });

        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let allocator = Arc::new(Mutex::new(CommandBufferAllocator::new_secondary(
                context,
                parent,
                buffer_count,
            )?));
            let release = Arc::new(BinarySemaphore::new());
            let assignment = Arc::new(Mutex::new(None));

            let thread = spawn_worker(
                Arc::clone(&device),
                Arc::clone(&shared),
                Arc::clone(&release),
                Arc::clone(&assignment),
                Arc::clone(&allocator),
                buffer_count,
            );

            workers.push(Worker {
                thread: Some(thread),
                release,
                assignment,
                allocator,
            });
        }

        info!("Worker pool started ({} threads).", worker_count);
        Ok(Self {
            workers,
            shared,
            device,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Distributes `batches` round-robin and wakes every worker.
    /// All workers are released even when they received nothing,
    /// so the wave accounting on the counting semaphore stays
    /// uniform.
    pub fn dispatch(&self, scope: RecordScope, batches: Vec<DrawRecorder>) {
        let mut waves: Vec<Vec<DrawRecorder>> = Vec::with_capacity(self.workers.len());
        waves.resize_with(self.workers.len(), Vec::new);
        for (i, batch) in batches.into_iter().enumerate() {
            waves[i % self.workers.len()].push(batch);
        }

        for (worker, batches) in self.workers.iter().zip(waves) {
            *worker.assignment.lock().unwrap() = Some(Wave { scope, batches });
            worker.release.release();
        }
    }

    /// Blocks until every worker has finished the current wave,
    /// then drains the recorded secondaries in arrival order. A
    /// failed batch is dropped; its error comes back alongside
    /// whatever the other workers produced, so the frame can
    /// still consume the partial results before surfacing it.
    pub fn collect(&self) -> (Vec<vk::CommandBuffer>, Option<anyhow::Error>) {
        self.shared.counting.acquire(self.workers.len());

        let buffers = std::mem::take(&mut *self.shared.results.lock().unwrap());
        let error = self.shared.error.lock().unwrap().take();
        (buffers, error)
    }

    /// Stops and joins every thread, then destroys their command
    /// pools. Call with no wave in flight and the device idle.
    pub fn terminate(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        for worker in &self.workers {
            worker.release.release();
        }
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    error!("Worker thread panicked during shutdown.");
                }
            }
            worker.allocator.lock().unwrap().terminate(&self.device);
        }
        self.workers.clear();
    }
}

fn spawn_worker(
    device: Arc<Device>,
    shared: Arc<WorkerShared>,
    release: Arc<BinarySemaphore>,
    assignment: Arc<Mutex<Option<Wave>>>,
    allocator: Arc<Mutex<CommandBufferAllocator>>,
    slot_stride: usize,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        release.acquire();
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }

        if let Some(wave) = assignment.lock().unwrap().take() {
            let scope = wave.scope;
            for (ordinal, recorder) in wave.batches.into_iter().enumerate() {
                // Lease index combines frame slot and batch
                // ordinal, so a slot's buffers are only reused
                // once its fence has been waited.
                let lease = scope.frame_index + slot_stride * ordinal;
                let recorded = record_batch(
                    &device,
                    &mut allocator.lock().unwrap(),
                    lease,
                    scope,
                    recorder,
                );
                match recorded {
                    Ok(buffer) => shared.results.lock().unwrap().push(buffer),
                    Err(err) => {
                        warn!("Draw batch dropped: {}", err);
                        let mut slot = shared.error.lock().unwrap();
                        if slot.is_none() {
                            *slot = Some(err);
                        }
                    }
                }
            }
        }

        shared.counting.release(1);
    })
}

/// Begins a secondary buffer inside the wave's render pass,
/// runs the recorder, and ends it.
fn record_batch(
    device: &Device,
    allocator: &mut CommandBufferAllocator,
    lease: usize,
    scope: RecordScope,
    recorder: DrawRecorder,
) -> Result<vk::CommandBuffer> {
    let buffer = allocator.lease(device, lease)?;

    let inheritance = vk::CommandBufferInheritanceInfo::builder()
        .render_pass(scope.render_pass)
        .subpass(0)
        .framebuffer(scope.framebuffer);
    let info = vk::CommandBufferBeginInfo::builder()
        .flags(
            vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE
                | vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
        )
        .inheritance_info(&inheritance);

    unsafe {
        device.reset_command_buffer(buffer, vk::CommandBufferResetFlags::empty())?;
        device.begin_command_buffer(buffer, &info)?;
    }

    recorder(device, buffer).map_err(|err| anyhow!("batch recording failed: {}", err))?;

    unsafe { device.end_command_buffer(buffer)? };
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_semaphore_hands_off_one_permit() {
        let semaphore = Arc::new(BinarySemaphore::new());
        let passed = Arc::new(AtomicBool::new(false));

        let waiter = {
            let semaphore = Arc::clone(&semaphore);
            let passed = Arc::clone(&passed);
            thread::spawn(move || {
                semaphore.acquire();
                passed.store(true, Ordering::SeqCst);
            })
        };

        semaphore.release();
        waiter.join().unwrap();
        assert!(passed.load(Ordering::SeqCst));
    }

    #[test]
    fn counting_semaphore_gates_on_full_wave() {
        let semaphore = Arc::new(CountingSemaphore::new());
        let workers = 4;

        let threads: Vec<_> = (0..workers)
            .map(|_| {
                let semaphore = Arc::clone(&semaphore);
                thread::spawn(move || semaphore.release(1))
            })
            .collect();

        semaphore.acquire(workers);
        for thread in threads {
            thread.join().unwrap();
        }

        // All permits consumed; nothing left over.
        assert_eq!(*semaphore.count.lock().unwrap(), 0);
    }

    #[test]
    fn round_robin_distribution_loses_nothing() {
        let workers = 3;
        let batches = 8;

        let mut waves: Vec<Vec<usize>> = vec![Vec::new(); workers];
        for i in 0..batches {
            waves[i % workers].push(i);
        }

        let total: usize = waves.iter().map(Vec::len).sum();
        assert_eq!(total, batches);
        assert!(waves.iter().all(|wave| wave.len() <= batches / workers + 1));
    }
}
