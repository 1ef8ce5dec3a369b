//! Per-LU task queue and worker thread (SPEC_FULL §4.6/§5).
//!
//! Each logical unit owns one worker thread draining a FIFO queue guarded by
//! a mutex+condvar, matching the original's one-worker-per-LU execution
//! model (`istgt_core.c`'s LU thread). Connection threads enqueue a `Task`
//! and block on an mpsc channel for the result; this keeps `target.rs`'s
//! per-connection code synchronous while SCSI execution itself runs
//! serialized per LU rather than inline on whichever connection thread
//! happens to hold the device lock.

use crate::error::{IscsiError, ScsiResult};
use crate::scsi::{ReservationTable, ScsiBlockDevice, ScsiContext, ScsiHandler, ScsiResponse, SenseData};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// Cooperative cancellation token for a queued task. Checked once before
/// execution begins; a task already running to completion is not
/// interrupted mid-flight (ERL 0 has no partial-I/O recovery to unwind to).
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// One SCSI command queued for execution against this LU.
struct Task {
    cdb: [u8; 16],
    write_data: Option<Vec<u8>>,
    initiator_key: String,
    last_sense: Option<SenseData>,
    cancel: CancelToken,
    respond: mpsc::SyncSender<(ScsiResult<ScsiResponse>, Option<SenseData>)>,
}

struct TaskQueue {
    queue: Mutex<VecDeque<Task>>,
    cv: Condvar,
    shutdown: AtomicBool,
}

/// A logical unit: its backing device, reservation state, and dedicated
/// task-execution worker thread.
pub struct LogicalUnit<D: ScsiBlockDevice> {
    pub lun: u64,
    device: Arc<Mutex<D>>,
    reservation: Arc<Mutex<ReservationTable>>,
    queue: Arc<TaskQueue>,
    worker: Option<JoinHandle<()>>,
}

impl<D: ScsiBlockDevice + Send + 'static> LogicalUnit<D> {
    pub fn new(lun: u64, device: D) -> Self {
        let device = Arc::new(Mutex::new(device));
        let reservation = Arc::new(Mutex::new(ReservationTable::default()));
        let queue = Arc::new(TaskQueue {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let worker_device = Arc::clone(&device);
        let worker_reservation = Arc::clone(&reservation);
        let worker_queue = Arc::clone(&queue);
        let worker = std::thread::Builder::new()
            .name(format!("lu-{lun}-worker"))
            .spawn(move || Self::worker_loop(worker_queue, worker_device, worker_reservation))
            .expect("failed to spawn LU worker thread");

        LogicalUnit {
            lun,
            device,
            reservation,
            queue,
            worker: Some(worker),
        }
    }

    fn worker_loop(queue: Arc<TaskQueue>, device: Arc<Mutex<D>>, reservation: Arc<Mutex<ReservationTable>>) {
        loop {
            let task = {
                let mut q = queue.queue.lock().expect("LU task queue poisoned");
                loop {
                    if let Some(task) = q.pop_front() {
                        break Some(task);
                    }
                    if queue.shutdown.load(Ordering::Acquire) {
                        break None;
                    }
                    q = queue.cv.wait(q).expect("LU task queue poisoned");
                }
            };

            let task = match task {
                Some(t) => t,
                None => return,
            };

            if task.cancel.is_cancelled() {
                let _ = task.respond.send((
                    Ok(ScsiResponse::check_condition(SenseData::new(
                        crate::scsi::sense_key::ABORTED_COMMAND,
                        0x00,
                        0,
                    ))),
                    task.last_sense,
                ));
                continue;
            }

            let mut ctx = ScsiContext {
                initiator_key: task.initiator_key,
                last_sense: task.last_sense,
            };

            let result = {
                let mut dev = device.lock().expect("LU device mutex poisoned");
                ScsiHandler::handle_command(&task.cdb, &mut *dev, task.write_data.as_deref(), &reservation, &mut ctx)
            };

            let _ = task.respond.send((result, ctx.last_sense));
        }
    }

    /// Enqueue a task and block the calling (connection) thread until the
    /// LU worker has executed it. `last_sense` is this I_T_L nexus's
    /// REQUEST-SENSE state going in; the returned value is the updated state
    /// to store back on the session.
    pub fn execute(
        &self,
        cdb: [u8; 16],
        write_data: Option<Vec<u8>>,
        initiator_key: String,
        last_sense: Option<SenseData>,
        cancel: CancelToken,
    ) -> ScsiResult<(ScsiResponse, Option<SenseData>)> {
        let (tx, rx) = mpsc::sync_channel(1);
        {
            let mut q = self.queue.queue.lock().map_err(|_| {
                IscsiError::InternalAssertionFailure("LU task queue poisoned".into())
            })?;
            q.push_back(Task {
                cdb,
                write_data,
                initiator_key,
                last_sense,
                cancel,
                respond: tx,
            });
            self.queue.cv.notify_one();
        }

        let (result, sense) = rx
            .recv()
            .map_err(|_| IscsiError::InternalAssertionFailure("LU worker dropped task without responding".into()))?;
        result.map(|r| (r, sense))
    }

    pub fn block_size(&self) -> ScsiResult<u32> {
        let dev = self
            .device
            .lock()
            .map_err(|_| IscsiError::InternalAssertionFailure("LU device mutex poisoned".into()))?;
        Ok(dev.block_size())
    }

    pub fn capacity(&self) -> ScsiResult<u64> {
        let dev = self
            .device
            .lock()
            .map_err(|_| IscsiError::InternalAssertionFailure("LU device mutex poisoned".into()))?;
        Ok(dev.capacity())
    }
}

impl<D: ScsiBlockDevice> Drop for LogicalUnit<D> {
    fn drop(&mut self) {
        self.queue.shutdown.store(true, Ordering::Release);
        self.queue.cv.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
