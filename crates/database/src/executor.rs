//! Background worker pool.
//!
//! One pool serves every instance of a file. Jobs are fed through a flume
//! channel to a fixed number of named threads; a panicking job is caught,
//! logged and reported through its panic handler instead of taking the
//! worker down. The workers exit once the pool and every clone of its
//! sender are gone.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tessel_core::Error;
use tracing::{debug, error, warn};

type Job = Box<dyn FnOnce(&AsyncTask) + Send>;
pub(crate) type PanicHandler = Box<dyn FnOnce(Error) + Send>;

struct Queued {
    label: &'static str,
    job: Job,
    on_panic: Option<PanicHandler>,
    task: AsyncTask,
}

/// Handle on a submitted job.
#[derive(Clone, Debug, Default)]
pub struct AsyncTask {
    cancelled: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
}

impl AsyncTask {
    /// Requests cancellation. A job that has not started is skipped; a
    /// running transaction checks the flag before committing.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Returns true once the job ran, was skipped or panicked.
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    fn finish(&self) {
        self.finished.store(true, Ordering::Release);
    }
}

/// Fixed-size pool of worker threads.
pub(crate) struct Executor {
    sender: flume::Sender<Queued>,
    workers: usize,
}

impl Executor {
    pub(crate) fn new(name: &str, workers: usize) -> Arc<Self> {
        let (sender, receiver) = flume::unbounded::<Queued>();
        let mut spawned = 0;
        for n in 0..workers.max(1) {
            let receiver = receiver.clone();
            let result = std::thread::Builder::new()
                .name(format!("tessel-worker-{}", n))
                .spawn(move || run_worker(receiver));
            match result {
                Ok(_) => spawned += 1,
                Err(e) => error!(error = %e, "failed to spawn worker thread"),
            }
        }
        debug!(file = name, workers = spawned, "started worker pool");
        Arc::new(Self {
            sender,
            workers: spawned,
        })
    }

    #[inline]
    pub(crate) fn workers(&self) -> usize {
        self.workers
    }

    /// Queues a job. The job receives its own task handle so long jobs can
    /// observe cancellation; `on_panic` receives the failure if it panics.
    pub(crate) fn submit(
        &self,
        label: &'static str,
        job: impl FnOnce(&AsyncTask) + Send + 'static,
        on_panic: Option<PanicHandler>,
    ) -> AsyncTask {
        let task = AsyncTask::default();
        let queued = Queued {
            label,
            job: Box::new(job),
            on_panic,
            task: task.clone(),
        };
        if self.sender.send(queued).is_err() {
            warn!(task = label, "worker pool is gone, job dropped");
            task.cancel();
            task.finish();
        }
        task
    }
}

fn run_worker(receiver: flume::Receiver<Queued>) {
    while let Ok(queued) = receiver.recv() {
        let Queued {
            label,
            job,
            on_panic,
            task,
        } = queued;
        if task.is_cancelled() {
            debug!(task = label, "skipping cancelled job");
            task.finish();
            continue;
        }
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| job(&task))) {
            let message = panic_message(panic.as_ref());
            error!(task = label, panic = %message, "background job panicked");
            if let Some(handler) = on_panic {
                handler(Error::background(Error::illegal_state(format!(
                    "{} panicked: {}",
                    label, message
                ))));
            }
        }
        task.finish();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
