use std::{
    io,
    sync::{Arc, Mutex, PoisonError, mpsc},
    thread,
};

use log::{debug, trace};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of named threads running dial and ping jobs for a pool.
#[derive(Debug)]
pub(crate) struct WorkerPool {
    workers: Vec<Worker>,
    sender: Option<mpsc::Sender<Job>>,
}

impl WorkerPool {
    pub fn new(name: &str, size: usize) -> io::Result<Self> {
        assert!(size > 0);

        let mut workers = Vec::with_capacity(size);
        let (sender, receiver) = mpsc::channel();

        let receiver = Arc::new(Mutex::new(receiver));
        let sender = Some(sender);

        for i in 0..size {
            workers.push(Worker::new(name, i, Arc::clone(&receiver))?);
        }

        Ok(Self { workers, sender })
    }

    /// Queues `f`. Returns false once the workers are gone.
    pub fn execute<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let job = Box::new(f);
        self.sender
            .as_ref()
            .is_some_and(|sender| sender.send(job).is_ok())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        drop(self.sender.take());

        let current = thread::current().id();
        for worker in self.workers.drain(..) {
            // The last pool handle may be released by a job on one of our own threads.
            if worker.thread.thread().id() == current {
                continue;
            }
            debug!("shutting down worker {}", worker.id);
            let _ = worker.thread.join();
        }
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    thread: thread::JoinHandle<()>,
}

impl Worker {
    fn new(name: &str, id: usize, receiver: Arc<Mutex<mpsc::Receiver<Job>>>) -> io::Result<Self> {
        let thread = thread::Builder::new()
            .name(format!("{name}-worker-{id}"))
            .spawn(move || {
                loop {
                    let msg = receiver
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .recv();
                    match msg {
                        Ok(job) => {
                            trace!("worker {id} running a job");
                            job();
                        }
                        Err(_) => {
                            debug!("worker {id} disconnected");
                            break;
                        }
                    }
                }
            })?;

        Ok(Self { id, thread })
    }
}
