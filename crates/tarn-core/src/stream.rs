//! FIFO worker threads backing the host, copy, compute and callback streams.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::{Condvar, Mutex};

use crate::{Result, TarnError};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

/// One-shot completion flag shared between streams.
#[derive(Default)]
pub(crate) struct Signal {
    done: Mutex<bool>,
    cv: Condvar,
}

impl Signal {
    pub(crate) fn set(&self) {
        *self.done.lock() = true;
        self.cv.notify_all();
    }

    pub(crate) fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cv.wait(&mut done);
        }
    }
}

pub(crate) struct Stream {
    name: String,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    pending: Arc<Pending>,
    worker: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl Stream {
    pub(crate) fn spawn(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let (tx, rx) = mpsc::channel::<Job>();
        let pending = Arc::new(Pending::default());
        let worker_pending = Arc::clone(&pending);
        let worker_name = name.clone();

        let handle = thread::Builder::new()
            .name(format!("tarn-{name}"))
            .spawn(move || {
                for job in rx {
                    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                        tracing::error!(stream = %worker_name, "job panicked");
                    }
                    let mut count = worker_pending.count.lock();
                    *count -= 1;
                    if *count == 0 {
                        worker_pending.idle.notify_all();
                    }
                }
            })
            .map_err(|e| TarnError::Config(format!("failed to start stream {name}: {e}")))?;

        Ok(Self {
            thread_id: handle.thread().id(),
            name,
            sender: Mutex::new(Some(tx)),
            pending,
            worker: Mutex::new(Some(handle)),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Queue a job behind everything already submitted.
    pub(crate) fn submit(&self, job: Job) -> Result<()> {
        let sender = self.sender.lock();
        let tx = sender.as_ref().ok_or(TarnError::EngineShutdown)?;
        *self.pending.count.lock() += 1;
        if tx.send(job).is_err() {
            *self.pending.count.lock() -= 1;
            return Err(TarnError::EngineShutdown);
        }
        Ok(())
    }

    /// Block until every submitted job has finished. A no-op when called
    /// from the stream's own thread.
    pub(crate) fn drain(&self) {
        if self.is_current() {
            return;
        }
        let mut count = self.pending.count.lock();
        while *count > 0 {
            self.pending.idle.wait(&mut count);
        }
    }

    pub(crate) fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub(crate) fn queued(&self) -> usize {
        *self.pending.count.lock()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        // closing the channel lets the worker finish its queue and exit
        self.sender.lock().take();
        if let Some(handle) = self.worker.lock().take() {
            if !self.is_current() && handle.join().is_err() {
                tracing::warn!(stream = %self.name, "stream worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_fifo_order() {
        let stream = Stream::spawn("test").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let seen = Arc::clone(&seen);
            stream
                .submit(Box::new(move || {
                    if i % 3 == 0 {
                        thread::sleep(Duration::from_millis(1));
                    }
                    seen.lock().push(i);
                }))
                .unwrap();
        }
        stream.drain();
        assert_eq!(*seen.lock(), (0..16).collect::<Vec<_>>());
        assert_eq!(stream.queued(), 0);
    }

    #[test]
    fn test_signal_across_streams() {
        let a = Stream::spawn("a").unwrap();
        let b = Stream::spawn("b").unwrap();
        let signal = Arc::new(Signal::default());
        let out = Arc::new(Mutex::new(0));

        let (s, o) = (Arc::clone(&signal), Arc::clone(&out));
        b.submit(Box::new(move || {
            s.wait();
            *o.lock() += 1;
        }))
        .unwrap();
        let s = Arc::clone(&signal);
        a.submit(Box::new(move || {
            thread::sleep(Duration::from_millis(5));
            s.set();
        }))
        .unwrap();

        b.drain();
        assert_eq!(*out.lock(), 1);
    }

    #[test]
    fn test_drop_finishes_queue() {
        let out = Arc::new(Mutex::new(0));
        {
            let stream = Stream::spawn("drop").unwrap();
            for _ in 0..4 {
                let o = Arc::clone(&out);
                stream.submit(Box::new(move || *o.lock() += 1)).unwrap();
            }
        }
        assert_eq!(*out.lock(), 4);
    }
}
