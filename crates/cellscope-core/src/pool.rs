//! Worker pool and reply queue for background Viterbi decoding.
//!
//! Each worker owns a private snapshot of the model-pair and pulls jobs from
//! its own FIFO queue. Two job kinds flow to a worker: decode a finalised
//! observation sequence, or refresh the private model snapshot. Decode jobs
//! are distributed round-robin; refresh jobs are broadcast to every worker,
//! so a decode enqueued before a refresh runs against the old model and one
//! enqueued after it runs against the new one. A decode that lands on a
//! worker with no model produces the empty-path sentinel.
//!
//! Completed jobs travel back over a single reply channel paired with a
//! non-blocking self-pipe, so a sleeping main loop can poll the read end and
//! drain replies when it wakes. Dropping the pool closes the job queues;
//! workers finish what is queued and exit, and are joined.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::model::{ModelPair, Observation};
use crate::viterbi;

/// Which HMM a sequence decodes against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Track {
    Packets,
    Streams,
}

/// A finalised observation sequence awaiting decoding.
pub(crate) struct DecodeJob {
    pub(crate) track: Track,
    pub(crate) observations: Vec<Observation>,
}

enum WorkerJob {
    Decode(DecodeJob),
    Refresh(Option<Arc<ModelPair>>),
}

/// Result of one decode job. `path` is `None` on any decode failure.
pub(crate) struct Completed {
    pub(crate) track: Track,
    pub(crate) path: Option<String>,
}

/// Select the track's HMM and decode, mapping every failure to `None`.
pub(crate) fn run_decode(model: &ModelPair, job: &DecodeJob) -> Option<String> {
    let hmm = match job.track {
        Track::Packets => model.packets.as_ref(),
        Track::Streams => model.streams.as_ref(),
    }?;
    match viterbi::decode_path(hmm, &job.observations) {
        Ok(path) => Some(path),
        Err(err) => {
            log::warn!("viterbi decode failed: {err}");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Reply queue
// ---------------------------------------------------------------------------

/// Build the worker-side sender and main-thread receiver of the reply queue.
pub(crate) fn reply_queue() -> std::io::Result<(ReplySender, ReplyReceiver)> {
    let (tx, rx) = channel();
    let pipe = Arc::new(SignalPipe::new()?);
    Ok((
        ReplySender {
            tx,
            pipe: Arc::clone(&pipe),
        },
        ReplyReceiver { rx, pipe },
    ))
}

#[derive(Clone)]
pub(crate) struct ReplySender {
    tx: Sender<Completed>,
    pipe: Arc<SignalPipe>,
}

impl ReplySender {
    pub(crate) fn send(&self, done: Completed) {
        if self.tx.send(done).is_ok() {
            self.pipe.notify();
        }
    }
}

pub(crate) struct ReplyReceiver {
    rx: Receiver<Completed>,
    pipe: Arc<SignalPipe>,
}

impl ReplyReceiver {
    /// Descriptor that becomes readable when a reply is waiting.
    #[cfg(unix)]
    pub(crate) fn read_fd(&self) -> std::os::unix::io::RawFd {
        self.pipe.read_fd()
    }

    /// Drain everything currently queued without blocking.
    pub(crate) fn try_drain(&self) -> Vec<Completed> {
        self.pipe.drain();
        let mut out = Vec::new();
        while let Ok(done) = self.rx.try_recv() {
            out.push(done);
        }
        out
    }

    /// Drain queued replies, waiting up to `timeout` for the first one.
    pub(crate) fn drain_timeout(&self, timeout: Duration) -> Vec<Completed> {
        let mut out = self.try_drain();
        if out.is_empty() {
            if let Ok(first) = self.rx.recv_timeout(timeout) {
                out.push(first);
                out.extend(self.try_drain());
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Self-pipe
// ---------------------------------------------------------------------------

#[cfg(unix)]
struct SignalPipe {
    read_fd: std::os::unix::io::RawFd,
    write_fd: std::os::unix::io::RawFd,
}

#[cfg(unix)]
impl SignalPipe {
    fn new() -> std::io::Result<Self> {
        let mut fds = [0i32; 2];
        // SAFETY: `pipe` fills a valid two-element descriptor array.
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        let pipe = Self {
            read_fd: fds[0],
            write_fd: fds[1],
        };
        for fd in fds {
            // SAFETY: both descriptors were just returned by `pipe`.
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            }
        }
        Ok(pipe)
    }

    fn read_fd(&self) -> std::os::unix::io::RawFd {
        self.read_fd
    }

    fn notify(&self) {
        let byte = 1u8;
        // SAFETY: one-byte write from a valid buffer. A full pipe (EAGAIN)
        // already holds pending wakeups, which is sufficient.
        let _ = unsafe { libc::write(self.write_fd, std::ptr::from_ref(&byte).cast(), 1) };
    }

    fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            // SAFETY: reads into a valid owned buffer of the stated length.
            let n = unsafe { libc::read(self.read_fd, buf.as_mut_ptr().cast(), buf.len()) };
            if n < buf.len() as isize {
                break;
            }
        }
    }
}

#[cfg(unix)]
impl Drop for SignalPipe {
    fn drop(&mut self) {
        // SAFETY: the descriptors are owned by this pipe and closed once.
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

#[cfg(not(unix))]
struct SignalPipe;

#[cfg(not(unix))]
impl SignalPipe {
    fn new() -> std::io::Result<Self> {
        Ok(Self)
    }
    fn notify(&self) {}
    fn drain(&self) {}
}

// ---------------------------------------------------------------------------
// Worker pool
// ---------------------------------------------------------------------------

pub(crate) struct WorkerPool {
    slots: Vec<WorkerSlot>,
    next: AtomicUsize,
}

struct WorkerSlot {
    tx: Sender<WorkerJob>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` workers, each starting from the given model snapshot.
    pub(crate) fn new(
        count: usize,
        initial: Option<Arc<ModelPair>>,
        replies: ReplySender,
    ) -> Self {
        let mut slots = Vec::with_capacity(count);
        for idx in 0..count {
            let (tx, rx) = channel();
            let model = initial.clone();
            let replies = replies.clone();
            let thread = std::thread::Builder::new()
                .name(format!("viterbi-worker-{idx}"))
                .spawn(move || worker_main(rx, model, replies))
                .expect("failed to spawn viterbi worker thread");
            slots.push(WorkerSlot {
                tx,
                thread: Some(thread),
            });
        }
        Self {
            slots,
            next: AtomicUsize::new(0),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Queue a decode on the next worker round-robin. Returns false if the
    /// chosen worker is gone; the caller then reports the job as failed.
    pub(crate) fn submit(&self, job: DecodeJob) -> bool {
        if self.slots.is_empty() {
            return false;
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        self.slots[idx].tx.send(WorkerJob::Decode(job)).is_ok()
    }

    /// Queue a model refresh on every worker. FIFO order per worker
    /// guarantees decodes enqueued earlier still see the old snapshot.
    pub(crate) fn broadcast_refresh(&self, model: Option<Arc<ModelPair>>) {
        for slot in &self.slots {
            if slot.tx.send(WorkerJob::Refresh(model.clone())).is_err() {
                log::warn!("viterbi worker exited early; skipping its model refresh");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let mut threads = Vec::with_capacity(self.slots.len());
        for slot in self.slots.drain(..) {
            drop(slot.tx);
            threads.push(slot.thread);
        }
        for thread in threads.into_iter().flatten() {
            let _ = thread.join();
        }
    }
}

fn worker_main(
    jobs: Receiver<WorkerJob>,
    mut model: Option<Arc<ModelPair>>,
    replies: ReplySender,
) {
    while let Ok(job) = jobs.recv() {
        match job {
            WorkerJob::Refresh(next) => model = next,
            WorkerJob::Decode(job) => {
                let path = model.as_deref().and_then(|m| run_decode(m, &job));
                replies.send(Completed {
                    track: job.track,
                    path,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ObsCode;
    use crate::parse::parse_model_object;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn test_model() -> Arc<ModelPair> {
        let blob = concat!(
            "{\"state_space\":[\"run\";\"stop\"];\"observation_space\":[\"+\";\"F\"];",
            "\"start_probability\":{\"run\":1.0};",
            "\"transition_probability\":{\"run\":{\"run\":0.5;\"stop\":0.5}};",
            "\"emission_probability\":{\"run\":{\"+\":[1.0;0.0;0.0;0.001]};",
            "\"stop\":{\"F\":[1.0]}}}",
        );
        Arc::new(parse_model_object(blob).expect("test model"))
    }

    fn plus_then_end(delay: u64) -> Vec<Observation> {
        vec![
            Observation::new(delay, ObsCode::ToServer),
            Observation::new(0, ObsCode::End),
        ]
    }

    #[test]
    fn worker_decodes_against_its_snapshot() {
        let (tx, rx) = reply_queue().expect("reply queue");
        let pool = WorkerPool::new(1, Some(test_model()), tx);
        assert!(pool.submit(DecodeJob {
            track: Track::Packets,
            observations: plus_then_end(50),
        }));
        let done = rx.drain_timeout(TIMEOUT);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].track, Track::Packets);
        assert_eq!(
            done[0].path.as_deref(),
            Some("[[\"run\";\"+\";50];[\"stop\";\"F\";0]]")
        );
    }

    #[test]
    fn decode_without_model_yields_sentinel() {
        let (tx, rx) = reply_queue().expect("reply queue");
        let pool = WorkerPool::new(1, None, tx);
        assert!(pool.submit(DecodeJob {
            track: Track::Streams,
            observations: plus_then_end(10),
        }));
        let done = rx.drain_timeout(TIMEOUT);
        assert_eq!(done.len(), 1);
        assert!(done[0].path.is_none());
    }

    #[test]
    fn refresh_applies_in_fifo_order() {
        let (tx, rx) = reply_queue().expect("reply queue");
        let pool = WorkerPool::new(1, Some(test_model()), tx);

        // First decode precedes the refresh, second follows it.
        assert!(pool.submit(DecodeJob {
            track: Track::Packets,
            observations: plus_then_end(10),
        }));
        pool.broadcast_refresh(None);
        assert!(pool.submit(DecodeJob {
            track: Track::Packets,
            observations: plus_then_end(10),
        }));

        let mut done = Vec::new();
        while done.len() < 2 {
            let batch = rx.drain_timeout(TIMEOUT);
            assert!(!batch.is_empty(), "timed out waiting for replies");
            done.extend(batch);
        }
        assert!(done[0].path.is_some());
        assert!(done[1].path.is_none());
    }

    #[test]
    fn track_without_hmm_yields_sentinel() {
        let (tx, rx) = reply_queue().expect("reply queue");
        let pool = WorkerPool::new(1, Some(test_model()), tx);
        assert!(pool.submit(DecodeJob {
            track: Track::Streams,
            observations: plus_then_end(10),
        }));
        let done = rx.drain_timeout(TIMEOUT);
        assert!(done[0].path.is_none());
    }

    #[test]
    fn jobs_spread_across_workers() {
        let (tx, rx) = reply_queue().expect("reply queue");
        let pool = WorkerPool::new(4, Some(test_model()), tx);
        assert_eq!(pool.len(), 4);
        for _ in 0..8 {
            assert!(pool.submit(DecodeJob {
                track: Track::Packets,
                observations: plus_then_end(10),
            }));
        }
        let mut seen = 0;
        while seen < 8 {
            let batch = rx.drain_timeout(TIMEOUT);
            assert!(!batch.is_empty(), "timed out waiting for replies");
            seen += batch.len();
        }
        assert_eq!(seen, 8);
    }

    #[cfg(unix)]
    #[test]
    fn reply_descriptor_signals_readable() {
        let (tx, rx) = reply_queue().expect("reply queue");
        let pool = WorkerPool::new(1, Some(test_model()), tx);
        assert!(pool.submit(DecodeJob {
            track: Track::Packets,
            observations: plus_then_end(10),
        }));

        let mut pollfd = libc::pollfd {
            fd: rx.read_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: polls a single valid descriptor owned by the reply queue.
        let rc = unsafe { libc::poll(&mut pollfd, 1, 10_000) };
        assert_eq!(rc, 1, "reply descriptor never became readable");
        assert_ne!(pollfd.revents & libc::POLLIN, 0);

        let done = rx.try_drain();
        assert_eq!(done.len(), 1);
    }

    #[test]
    fn dropping_the_pool_joins_workers() {
        let (tx, rx) = reply_queue().expect("reply queue");
        let pool = WorkerPool::new(2, Some(test_model()), tx);
        assert!(pool.submit(DecodeJob {
            track: Track::Packets,
            observations: plus_then_end(10),
        }));
        drop(pool);
        // The queued job was drained before exit.
        let done = rx.try_drain();
        assert_eq!(done.len(), 1);
    }
}
