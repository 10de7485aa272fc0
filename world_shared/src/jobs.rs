//! Async job runner: named worker groups for blocking work.
//!
//! Each named group owns one worker thread draining a FIFO of jobs, so
//! blocking calls (disk, DB drivers, third-party SDKs) never stall the
//! game loop, and jobs within one group keep their submission order.
//! Completion callbacks are never invoked on the worker; they go through
//! the `PostQueue` and run on the owning loop.
//!
//! Shutdown closes a group's queue and waits for the worker to drain.
//! There is no per-job cancellation or timeout: a stuck job stalls only
//! its own group.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread::JoinHandle;

use tracing::{debug, warn};

use crate::post::PostQueue;

type BoxedJob = Box<dyn FnOnce(&PostQueue) + Send + 'static>;

struct Group {
    tx: mpsc::Sender<BoxedJob>,
    handle: JoinHandle<()>,
}

/// Fixed-named worker queues executing blocking jobs off the main loop.
pub struct JobRunner {
    groups: Mutex<HashMap<String, Group>>,
    post: PostQueue,
}

impl JobRunner {
    pub fn new(post: PostQueue) -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
            post,
        }
    }

    /// Appends a job to the named group, creating the group's worker on
    /// first use. `routine` runs blocking on the worker; `callback` is
    /// posted with the routine's result.
    pub fn submit<R, F, C>(&self, group: &str, routine: F, callback: C)
    where
        R: Send + 'static,
        F: FnOnce() -> anyhow::Result<R> + Send + 'static,
        C: FnOnce(anyhow::Result<R>) + Send + 'static,
    {
        let job: BoxedJob = Box::new(move |post: &PostQueue| {
            let result = routine();
            post.post(move || callback(result));
        });

        let mut groups = self.groups.lock().expect("job groups poisoned");
        let entry = groups
            .entry(group.to_string())
            .or_insert_with(|| Self::spawn_group(group, self.post.clone()));
        if let Err(mpsc::SendError(job)) = entry.tx.send(job) {
            // Worker died (should not happen); restart the group and
            // resubmit the bounced job.
            warn!(group, "job worker gone, respawning");
            let fresh = Self::spawn_group(group, self.post.clone());
            fresh.tx.send(job).expect("fresh worker accepts jobs");
            groups.insert(group.to_string(), fresh);
        }
    }

    fn spawn_group(name: &str, post: PostQueue) -> Group {
        let (tx, rx) = mpsc::channel::<BoxedJob>();
        let group_name = name.to_string();
        let handle = std::thread::Builder::new()
            .name(format!("job-{}", group_name))
            .spawn(move || {
                debug!(group = %group_name, "job worker started");
                for job in rx {
                    // A panicking routine must not take the group down.
                    if catch_unwind(AssertUnwindSafe(|| job(&post))).is_err() {
                        warn!(group = %group_name, "job routine panicked");
                    }
                }
                debug!(group = %group_name, "job worker drained");
            })
            .expect("spawn job worker");
        Group { tx, handle }
    }

    /// Closes the named group's queue and waits for its worker to drain.
    pub fn shutdown_group(&self, group: &str) {
        let removed = self
            .groups
            .lock()
            .expect("job groups poisoned")
            .remove(group);
        if let Some(g) = removed {
            drop(g.tx);
            if g.handle.join().is_err() {
                warn!(group, "job worker panicked during shutdown");
            }
        }
    }

    /// Drains and stops every group.
    pub fn shutdown_all(&self) {
        let groups: Vec<Group> = {
            let mut map = self.groups.lock().expect("job groups poisoned");
            map.drain().map(|(_, g)| g).collect()
        };
        for g in groups {
            drop(g.tx);
            let _ = g.handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn jobs_in_one_group_run_in_order() {
        let post = PostQueue::new();
        let runner = JobRunner::new(post.clone());
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..4 {
            let log = Arc::clone(&log);
            runner.submit(
                "db",
                move || Ok(i),
                move |res: anyhow::Result<i32>| log.lock().unwrap().push(res.unwrap()),
            );
        }
        runner.shutdown_group("db");
        post.drain();
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn callback_sees_routine_error() {
        let post = PostQueue::new();
        let runner = JobRunner::new(post.clone());
        let failed = Arc::new(AtomicUsize::new(0));

        let failed2 = Arc::clone(&failed);
        runner.submit(
            "io",
            || -> anyhow::Result<()> { anyhow::bail!("disk on fire") },
            move |res| {
                if res.is_err() {
                    failed2.fetch_add(1, Ordering::SeqCst);
                }
            },
        );
        runner.shutdown_all();
        post.drain();
        assert_eq!(failed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_routine_does_not_kill_the_group() {
        let post = PostQueue::new();
        let runner = JobRunner::new(post.clone());
        let ran = Arc::new(AtomicUsize::new(0));

        runner.submit(
            "db",
            || -> anyhow::Result<()> { panic!("routine blew up") },
            |_res| {},
        );
        let ran2 = Arc::clone(&ran);
        runner.submit(
            "db",
            || Ok(()),
            move |_res: anyhow::Result<()>| {
                ran2.fetch_add(1, Ordering::SeqCst);
            },
        );
        runner.shutdown_all();
        post.drain();
        assert_eq!(ran.load(Ordering::SeqCst), 1, "later jobs must still run");
    }
}
