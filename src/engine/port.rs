use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// One unit of work for an engine worker.
pub(crate) enum Task {
    /// A completion (or a blocking operation to issue) ready to run.
    Run(Box<dyn FnOnce() + Send>),
    /// Tells exactly one worker to exit.
    Shutdown,
}

/// The engine's completion port.
///
/// A single queue that every worker thread blocks on. Backends post
/// finished completions here so user callbacks always run on worker
/// threads; the blocking file backend also posts its not-yet-issued
/// operations, which a worker then performs inline.
pub(crate) struct CompletionPort {
    queue: Mutex<VecDeque<Task>>,
    ready: Condvar,
}

impl CompletionPort {
    pub(crate) fn new() -> CompletionPort {
        CompletionPort {
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        }
    }

    pub(crate) fn post(&self, task: Task) {
        let mut queue = self.queue.lock().unwrap();
        queue.push_back(task);
        drop(queue);
        self.ready.notify_one();
    }

    pub(crate) fn post_run<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.post(Task::Run(Box::new(f)));
    }

    fn next(&self) -> Task {
        let mut queue = self.queue.lock().unwrap();
        loop {
            match queue.pop_front() {
                Some(task) => return task,
                None => queue = self.ready.wait(queue).unwrap(),
            }
        }
    }

    /// Worker thread body: dispatch tasks until told to exit.
    pub(crate) fn run_worker(&self) {
        loop {
            match self.next() {
                Task::Run(f) => f(),
                Task::Shutdown => return,
            }
        }
    }
}

impl std::fmt::Debug for CompletionPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.queue.lock().map(|q| q.len()).unwrap_or(0);
        f.debug_struct("CompletionPort").field("queued", &len).finish()
    }
}
