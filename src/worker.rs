// Background resource worker
//
// A single owned thread draining a FIFO of trim and destroy
// commands. Actions run here must only free objects that have
// already been dissociated from the render graph and fenced out of
// flight; they never touch the swapchain, in-flight command buffers,
// or sync primitives. The render thread never blocks on us.
//
// Austin Shafer - 2025
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// How long the worker naps when the queue is empty.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

type Action = Box<dyn FnOnce() + Send>;

/// A command for the worker, tagged with what it trims and carrying
/// the action to run.
pub enum WorkerCommand {
    TrimMaterials(Action),
    TrimMeshes(Action),
    TrimTextures(Action),
    TrimPipelines(Action),
    ProcessDestroys(Action),
    Shutdown,
}

impl WorkerCommand {
    fn name(&self) -> &'static str {
        match self {
            WorkerCommand::TrimMaterials(_) => "TrimMaterials",
            WorkerCommand::TrimMeshes(_) => "TrimMeshes",
            WorkerCommand::TrimTextures(_) => "TrimTextures",
            WorkerCommand::TrimPipelines(_) => "TrimPipelines",
            WorkerCommand::ProcessDestroys(_) => "ProcessDestroys",
            WorkerCommand::Shutdown => "Shutdown",
        }
    }

    fn run(self) {
        match self {
            WorkerCommand::TrimMaterials(f)
            | WorkerCommand::TrimMeshes(f)
            | WorkerCommand::TrimTextures(f)
            | WorkerCommand::TrimPipelines(f)
            | WorkerCommand::ProcessDestroys(f) => f(),
            WorkerCommand::Shutdown => {}
        }
    }
}

pub struct ResourceWorker {
    w_queue: Arc<Mutex<VecDeque<WorkerCommand>>>,
    w_thread: Option<thread::JoinHandle<()>>,
}

impl ResourceWorker {
    /// Spawn the worker thread.
    pub fn start() -> Self {
        let queue: Arc<Mutex<VecDeque<WorkerCommand>>> = Arc::new(Mutex::new(VecDeque::new()));
        let thread_queue = queue.clone();

        let handle = thread::Builder::new()
            .name("squall-resources".to_owned())
            .spawn(move || Self::worker_main(thread_queue))
            .expect("could not spawn resource worker thread");

        log::info!("ResourceWorker: started worker thread");
        Self {
            w_queue: queue,
            w_thread: Some(handle),
        }
    }

    /// Queue a command. Safe from any thread.
    pub fn enqueue(&self, cmd: WorkerCommand) {
        self.w_queue.lock().unwrap().push_back(cmd);
    }

    fn worker_main(queue: Arc<Mutex<VecDeque<WorkerCommand>>>) {
        loop {
            let cmd = queue.lock().unwrap().pop_front();

            match cmd {
                Some(WorkerCommand::Shutdown) => break,
                Some(cmd) => {
                    log::debug!("ResourceWorker: executing {}", cmd.name());
                    cmd.run();
                }
                None => thread::sleep(POLL_INTERVAL),
            }
        }

        // Drain what was queued behind the shutdown so nothing leaks
        let remaining: Vec<WorkerCommand> = queue.lock().unwrap().drain(..).collect();
        for cmd in remaining {
            match cmd {
                WorkerCommand::Shutdown => {}
                cmd => cmd.run(),
            }
        }
        log::debug!("ResourceWorker: worker thread exited");
    }

    /// Request shutdown and join the thread. Remaining non-shutdown
    /// commands run before the thread exits.
    pub fn stop(&mut self) {
        if let Some(handle) = self.w_thread.take() {
            log::info!("ResourceWorker: requesting shutdown");
            self.enqueue(WorkerCommand::Shutdown);
            let _ = handle.join();
        }
    }
}

impl Drop for ResourceWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn commands_run_on_the_worker() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut worker = ResourceWorker::start();

        for _ in 0..4 {
            let c = counter.clone();
            worker.enqueue(WorkerCommand::TrimTextures(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })));
        }

        worker.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn shutdown_drains_queued_commands() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut worker = ResourceWorker::start();

        // Push everything in one burst so some commands are still
        // queued when the shutdown lands behind them
        {
            let mut q = worker.w_queue.lock().unwrap();
            for _ in 0..8 {
                let c = counter.clone();
                q.push_back(WorkerCommand::ProcessDestroys(Box::new(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                })));
            }
        }

        worker.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn enqueue_is_safe_from_other_threads(){
        let counter = Arc::new(AtomicUsize::new(0));
        let worker = Arc::new(Mutex::new(ResourceWorker::start()));

        let mut joins = Vec::new();
        for _ in 0..4 {
            let c = counter.clone();
            let w = worker.clone();
            joins.push(thread::spawn(move || {
                for _ in 0..16 {
                    let c2 = c.clone();
                    w.lock().unwrap().enqueue(WorkerCommand::TrimMeshes(Box::new(
                        move || {
                            c2.fetch_add(1, Ordering::SeqCst);
                        },
                    )));
                }
            }));
        }
        for j in joins {
            j.join().unwrap();
        }

        worker.lock().unwrap().stop();
        assert_eq!(counter.load(Ordering::SeqCst), 64);
    }
}
