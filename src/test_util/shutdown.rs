//! Orderly teardown of a parent / child test setup.
//!
//! In threaded mode, the child runs on a worker in the parent's process, and both sides signal
//!  independently that they are done. The worker must only be deleted once both are done, and
//!  the subprocess teardown must be posted as a separate task so it does not race with the
//!  channel being closed. All of this happens on the parent's loop, in whatever order the two
//!  sides finish.
//!
//! In process mode, each side shuts down on its own loop.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TestMode {
    Threaded,
    Process,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ShutdownStep {
    ChildWorkerDeleted,
    SubprocessDestroyed,
    ParentActorDeleted,
    ChildActorDeleted,
    ChildProcessShutDown,
}

#[derive(Debug)]
enum ParentTask {
    TryThreadedShutdown,
    ChildCompleted,
    DeferredParentShutdown,
    DeleteSubprocess,
    QuitParentProcess,
}

#[derive(Debug)]
enum ChildTask {
    Die,
}

/// The parent's side of the shutdown, owning the parent's task loop
pub struct ShutdownContext {
    mode: TestMode,
    parent_done: bool,
    child_done: bool,
    child_worker: Option<JoinHandle<()>>,
    is_shut_down: bool,
    steps: Vec<ShutdownStep>,
    task_sender: mpsc::UnboundedSender<ParentTask>,
    task_receiver: mpsc::UnboundedReceiver<ParentTask>,
}

/// The child's side of the shutdown. In process mode, it has a task loop of its own.
pub struct ChildHandle {
    mode: TestMode,
    parent: mpsc::UnboundedSender<ParentTask>,
    task_sender: mpsc::UnboundedSender<ChildTask>,
    task_receiver: mpsc::UnboundedReceiver<ChildTask>,
    steps: Vec<ShutdownStep>,
}

impl ShutdownContext {
    /// The child runs on `child_worker`, which is aborted when both sides are done
    pub fn threaded(child_worker: JoinHandle<()>) -> (ShutdownContext, ChildHandle) {
        Self::new(TestMode::Threaded, Some(child_worker))
    }

    pub fn process() -> (ShutdownContext, ChildHandle) {
        Self::new(TestMode::Process, None)
    }

    fn new(mode: TestMode, child_worker: Option<JoinHandle<()>>) -> (ShutdownContext, ChildHandle) {
        let (task_sender, task_receiver) = mpsc::unbounded_channel();
        let (child_sender, child_receiver) = mpsc::unbounded_channel();

        let child = ChildHandle {
            mode,
            parent: task_sender.clone(),
            task_sender: child_sender,
            task_receiver: child_receiver,
            steps: Vec::new(),
        };
        let ctx = ShutdownContext {
            mode,
            parent_done: false,
            child_done: false,
            child_worker,
            is_shut_down: false,
            steps: Vec::new(),
            task_sender,
            task_receiver,
        };
        (ctx, child)
    }

    pub fn mode(&self) -> TestMode {
        self.mode
    }

    pub fn is_shut_down(&self) -> bool {
        self.is_shut_down
    }

    /// the teardown steps the parent performed so far, in order
    pub fn steps(&self) -> &[ShutdownStep] {
        &self.steps
    }

    pub fn quit_parent(&mut self) {
        match self.mode {
            TestMode::Threaded => {
                self.parent_done = true;
                self.post(ParentTask::TryThreadedShutdown);
            }
            TestMode::Process => {
                // the real shutdown is deferred so it does not race with the channel being closed
                self.post(ParentTask::DeferredParentShutdown);
            }
        }
    }

    fn post(&self, task: ParentTask) {
        // the receiver lives in self, so sending can not fail
        let _ = self.task_sender.send(task);
    }

    /// Runs the tasks that were posted to the parent's loop, including those posted while
    ///  running, until there are none left
    pub fn run_until_idle(&mut self) {
        while let Ok(task) = self.task_receiver.try_recv() {
            trace!("running parent task {:?}", task);
            match task {
                ParentTask::TryThreadedShutdown => self.try_threaded_shutdown(),
                ParentTask::ChildCompleted => {
                    self.child_done = true;
                    self.try_threaded_shutdown();
                }
                ParentTask::DeferredParentShutdown => self.deferred_parent_shutdown(),
                ParentTask::DeleteSubprocess => {
                    self.steps.push(ShutdownStep::SubprocessDestroyed);
                    self.post(ParentTask::QuitParentProcess);
                }
                ParentTask::QuitParentProcess => {
                    self.steps.push(ShutdownStep::ParentActorDeleted);
                    self.is_shut_down = true;
                    debug!("parent shut down");
                }
            }
        }
    }

    /// Posted by both sides, so it runs at least twice: only the run that sees both sides done
    ///  while the worker still exists does anything.
    fn try_threaded_shutdown(&mut self) {
        if !self.child_done || !self.parent_done {
            return;
        }
        let Some(worker) = self.child_worker.take() else {
            return;
        };

        worker.abort();
        self.steps.push(ShutdownStep::ChildWorkerDeleted);
        self.deferred_parent_shutdown();
    }

    fn deferred_parent_shutdown(&mut self) {
        self.post(ParentTask::DeleteSubprocess);
    }
}

impl ChildHandle {
    pub fn quit_child(&self) {
        // the receivers live in the context and in self, so sending can only fail after the
        //  parent is gone
        match self.mode {
            TestMode::Threaded => {
                let _ = self.parent.send(ParentTask::ChildCompleted);
            }
            TestMode::Process => {
                let _ = self.task_sender.send(ChildTask::Die);
            }
        }
    }

    pub fn steps(&self) -> &[ShutdownStep] {
        &self.steps
    }

    /// Runs the tasks posted to the child's own loop. This is a no-op in threaded mode where the
    ///  child's work happens on the parent's loop.
    pub fn run_until_idle(&mut self) {
        while let Ok(task) = self.task_receiver.try_recv() {
            match task {
                ChildTask::Die => {
                    self.steps.push(ShutdownStep::ChildActorDeleted);
                    self.steps.push(ShutdownStep::ChildProcessShutDown);
                    debug!("child shut down");
                }
            }
        }
    }
}
