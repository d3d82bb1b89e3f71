//! The cooperative fiber runtime.
//!
//! A [`Dispatcher`] owns one OS thread and hosts any number of
//! [`FiberGroup`]s on it. Every fiber of a group runs on that single
//! thread, so group state needs no locking; cross-thread entry points
//! communicate through channels and [`FiberFuture`] completers.
//!
//! Fibers are plain futures. The compiler builds the continuation: a
//! sub-call is an `.await`, a suspension is an await on a wait source,
//! recovery is `Result` propagation and cleanup is `Drop`. Fibers are
//! classified `normal` or `daemon`: a group finishes once a stop was
//! requested and its last normal fiber has exited, at which point the
//! daemons are cancelled.

pub mod retry;
pub mod sync;

use std::cell::Cell;
use std::cell::RefCell;
use std::future::Future;
use std::io;
use std::rc::Rc;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub use retry::RetrySchedule;
pub use sync::with_deadline;
pub use sync::Completer;
pub use sync::FiberChannel;
pub use sync::FiberCondition;
pub use sync::FiberFuture;

use crate::error::RaftError;
use crate::error::RaftResult;

/// Run a blocking file operation on the runtime's blocking pool and await
/// its result. This is the only path by which fibers touch blocking
/// syscalls.
pub(crate) async fn io_call<T, F>(f: F) -> io::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> io::Result<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(res) => res,
        Err(join_err) => Err(io::Error::new(io::ErrorKind::Other, join_err)),
    }
}

enum DispatcherMsg {
    CreateGroup {
        name: String,
        tx: oneshot::Sender<FiberGroupHandle>,
    },
    Stop,
}

/// Owns one scheduling thread and the groups placed on it.
pub struct Dispatcher {
    name: String,
    tx: mpsc::UnboundedSender<DispatcherMsg>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Dispatcher {
    /// Spawn the dispatcher thread.
    pub fn spawn(name: impl Into<String>) -> RaftResult<Self> {
        let name = name.into();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let thread_name = name.clone();
        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || dispatcher_main(thread_name, runtime, rx))?;
        Ok(Self {
            name,
            tx,
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A `Send + Clone` handle for creating groups on this dispatcher.
    pub fn handle(&self) -> DispatcherHandle {
        DispatcherHandle {
            tx: self.tx.clone(),
        }
    }

    /// Create a fiber group on this dispatcher.
    pub async fn create_group(&self, name: impl Into<String>) -> RaftResult<FiberGroupHandle> {
        self.handle().create_group(name).await
    }

    /// Stop every hosted group, wait for their normal fibers to drain and
    /// join the scheduling thread.
    pub fn shutdown(mut self) {
        let _ = self.tx.send(DispatcherMsg::Stop);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!(dispatcher = %self.name, "dispatcher thread panicked");
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        let _ = self.tx.send(DispatcherMsg::Stop);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Creates groups on a dispatcher from any thread.
#[derive(Clone)]
pub struct DispatcherHandle {
    tx: mpsc::UnboundedSender<DispatcherMsg>,
}

impl DispatcherHandle {
    pub async fn create_group(&self, name: impl Into<String>) -> RaftResult<FiberGroupHandle> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(DispatcherMsg::CreateGroup {
                name: name.into(),
                tx,
            })
            .map_err(|_| RaftError::Stopped)?;
        rx.await.map_err(|_| RaftError::Stopped)
    }
}

fn dispatcher_main(
    name: String,
    runtime: tokio::runtime::Runtime,
    mut rx: mpsc::UnboundedReceiver<DispatcherMsg>,
) {
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, async move {
        tracing::debug!(dispatcher = %name, "dispatcher started");
        let mut groups: Vec<FiberGroup> = Vec::new();
        while let Some(msg) = rx.recv().await {
            match msg {
                DispatcherMsg::CreateGroup { name, tx } => {
                    let group = FiberGroup::new(name);
                    groups.push(group.clone());
                    let _ = tx.send(group.handle());
                }
                DispatcherMsg::Stop => break,
            }
        }
        for group in &groups {
            group.request_stop();
        }
        for group in &groups {
            group.finished().await;
        }
        tracing::debug!(dispatcher = %name, "dispatcher stopped");
    });
}

enum GroupCmd {
    Run(Box<dyn FnOnce(&FiberGroup) + Send>),
    Stop,
}

struct GroupInner {
    name: String,
    should_stop: Cell<bool>,
    stop_cond: FiberCondition,
    normal_fibers: Cell<usize>,
    daemons: RefCell<Vec<tokio::task::AbortHandle>>,
    finished_tx: watch::Sender<bool>,
}

/// A bucket of fibers sharing one scheduling thread. Cheap to clone.
#[derive(Clone)]
pub struct FiberGroup {
    inner: Rc<GroupInner>,
    cmd_tx: mpsc::UnboundedSender<GroupCmd>,
    finished_rx: watch::Receiver<bool>,
}

/// A handle to a fiber's scheduled task.
pub struct Fiber {
    name: String,
    handle: JoinHandle<()>,
}

impl Fiber {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cancel the fiber at its next suspension point.
    pub fn interrupt(&self) {
        self.handle.abort();
    }
}

impl FiberGroup {
    fn new(name: String) -> Self {
        let (finished_tx, finished_rx) = watch::channel(false);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let group = Self {
            inner: Rc::new(GroupInner {
                name,
                should_stop: Cell::new(false),
                stop_cond: FiberCondition::new(),
                normal_fibers: Cell::new(0),
                daemons: RefCell::new(Vec::new()),
                finished_tx,
            }),
            cmd_tx,
            finished_rx,
        };
        group.spawn_control_fiber(cmd_rx);
        group
    }

    fn spawn_control_fiber(&self, mut cmd_rx: mpsc::UnboundedReceiver<GroupCmd>) {
        let group = self.clone();
        let handle = tokio::task::spawn_local(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    GroupCmd::Run(f) => f(&group),
                    GroupCmd::Stop => {
                        group.request_stop();
                        return;
                    }
                }
            }
        });
        self.inner.daemons.borrow_mut().push(handle.abort_handle());
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn handle(&self) -> FiberGroupHandle {
        FiberGroupHandle {
            cmd_tx: self.cmd_tx.clone(),
            finished_rx: self.finished_rx.clone(),
        }
    }

    /// Spawn a normal fiber. Normal fibers keep the group alive: the group
    /// only finishes once every normal fiber has returned.
    pub fn spawn(&self, name: impl Into<String>, fut: impl Future<Output = ()> + 'static) -> Fiber {
        let name = name.into();
        if *self.finished_rx.borrow() {
            tracing::warn!(group = %self.inner.name, fiber = %name, "fiber spawned after group finished, dropping");
            return Fiber {
                name,
                handle: tokio::task::spawn_local(async {}),
            };
        }
        self.inner.normal_fibers.set(self.inner.normal_fibers.get() + 1);
        let group = self.clone();
        let fiber_name = name.clone();
        let handle = tokio::task::spawn_local(async move {
            fut.await;
            tracing::trace!(group = %group.inner.name, fiber = %fiber_name, "fiber finished");
            group.normal_fiber_done();
        });
        Fiber { name, handle }
    }

    /// Spawn a daemon fiber. Daemons do not keep the group alive and are
    /// cancelled once the group finishes.
    pub fn spawn_daemon(
        &self,
        name: impl Into<String>,
        fut: impl Future<Output = ()> + 'static,
    ) -> Fiber {
        let name = name.into();
        let handle = tokio::task::spawn_local(fut);
        self.inner.daemons.borrow_mut().push(handle.abort_handle());
        Fiber { name, handle }
    }

    /// True once a stop has been requested for this group.
    pub fn should_stop(&self) -> bool {
        self.inner.should_stop.get()
    }

    /// Wait until a stop is requested.
    pub async fn stopped(&self) {
        while !self.should_stop() {
            self.inner.stop_cond.wait().await;
        }
    }

    /// Request the group to stop. Fibers observe `should_stop` and wind
    /// down; the group finishes when the last normal fiber exits.
    pub fn request_stop(&self) {
        if self.inner.should_stop.replace(true) {
            return;
        }
        tracing::debug!(group = %self.inner.name, "group stop requested");
        self.inner.stop_cond.notify_all();
        if self.inner.normal_fibers.get() == 0 {
            self.finish();
        }
    }

    fn normal_fiber_done(&self) {
        let left = self.inner.normal_fibers.get() - 1;
        self.inner.normal_fibers.set(left);
        if left == 0 && self.inner.should_stop.get() {
            self.finish();
        }
    }

    fn finish(&self) {
        if *self.finished_rx.borrow() {
            return;
        }
        for daemon in self.inner.daemons.borrow_mut().drain(..) {
            daemon.abort();
        }
        let _ = self.inner.finished_tx.send(true);
        tracing::debug!(group = %self.inner.name, "group finished");
    }

    /// Wait until the group has finished.
    pub async fn finished(&self) {
        let mut rx = self.finished_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// A `Send` handle to a group living on a dispatcher thread.
#[derive(Clone)]
pub struct FiberGroupHandle {
    cmd_tx: mpsc::UnboundedSender<GroupCmd>,
    finished_rx: watch::Receiver<bool>,
}

impl FiberGroupHandle {
    /// Run a closure on the group's thread with access to the local
    /// [`FiberGroup`]; the usual way to construct thread-confined state
    /// and spawn the fibers owning it.
    pub fn run<F>(&self, f: F) -> RaftResult<()>
    where
        F: FnOnce(&FiberGroup) + Send + 'static,
    {
        self.cmd_tx
            .send(GroupCmd::Run(Box::new(f)))
            .map_err(|_| RaftError::Stopped)
    }

    pub fn request_stop(&self) {
        let _ = self.cmd_tx.send(GroupCmd::Stop);
    }

    /// Wait until the group has finished.
    pub async fn join(&self) {
        let mut rx = self.finished_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn fibers_run_on_the_dispatcher_thread() {
        let dispatcher = Dispatcher::spawn("test-dispatcher").unwrap();
        let group = dispatcher.create_group("g1").await.unwrap();

        let (fut, completer) = FiberFuture::new();
        group
            .run(move |g| {
                g.spawn("answer", async move {
                    completer.complete(std::thread::current().name().map(str::to_string));
                });
            })
            .unwrap();
        let thread_name = fut.await.unwrap();
        assert_eq!(thread_name.as_deref(), Some("test-dispatcher"));

        group.request_stop();
        group.join().await;
        dispatcher.shutdown();
    }

    #[tokio::test]
    async fn daemons_do_not_keep_a_group_alive() {
        let dispatcher = Dispatcher::spawn("test-daemons").unwrap();
        let group = dispatcher.create_group("g1").await.unwrap();

        let (fut, completer) = FiberFuture::new();
        group
            .run(move |g| {
                g.spawn_daemon("ticker", async {
                    loop {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                    }
                });
                g.spawn("once", async move {
                    completer.complete(());
                });
            })
            .unwrap();
        fut.await.unwrap();

        group.request_stop();
        // The sleeping daemon must not block the join.
        tokio::time::timeout(Duration::from_secs(5), group.join())
            .await
            .expect("group did not finish");
        dispatcher.shutdown();
    }

    #[tokio::test]
    async fn stopped_observes_stop_request() {
        let dispatcher = Dispatcher::spawn("test-stop").unwrap();
        let group = dispatcher.create_group("g1").await.unwrap();

        let (fut, completer) = FiberFuture::new();
        group
            .run(move |g| {
                let waiter = g.clone();
                g.spawn("wait-for-stop", async move {
                    waiter.stopped().await;
                    completer.complete(());
                });
            })
            .unwrap();
        group.request_stop();
        fut.await.unwrap();
        group.join().await;
        dispatcher.shutdown();
    }
}
