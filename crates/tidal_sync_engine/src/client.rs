//! The sync client actor.
//!
//! [`SyncClient`] is a cheap handle; the state lives in a worker task that
//! owns the [`RemoteStore`] and the [`LruScheduler`] and processes
//! [`Command`]s one at a time. Caller operations, watch stream events, timer
//! firings and identity changes all travel through the same queue, so they
//! are applied in the order they were enqueued.
//!
//! Only [`SyncClient`] handles keep the worker alive. The watch stream, the
//! timers and the identity listener reach the queue through a
//! [`WeakQueue`], so dropping the last handle tears the worker down as if
//! [`SyncClient::shutdown`] had been called, leaving persistence open.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::identity::{IdentityProvider, User};
use crate::lru_scheduler::LruScheduler;
use crate::persistence::{LocalStore, Persistence};
use crate::queue::{AsyncQueue, QueueReceiver, WeakQueue};
use crate::remote_store::{RemoteStore, RemoteSyncer};
use crate::timer::{Scheduler, TimerFired, TimerId};
use crate::transport::{StreamEvent, WatchEventSink, WatchStream};
use parking_lot::Mutex;
use std::sync::Arc;
use tidal_sync_protocol::{TargetData, TargetId};
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace};

/// A message for the client worker.
#[derive(Debug)]
pub enum Command {
    /// Start listening to a target.
    Listen {
        /// The target.
        target_data: TargetData,
        /// Completion signal.
        done: oneshot::Sender<()>,
    },
    /// Stop listening to a target.
    Unlisten {
        /// The target.
        target_id: TargetId,
        /// Completion signal.
        done: oneshot::Sender<()>,
    },
    /// Enable or disable the network.
    SetNetworkEnabled {
        /// Whether the network may be used.
        enabled: bool,
        /// Completion signal.
        done: oneshot::Sender<()>,
    },
    /// An event from the watch stream.
    Stream(StreamEvent),
    /// A timer expired.
    Timer(TimerFired),
    /// The signed-in user changed.
    UserChanged(User),
    /// Stop the worker.
    Shutdown {
        /// Completion signal.
        done: oneshot::Sender<()>,
    },
}

impl From<TimerFired> for Command {
    fn from(fired: TimerFired) -> Self {
        Command::Timer(fired)
    }
}

/// Handle to a running sync client.
///
/// Operations may be called from any task; they complete once the worker
/// has applied them.
#[derive(Debug, Clone)]
pub struct SyncClient {
    queue: AsyncQueue<Command>,
}

impl SyncClient {
    /// Starts a client on the current tokio runtime.
    ///
    /// `make_stream` builds the watch stream around the sink that feeds the
    /// client's queue. Commands sent before `identity` delivers the first
    /// user are held until it does.
    pub fn start<W, S, P, F>(
        config: SyncConfig,
        make_stream: F,
        syncer: S,
        persistence: Arc<P>,
        identity: &dyn IdentityProvider,
    ) -> Self
    where
        W: WatchStream + 'static,
        S: RemoteSyncer + 'static,
        P: LocalStore + Persistence + 'static,
        F: FnOnce(WatchEventSink) -> W,
    {
        let (queue, receiver) = AsyncQueue::<Command>::new();

        let (initial_tx, initial_rx) = oneshot::channel();
        let initial_tx = Mutex::new(Some(initial_tx));
        let weak: WeakQueue<Command> = queue.downgrade();
        let listener_queue = weak.clone();
        identity.set_change_listener(Box::new(move |user| {
            if let Some(tx) = initial_tx.lock().take() {
                let _ = tx.send(user);
            } else if listener_queue.enqueue(Command::UserChanged(user)).is_err() {
                trace!("Dropping user change after shutdown");
            }
        }));

        let sink_queue = weak.clone();
        let sink = WatchEventSink::new(move |event| sink_queue.enqueue(Command::Stream(event)).is_ok());

        let scheduler: Arc<dyn Scheduler> = Arc::new(weak);
        let local_store: Arc<P> = Arc::clone(&persistence);
        let remote_store = RemoteStore::new(
            make_stream(sink),
            syncer,
            local_store,
            Arc::clone(&scheduler),
            config.online_state.clone(),
        );
        let worker = Worker {
            remote_store,
            lru_scheduler: LruScheduler::new(persistence.garbage_collector()),
            persistence,
            scheduler,
            user: User::unauthenticated(),
        };

        receiver.spawn(move |receiver| worker.run(receiver, initial_rx));
        Self { queue }
    }

    /// Starts listening to a target.
    pub async fn listen(&self, target_data: TargetData) -> SyncResult<()> {
        self.call(|done| Command::Listen { target_data, done }).await
    }

    /// Stops listening to a target.
    pub async fn unlisten(&self, target_id: TargetId) -> SyncResult<()> {
        self.call(|done| Command::Unlisten { target_id, done }).await
    }

    /// Allows network use.
    pub async fn enable_network(&self) -> SyncResult<()> {
        self.call(|done| Command::SetNetworkEnabled { enabled: true, done })
            .await
    }

    /// Forbids network use.
    pub async fn disable_network(&self) -> SyncResult<()> {
        self.call(|done| Command::SetNetworkEnabled { enabled: false, done })
            .await
    }

    /// Stops the client. Later operations fail with [`SyncError::ShutDown`].
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.call(|done| Command::Shutdown { done }).await
    }

    /// Returns true once the worker has stopped.
    pub fn is_shut_down(&self) -> bool {
        self.queue.is_closed()
    }

    async fn call(&self, command: impl FnOnce(oneshot::Sender<()>) -> Command) -> SyncResult<()> {
        let (done, wait) = oneshot::channel();
        self.queue.enqueue(command(done))?;
        wait.await.map_err(|_| SyncError::ShutDown)
    }
}

struct Worker<W, S, P> {
    remote_store: RemoteStore<W, S, P>,
    lru_scheduler: LruScheduler,
    persistence: Arc<P>,
    scheduler: Arc<dyn Scheduler>,
    user: User,
}

impl<W, S, P> Worker<W, S, P>
where
    W: WatchStream,
    S: RemoteSyncer,
    P: LocalStore + Persistence,
{
    async fn run(mut self, mut receiver: QueueReceiver<Command>, mut initial_user: oneshot::Receiver<User>) {
        // Nothing runs before the identity is known; commands are held back.
        let mut held = Vec::new();
        let user = loop {
            tokio::select! {
                user = &mut initial_user => match user {
                    Ok(user) => break user,
                    Err(_) => {
                        error!("Identity provider went away before reporting a user");
                        return;
                    }
                },
                command = receiver.recv() => match command {
                    Some(command) => held.push(command),
                    None => {
                        debug!("Sync client dropped before the first user");
                        return;
                    }
                },
            }
        };
        info!(user = %user, "Sync client started");
        self.user = user;
        self.lru_scheduler.start(self.scheduler.as_ref());

        for command in held {
            if !self.handle(command) {
                return;
            }
        }
        while let Some(command) = receiver.recv().await {
            debug_assert!(receiver.is_current_queue());
            if !self.handle(command) {
                return;
            }
        }

        info!("Every sync client handle was dropped; stopping");
        self.stop();
    }

    fn stop(&mut self) {
        self.lru_scheduler.stop();
        self.remote_store.shutdown();
        debug!("Sync client worker stopped");
    }

    /// Applies one command. Returns false once the worker should stop.
    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Listen { target_data, done } => {
                self.remote_store.listen(target_data);
                let _ = done.send(());
            }
            Command::Unlisten { target_id, done } => {
                self.remote_store.unlisten(target_id);
                let _ = done.send(());
            }
            Command::SetNetworkEnabled { enabled, done } => {
                self.remote_store.set_network_enabled(enabled);
                let _ = done.send(());
            }
            Command::Stream(event) => self.remote_store.handle_stream_event(event),
            Command::Timer(fired) => self.handle_timer(fired),
            Command::UserChanged(user) => {
                if user != self.user {
                    self.user = user.clone();
                    self.remote_store.handle_credential_change(user);
                }
            }
            Command::Shutdown { done } => {
                self.stop();
                self.persistence.shutdown();
                info!("Sync client shut down");
                let _ = done.send(());
                return false;
            }
        }
        true
    }

    fn handle_timer(&mut self, fired: TimerFired) {
        if fired.is_cancelled() {
            trace!(timer = ?fired.timer_id(), "Dropping cancelled timer");
            return;
        }
        match fired.timer_id() {
            TimerId::OnlineStateTimeout => self.remote_store.handle_online_state_timeout(),
            TimerId::LruGarbageCollection => {
                self.lru_scheduler
                    .run(self.persistence.as_ref(), self.scheduler.as_ref());
            }
        }
    }
}
