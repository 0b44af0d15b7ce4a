//! Tokio host for the coordinator: one task owns it and drains a single serialized inbox.
//!
//! Platform callbacks enter through [`EventSink`], application calls through [`ServiceHandle`].
//! Both land in the same channel and are processed strictly in arrival order.

use std::collections::{BTreeSet, HashMap};

use mpchat_core::{
    BrowsedPeer, ConnectError, ConnectFailure, Event, MessageRecord, Notification, Output, PeerId,
    PeerIdentity, RecordStore, SessionCoordinator, StoreError, Timer, Transport,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

const NOTIFICATION_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("service is not running")]
    Closed,
    #[error(transparent)]
    Core(#[from] mpchat_core::Error),
}

impl From<ConnectError> for ServiceError {
    fn from(e: ConnectError) -> Self {
        ServiceError::Core(e.into())
    }
}

impl From<ConnectFailure> for ServiceError {
    fn from(e: ConnectFailure) -> Self {
        ServiceError::Core(e.into())
    }
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        ServiceError::Core(e.into())
    }
}

type Reply<T> = oneshot::Sender<Result<T, ServiceError>>;

enum Command {
    Event(Event),
    StartDiscovery(Reply<()>),
    StopDiscovery(Reply<()>),
    Connect(PeerId, Reply<()>),
    Accept(Reply<()>),
    Decline(Reply<()>),
    SendText(String, BTreeSet<PeerId>, Reply<Option<MessageRecord>>),
    SendImage(Vec<u8>, BTreeSet<PeerId>, Reply<Option<MessageRecord>>),
    LoadMore(PeerId, Reply<Vec<MessageRecord>>),
    RemovePeer(PeerId, Reply<()>),
    RemoveAllPeers(Reply<()>),
    RemoveAllMessages(Reply<usize>),
    ResendIntroduction(PeerId, Reply<bool>),
    Subscribe(PeerId, Reply<mpsc::UnboundedReceiver<MessageRecord>>),
    Peers(Reply<Vec<BrowsedPeer>>),
    KnownPeers(Reply<Vec<PeerIdentity>>),
    Shutdown(Reply<()>),
}

/// Entry point for platform callbacks. Cheap to clone; hand one to each platform delegate.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Command>,
}

impl EventSink {
    pub fn deliver(&self, event: Event) -> Result<(), ServiceError> {
        self.tx
            .send(Command::Event(event))
            .map_err(|_| ServiceError::Closed)
    }
}

/// Application-side API of a running service.
#[derive(Clone)]
pub struct ServiceHandle {
    tx: mpsc::UnboundedSender<Command>,
    notifications: broadcast::Sender<Notification>,
}

impl ServiceHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).map_err(|_| ServiceError::Closed)?;
        rx.await.map_err(|_| ServiceError::Closed)?
    }

    pub async fn start_discovery(&self) -> Result<(), ServiceError> {
        self.request(Command::StartDiscovery).await
    }

    pub async fn stop_discovery(&self) -> Result<(), ServiceError> {
        self.request(Command::StopDiscovery).await
    }

    /// Invite `peer` and wait until the session connects, fails or the invite times out.
    pub async fn connect(&self, peer: PeerId) -> Result<(), ServiceError> {
        self.request(|reply| Command::Connect(peer, reply)).await
    }

    pub async fn accept(&self) -> Result<(), ServiceError> {
        self.request(Command::Accept).await
    }

    pub async fn decline(&self) -> Result<(), ServiceError> {
        self.request(Command::Decline).await
    }

    /// The stored record, or None when the send failed and nothing was persisted.
    pub async fn send_text(
        &self,
        text: impl Into<String>,
        recipients: BTreeSet<PeerId>,
    ) -> Result<Option<MessageRecord>, ServiceError> {
        let text = text.into();
        self.request(|reply| Command::SendText(text, recipients, reply))
            .await
    }

    pub async fn send_image(
        &self,
        image: Vec<u8>,
        recipients: BTreeSet<PeerId>,
    ) -> Result<Option<MessageRecord>, ServiceError> {
        self.request(|reply| Command::SendImage(image, recipients, reply))
            .await
    }

    pub async fn load_more_messages(
        &self,
        peer: PeerId,
    ) -> Result<Vec<MessageRecord>, ServiceError> {
        self.request(|reply| Command::LoadMore(peer, reply)).await
    }

    pub async fn remove_peer(&self, peer: PeerId) -> Result<(), ServiceError> {
        self.request(|reply| Command::RemovePeer(peer, reply)).await
    }

    pub async fn remove_all_peers(&self) -> Result<(), ServiceError> {
        self.request(Command::RemoveAllPeers).await
    }

    /// Delete the whole message history. Returns how many records were removed.
    pub async fn remove_all_messages(&self) -> Result<usize, ServiceError> {
        self.request(Command::RemoveAllMessages).await
    }

    pub async fn resend_introduction(&self, peer: PeerId) -> Result<bool, ServiceError> {
        self.request(|reply| Command::ResendIntroduction(peer, reply))
            .await
    }

    /// Records stored from now on for the conversation with `peer`.
    pub async fn subscribe(
        &self,
        peer: PeerId,
    ) -> Result<mpsc::UnboundedReceiver<MessageRecord>, ServiceError> {
        self.request(|reply| Command::Subscribe(peer, reply)).await
    }

    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    pub async fn peers(&self) -> Result<Vec<BrowsedPeer>, ServiceError> {
        self.request(Command::Peers).await
    }

    pub async fn known_peers(&self) -> Result<Vec<PeerIdentity>, ServiceError> {
        self.request(Command::KnownPeers).await
    }

    /// Stop discovery and end the service task. Pending connects resolve as closed.
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        self.request(Command::Shutdown).await
    }
}

struct Service<T, S> {
    coordinator: SessionCoordinator<T, S>,
    inbox: mpsc::UnboundedReceiver<Command>,
    timers: mpsc::WeakUnboundedSender<Command>,
    notifications: broadcast::Sender<Notification>,
    waiters: HashMap<PeerId, Vec<Reply<()>>>,
}

/// Spawn the service task on the current tokio runtime.
pub fn spawn<T, S>(coordinator: SessionCoordinator<T, S>) -> (ServiceHandle, EventSink, JoinHandle<()>)
where
    T: Transport + Send + 'static,
    S: RecordStore + Send + 'static,
{
    let (tx, inbox) = mpsc::unbounded_channel();
    let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
    let service = Service {
        coordinator,
        inbox,
        timers: tx.downgrade(),
        notifications: notifications.clone(),
        waiters: HashMap::new(),
    };
    let task = tokio::spawn(service.run());
    let handle = ServiceHandle {
        tx: tx.clone(),
        notifications,
    };
    (handle, EventSink { tx }, task)
}

impl<T: Transport, S: RecordStore> Service<T, S> {
    async fn run(mut self) {
        tracing::info!(peer = %self.coordinator.local().id, "service started");
        while let Some(cmd) = self.inbox.recv().await {
            if let Command::Shutdown(reply) = cmd {
                let out = self.coordinator.stop_discovery();
                self.perform(out);
                let _ = reply.send(Ok(()));
                break;
            }
            self.dispatch(cmd);
        }
        tracing::info!("service stopped");
    }

    fn dispatch(&mut self, cmd: Command) {
        match cmd {
            Command::Event(event) => {
                let out = self.coordinator.handle(event);
                self.perform(out);
            }
            Command::StartDiscovery(reply) => {
                let out = self.coordinator.start_discovery();
                self.perform(out);
                let _ = reply.send(Ok(()));
            }
            Command::StopDiscovery(reply) => {
                let out = self.coordinator.stop_discovery();
                self.perform(out);
                let _ = reply.send(Ok(()));
            }
            Command::Connect(peer, reply) => match self.coordinator.connect(peer) {
                Ok(out) => {
                    self.waiters.entry(peer).or_default().push(reply);
                    self.perform(out);
                }
                Err(e) => {
                    let _ = reply.send(Err(e.into()));
                }
            },
            Command::Accept(reply) => {
                let result = self.coordinator.accept().map(|out| self.perform(out));
                let _ = reply.send(result.map_err(Into::into));
            }
            Command::Decline(reply) => {
                let result = self.coordinator.decline().map(|out| self.perform(out));
                let _ = reply.send(result.map_err(Into::into));
            }
            Command::SendText(text, recipients, reply) => {
                let result = self.coordinator.send_text(&text, &recipients);
                let _ = reply.send(result.map_err(Into::into));
            }
            Command::SendImage(image, recipients, reply) => {
                let result = self.coordinator.send_image(image, &recipients);
                let _ = reply.send(result.map_err(Into::into));
            }
            Command::LoadMore(peer, reply) => {
                let result = self.coordinator.load_more_messages(peer);
                let _ = reply.send(result.map_err(Into::into));
            }
            Command::RemovePeer(peer, reply) => {
                let result = self.coordinator.remove_peer(peer).map(|out| self.perform(out));
                let _ = reply.send(result.map_err(Into::into));
            }
            Command::RemoveAllPeers(reply) => {
                let result = self
                    .coordinator
                    .remove_all_peers()
                    .map(|out| self.perform(out));
                let _ = reply.send(result.map_err(Into::into));
            }
            Command::RemoveAllMessages(reply) => {
                let result = self.coordinator.remove_all_messages();
                let _ = reply.send(result.map_err(Into::into));
            }
            Command::ResendIntroduction(peer, reply) => {
                let _ = reply.send(Ok(self.coordinator.send_introduction(peer)));
            }
            Command::Subscribe(peer, reply) => {
                let _ = reply.send(Ok(self.coordinator.subscribe(peer)));
            }
            Command::Peers(reply) => {
                let _ = reply.send(Ok(self.coordinator.peers()));
            }
            Command::KnownPeers(reply) => {
                let result = self.coordinator.known_peers();
                let _ = reply.send(result.map_err(Into::into));
            }
            Command::Shutdown(reply) => {
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn perform(&mut self, outputs: Vec<Output>) {
        for output in outputs {
            match output {
                Output::Schedule { after, timer } => self.schedule(after, timer),
                Output::Notify(notification) => {
                    self.resolve_waiters(&notification);
                    // No receivers is fine; notifications are advisory.
                    let _ = self.notifications.send(notification);
                }
            }
        }
    }

    fn schedule(&self, after: std::time::Duration, timer: Timer) {
        let inbox = self.timers.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(tx) = inbox.upgrade() {
                let _ = tx.send(Command::Event(Event::Timer(timer)));
            }
        });
    }

    fn resolve_waiters(&mut self, notification: &Notification) {
        let (peer, result) = match notification {
            Notification::PeerConnected { peer } => (*peer, Ok(())),
            Notification::CouldNotConnect { peer, failure } => (*peer, Err(failure.clone())),
            Notification::PeerRemoved { peer } | Notification::PeerLost { peer } => {
                (*peer, Err(ConnectFailure::NotConnected))
            }
            _ => return,
        };
        if let Some(waiters) = self.waiters.remove(&peer) {
            for reply in waiters {
                let _ = reply.send(result.clone().map_err(Into::into));
            }
        }
    }
}
