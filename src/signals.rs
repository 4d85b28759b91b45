//! Module to coordinate shutdown in hopper.
//!
//! Hopper runs multiple workloads concurrently and must wind them all down
//! when the run ends, whether because every workload ran out its clock or
//! because the user interrupted the process. The mechanism here has two
//! components, a [`Broadcaster`] and a [`Watcher`]. The `Broadcaster` is
//! responsible for signaling the `Watcher` instances that shutdown has begun.
//! This is a one-time event. The `Watcher` is responsible for waiting for the
//! signal to be sent.
//!
//! There is only one `Broadcaster` and potentially many `Watcher` instances.

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use tokio::sync::{
    Notify,
    broadcast::{self, error},
};
use tracing::info;

/// Construct a `Watcher` and `Broadcaster` pair.
#[must_use]
pub fn signal() -> (Watcher, Broadcaster) {
    let (sender, receiver) = broadcast::channel(1);
    let peers = Arc::new(AtomicU32::new(1));
    let notify = Arc::new(Notify::new());

    let w = Watcher {
        peers: Arc::clone(&peers),
        receiver,
        signal_received: false,
        notify: Arc::clone(&notify),
        peer_count_decreased: false,
        registered: true,
    };

    let b = Broadcaster {
        peers,
        sender,
        notify,
    };

    (w, b)
}

#[derive(Debug)]
/// Mechanism to notify one or more `Watcher` instances that shutdown has
/// begun.
pub struct Broadcaster {
    /// The total number of peers subscribed to this `Broadcaster`. Used by
    /// this struct to understand when all `Watcher` instances have dropped
    /// off.
    peers: Arc<AtomicU32>,
    /// Transmission point for the signal to `Watcher` instances.
    sender: broadcast::Sender<()>,
    /// Allow the `Watchers` to notify `Broadcaster` that they have logged off.
    notify: Arc<Notify>,
}

impl Broadcaster {
    /// Send the signal through any `Watcher` instances.
    ///
    /// Function will NOT block until all peers have ack'ed the signal.
    pub fn signal(self) {
        drop(self.sender);
    }

    /// Send the signal through to any `Watcher` instances.
    ///
    /// Function WILL block until all peers have ack'ed the signal.
    pub async fn signal_and_wait(self) {
        drop(self.sender);

        // Register for notification, check the condition, then await. In that
        // order: if we checked first a peer could decrement and notify between
        // our check and registration, losing the wakeup.
        loop {
            let notified = self.notify.notified();

            let peers = self.peers.load(Ordering::SeqCst);
            if peers == 0 {
                break;
            }
            info!("Waiting for {peers} peers");

            notified.await;
        }
    }
}

/// Errors for `Watcher::register`.
#[derive(thiserror::Error, Debug, Clone, Copy)]
pub enum RegisterError {
    /// The signal has been received and yet `register` was called.
    #[error("signal has been received")]
    SignalReceived,
}

#[derive(Debug)]
/// Mechanism to watch for the shutdown signal.
pub struct Watcher {
    /// Used to track if the signal has been received without synchronization.
    signal_received: bool,
    /// Record whether the peer count of this Watcher has been decreased.
    peer_count_decreased: bool,
    /// The total number of peers subscribed to the `Broadcaster`. Used by this
    /// struct not to observe other `Watcher` instances but to inform
    /// `Broadcaster` of the existence/lack-of of this instance.
    peers: Arc<AtomicU32>,
    /// Transmission point for the signal from `Broadcaster`.
    receiver: broadcast::Receiver<()>,
    /// Allow the `Watchers` to notify `Broadcaster` that they have logged off.
    notify: Arc<Notify>,
    /// Whether the `Broadcaster` is aware of this instance's existence and
    /// will wait via `signal_and_wait` for it to terminate.
    registered: bool,
}

impl Watcher {
    /// Decrease the peer count in the `Broadcaster`, allowing the
    /// `Broadcaster` to unblock if waiting for peers. See
    /// `Broadcaster::signal_and_wait`.
    fn decrease_peer_count(&mut self) {
        if !self.registered {
            // An unregistered instance is not waited on and has no count to
            // give back.
            return;
        }

        if self.peer_count_decreased {
            return;
        }

        // Why not fetch_sub? That function overflows at the zero boundary and
        // we don't want the peer count to suddenly be u32::MAX.
        let mut old = self.peers.load(Ordering::Relaxed);
        while old > 0 {
            match self.peers.compare_exchange_weak(
                old,
                old - 1,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.notify.notify_waiters();
                    break;
                }
                Err(x) => old = x,
            }
        }
        self.peer_count_decreased = true;
    }

    /// Receive the shutdown notice. This function will block if a notice has
    /// not already been sent.
    ///
    /// If `recv` is called multiple times after the signal has been received
    /// this function will return immediately.
    ///
    /// # Panics
    ///
    /// Panics if the broadcast receiver has lagged behind, indicating a
    /// catastrophic programming error in the signal coordination.
    pub async fn recv(mut self) {
        if self.signal_received {
            // Once the signal is received, if this function were called in a
            // `select!` it might drown out every other arm.
            tokio::task::yield_now().await;
            return;
        }

        match self.receiver.recv().await {
            Ok(()) | Err(error::RecvError::Closed) => {
                self.decrease_peer_count();
                self.signal_received = true;
            }
            Err(error::RecvError::Lagged(_)) => {
                panic!("Catastrophic programming error: lagged behind");
            }
        }
    }

    /// Register with the `Broadcaster`, returning a new instance of `Watcher`.
    ///
    /// # Errors
    ///
    /// Returns `RegisterError::SignalReceived` if the signal has already been
    /// received by this watcher, preventing registration of new watchers
    /// after shutdown.
    pub fn register(&self) -> Result<Self, RegisterError> {
        if self.signal_received {
            return Err(RegisterError::SignalReceived);
        }

        self.peers.fetch_add(1, Ordering::SeqCst);

        Ok(Self {
            peers: Arc::clone(&self.peers),
            receiver: self.receiver.resubscribe(),
            signal_received: self.signal_received,
            notify: Arc::clone(&self.notify),
            // Do not copy existing peer count decreased state as this new
            // peer is independent.
            peer_count_decreased: false,
            registered: true,
        })
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.decrease_peer_count();
    }
}

impl Clone for Watcher {
    fn clone(&self) -> Self {
        Self {
            peers: Arc::clone(&self.peers),
            receiver: self.receiver.resubscribe(),
            signal_received: self.signal_received,
            notify: Arc::clone(&self.notify),
            // Do not copy existing peer count decreased state as this new
            // peer is independent.
            peer_count_decreased: false,
            registered: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::signal;

    #[tokio::test]
    async fn basic_signal() {
        let (watcher, broadcaster) = signal();

        let watcher_handle = tokio::spawn(watcher.recv());

        broadcaster.signal_and_wait().await;

        watcher_handle.await.expect("watcher task panicked");
    }

    #[tokio::test]
    async fn multiple_watchers() {
        let (watcher1, broadcaster) = signal();
        let watcher2 = watcher1.register().expect("registration failed");

        let handle1 = tokio::spawn(watcher1.recv());
        let handle2 = tokio::spawn(watcher2.recv());

        broadcaster.signal_and_wait().await;

        handle1.await.expect("watcher task panicked");
        handle2.await.expect("watcher task panicked");
    }

    #[tokio::test]
    async fn unregistered_watcher_does_not_block_shutdown() {
        let (watcher, broadcaster) = signal();
        // Clones are unregistered and must not deadlock signal_and_wait even
        // though they never call recv.
        let _unregistered = watcher.clone();
        drop(watcher);

        broadcaster.signal_and_wait().await;
    }

    #[tokio::test]
    async fn signal_without_watchers() {
        let (watcher, broadcaster) = signal();
        drop(watcher);

        broadcaster.signal();
    }
}
