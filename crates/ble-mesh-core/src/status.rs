//! Status stream: a coarse-grained summary of the core's current
//! connectivity, published over a `tokio::sync::watch` channel so UI and
//! diagnostics code can observe it without polling. `watch` is the natural
//! fit here since only the latest status ever matters to an observer.

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreStatus {
    Disconnected,
    Scanning,
    Connecting,
    Handshaking,
    Ready,
    Reconnecting,
    Failed,
}

pub struct StatusPublisher {
    sender: watch::Sender<CoreStatus>,
}

impl StatusPublisher {
    pub fn new(initial: CoreStatus) -> (Self, watch::Receiver<CoreStatus>) {
        let (sender, receiver) = watch::channel(initial);
        (Self { sender }, receiver)
    }

    pub fn set(&self, status: CoreStatus) {
        // `send` only errors when every receiver has been dropped; the
        // core has nothing useful to do about that, so it is ignored.
        let _ = self.sender.send(status);
    }

    pub fn current(&self) -> CoreStatus {
        *self.sender.borrow()
    }
}
