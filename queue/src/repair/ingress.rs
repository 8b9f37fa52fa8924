use crate::QueueDefinition;
use futures::{
    channel::{mpsc, oneshot},
    SinkExt,
};

/// Message types that can be sent to the [super::Mailbox].
pub enum Message {
    /// Start repairing a queue.
    ///
    /// The responder is sent `false` if the queue was already being repaired.
    Start {
        queue: QueueDefinition,
        responder: oneshot::Sender<bool>,
    },

    /// Stop repairing the queue with the given id.
    ///
    /// The responder is sent `false` if the queue was not being repaired. It is sent only after
    /// the worker has exited.
    Stop {
        queue: String,
        responder: oneshot::Sender<bool>,
    },

    /// List the ids of the queues being repaired.
    Running { responder: oneshot::Sender<Vec<String>> },
}

/// Ingress mailbox for [super::Manager].
#[derive(Clone)]
pub struct Mailbox {
    sender: mpsc::Sender<Message>,
}

impl Mailbox {
    pub(super) fn new(sender: mpsc::Sender<Message>) -> Self {
        Self { sender }
    }

    /// Start repairing `queue`.
    pub async fn start(&mut self, queue: QueueDefinition) -> bool {
        let (responder, receiver) = oneshot::channel();
        self.sender
            .send(Message::Start { queue, responder })
            .await
            .expect("mailbox closed");
        receiver.await.expect("manager dropped request")
    }

    /// Stop repairing the queue with id `queue`.
    pub async fn stop(&mut self, queue: String) -> bool {
        let (responder, receiver) = oneshot::channel();
        self.sender
            .send(Message::Stop { queue, responder })
            .await
            .expect("mailbox closed");
        receiver.await.expect("manager dropped request")
    }

    /// The ids of the queues being repaired, in sorted order.
    pub async fn running(&mut self) -> Vec<String> {
        let (responder, receiver) = oneshot::channel();
        self.sender
            .send(Message::Running { responder })
            .await
            .expect("mailbox closed");
        receiver.await.expect("manager dropped request")
    }
}
