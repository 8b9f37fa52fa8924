use super::{ingress::Message, Config, Mailbox, Metrics, Worker};
use crate::driver::Driver;
use commonware_runtime::{Clock, Handle, Metrics as RuntimeMetrics, Spawner};
use futures::{
    channel::{mpsc, oneshot},
    StreamExt,
};
use rand::RngCore;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// A running worker.
struct Running {
    stop: oneshot::Sender<()>,
    handle: Handle<()>,
}

/// Owns one repair [Worker] per started queue.
pub struct Manager<E: Clock + Spawner + RuntimeMetrics + RngCore, D: Driver> {
    context: E,
    driver: D,
    cfg: Config,

    mailbox_receiver: mpsc::Receiver<Message>,
    workers: BTreeMap<String, Running>,

    metrics: Metrics,
}

impl<E: Clock + Spawner + RuntimeMetrics + RngCore, D: Driver> Manager<E, D> {
    /// Create a manager and the mailbox used to control it.
    pub fn new(context: E, driver: D, cfg: Config) -> (Self, Mailbox) {
        let (sender, mailbox_receiver) = mpsc::channel(cfg.mailbox_size);
        let metrics = Metrics::init(context.clone());
        let manager = Self {
            context,
            driver,
            cfg,
            mailbox_receiver,
            workers: BTreeMap::new(),
            metrics,
        };
        (manager, Mailbox::new(sender))
    }

    /// Process mailbox requests until every [Mailbox] is dropped, then stop all workers.
    pub fn start(self) -> Handle<()> {
        self.context.clone().spawn(|_| self.run())
    }

    async fn run(mut self) {
        while let Some(message) = self.mailbox_receiver.next().await {
            match message {
                Message::Start { queue, responder } => {
                    let id = queue.id();
                    if self.workers.contains_key(&id) {
                        let _ = responder.send(false);
                        continue;
                    }
                    let (stop, stopped) = oneshot::channel();
                    let driver = self.driver.clone();
                    let cfg = self.cfg.clone();
                    let metrics = self.metrics.clone();
                    let handle = self.context.with_label("worker").spawn(|context| async move {
                        Worker::new(context, driver, queue, cfg, metrics)
                            .run(stopped)
                            .await
                    });
                    self.workers.insert(id, Running { stop, handle });
                    self.metrics.running.set(self.workers.len() as i64);
                    let _ = responder.send(true);
                }
                Message::Stop { queue, responder } => {
                    let Some(running) = self.workers.remove(&queue) else {
                        let _ = responder.send(false);
                        continue;
                    };
                    Self::shutdown(&queue, running).await;
                    self.metrics.running.set(self.workers.len() as i64);
                    let _ = responder.send(true);
                }
                Message::Running { responder } => {
                    let _ = responder.send(self.workers.keys().cloned().collect());
                }
            }
        }

        debug!("mailbox closed");
        for (queue, running) in std::mem::take(&mut self.workers) {
            Self::shutdown(&queue, running).await;
        }
        self.metrics.running.set(0);
    }

    async fn shutdown(queue: &str, running: Running) {
        let _ = running.stop.send(());
        if let Err(err) = running.handle.await {
            warn!(queue, ?err, "repair worker exited abnormally");
        }
    }
}
