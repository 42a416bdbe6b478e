//! Service controller — the in-process message bus.
//!
//! One dispatcher task reads a bounded FIFO mailbox. Messages addressed to
//! [`CONTROLLER_ID`] are control commands (`set_worker`, `exit`) handled by
//! the dispatcher itself; everything else is forwarded to the addressed
//! service's `exec`, one message at a time, in arrival order.
//!
//! Services talk to the bus through a [`BusHandle`], which only holds the
//! sending side of the mailbox.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use futures::future::join_all;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::command::{Command, Reply, ServiceMessage};
use crate::error::BusError;
use crate::service::BackgroundService;

/// Address of the controller itself.
pub const CONTROLLER_ID: &str = "Controller";

const MAILBOX_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Envelope {
    service_id: String,
    message: ServiceMessage,
}

type Services = Arc<RwLock<HashMap<String, Arc<dyn BackgroundService>>>>;

/// Cloneable sending side of the bus.
#[derive(Debug, Clone)]
pub struct BusHandle {
    sender: mpsc::Sender<Envelope>,
}

impl BusHandle {
    /// Fire-and-forget.
    pub async fn dispatch(&self, service_id: &str, command: Command) -> Result<(), BusError> {
        self.send(service_id, ServiceMessage::new(command)).await
    }

    /// Dispatch and suspend until the target replies.
    pub async fn dispatch_and_wait(&self, service_id: &str, command: Command) -> Result<Reply, BusError> {
        let name = command.name();
        let (message, rx) = ServiceMessage::expect_returns(command);
        self.send(service_id, message).await?;
        rx.await.map_err(|_| BusError::NoReply {
            service: service_id.to_string(),
            command: name.to_string(),
        })
    }

    /// Ask the controller to scale `service_id` to `count` workers.
    pub async fn set_worker_count(&self, service_id: &str, count: u16) -> Result<(), BusError> {
        let command = Command::SetWorker { service_id: service_id.to_string(), count };
        match self.dispatch_and_wait(CONTROLLER_ID, command).await? {
            Reply::Ack => Ok(()),
            Reply::Rejected(reason) | Reply::Failed(reason) => Err(BusError::Rejected(reason)),
            other => Err(BusError::UnexpectedReply {
                command: "set_worker".into(),
                reply: format!("{other:?}"),
            }),
        }
    }

    /// Stop the bus. Irreversible.
    pub async fn exit(&self) -> Result<(), BusError> {
        self.dispatch(CONTROLLER_ID, Command::Exit).await
    }

    async fn send(&self, service_id: &str, message: ServiceMessage) -> Result<(), BusError> {
        self.sender
            .send(Envelope { service_id: service_id.to_string(), message })
            .await
            .map_err(|_| BusError::Closed)
    }
}

pub struct ServiceController {
    services: Services,
    handle: BusHandle,
    mailbox: Mutex<Option<mpsc::Receiver<Envelope>>>,
    exited: Arc<watch::Sender<bool>>,
}

impl Default for ServiceController {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceController {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel(MAILBOX_CAPACITY);
        let (exited, _) = watch::channel(false);
        Self {
            services: Arc::new(RwLock::new(HashMap::new())),
            handle: BusHandle { sender },
            mailbox: Mutex::new(Some(receiver)),
            exited: Arc::new(exited),
        }
    }

    pub fn handle(&self) -> BusHandle {
        self.handle.clone()
    }

    pub fn register(&self, service: Arc<dyn BackgroundService>) -> Result<(), BusError> {
        let id = service.service_id().to_string();
        let mut services = self.services.write().unwrap();
        if services.contains_key(&id) {
            return Err(BusError::DuplicateService(id));
        }
        debug!(service = %id, "service registered");
        services.insert(id, service);
        Ok(())
    }

    pub fn service(&self, service_id: &str) -> Option<Arc<dyn BackgroundService>> {
        self.services.read().unwrap().get(service_id).cloned()
    }

    pub fn service_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.services.read().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn dispatch(&self, service_id: &str, command: Command) -> Result<(), BusError> {
        self.handle.dispatch(service_id, command).await
    }

    pub async fn dispatch_and_wait(&self, service_id: &str, command: Command) -> Result<Reply, BusError> {
        self.handle.dispatch_and_wait(service_id, command).await
    }

    pub async fn set_worker_count(&self, service_id: &str, count: u16) -> Result<(), BusError> {
        self.handle.set_worker_count(service_id, count).await
    }

    pub fn is_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Start the dispatcher (once). With `background = true`, also suspend
    /// until the bus exits.
    pub async fn run(&self, background: bool) {
        let mailbox = self.mailbox.lock().unwrap().take();
        if let Some(mailbox) = mailbox {
            info!("service controller started");
            tokio::spawn(dispatch_loop(mailbox, self.services.clone(), self.exited.clone()));
        }
        if background {
            self.wait_exit().await;
        }
    }

    /// Suspend until the bus has exited.
    pub async fn wait_exit(&self) {
        let mut rx = self.exited.subscribe();
        let _ = rx.wait_for(|exited| *exited).await;
    }
}

async fn dispatch_loop(
    mut mailbox: mpsc::Receiver<Envelope>,
    services: Services,
    exited: Arc<watch::Sender<bool>>,
) {
    while let Some(Envelope { service_id, message }) = mailbox.recv().await {
        if service_id == CONTROLLER_ID {
            if handle_control(&services, message).await {
                break;
            }
            continue;
        }
        let service = services.read().unwrap().get(&service_id).cloned();
        match service {
            Some(service) => service.exec(message).await,
            None => {
                // dropping the message wakes a waiter with NoReply
                warn!(service = %service_id, command = message.command.name(), "no such service");
            }
        }
    }
    mailbox.close();
    exited.send_replace(true);
    info!("service controller exited");
}

/// Returns `true` when the dispatcher must stop.
async fn handle_control(services: &Services, message: ServiceMessage) -> bool {
    match &message.command {
        Command::SetWorker { service_id, count } => {
            let service = services.read().unwrap().get(service_id).cloned();
            match service {
                Some(service) => {
                    service.set_worker(*count).await;
                    message.reply(Reply::Ack);
                }
                None => {
                    warn!(service = %service_id, "set_worker for unknown service");
                    let reason = format!("no service registered under '{service_id}'");
                    message.reply(Reply::Rejected(reason));
                }
            }
            false
        }
        Command::Exit => {
            info!("exit requested, stopping all services");
            let all: Vec<_> = services.read().unwrap().values().cloned().collect();
            join_all(all.iter().map(|s| s.shutdown())).await;
            message.reply(Reply::Ack);
            true
        }
        other => {
            let name = other.name();
            warn!(command = name, "controller ignores command");
            message.reply(Reply::Rejected(format!("controller does not handle '{name}'")));
            false
        }
    }
}
