//! In-process fan-out of registry events to live subscribers.
//!
//! The broker is a single task that owns the subscriber list. Publishing
//! never waits: a subscriber whose buffer is full misses the event, and one
//! that has gone away is dropped on the next publish.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinSet,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{digest::Digest, webhook::model::EventType};

const COMMAND_BUFFER: usize = 1024;

/// Something that happened to a repository.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub id: Uuid,
    pub kind: EventType,
    pub project: String,
    pub repository: String,
    pub digest: Digest,
    pub tag: Option<String>,
    pub media_type: String,
    pub size: u64,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
}

enum Command {
    Subscribe(mpsc::Sender<DomainEvent>),
    Publish(DomainEvent),
}

pub struct EventBroker {
    commands: mpsc::Sender<Command>,
    capacity: usize,
}

impl EventBroker {
    pub fn start(tasks: &mut JoinSet<Result<()>>, capacity: usize) -> Self {
        let (commands, mut rx) = mpsc::channel::<Command>(COMMAND_BUFFER);

        tasks.spawn(async move {
            let mut subscribers: Vec<mpsc::Sender<DomainEvent>> = Vec::new();

            while let Some(command) = rx.recv().await {
                match command {
                    Command::Subscribe(tx) => subscribers.push(tx),
                    Command::Publish(event) => {
                        subscribers.retain(|tx| match tx.try_send(event.clone()) {
                            Ok(()) => true,
                            Err(TrySendError::Full(_)) => {
                                warn!(event = %event.id, "Subscriber lagging, dropped event");
                                true
                            }
                            Err(TrySendError::Closed(_)) => false,
                        });
                    }
                }
            }

            Ok(())
        });

        Self {
            commands,
            capacity: capacity.max(1),
        }
    }

    pub fn publish(&self, event: DomainEvent) {
        match self.commands.try_send(Command::Publish(event)) {
            Ok(()) => {}
            Err(TrySendError::Full(Command::Publish(event))) => {
                warn!(event = %event.id, "Event broker busy, dropped event");
            }
            Err(_) => debug!("Event broker has stopped"),
        }
    }

    pub async fn subscribe(&self) -> Result<mpsc::Receiver<DomainEvent>> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.commands
            .send(Command::Subscribe(tx))
            .await
            .map_err(|_| anyhow::anyhow!("Event broker has stopped"))?;
        Ok(rx)
    }
}
