use std::sync::{Arc, Mutex};

use snapask_core::{CommandError, CommandKind, PartyId, Role, Seq, parse_command};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::registry::{ConnectionRegistry, RegistryError};

/// A validated, sequenced command. Consumed exactly once by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub seq: Seq,
    pub kind: CommandKind,
    pub question: Option<String>,
    pub origin: PartyId,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouterError {
    #[error(transparent)]
    Invalid(#[from] CommandError),
    #[error("{role} parties may not submit `{kind}` commands")]
    Forbidden { role: Role, kind: CommandKind },
    #[error(transparent)]
    Connection(#[from] RegistryError),
    #[error("pipeline is not accepting commands")]
    PipelineClosed,
}

#[derive(Debug, Clone)]
pub struct CommandRouter {
    registry: ConnectionRegistry,
    // Held across numbering and enqueueing so queue order always matches seq order.
    sequencer: Arc<Mutex<Sequencer>>,
}

#[derive(Debug)]
struct Sequencer {
    next_seq: Seq,
    queue: mpsc::UnboundedSender<Command>,
}

impl CommandRouter {
    pub fn new(registry: ConnectionRegistry, queue: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            registry,
            sequencer: Arc::new(Mutex::new(Sequencer { next_seq: 1, queue })),
        }
    }

    /// Validates `raw`, sequences it and hands it to the pipeline.
    ///
    /// Sequence numbers are only consumed by commands that are actually enqueued.
    pub async fn submit(&self, raw: &str, from: PartyId) -> Result<Command, RouterError> {
        let party = self.registry.get(from).await?;
        let request = parse_command(raw)?;

        if party.role == Role::Overlay && request.kind != CommandKind::Query {
            warn!(party_id = from, kind = %request.kind, "forbidden command from overlay");
            return Err(RouterError::Forbidden {
                role: party.role,
                kind: request.kind,
            });
        }

        let command = {
            let mut sequencer = self
                .sequencer
                .lock()
                .map_err(|_| RouterError::PipelineClosed)?;
            let command = Command {
                seq: sequencer.next_seq,
                kind: request.kind,
                question: request.question,
                origin: from,
            };
            sequencer
                .queue
                .send(command.clone())
                .map_err(|_| RouterError::PipelineClosed)?;
            sequencer.next_seq += 1;
            command
        };
        debug!(seq = command.seq, kind = %command.kind, party_id = from, "command enqueued");
        Ok(command)
    }
}
