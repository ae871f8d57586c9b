use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use serde::Serialize;
use snapask_core::{PartyId, Role, Seq, ServerMessage};
use thiserror::Error;
use tokio::sync::{RwLock, mpsc};
use tracing::{info, warn};

/// Server-side identity of one accepted socket.
pub type ConnectionId = u64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection {0} is already registered")]
    DuplicateConnection(ConnectionId),
    #[error("unknown party {0}")]
    UnknownParty(PartyId),
}

/// A registered party as seen by the router and broadcaster.
///
/// Clones share the outbound queue and the delivery watermark.
#[derive(Debug, Clone)]
pub struct Party {
    pub id: PartyId,
    pub role: Role,
    pub connection_id: ConnectionId,
    pub name: Option<String>,
    tx: mpsc::UnboundedSender<ServerMessage>,
    last_delivered: Arc<AtomicU64>,
}

impl Party {
    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    pub(crate) fn send(&self, message: ServerMessage) -> bool {
        self.tx.send(message).is_ok()
    }

    /// Advances the delivery watermark; false when `seq` is older than one already delivered.
    pub(crate) fn advance_watermark(&self, seq: Seq) -> bool {
        let previous = self.last_delivered.fetch_max(seq, Ordering::SeqCst);
        seq >= previous
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct PartyCounts {
    pub controllers: usize,
    pub overlays: usize,
}

#[derive(Debug, Default)]
struct RegistryState {
    parties: HashMap<PartyId, Party>,
    by_connection: HashMap<ConnectionId, PartyId>,
    next_party_id: PartyId,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    state: Arc<RwLock<RegistryState>>,
    overlay_present: Arc<AtomicBool>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(
        &self,
        connection_id: ConnectionId,
        role: Role,
        name: Option<String>,
        tx: mpsc::UnboundedSender<ServerMessage>,
    ) -> Result<PartyId, RegistryError> {
        let mut state = self.state.write().await;
        if state.by_connection.contains_key(&connection_id) {
            warn!(connection_id, "duplicate registration rejected");
            return Err(RegistryError::DuplicateConnection(connection_id));
        }

        state.next_party_id += 1;
        let id = state.next_party_id;
        state.parties.insert(
            id,
            Party {
                id,
                role,
                connection_id,
                name,
                tx,
                last_delivered: Arc::new(AtomicU64::new(0)),
            },
        );
        state.by_connection.insert(connection_id, id);
        if role == Role::Overlay {
            self.overlay_present.store(true, Ordering::SeqCst);
        }
        drop(state);

        info!(party_id = id, connection_id, %role, "party registered");
        Ok(id)
    }

    pub async fn unregister(&self, party_id: PartyId) -> Result<(), RegistryError> {
        let mut state = self.state.write().await;
        let Some(party) = state.parties.remove(&party_id) else {
            warn!(party_id, "unregister for unknown party");
            return Err(RegistryError::UnknownParty(party_id));
        };
        state.by_connection.remove(&party.connection_id);
        let overlays_left = state.parties.values().any(|p| p.role == Role::Overlay);
        self.overlay_present.store(overlays_left, Ordering::SeqCst);
        drop(state);

        info!(party_id, role = %party.role, "party unregistered");
        Ok(())
    }

    pub async fn list(&self, role: Role) -> Vec<PartyId> {
        let state = self.state.read().await;
        let mut ids = state
            .parties
            .values()
            .filter(|party| party.role == role)
            .map(|party| party.id)
            .collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }

    pub async fn is_alive(&self, party_id: PartyId) -> bool {
        self.state
            .read()
            .await
            .parties
            .get(&party_id)
            .is_some_and(Party::is_alive)
    }

    pub async fn get(&self, party_id: PartyId) -> Result<Party, RegistryError> {
        self.state
            .read()
            .await
            .parties
            .get(&party_id)
            .cloned()
            .ok_or(RegistryError::UnknownParty(party_id))
    }

    pub(crate) async fn parties_with_role(&self, role: Role) -> Vec<Party> {
        let state = self.state.read().await;
        state
            .parties
            .values()
            .filter(|party| party.role == role)
            .cloned()
            .collect()
    }

    pub fn overlay_present(&self) -> bool {
        self.overlay_present.load(Ordering::SeqCst)
    }

    pub async fn counts(&self) -> PartyCounts {
        let state = self.state.read().await;
        state
            .parties
            .values()
            .fold(PartyCounts::default(), |mut counts, party| {
                match party.role {
                    Role::Controller => counts.controllers += 1,
                    Role::Overlay => counts.overlays += 1,
                }
                counts
            })
    }
}
