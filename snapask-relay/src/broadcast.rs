use snapask_core::{PartyId, ResultMessage, Role, ServerMessage};
use tracing::{debug, info, warn};

use crate::registry::{ConnectionRegistry, Party};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    /// Recipients skipped because they had already seen a newer result.
    pub stale: usize,
    /// Recipients that were gone by the time the result was ready.
    pub offline: usize,
}

#[derive(Debug, Clone)]
pub struct ResultBroadcaster {
    registry: ConnectionRegistry,
}

impl ResultBroadcaster {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self { registry }
    }

    /// Sends a pipeline result to its originator and to every registered overlay.
    ///
    /// Overlays only receive screenshot metadata, never the encoded image.
    pub async fn deliver(&self, result: ResultMessage, origin: PartyId) -> DeliveryReport {
        let mut report = DeliveryReport::default();

        match self.registry.get(origin).await {
            Ok(party) => {
                let message = if party.role == Role::Overlay {
                    strip_image(&result)
                } else {
                    result.clone()
                };
                send_in_order(&party, message, &mut report);
            }
            Err(_) => {
                debug!(party_id = origin, seq = ?result.seq, "originator gone; dropping its copy");
                report.offline += 1;
            }
        }

        if self.registry.overlay_present() {
            let overlay_copy = strip_image(&result);
            for overlay in self.registry.parties_with_role(Role::Overlay).await {
                if overlay.id == origin {
                    continue;
                }
                send_in_order(&overlay, overlay_copy.clone(), &mut report);
            }
        }

        info!(
            seq = ?result.seq,
            success = result.success,
            delivered = report.delivered,
            stale = report.stale,
            offline = report.offline,
            "result delivered"
        );
        report
    }

    /// Echoes a router rejection back to the sender only.
    pub async fn reject(&self, origin: PartyId, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        match self.registry.get(origin).await {
            Ok(party) => party.send(ServerMessage::Result(ResultMessage::rejected(reason))),
            Err(err) => {
                warn!(party_id = origin, "cannot echo rejection: {}", err);
                false
            }
        }
    }
}

fn strip_image(result: &ResultMessage) -> ResultMessage {
    ResultMessage {
        artifact: result.artifact.as_ref().map(|info| info.without_image()),
        ..result.clone()
    }
}

fn send_in_order(party: &Party, message: ResultMessage, report: &mut DeliveryReport) {
    if let Some(seq) = message.seq
        && !party.advance_watermark(seq)
    {
        debug!(party_id = party.id, seq, "dropping out-of-order result");
        report.stale += 1;
        return;
    }

    if party.send(ServerMessage::Result(message)) {
        report.delivered += 1;
    } else {
        report.offline += 1;
    }
}
