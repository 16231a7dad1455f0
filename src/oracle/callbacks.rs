//! Signing-network callbacks of the DLC module.

use super::keeper;
use crate::collaborators::{CallbackEvent, CallbackHandler, Context, SigningIntent};
use crate::error::{LendingError, LendingResult};

/// Feeds DKG results and oracle attestations back into the oracle keeper.
pub struct DlcCallbacks;

fn event_id(scope_id: &str) -> LendingResult<u64> {
    scope_id
        .parse()
        .map_err(|_| LendingError::validation(format!("invalid dlc event id {}", scope_id)))
}

impl CallbackHandler for DlcCallbacks {
    fn handle(&self, ctx: &mut Context<'_>, event: &CallbackEvent) -> LendingResult<()> {
        match event {
            CallbackEvent::DkgCompletionReceived { dkg_id, participant } => {
                keeper::on_dkg_completion_received(ctx.store, *dkg_id, participant)
            }
            CallbackEvent::DkgCompleted { dkg_id, pub_keys } => {
                keeper::on_dkg_completed(ctx.store, *dkg_id, pub_keys, ctx.now)
            }
            CallbackEvent::DkgTimeout {
                dkg_id,
                absent_participants,
            } => keeper::on_dkg_timeout(ctx.store, *dkg_id, absent_participants),
            CallbackEvent::SigningCompleted {
                request_id,
                scope_id,
                intent: SigningIntent::DlcAttestation,
                signatures,
            } => {
                let event_id = event_id(scope_id)?;
                let dlc_event = keeper::get_event(ctx.store, event_id)?;
                if dlc_event.signing_request_id != Some(*request_id) {
                    return Err(LendingError::conflict(format!(
                        "request {} is not the attestation request of event {}",
                        request_id, event_id
                    )));
                }
                let signature = match signatures.as_slice() {
                    [signature] => signature,
                    _ => {
                        return Err(LendingError::validation(format!(
                            "attestation of event {} needs exactly one signature, got {}",
                            event_id,
                            signatures.len()
                        )))
                    }
                };
                keeper::handle_attestation(ctx.store, event_id, signature, ctx.now).map(|_| ())
            }
            CallbackEvent::SigningTimeout {
                request_id,
                scope_id,
                intent: SigningIntent::DlcAttestation,
            } => keeper::retry_attestation(ctx, event_id(scope_id)?, *request_id).map(|_| ()),
            _ => Err(LendingError::validation(format!(
                "dlc module does not handle {}",
                event.kind()
            ))),
        }
    }
}
