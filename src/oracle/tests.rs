//! Oracle lifecycle tests: DKG rounds, the nonce queue and attestations.

#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::adaptor;
    use crate::collaborators::CallbackEvent;
    use crate::config::{modules, Params};
    use crate::error::LendingError;
    use crate::store::MemStore;
    use crate::testing::{bootstrap, test_params, TestEngine};
    use rust_decimal::Decimal;

    const T0: i64 = 1_700_000_000;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str_exact(s).unwrap()
    }

    fn engine() -> TestEngine {
        bootstrap(test_params(), T0).unwrap().0
    }

    #[test]
    fn test_bootstrap_registers_keys_and_nonces() {
        let engine = engine();
        let oracle = keeper::current_oracle(&engine.store).unwrap();
        assert_eq!(oracle.nonce_index, 4);
        assert_eq!(oracle.participants.len(), 3);
        assert_eq!(keeper::get_dcms(&engine.store).unwrap().len(), 1);

        let pending = keeper::get_events_by_status(&engine.store, DlcEventStatus::Pending).unwrap();
        assert_eq!(pending.iter().map(|e| e.id).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert!(pending.iter().all(|e| e.pub_key == oracle.pub_key));
        assert_eq!(keeper::get_nonce(&engine.store, oracle.id, 1).unwrap().nonce, pending[0].nonce);
    }

    #[test]
    fn test_lending_events_are_fifo() {
        let mut engine = engine();
        let ids: Vec<u64> = (0..3)
            .map(|_| {
                engine
                    .execute(T0, |ctx| keeper::get_available_lending_event(ctx.store))
                    .unwrap()
                    .unwrap()
                    .id
            })
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(keeper::get_event(&engine.store, 1).unwrap().status, DlcEventStatus::Active);
    }

    #[test]
    fn test_queue_refilled_below_threshold() {
        let mut engine = engine();
        for _ in 0..3 {
            engine
                .execute(T0, |ctx| keeper::get_available_lending_event(ctx.store))
                .unwrap();
        }

        let report = engine.tick(T0 + 1).unwrap();
        assert!(report.nonce_dkg.is_some());
        // One batch in flight at a time
        assert_eq!(engine.tick(T0 + 2).unwrap().nonce_dkg, None);

        engine.run_signer(T0 + 2).unwrap();
        let pending = keeper::get_events_by_status(&engine.store, DlcEventStatus::Pending).unwrap();
        assert_eq!(pending.len(), 5);
        assert_eq!(pending[0].id, 4);
    }

    #[test]
    fn test_exhausted_queue() {
        let mut engine = engine();
        for _ in 0..4 {
            engine
                .execute(T0, |ctx| keeper::get_available_lending_event(ctx.store))
                .unwrap();
        }
        let next = engine
            .execute(T0, |ctx| keeper::get_available_lending_event(ctx.store))
            .unwrap();
        assert!(next.is_none());
        assert!(matches!(
            engine.new_date_event(T0),
            Err(LendingError::NoAvailableDlcEvent)
        ));
    }

    #[test]
    fn test_duplicate_dkg_completion_rejected() {
        let mut engine = engine();
        let dkg_id = engine.create_dcm(T0, vec!["a".to_string(), "b".to_string()], 2).unwrap();
        let events = engine.signer.complete_dkg(dkg_id).unwrap();
        let (module, first) = &events[0];
        engine.deliver(module, first, T0).unwrap();
        assert!(matches!(
            engine.deliver(module, first, T0),
            Err(LendingError::Conflict { .. })
        ));

        let stranger = CallbackEvent::DkgCompletionReceived {
            dkg_id,
            participant: "mallory".to_string(),
        };
        assert!(matches!(
            engine.deliver(modules::DLC, &stranger, T0),
            Err(LendingError::Validation { .. })
        ));
    }

    #[test]
    fn test_nonce_dkg_timeout_marks_absent_participants() {
        let mut engine = engine();
        let dkg_id = engine.execute(T0, keeper::request_nonces).unwrap();
        let (module, event) = engine.signer.timeout_dkg(dkg_id, &["val2"]).unwrap();
        engine.deliver(&module, &event, T0).unwrap();

        assert_eq!(keeper::get_dkg(&engine.store, dkg_id).unwrap().status, DkgStatus::TimedOut);
        assert!(!keeper::get_liveness(&engine.store, "val2").unwrap().unwrap().alive);
        assert!(keeper::get_liveness(&engine.store, "val1").unwrap().unwrap().alive);

        let narrow = Params {
            oracle_participant_num: 2,
            ..test_params()
        };
        for seed in 0..5 {
            let mut selected = keeper::select_participants(&engine.store, &narrow, seed).unwrap();
            selected.sort();
            assert_eq!(selected, vec!["val1".to_string(), "val3".to_string()]);
        }

        // Too few alive: fall back to the whole allowed set
        let selected = keeper::select_participants(&engine.store, &test_params(), 7).unwrap();
        assert_eq!(selected.len(), 3);
    }

    #[test]
    fn test_participant_selection_is_deterministic() {
        let store = MemStore::new();
        let params = Params {
            oracle_participants: (0..10).map(|i| format!("val{}", i)).collect(),
            oracle_participant_num: 4,
            oracle_threshold: 3,
            ..Params::default()
        };
        let first = keeper::select_participants(&store, &params, T0).unwrap();
        assert_eq!(first.len(), 4);
        assert_eq!(first, keeper::select_participants(&store, &params, T0).unwrap());

        let few = Params {
            oracle_participants: vec!["val0".to_string()],
            ..params
        };
        assert!(matches!(
            keeper::select_participants(&store, &few, T0),
            Err(LendingError::Insufficient { .. })
        ));
    }

    #[test]
    fn test_price_event_attestation() {
        let mut engine = engine();
        engine.prices.set_price("BTCUSDT", dec("65432.1234"));
        let event = engine.new_price_event(T0, "BTCUSDT").unwrap();
        assert_eq!(event.kind, DlcEventKind::Price);
        assert_eq!(event.outcomes, vec!["BTCUSDT:65432.1".to_string()]);
        assert_eq!(event.status, DlcEventStatus::Triggered);

        engine.run_signer(T0).unwrap();
        let attestation = keeper::get_attestation(&engine.store, event.id).unwrap().unwrap();
        assert_eq!(attestation.outcome, "BTCUSDT:65432.1");
        assert_eq!(keeper::get_event(&engine.store, event.id).unwrap().status, DlcEventStatus::Attested);

        // The attestation reveals the discrete log of the outcome's point
        let event = keeper::get_event(&engine.store, event.id).unwrap();
        let secret = keeper::attestation_secret(&attestation).unwrap();
        assert_eq!(
            adaptor::secret_to_pubkey(&secret),
            keeper::get_signature_point_from_event(&event, 0).unwrap()
        );

        assert!(matches!(
            keeper::handle_attestation(&mut engine.store, event.id, &attestation.signature, T0),
            Err(LendingError::AttestationExists { .. })
        ));
    }

    #[test]
    fn test_attestation_checks() {
        let mut engine = engine();
        let pending = keeper::get_events_by_status(&engine.store, DlcEventStatus::Pending).unwrap();
        let signature = "11".repeat(64);
        assert!(matches!(
            keeper::handle_attestation(&mut engine.store, pending[0].id, &signature, T0),
            Err(LendingError::EventNotTriggered { .. })
        ));
        assert!(matches!(
            keeper::handle_attestation(&mut engine.store, 999, &signature, T0),
            Err(LendingError::NotFound { .. })
        ));

        let event = engine.new_date_event(T0).unwrap();
        assert_eq!(event.outcomes, vec!["2023-11-14".to_string()]);

        engine.run_signer(T0).unwrap();
        let foreign = keeper::get_attestation(&engine.store, event.id).unwrap().unwrap();

        // Valid signature, but under another event's nonce
        let other = engine.new_date_event(T0 + 86_400).unwrap();
        let err = keeper::handle_attestation(&mut engine.store, other.id, &foreign.signature, T0)
            .unwrap_err();
        assert!(err.is_security_critical());
        assert!(keeper::get_attestation(&engine.store, other.id).unwrap().is_none());
    }

    #[test]
    fn test_attestation_timeout_is_retried() {
        let mut engine = engine();
        let event = engine.new_date_event(T0).unwrap();
        let request_id = event.signing_request_id.unwrap();

        let (module, timeout) = engine.signer.timeout_signing(request_id).unwrap();
        assert_eq!(module, modules::DLC);
        engine.deliver(&module, &timeout, T0 + 1).unwrap();

        let retried = keeper::get_event(&engine.store, event.id).unwrap();
        assert_eq!(retried.status, DlcEventStatus::Triggered);
        assert_ne!(retried.signing_request_id, Some(request_id));

        // The stale request can no longer complete
        assert!(engine.deliver(&module, &timeout, T0 + 1).is_err());
        engine.run_signer(T0 + 1).unwrap();
        assert!(keeper::get_attestation(&engine.store, event.id).unwrap().is_some());
    }

    #[test]
    fn test_trigger_is_idempotent() {
        let mut engine = engine();
        let event = engine.new_date_event(T0).unwrap();
        engine
            .execute(T0 + 5, |ctx| keeper::trigger_dlc_event(ctx, event.id, 0))
            .unwrap();
        let again = keeper::get_event(&engine.store, event.id).unwrap();
        assert_eq!(again.triggered_at, Some(T0));
        assert_eq!(again.signing_request_id, event.signing_request_id);
    }

    #[test]
    fn test_normalize_price() {
        assert_eq!(keeper::normalize_price(dec("12345.678"), 6).unwrap(), dec("12345.7"));
        assert_eq!(keeper::normalize_price(dec("0.000123456789"), 6).unwrap(), dec("0.000123457"));
        assert_eq!(keeper::normalize_price(dec("100.000"), 6).unwrap().to_string(), "100");
        assert_eq!(keeper::normalize_price(dec("987654321"), 3).unwrap(), dec("988000000"));
        assert_eq!(keeper::normalize_price(Decimal::ZERO, 6).unwrap(), Decimal::ZERO);
        assert!(keeper::normalize_price(dec("-1"), 6).is_err());
        assert!(keeper::normalize_price(dec("1"), 0).is_err());
    }
}
