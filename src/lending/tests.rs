//! End-to-end loan lifecycle tests against the in-memory collaborators.

#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::cet::{tx_from_hex, tx_to_hex, vault_utxos_from_deposit, CetKind, CetSubmission, VaultUtxo};
    use crate::collaborators::SigningIntent;
    use crate::config::Params;
    use crate::config::oracle::{OUTCOME_DEFAULT_LIQUIDATED, OUTCOME_LIQUIDATED, OUTCOME_REPAID};
    use crate::error::{LendingError, LendingResult};
    use crate::keys::KeyScheme;
    use crate::oracle::keeper as oracle_keeper;
    use crate::schnorr;
    use crate::testing::{bootstrap, btc_usdt_pool, test_params, TestBorrower, TestEngine};
    use bitcoin::Transaction;
    use rust_decimal::Decimal;

    const T0: i64 = 1_700_000_000;
    const MATURITY: i64 = 30 * 86_400;
    const PAIR: &str = "BTCUSDT";
    const POOL: &str = "btc-usdt";

    /// Everything a test needs about one borrower's loan.
    struct Setup {
        engine: TestEngine,
        borrower: TestBorrower,
        loan_id: String,
        deposit: Transaction,
        utxos: Vec<VaultUtxo>,
        cets: CetSubmission,
    }

    fn price(s: &str) -> Decimal {
        Decimal::from_str_exact(s).unwrap()
    }

    /// Oracle, DCM, nonces and a funded pool, then a 100k loan request
    /// against a 200k sat deposit with signed CETs ready to submit.
    fn setup() -> Setup {
        setup_with(test_params(), None)
    }

    /// Same as [`setup`] with custom params and an optional referrer the
    /// loan is applied under.
    fn setup_with(params: Params, referrer: Option<Referrer>) -> Setup {
        let (mut engine, dcm_id) = bootstrap(params, T0).unwrap();
        engine.prices.set_price(PAIR, price("1"));
        engine.create_pool(T0, POOL, btc_usdt_pool()).unwrap();
        engine.mint("lp", "usat", 1_000_000).unwrap();
        engine.supply(T0, POOL, "lp", 1_000_000).unwrap();
        if let Some(referrer) = &referrer {
            engine.register_referrer(T0, referrer.clone()).unwrap();
        }

        let borrower = TestBorrower::new("alice", 7).unwrap();
        let loan = engine
            .apply(
                T0,
                &ApplyRequest {
                    borrower: borrower.address.clone(),
                    borrower_pub_key: borrower.pub_key(),
                    borrower_auth_pub_key: borrower.auth_pub_key(),
                    pool_id: POOL.to_string(),
                    borrow_amount: 100_000,
                    maturity: MATURITY,
                    dcm_id,
                    referral_code: referrer.map(|r| r.referral_code),
                },
            )
            .unwrap();
        assert_eq!(loan.status, LoanStatus::Requested);

        let info = engine.cet_info(&loan.vault_address, Some(200_000)).unwrap();
        let deposit = borrower.deposit_tx(&info.vault, 200_000, 1).unwrap();
        let utxos = vault_utxos_from_deposit(&deposit, &info.vault.script_pubkey().unwrap());
        let cets = borrower.sign_cets(&info, &utxos).unwrap();

        Setup {
            engine,
            borrower,
            loan_id: loan.vault_address,
            deposit,
            utxos,
            cets,
        }
    }

    fn submit(s: &mut Setup, now: i64) -> LendingResult<Authorization> {
        let request = SubmitCetsRequest {
            borrower: s.borrower.address.clone(),
            loan_id: s.loan_id.clone(),
            deposit_txs: vec![tx_to_hex(&s.deposit)],
            cets: s.cets.clone(),
        };
        s.engine.submit_cets(now, &request)
    }

    fn confirm_deposit(s: &mut Setup, now: i64) {
        s.engine
            .submit_deposit(
                now,
                &DepositRequest {
                    vault_address: s.loan_id.clone(),
                    deposit_tx: tx_to_hex(&s.deposit),
                    block_hash: "00".repeat(32),
                    proof: vec![],
                },
            )
            .unwrap();
    }

    /// Submitted, confirmed and disbursed.
    fn open_loan() -> Setup {
        open(setup())
    }

    fn open(mut s: Setup) -> Setup {
        submit(&mut s, T0).unwrap();
        confirm_deposit(&mut s, T0);
        let report = s.engine.tick(T0 + 1).unwrap();
        assert!(report.failures.is_empty(), "{:?}", report.failures);
        assert_eq!(s.engine.loan(&s.loan_id).unwrap().status, LoanStatus::Open);
        s
    }

    #[test]
    fn test_apply_binds_oldest_lending_event() {
        let s = setup();
        let loan = s.engine.loan(&s.loan_id).unwrap();
        let event = oracle_keeper::get_event(&s.engine.store, loan.dlc_event_id).unwrap();
        assert_eq!(event.id, 1);
        assert_eq!(event.status, crate::oracle::DlcEventStatus::Active);
        assert!(loan.vault_address.starts_with("tb1p"));
    }

    #[test]
    fn test_submit_cets_authorizes_loan() {
        let mut s = setup();
        let authorization = submit(&mut s, T0).unwrap();
        assert_eq!(authorization.status, AuthorizationStatus::Authorized);
        assert_eq!(authorization.deposit_txs, vec![s.deposit.compute_txid().to_string()]);

        let loan = s.engine.loan(&s.loan_id).unwrap();
        assert_eq!(loan.status, LoanStatus::Authorized);
        assert_eq!(loan.collateral_amount, 200_000);
        assert!(loan.liquidation_price > price("0.6") && loan.liquidation_price < price("0.65"));

        let event = oracle_keeper::get_event(&s.engine.store, loan.dlc_event_id).unwrap();
        assert_eq!(event.outcomes[OUTCOME_LIQUIDATED], "liquidated_200000");

        let meta = keeper::get_dlc_meta(&s.engine.store, &s.loan_id).unwrap();
        assert_eq!(meta.vault_utxos, s.utxos);
        assert!(tx_from_hex(&meta.liquidation_cet.tx).unwrap().output.is_empty());
        assert!(!meta.timeout_refund_tx.is_empty());
    }

    #[test]
    fn test_swapped_adaptor_signatures_rejected_atomically() {
        let mut s = setup();
        std::mem::swap(
            &mut s.cets.liquidation_adaptor_signatures,
            &mut s.cets.default_liquidation_adaptor_signatures,
        );
        let err = submit(&mut s, T0).unwrap_err();
        assert!(err.is_security_critical(), "{}", err);

        let loan = s.engine.loan(&s.loan_id).unwrap();
        assert_eq!(loan.status, LoanStatus::Requested);
        let event = oracle_keeper::get_event(&s.engine.store, loan.dlc_event_id).unwrap();
        assert!(event.outcomes[OUTCOME_LIQUIDATED].is_empty());
    }

    #[test]
    fn test_stale_fee_rate_rejects_submission() {
        let mut s = setup();
        let err = submit(&mut s, T0 + 3_600).unwrap_err();
        assert!(matches!(err, LendingError::InvalidState { entity: "fee rate", .. }));
        assert_eq!(s.engine.loan(&s.loan_id).unwrap().status, LoanStatus::Requested);
    }

    #[test]
    fn test_unconfirmed_deposit_blocks_disbursement() {
        let mut s = setup();
        submit(&mut s, T0).unwrap();
        s.engine.tick(T0 + 1).unwrap();
        assert_eq!(s.engine.loan(&s.loan_id).unwrap().status, LoanStatus::Authorized);
        assert_eq!(s.engine.balance("alice", "usat").unwrap(), 0);
    }

    #[test]
    fn test_deposit_proven_before_cets() {
        let mut s = setup();
        confirm_deposit(&mut s, T0);
        submit(&mut s, T0).unwrap();
        s.engine.tick(T0 + 1).unwrap();
        assert_eq!(s.engine.loan(&s.loan_id).unwrap().status, LoanStatus::Open);
    }

    #[test]
    fn test_disbursement_pays_borrower_minus_fee() {
        let s = open_loan();
        assert_eq!(s.engine.balance("alice", "usat").unwrap(), 99_000);
        assert_eq!(
            s.engine.balance(&s.engine.params.protocol_fee_collector, "usat").unwrap(),
            1_000
        );
        let pool = s.engine.pool(POOL).unwrap();
        assert_eq!(pool.available_amount, 900_000);
        assert_eq!(pool.borrowed_amount, 100_000);

        let loan = s.engine.loan(&s.loan_id).unwrap();
        assert_eq!(loan.origination_fee, 1_000);
        assert_eq!(loan.disburse_at, Some(T0 + 1));
    }

    #[test]
    fn test_price_drop_rejects_before_disbursement() {
        let mut s = setup();
        submit(&mut s, T0).unwrap();
        confirm_deposit(&mut s, T0);
        // 100k against 200k sats at 0.6 is above the 70% max ltv
        s.engine.prices.set_price(PAIR, price("0.6"));
        s.engine.tick(T0 + 1).unwrap();

        let loan = s.engine.loan(&s.loan_id).unwrap();
        assert_eq!(loan.status, LoanStatus::Rejected);
        assert_eq!(loan.authorizations[0].status, AuthorizationStatus::Rejected);
    }

    #[test]
    fn test_unfunded_request_expires() {
        let mut s = setup();
        s.engine.tick(T0 + MATURITY).unwrap();
        assert_eq!(s.engine.loan(&s.loan_id).unwrap().status, LoanStatus::Rejected);
    }

    #[test]
    fn test_price_liquidation_end_to_end() {
        let mut s = open_loan();
        s.engine.prices.set_price(PAIR, price("0.5"));
        s.engine.tick(T0 + 2).unwrap();

        let loan = s.engine.loan(&s.loan_id).unwrap();
        assert_eq!(loan.status, LoanStatus::Liquidated);
        let liquidation = keeper::get_liquidation(&s.engine.store, loan.liquidation_id.unwrap()).unwrap();
        assert_eq!(liquidation.kind, LiquidationKind::Price);
        assert_eq!(liquidation.status, LiquidationStatus::Liquidating);
        assert_eq!(liquidation.collateral_amount, 200_000);

        let event = oracle_keeper::get_event(&s.engine.store, loan.dlc_event_id).unwrap();
        assert_eq!(event.outcome_index, Some(OUTCOME_LIQUIDATED));

        // Attestation and DCM signatures arrive, the next tick settles
        s.engine.run_signer(T0 + 2).unwrap();
        s.engine.tick(T0 + 3).unwrap();

        let liquidation = keeper::get_liquidation(&s.engine.store, liquidation.id).unwrap();
        assert_eq!(liquidation.status, LiquidationStatus::Settled);

        let meta = keeper::get_dlc_meta(&s.engine.store, &s.loan_id).unwrap();
        let signed = tx_from_hex(&meta.liquidation_cet.signed_tx_hex).unwrap();
        assert_eq!(signed.input.len(), 1);
        assert_eq!(signed.input[0].witness.len(), 4);
        assert_eq!(signed.output.len(), 1);

        let dcm_payout = KeyScheme::Taproot(schnorr::parse_xonly(&loan.dcm_pub_key).unwrap()).payout_script();
        assert_eq!(signed.output[0].script_pubkey, dcm_payout);
        assert!(signed.output[0].value.to_sat() < 200_000);
    }

    #[test]
    fn test_default_at_maturity() {
        let mut s = open_loan();
        let now = T0 + MATURITY + 1;
        s.engine.bridge.set_fee_rate(3, now);
        s.engine.tick(now).unwrap();

        let loan = s.engine.loan(&s.loan_id).unwrap();
        assert_eq!(loan.status, LoanStatus::Defaulted);
        let event = oracle_keeper::get_event(&s.engine.store, loan.dlc_event_id).unwrap();
        assert_eq!(event.outcome_index, Some(OUTCOME_DEFAULT_LIQUIDATED));

        s.engine.run_signer(now).unwrap();
        s.engine.tick(now + 1).unwrap();

        let meta = keeper::get_dlc_meta(&s.engine.store, &s.loan_id).unwrap();
        assert!(meta.default_liquidation_cet.is_signed());
        assert!(!meta.liquidation_cet.is_signed());
    }

    #[test]
    fn test_liquidation_needs_fresh_fee_rate() {
        let mut s = open_loan();
        s.engine.prices.set_price(PAIR, price("0.5"));
        let report = s.engine.tick(T0 + 3_600).unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(s.engine.loan(&s.loan_id).unwrap().status, LoanStatus::Open);

        s.engine.bridge.set_fee_rate(2, T0 + 3_600);
        s.engine.tick(T0 + 3_601).unwrap();
        assert_eq!(s.engine.loan(&s.loan_id).unwrap().status, LoanStatus::Liquidated);
    }

    /// 0.1% interest per block: one block on 100k accrues exactly 100.
    fn accruing_params() -> Params {
        Params {
            blocks_per_year: 100,
            ..test_params()
        }
    }

    /// Accrue one block on an open loan, repay it and run the repayment
    /// through settlement.
    fn repay_and_settle(s: &mut Setup) -> Repayment {
        s.engine.tick(T0 + 2).unwrap();
        s.engine.mint("alice", "usat", 10_000).unwrap();
        let repayment = s.engine.repay(T0 + 2, "alice", &s.loan_id).unwrap();

        s.engine.tick(T0 + 3).unwrap();
        s.engine.run_signer(T0 + 3).unwrap();
        s.engine.tick(T0 + 4).unwrap();
        assert_eq!(s.engine.loan(&s.loan_id).unwrap().status, LoanStatus::Closed);
        repayment
    }

    #[test]
    fn test_repayment_end_to_end() {
        let mut s = open(setup_with(accruing_params(), None));
        s.engine.tick(T0 + 2).unwrap();
        s.engine.mint("alice", "usat", 10_000).unwrap();

        let repayment = s.engine.repay(T0 + 2, "alice", &s.loan_id).unwrap();
        assert_eq!(repayment.interest, 100);
        assert_eq!(repayment.amount, 100_100);
        assert!(matches!(
            s.engine.repay(T0 + 2, "alice", &s.loan_id),
            Err(LendingError::InvalidState { .. })
        ));
        assert_eq!(s.engine.balance(bank::REPAYMENT_ESCROW, "usat").unwrap(), repayment.amount);

        // Trigger the repaid outcome and request the DCM adaptor signatures
        s.engine.tick(T0 + 3).unwrap();
        let loan = s.engine.loan(&s.loan_id).unwrap();
        assert_eq!(loan.status, LoanStatus::Repaid);
        let event = oracle_keeper::get_event(&s.engine.store, loan.dlc_event_id).unwrap();
        assert_eq!(event.outcome_index, Some(OUTCOME_REPAID));

        s.engine.run_signer(T0 + 3).unwrap();
        s.engine.tick(T0 + 4).unwrap();

        let loan = s.engine.loan(&s.loan_id).unwrap();
        assert_eq!(loan.status, LoanStatus::Closed);
        assert_eq!(s.engine.balance(bank::REPAYMENT_ESCROW, "usat").unwrap(), 0);

        let meta = keeper::get_dlc_meta(&s.engine.store, &s.loan_id).unwrap();
        let signed = tx_from_hex(&meta.repayment_cet.signed_tx_hex).unwrap();
        assert_eq!(signed.output[0].script_pubkey, s.borrower.payout_script());
        assert_eq!(signed.input[0].witness.len(), 4);

        // Reserve factor 100: 10 of the 100 interest goes to the collector
        let collector = s.engine.params.protocol_fee_collector.clone();
        assert_eq!(s.engine.balance(&collector, "usat").unwrap(), 1_000 + 10);
        assert_eq!(
            s.engine.balance(&bank::pool_account(POOL), "usat").unwrap(),
            900_000 + 100_090
        );
        let pool = s.engine.pool(POOL).unwrap();
        assert_eq!(pool.borrowed_amount, 0);
        assert_eq!(pool.available_amount, 1_000_090);
    }

    #[test]
    fn test_repay_after_maturity_before_tick() {
        let mut s = open_loan();
        let maturity_time = s.engine.loan(&s.loan_id).unwrap().maturity_time;
        s.engine.mint("alice", "usat", 10_000).unwrap();

        s.engine.repay(maturity_time + 60, "alice", &s.loan_id).unwrap();
        s.engine.tick(maturity_time + 61).unwrap();

        let loan = s.engine.loan(&s.loan_id).unwrap();
        assert_eq!(loan.status, LoanStatus::Repaid);
        assert!(loan.liquidation_id.is_none());
        let event = oracle_keeper::get_event(&s.engine.store, loan.dlc_event_id).unwrap();
        assert_eq!(event.outcome_index, Some(OUTCOME_REPAID));
    }

    #[test]
    fn test_referrer_shares_fees() {
        let referrer = Referrer {
            referral_code: "friend".to_string(),
            address: "bob".to_string(),
            referral_fee_factor: 200,
        };
        let mut s = open(setup_with(accruing_params(), Some(referrer)));
        let collector = s.engine.params.protocol_fee_collector.clone();

        let loan = s.engine.loan(&s.loan_id).unwrap();
        assert_eq!(loan.referrer.as_ref().map(|r| r.address.as_str()), Some("bob"));
        // Origination fee 1_000, a fifth to the referrer
        assert_eq!(s.engine.balance("bob", "usat").unwrap(), 200);
        assert_eq!(s.engine.balance(&collector, "usat").unwrap(), 800);

        let repayment = repay_and_settle(&mut s);
        assert_eq!(repayment.interest, 100);
        // Protocol fee 10 on the interest, split 2 / 8
        assert_eq!(s.engine.balance("bob", "usat").unwrap(), 202);
        assert_eq!(s.engine.balance(&collector, "usat").unwrap(), 808);
        assert_eq!(s.engine.balance(bank::REPAYMENT_ESCROW, "usat").unwrap(), 0);
    }

    #[test]
    fn test_unknown_referral_code_rejected() {
        let (mut engine, dcm_id) = bootstrap(test_params(), T0).unwrap();
        engine.create_pool(T0, POOL, btc_usdt_pool()).unwrap();
        let borrower = TestBorrower::new("alice", 7).unwrap();
        let result = engine.apply(
            T0,
            &ApplyRequest {
                borrower: borrower.address.clone(),
                borrower_pub_key: borrower.pub_key(),
                borrower_auth_pub_key: borrower.auth_pub_key(),
                pool_id: POOL.to_string(),
                borrow_amount: 100_000,
                maturity: MATURITY,
                dcm_id,
                referral_code: Some("nobody".to_string()),
            },
        );
        assert!(matches!(result, Err(LendingError::NotFound { entity: "referrer", .. })));
    }

    #[test]
    fn test_repay_requires_borrower_and_open_loan() {
        let mut s = setup();
        assert!(matches!(
            s.engine.repay(T0, "alice", &s.loan_id),
            Err(LendingError::InvalidState { .. })
        ));
        submit(&mut s, T0).unwrap();
        confirm_deposit(&mut s, T0);
        s.engine.tick(T0 + 1).unwrap();
        assert!(matches!(
            s.engine.repay(T0 + 1, "mallory", &s.loan_id),
            Err(LendingError::Validation { .. })
        ));
    }

    #[test]
    fn test_cancel_and_redeem() {
        let mut s = setup();
        submit(&mut s, T0).unwrap();
        confirm_deposit(&mut s, T0);
        s.engine.cancel(T0, "alice", &s.loan_id).unwrap();
        assert_eq!(s.engine.loan(&s.loan_id).unwrap().status, LoanStatus::Cancelled);

        let meta = keeper::get_dlc_meta(&s.engine.store, &s.loan_id).unwrap();
        let (tx, signatures) = s.borrower.sign_redemption(&meta.vault, &s.utxos, 2).unwrap();
        let redemption = s
            .engine
            .redeem(
                T0 + 1,
                &RedeemRequest {
                    borrower: "alice".to_string(),
                    loan_id: s.loan_id.clone(),
                    tx,
                    signatures,
                },
            )
            .unwrap();
        assert!(redemption.signed_tx_hex.is_empty());

        s.engine.run_signer(T0 + 1).unwrap();
        let redemption = keeper::get_redemption(&s.engine.store, redemption.id).unwrap();
        let signed = tx_from_hex(&redemption.signed_tx_hex).unwrap();
        assert_eq!(signed.input[0].witness.len(), 4);

        let logs = keeper::get_deposit_logs(&s.engine.store, &s.loan_id).unwrap();
        assert!(logs.iter().all(|l| l.status == DepositStatus::Redeemed));
    }

    #[test]
    fn test_redeem_open_loan_rejected() {
        let mut s = open_loan();
        let meta = keeper::get_dlc_meta(&s.engine.store, &s.loan_id).unwrap();
        let (tx, signatures) = s.borrower.sign_redemption(&meta.vault, &s.utxos, 2).unwrap();
        let result = s.engine.redeem(
            T0 + 2,
            &RedeemRequest {
                borrower: "alice".to_string(),
                loan_id: s.loan_id.clone(),
                tx,
                signatures,
            },
        );
        assert!(matches!(result, Err(LendingError::InvalidState { .. })));
    }

    #[test]
    fn test_liquidation_signing_timeout_is_retried() {
        let mut s = open_loan();
        s.engine.prices.set_price(PAIR, price("0.5"));
        s.engine.tick(T0 + 2).unwrap();

        let meta = keeper::get_dlc_meta(&s.engine.store, &s.loan_id).unwrap();
        let request_id = meta.liquidation_cet.signing_request_id.unwrap();
        let (module, event) = s.engine.signer.timeout_signing(request_id).unwrap();
        s.engine.deliver(&module, &event, T0 + 2).unwrap();

        let record = keeper::get_signing_record(&s.engine.store, request_id).unwrap().unwrap();
        assert_eq!(record.status, SigningStatus::TimedOut);
        assert_eq!(record.intent, SigningIntent::LiquidationCet);
        let meta = keeper::get_dlc_meta(&s.engine.store, &s.loan_id).unwrap();
        assert_eq!(meta.liquidation_cet.signing_request_id, None);

        // Re-requested by the next tick, then settled
        s.engine.tick(T0 + 3).unwrap();
        let meta = keeper::get_dlc_meta(&s.engine.store, &s.loan_id).unwrap();
        assert!(meta.liquidation_cet.signing_request_id.is_some());
        assert_ne!(meta.liquidation_cet.signing_request_id, Some(request_id));

        s.engine.run_signer(T0 + 3).unwrap();
        s.engine.tick(T0 + 4).unwrap();
        let meta = keeper::get_dlc_meta(&s.engine.store, &s.loan_id).unwrap();
        assert!(meta.cet(CetKind::Liquidation).is_signed());
    }

    #[test]
    fn test_stale_signing_callback_rejected() {
        let mut s = open_loan();
        s.engine.prices.set_price(PAIR, price("0.5"));
        s.engine.tick(T0 + 2).unwrap();

        let meta = keeper::get_dlc_meta(&s.engine.store, &s.loan_id).unwrap();
        let request_id = meta.liquidation_cet.signing_request_id.unwrap();
        let (module, event) = s.engine.signer.complete_signing(request_id).unwrap();
        s.engine.deliver(&module, &event, T0 + 2).unwrap();
        assert!(matches!(
            s.engine.deliver(&module, &event, T0 + 2),
            Err(LendingError::Conflict { .. })
        ));
    }
}
