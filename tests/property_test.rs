//! Property-based tests for campaign pipeline invariants.
//!
//! Random audiences, provider behaviour and balances are pushed through the
//! in-memory pipeline until idle, then the ledger and recipient rows are
//! checked against what the inputs allow.

use std::collections::HashSet;

use herald_core::{CampaignStatus, HeraldError, RecipientStatus};
use herald_pipeline::{provider::mock::ScriptedSend, CreditLedger, PipelineError};
use herald_testing::{invariants, ContactBuilder, TestHarness};
use proptest::{prelude::*, test_runner::Config as ProptestConfig};

/// Creates property test configuration based on environment.
///
/// Uses environment variables:
/// - `PROPTEST_CASES`: Number of test cases (default: 8 for dev, 24 for CI)
/// - `CI`: If set to "true", uses CI configuration
fn proptest_config() -> ProptestConfig {
    let is_ci = std::env::var("CI").unwrap_or_default() == "true";
    let default_cases = if is_ci { 24 } else { 8 };

    let cases =
        std::env::var("PROPTEST_CASES").ok().and_then(|s| s.parse().ok()).unwrap_or(default_cases);

    ProptestConfig::with_cases(cases)
}

/// How the provider treats one recipient.
#[derive(Debug, Clone)]
enum Outcome {
    Accept,
    Reject,
    /// Transient failures before the provider accepts.
    Flaky(u8),
    /// Transient failures on every attempt.
    Down,
}

fn outcome_strategy() -> impl Strategy<Value = Outcome> {
    prop_oneof![
        4 => Just(Outcome::Accept),
        1 => Just(Outcome::Reject),
        2 => (1u8..4).prop_map(Outcome::Flaky),
        1 => Just(Outcome::Down),
    ]
}

impl Outcome {
    fn script(&self) -> Vec<ScriptedSend> {
        match self {
            Self::Accept => vec![ScriptedSend::Accept],
            Self::Reject => vec![ScriptedSend::Fail(PipelineError::rejected("INVALID_NUMBER", false))],
            Self::Flaky(failures) => {
                let mut script: Vec<_> =
                    (0..*failures).map(|_| ScriptedSend::Fail(PipelineError::server_error(503, "busy"))).collect();
                script.push(ScriptedSend::Accept);
                script
            },
            Self::Down => (0..16).map(|_| ScriptedSend::Fail(PipelineError::timeout(10))).collect(),
        }
    }

    fn accepted(&self) -> bool {
        matches!(self, Self::Accept | Self::Flaky(_))
    }
}

proptest! {
    #![proptest_config(proptest_config())]

    /// Every eligible contact gets exactly one row, every row ends settled,
    /// and the owner pays for accepted messages only.
    #[test]
    fn credits_follow_provider_acceptance(
        outcomes in prop::collection::vec(outcome_strategy(), 1..16),
        opted_out in 0usize..4,
        spare_credits in 0i64..5,
        batch_size in 1usize..6,
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let mut config = TestHarness::default_config();
            config.fanout.batch_size = batch_size;
            let harness = TestHarness::with_config(config);

            let purchased = outcomes.len() as i64 + spare_credits;
            let owner = harness.owner_with_credits(purchased).await;
            for outcome in &outcomes {
                let contact = harness.add_contact(ContactBuilder::new(owner)).await;
                harness.provider.script(contact.phone.clone(), outcome.script()).await;
            }
            for _ in 0..opted_out {
                harness.add_contact(ContactBuilder::new(owner).opted_out()).await;
            }
            let campaign = harness.draft_campaign(owner, &[]).await;

            let outcome = harness.enqueue(campaign.id, "prop").await.unwrap();
            prop_assert_eq!(outcome.queued, outcomes.len() as i64);
            harness.run_until_idle().await.unwrap();

            let accepted = outcomes.iter().filter(|o| o.accepted()).count() as i64;
            let expected = if accepted > 0 { CampaignStatus::Completed } else { CampaignStatus::Failed };
            let finished = harness.campaign(campaign.id).await.unwrap();
            prop_assert_eq!(finished.status, expected);

            let rows = harness.backend.recipients(campaign.id).await;
            prop_assert_eq!(rows.len(), outcomes.len());
            let phones: HashSet<_> = rows.iter().map(|row| row.phone.clone()).collect();
            prop_assert_eq!(phones.len(), rows.len());
            prop_assert!(rows.iter().all(|row| row.status != RecipientStatus::Queued));

            let reservation = &harness.backend.reservations_for(owner).await[0];
            prop_assert_eq!(reservation.committed, accepted);
            prop_assert_eq!(reservation.committed + reservation.released, reservation.amount);

            let balance = harness.backend.balance(owner).await.unwrap();
            prop_assert_eq!(balance.balance, purchased - accepted);
            prop_assert_eq!(balance.reserved, 0);

            invariants::check_ledger(&harness.backend, owner, purchased).await.unwrap();
            invariants::check_campaign(&harness.backend, campaign.id).await.unwrap();
            Ok(())
        })?;
    }

    /// Replaying a key never reserves, fans out or sends twice, whenever
    /// the replay arrives.
    #[test]
    fn replayed_keys_return_the_first_outcome(
        audience in 1usize..12,
        replay_after_steps in 0usize..6,
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let mut config = TestHarness::default_config();
            config.fanout.batch_size = 2;
            config.worker.batch_size = 2;
            let harness = TestHarness::with_config(config);
            let owner = harness.owner_with_credits(audience as i64).await;
            harness.add_contacts(owner, audience, &[]).await;
            let campaign = harness.draft_campaign(owner, &[]).await;

            let first = harness.enqueue(campaign.id, "same-key").await.unwrap();
            for _ in 0..replay_after_steps {
                harness.drain().await.unwrap();
            }
            let replay = harness.enqueue(campaign.id, "same-key").await.unwrap();
            harness.run_until_idle().await.unwrap();

            prop_assert!(replay.replayed);
            prop_assert_eq!(replay.queued, first.queued);
            prop_assert_eq!(replay.reservation_id, first.reservation_id);
            prop_assert_eq!(harness.backend.reservations_for(owner).await.len(), 1);
            prop_assert_eq!(harness.provider.sent().await.len(), audience);
            invariants::check_ledger(&harness.backend, owner, audience as i64).await.unwrap();
            Ok(())
        })?;
    }

    /// An owner who cannot cover the audience is refused before anything
    /// is reserved or queued.
    #[test]
    fn short_balances_leave_no_trace(audience in 2usize..20, shortfall in 1i64..10) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let harness = TestHarness::new();
            let available = (audience as i64 - shortfall).max(0);
            let owner = harness.owner_with_credits(available).await;
            harness.add_contacts(owner, audience, &[]).await;
            let campaign = harness.draft_campaign(owner, &[]).await;

            let err = harness.enqueue(campaign.id, "too-big").await.unwrap_err();
            let is_insufficient = matches!(
                err,
                HeraldError::InsufficientCredits { required, .. } if required == audience as i64
            );
            prop_assert!(is_insufficient, "unexpected error: {err}");

            prop_assert_eq!(harness.campaign(campaign.id).await.unwrap().status, CampaignStatus::Draft);
            prop_assert!(harness.backend.recipients(campaign.id).await.is_empty());
            prop_assert!(harness.backend.reservations_for(owner).await.is_empty());
            prop_assert_eq!(harness.backend.balance(owner).await.unwrap().balance, available);
            Ok(())
        })?;
    }
}
