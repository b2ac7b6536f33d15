//! Ledger and recipient invariants checked after a test run.

use std::collections::HashSet;

use anyhow::{ensure, Result};
use herald_core::{CampaignId, CreditReservation, OwnerId, RecipientStatus, ReservationStatus, SettlementKind};
use herald_pipeline::{storage::PipelineStorage, CreditLedger, MemoryBackend};

/// Verifies the owner's credit accounting.
///
/// - no reservation settles more than it holds
/// - settlement records sum to each reservation's committed and released
/// - no slice is settled twice
/// - `reserved` equals the unsettled remainder of active reservations
/// - `purchased` equals the balance plus everything committed
pub async fn check_ledger(backend: &MemoryBackend, owner_id: OwnerId, purchased: i64) -> Result<()> {
    let reservations = backend.reservations_for(owner_id).await;
    let balance = backend.balance(owner_id).await?;

    let mut held = 0;
    let mut committed_total = 0;
    for reservation in &reservations {
        ensure!(
            reservation.committed + reservation.released <= reservation.amount,
            "reservation {} settled {} + {} of {}",
            reservation.id,
            reservation.committed,
            reservation.released,
            reservation.amount
        );

        let settlements = backend.settlements(reservation.id).await;
        let mut keys = HashSet::new();
        let mut committed = 0;
        let mut released = 0;
        for settlement in &settlements {
            ensure!(
                keys.insert(settlement.slice_key.clone()),
                "slice {} settled twice on reservation {}",
                settlement.slice_key,
                reservation.id
            );
            match settlement.kind {
                SettlementKind::Commit => committed += settlement.amount,
                SettlementKind::Release => released += settlement.amount,
            }
        }
        ensure!(committed == reservation.committed, "reservation {} commit records drifted", reservation.id);
        ensure!(released <= reservation.released, "reservation {} release records drifted", reservation.id);

        if reservation.status == ReservationStatus::Active {
            held += reservation.unsettled();
        } else {
            ensure!(
                reservation.committed + reservation.released == reservation.amount
                    || reservation.status == ReservationStatus::Expired,
                "closed reservation {} still holds credits",
                reservation.id
            );
        }
        committed_total += reservation.committed;
    }

    ensure!(balance.reserved == held, "reserved {} but active reservations hold {held}", balance.reserved);
    ensure!(
        balance.balance + committed_total == purchased,
        "balance {} + committed {committed_total} != purchased {purchased}",
        balance.balance
    );
    Ok(())
}

/// Verifies a campaign's recipient rows against its reservation.
///
/// - one row per contact
/// - rows that reached the provider were charged exactly once, across
///   every reservation the campaign held
/// - rows that failed to send were never charged
/// - a terminal campaign has no queued rows and no active reservation
pub async fn check_campaign(backend: &MemoryBackend, campaign_id: CampaignId) -> Result<()> {
    let campaign = backend
        .find_campaign(campaign_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("campaign {campaign_id} not found"))?;
    let rows = backend.recipients(campaign_id).await;

    let mut contacts = HashSet::new();
    for row in &rows {
        ensure!(contacts.insert(row.contact_id), "contact {} fanned out twice", row.contact_id);
        match row.status {
            RecipientStatus::FailedSend => {
                ensure!(row.credits_charged == 0, "failed row {} was charged", row.id);
            },
            RecipientStatus::Accepted | RecipientStatus::Delivered | RecipientStatus::FailedDelivery => {
                ensure!(row.provider_message_id.is_some(), "sent row {} has no provider id", row.id);
                ensure!(row.credits_charged > 0, "sent row {} was never charged", row.id);
            },
            RecipientStatus::Queued => {},
        }
    }

    let key = CreditReservation::key_for_campaign(campaign_id);
    let mut commits = 0;
    for reservation in backend.reservations_for(campaign.owner_id).await {
        if reservation.reservation_key == key {
            let settlements = backend.settlements(reservation.id).await;
            commits += settlements.iter().filter(|s| s.kind == SettlementKind::Commit).count();
        }
    }
    let charged = rows.iter().filter(|row| row.credits_charged > 0).count();
    ensure!(commits == charged, "{commits} commits for {charged} charged rows");

    if campaign.status.is_terminal() {
        ensure!(
            rows.iter().all(|row| row.status != RecipientStatus::Queued),
            "terminal campaign {campaign_id} has queued rows"
        );
        if let Some(reservation_id) = campaign.reservation_id {
            let reservation = backend
                .find_reservation(reservation_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("reservation {reservation_id} not found"))?;
            ensure!(
                reservation.status != ReservationStatus::Active,
                "terminal campaign {campaign_id} still holds reservation {reservation_id}"
            );
        }
    }

    Ok(())
}
