//! Campaign status document.
//!
//! Served in two shapes at once: the canonical `totals`/`delivery` blocks,
//! and the legacy top-level `sent`/`failed`/`processed` aggregates that
//! older dashboards still read.

use herald_core::{Campaign, CampaignId, CampaignStatus, RecipientCounts};
use serde::Serialize;

/// Canonical totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusTotals {
    /// Audience size: the fan-out count once known, the estimate before.
    pub recipients: i64,
    /// Messages the provider took responsibility for.
    pub accepted: i64,
    /// Same as `accepted`; kept for callers that read `sent`.
    pub sent: i64,
    /// Confirmed deliveries.
    pub delivered: i64,
    /// Send failures plus delivery failures.
    pub failed: i64,
}

/// Delivery receipt breakdown of accepted messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryBreakdown {
    /// Accepted and still waiting for a receipt.
    pub pending_delivery: i64,
    /// Confirmed deliveries.
    pub delivered: i64,
    /// Provider reported undeliverable.
    pub failed_delivery: i64,
}

/// `GET /campaigns/{id}/status` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignStatusDocument {
    /// Campaign id.
    pub campaign_id: CampaignId,
    /// Current lifecycle status.
    pub status: CampaignStatus,
    /// Rows still waiting for a send.
    pub queued: i64,
    /// Canonical totals.
    pub totals: StatusTotals,
    /// Receipt breakdown.
    pub delivery: DeliveryBreakdown,
    /// Legacy: provider-accepted messages.
    pub sent: i64,
    /// Legacy: every failed message.
    pub failed: i64,
    /// Legacy: rows the send worker is done with.
    pub processed: i64,
}

impl CampaignStatusDocument {
    /// Builds the document from a campaign and its recipient tallies.
    pub fn build(campaign: &Campaign, counts: RecipientCounts) -> Self {
        let sent = counts.sent();
        let failed = counts.failed_send + counts.failed_delivery;

        Self {
            campaign_id: campaign.id,
            status: campaign.status,
            queued: counts.queued,
            totals: StatusTotals {
                recipients: i64::from(campaign.total_recipients).max(counts.total()),
                accepted: sent,
                sent,
                delivered: counts.delivered,
                failed,
            },
            delivery: DeliveryBreakdown {
                pending_delivery: counts.accepted,
                delivered: counts.delivered,
                failed_delivery: counts.failed_delivery,
            },
            sent,
            failed,
            processed: sent + counts.failed_send,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use herald_core::OwnerId;

    use super::*;

    #[test]
    fn canonical_and_legacy_shapes_agree() {
        let mut campaign = Campaign::draft(OwnerId::new(), "promo", "hi", vec![], Utc::now());
        campaign.status = CampaignStatus::Sending;
        campaign.total_recipients = 10;
        let counts = RecipientCounts {
            queued: 2,
            accepted: 3,
            delivered: 2,
            failed_delivery: 1,
            failed_send: 2,
        };

        let doc = CampaignStatusDocument::build(&campaign, counts);

        assert_eq!(doc.totals.recipients, 10);
        assert_eq!(doc.totals.accepted, 6);
        assert_eq!(doc.totals.sent, doc.sent);
        assert_eq!(doc.totals.failed, 3);
        assert_eq!(doc.delivery.pending_delivery, 3);
        assert_eq!(doc.processed, 8);
        assert_eq!(doc.processed + doc.queued, counts.total());
    }

    #[test]
    fn serializes_camel_case() {
        let campaign = Campaign::draft(OwnerId::new(), "promo", "hi", vec![], Utc::now());
        let value = serde_json::to_value(CampaignStatusDocument::build(
            &campaign,
            RecipientCounts::default(),
        ))
        .unwrap();

        assert_eq!(value["status"], "draft");
        assert!(value["delivery"].get("pendingDelivery").is_some());
        assert!(value.get("campaignId").is_some());
    }
}
