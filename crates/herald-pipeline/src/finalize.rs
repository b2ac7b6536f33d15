//! Campaign finalization.
//!
//! A campaign is finished once it is `sending`, fan-out has completed and no
//! recipient row is still `queued`. It ends `failed` when every row failed
//! to send (or there were no rows at all) and `completed` otherwise; then
//! the reservation's unsettled remainder is released.

use std::sync::Arc;

use herald_core::{CampaignId, CampaignStatus};
use tracing::{debug, info};

use crate::{error::Result, ledger::CreditLedger, storage::PipelineStorage};

/// Tries to move a campaign to its terminal status.
pub struct CampaignFinalizer {
    storage: Arc<dyn PipelineStorage>,
    ledger: Arc<dyn CreditLedger>,
}

impl CampaignFinalizer {
    /// Creates a new finalizer.
    pub fn new(storage: Arc<dyn PipelineStorage>, ledger: Arc<dyn CreditLedger>) -> Self {
        Self { storage, ledger }
    }

    /// Finalizes the campaign if it is ready. Returns the terminal status
    /// when this call performed the transition.
    ///
    /// # Errors
    ///
    /// Returns error if storage or the ledger fails.
    pub async fn try_finalize(&self, campaign_id: CampaignId) -> Result<Option<CampaignStatus>> {
        let Some(campaign) = self.storage.find_campaign(campaign_id).await? else {
            return Ok(None);
        };
        if campaign.status != CampaignStatus::Sending || campaign.fanout_completed_at.is_none() {
            return Ok(None);
        }

        let counts = self.storage.recipient_counts(campaign_id).await?;
        if counts.queued > 0 {
            debug!(campaign_id = %campaign_id, queued = counts.queued, "campaign not ready to finalize");
            return Ok(None);
        }

        let status = if counts.total() == 0 || counts.failed_send == counts.total() {
            CampaignStatus::Failed
        } else {
            CampaignStatus::Completed
        };

        if !self.storage.finalize_campaign(campaign_id, status).await? {
            return Ok(None);
        }

        let released = match campaign.reservation_id {
            Some(reservation_id) => self.ledger.release_remaining(reservation_id).await?,
            None => 0,
        };

        info!(
            campaign_id = %campaign_id,
            status = %status,
            accepted = counts.sent(),
            failed_send = counts.failed_send,
            released,
            "campaign finalized"
        );

        Ok(Some(status))
    }
}
