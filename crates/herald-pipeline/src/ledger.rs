//! Two-phase credit ledger.
//!
//! Enqueue reserves the estimated campaign cost up front. Each accepted send
//! commits one slice and each failed send releases one slice; slices are
//! keyed by recipient message id so replays are harmless. Finalization
//! releases whatever is still unsettled, and the expiry sweep reclaims
//! reservations whose campaign never finished.

use std::sync::Arc;

use herald_core::{
    error::Result, storage::Storage, Clock, CreditBalance, CreditReservation, OwnerId,
    RecipientMessageId, ReservationId, ReserveOutcome, SettleOutcome, SettlementKind,
};

use crate::queue::BoxFuture;

/// Credit reservation operations.
pub trait CreditLedger: Send + Sync + 'static {
    /// Holds `amount` credits under `key` until `ttl` elapses.
    fn reserve(
        &self,
        owner_id: OwnerId,
        key: String,
        amount: i64,
        ttl: chrono::Duration,
    ) -> BoxFuture<'_, Result<ReserveOutcome>>;

    /// Converts one message's slice into a debit.
    fn commit(
        &self,
        reservation_id: ReservationId,
        slice: RecipientMessageId,
        amount: i64,
    ) -> BoxFuture<'_, Result<SettleOutcome>>;

    /// Returns one message's slice to the available balance.
    fn release(
        &self,
        reservation_id: ReservationId,
        slice: RecipientMessageId,
        amount: i64,
    ) -> BoxFuture<'_, Result<SettleOutcome>>;

    /// Releases everything still unsettled and closes the reservation.
    fn release_remaining(&self, reservation_id: ReservationId) -> BoxFuture<'_, Result<i64>>;

    /// Expires active reservations past their deadline.
    fn expire_due(&self) -> BoxFuture<'_, Result<Vec<ReservationId>>>;

    /// Finds a reservation.
    fn find_reservation(
        &self,
        reservation_id: ReservationId,
    ) -> BoxFuture<'_, Result<Option<CreditReservation>>>;

    /// Owner balance.
    fn balance(&self, owner_id: OwnerId) -> BoxFuture<'_, Result<CreditBalance>>;
}

/// Ledger backed by the `credit_*` tables.
pub struct PostgresCreditLedger {
    storage: Arc<Storage>,
    clock: Arc<dyn Clock>,
}

impl PostgresCreditLedger {
    /// Creates a new ledger adapter.
    pub fn new(storage: Arc<Storage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    fn settle(
        &self,
        reservation_id: ReservationId,
        slice: RecipientMessageId,
        kind: SettlementKind,
        amount: i64,
    ) -> BoxFuture<'_, Result<SettleOutcome>> {
        let now = self.clock.now_utc();
        Box::pin(async move {
            self.storage
                .reservations
                .settle(reservation_id, &slice.to_string(), kind, amount, now)
                .await
        })
    }
}

impl CreditLedger for PostgresCreditLedger {
    fn reserve(
        &self,
        owner_id: OwnerId,
        key: String,
        amount: i64,
        ttl: chrono::Duration,
    ) -> BoxFuture<'_, Result<ReserveOutcome>> {
        let now = self.clock.now_utc();
        Box::pin(async move {
            self.storage.reservations.reserve(owner_id, &key, amount, now + ttl, now).await
        })
    }

    fn commit(
        &self,
        reservation_id: ReservationId,
        slice: RecipientMessageId,
        amount: i64,
    ) -> BoxFuture<'_, Result<SettleOutcome>> {
        self.settle(reservation_id, slice, SettlementKind::Commit, amount)
    }

    fn release(
        &self,
        reservation_id: ReservationId,
        slice: RecipientMessageId,
        amount: i64,
    ) -> BoxFuture<'_, Result<SettleOutcome>> {
        self.settle(reservation_id, slice, SettlementKind::Release, amount)
    }

    fn release_remaining(&self, reservation_id: ReservationId) -> BoxFuture<'_, Result<i64>> {
        Box::pin(async move { self.storage.reservations.release_remaining(reservation_id).await })
    }

    fn expire_due(&self) -> BoxFuture<'_, Result<Vec<ReservationId>>> {
        let now = self.clock.now_utc();
        Box::pin(async move { self.storage.reservations.expire_due(now).await })
    }

    fn find_reservation(
        &self,
        reservation_id: ReservationId,
    ) -> BoxFuture<'_, Result<Option<CreditReservation>>> {
        Box::pin(async move { self.storage.reservations.find(reservation_id).await })
    }

    fn balance(&self, owner_id: OwnerId) -> BoxFuture<'_, Result<CreditBalance>> {
        Box::pin(async move { self.storage.reservations.balance(owner_id).await })
    }
}
