use chrono::{DateTime, Utc};
use tokio::sync::OwnedRwLockWriteGuard;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::Notice;
use crate::observability::*;

use super::conflict::{check_no_conflict, validate_attrs, validate_reservation_window};
use super::{Ledger, LedgerError, now};

/// Result of the locked insert: either a fresh reservation or the one an
/// earlier delivery of the same payment token already created.
enum Inserted {
    Created(Reservation),
    Existing(Reservation),
}

fn validate_token(token: &str) -> Result<(), LedgerError> {
    if token.is_empty() {
        return Err(LedgerError::LimitExceeded("empty correlation token"));
    }
    if token.len() > MAX_TOKEN_LEN {
        return Err(LedgerError::LimitExceeded("correlation token too long"));
    }
    Ok(())
}

impl Ledger {
    /// Reserve `spot_id` for `[start, end)`, effective immediately.
    pub async fn reserve(
        &self,
        spot_id: SpotId,
        principal: PrincipalId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        attrs: ReservationAttrs,
    ) -> Result<Reservation, LedgerError> {
        let span = validate_reservation_window(start, end)?;
        validate_attrs(&attrs)?;

        let reservation = match self.insert_reservation(spot_id, principal, span, attrs, None).await? {
            Inserted::Created(r) | Inserted::Existing(r) => r,
        };
        metrics::counter!(RESERVATIONS_CREATED_TOTAL, "path" => "immediate").increment(1);
        tracing::info!(
            "reservation {} created on spot {spot_id} [{}, {})",
            reservation.id,
            reservation.start,
            reservation.end
        );
        self.notify.send(Notice::Created {
            reservation: reservation.clone(),
        });
        Ok(reservation)
    }

    /// Create the reservation a completed external payment paid for.
    ///
    /// Availability is re-checked here: the slot may have been taken while the
    /// payment was in flight. On `Conflict` the checkout is marked rejected and
    /// the caller owes the payer a refund. Safe to call more than once per token.
    pub async fn confirm_deferred(
        &self,
        token: &str,
        spot_id: SpotId,
        principal: PrincipalId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        attrs: ReservationAttrs,
    ) -> Result<Reservation, LedgerError> {
        validate_token(token)?;
        if let Some(existing) = self.reservation_for_token(token) {
            metrics::counter!(DUPLICATE_CONFIRMATIONS_TOTAL).increment(1);
            return Ok(existing);
        }
        if let Some(CheckoutState::Rejected { conflicting }) = self.checkouts.get(token).map(|c| c.state.clone()) {
            return Err(LedgerError::Conflict(conflicting));
        }
        let span = validate_reservation_window(start, end)?;
        validate_attrs(&attrs)?;

        let inserted = self
            .insert_reservation(spot_id, principal, span, attrs.clone(), Some(token.to_string()))
            .await;
        let reservation = match inserted {
            Ok(Inserted::Existing(r)) => {
                metrics::counter!(DUPLICATE_CONFIRMATIONS_TOTAL).increment(1);
                return Ok(r);
            }
            Ok(Inserted::Created(r)) => r,
            Err(LedgerError::Conflict(conflicting)) => {
                tracing::warn!("payment {token} lost spot {spot_id} to reservation {conflicting}");
                let state = CheckoutState::Rejected { conflicting };
                if let Err(e) = self.settle_checkout(token, spot_id, principal, start, end, attrs, state).await {
                    tracing::error!("failed to record rejected checkout {token}: {e}");
                }
                return Err(LedgerError::Conflict(conflicting));
            }
            Err(e) => return Err(e),
        };

        let state = CheckoutState::Confirmed(reservation.id);
        if let Err(e) = self.settle_checkout(token, spot_id, principal, start, end, attrs, state).await {
            // The reservation itself is durable; the checkout record is bookkeeping.
            tracing::error!("failed to record confirmed checkout {token}: {e}");
        }
        metrics::counter!(RESERVATIONS_CREATED_TOTAL, "path" => "deferred").increment(1);
        tracing::info!("reservation {} confirmed by payment {token}", reservation.id);
        self.notify.send(Notice::Confirmed {
            reservation: reservation.clone(),
            token: token.to_string(),
        });
        Ok(reservation)
    }

    /// Open a pending checkout: quote the price and remember the request until
    /// the payment gateway reports back. Reserves nothing.
    pub async fn open_checkout(
        &self,
        spot_id: SpotId,
        principal: PrincipalId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        attrs: ReservationAttrs,
    ) -> Result<Checkout, LedgerError> {
        let span = validate_reservation_window(start, end)?;
        validate_attrs(&attrs)?;
        let handle = self.spot_handle(&spot_id)?;
        {
            // Advisory only: saves a doomed payment, guarantees nothing.
            let guard = handle.read().await;
            if guard.retired {
                return Err(LedgerError::spot_not_found(spot_id));
            }
            check_no_conflict(&guard, &span)?;
        }

        let checkout = Checkout {
            token: Ulid::new().to_string(),
            spot_id,
            principal,
            start: normalize(start),
            end: normalize(end),
            attrs,
            amount_minor: self.tariff.quote(end - start),
            opened_at: now(),
            state: CheckoutState::Pending,
        };
        {
            let _checkouts = self.checkout_lock.lock().await;
            self.wal_append(&Event::CheckoutOpened {
                checkout: checkout.clone(),
            })
            .await?;
            self.checkouts.insert(checkout.token.clone(), checkout.clone());
        }
        tracing::info!(
            "checkout {} opened for spot {spot_id}, amount {}",
            checkout.token,
            checkout.amount_minor
        );
        Ok(checkout)
    }

    /// `confirm_deferred` using the request recorded by `open_checkout`.
    pub async fn confirm_checkout(&self, token: &str) -> Result<Reservation, LedgerError> {
        let checkout = self.checkout(token)?;
        self.confirm_deferred(
            token,
            checkout.spot_id,
            checkout.principal,
            checkout.start,
            checkout.end,
            checkout.attrs,
        )
        .await
    }

    /// Deactivate a reservation on behalf of its owner or an administrator.
    pub async fn cancel(&self, id: ReservationId, requested_by: Requester) -> Result<Reservation, LedgerError> {
        let snapshot = self
            .reservations
            .get(&id)
            .map(|r| r.clone())
            .ok_or_else(|| LedgerError::reservation_not_found(id))?;
        if !requested_by.admin && requested_by.principal != snapshot.principal {
            return Err(LedgerError::Forbidden(id));
        }
        if !snapshot.active {
            return Err(LedgerError::AlreadyInactive(id));
        }

        let released = self
            .release_if(id, ReleaseReason::Cancelled, now(), |_| true)
            .await?
            .ok_or(LedgerError::AlreadyInactive(id))?;
        tracing::info!("reservation {id} cancelled by {}", requested_by.principal);
        Ok(released)
    }

    /// Record that the vehicle with `plate` was seen at its spot at `at`.
    ///
    /// Picks the active reservation for the plate whose window contains `at`,
    /// otherwise the earliest active one. Recording twice keeps the first time.
    pub async fn record_arrival(&self, plate: &str, at: DateTime<Utc>) -> Result<Reservation, LedgerError> {
        let at = normalize(at);
        let t = to_ms(at);
        let wanted = normalize_plate(plate);
        if wanted.is_empty() {
            return Err(LedgerError::reservation_not_found(format!("plate {plate}")));
        }
        let mut candidates: Vec<Reservation> = self
            .reservations
            .iter()
            .filter(|r| r.active && r.plate_number.as_deref().is_some_and(|p| normalize_plate(p) == wanted))
            .map(|r| r.clone())
            .collect();
        candidates.sort_by_key(|r| r.start);
        let target = candidates
            .iter()
            .find(|r| r.span().contains_instant(t))
            .or_else(|| candidates.first())
            .map(|r| r.id)
            .ok_or_else(|| LedgerError::reservation_not_found(format!("plate {plate}")))?;

        let mut guard = self.lock_reservation_spot(&target).await?;
        let current = self.snapshot(&target)?;
        if !current.active {
            return Err(LedgerError::AlreadyInactive(target));
        }
        if current.arrived_at.is_some() {
            return Ok(current);
        }
        let event = Event::ArrivalRecorded {
            id: target,
            spot_id: current.spot_id,
            at,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        tracing::info!("arrival recorded for reservation {target} at {at}");
        self.snapshot(&target)
    }

    // ── Release primitives shared with the sweeper ───────────────

    /// Deactivate `id` if it is still active and `still_due` holds under the
    /// spot lock. Returns the released record, or `None` when nothing changed.
    pub(crate) async fn release_if(
        &self,
        id: ReservationId,
        reason: ReleaseReason,
        at: DateTime<Utc>,
        still_due: impl Fn(&Reservation) -> bool,
    ) -> Result<Option<Reservation>, LedgerError> {
        let mut guard = self.lock_reservation_spot(&id).await?;
        let current = self.snapshot(&id)?;
        if !current.active || !still_due(&current) {
            return Ok(None);
        }
        self.release_locked(&mut guard, &current, reason, at).await?;
        drop(guard);

        metrics::counter!(RELEASES_TOTAL, "reason" => reason.as_str()).increment(1);
        self.notify.send(Notice::Released {
            reservation_id: id,
            spot_id: current.spot_id,
            principal: current.principal,
            reason,
        });
        self.snapshot(&id).map(Some)
    }

    /// Deactivate then clear the spot's occupied flag. Two separate records: a
    /// crash between them leaves the spot flagged until `reconcile_spot` runs.
    async fn release_locked(
        &self,
        guard: &mut OwnedRwLockWriteGuard<SpotState>,
        current: &Reservation,
        reason: ReleaseReason,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let released = Event::ReservationReleased {
            id: current.id,
            spot_id: current.spot_id,
            reason,
            at,
        };
        self.persist_and_apply(guard, &released).await?;
        if guard.occupied && !guard.has_active() {
            self.persist_and_apply(guard, &Event::SpotReleased {
                spot_id: current.spot_id,
            })
            .await?;
        }
        Ok(())
    }

    /// Clear a stale occupied flag on a spot with no active reservations.
    pub(crate) async fn reconcile_spot(&self, spot_id: SpotId) -> Result<bool, LedgerError> {
        let handle = self.spot_handle(&spot_id)?;
        let mut guard = handle.write().await;
        if guard.retired || !guard.occupied || guard.has_active() {
            return Ok(false);
        }
        self.persist_and_apply(&mut guard, &Event::SpotReleased { spot_id }).await?;
        tracing::info!("spot {spot_id} occupancy reconciled");
        Ok(true)
    }

    /// Mark `id` reminded if it is still active and not yet reminded.
    pub(crate) async fn mark_reminded(&self, id: ReservationId) -> Result<Option<Reservation>, LedgerError> {
        let mut guard = self.lock_reservation_spot(&id).await?;
        let current = self.snapshot(&id)?;
        if !current.active || current.reminded {
            return Ok(None);
        }
        let event = Event::ReminderSent {
            id,
            spot_id: current.spot_id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        drop(guard);
        let reminded = self.snapshot(&id)?;
        self.notify.send(Notice::EndingSoon {
            reservation: reminded.clone(),
        });
        Ok(Some(reminded))
    }

    // ── Internals ────────────────────────────────────────────────

    /// Check-and-insert under the spot's write lock.
    async fn insert_reservation(
        &self,
        spot_id: SpotId,
        principal: PrincipalId,
        span: Span,
        attrs: ReservationAttrs,
        token: Option<String>,
    ) -> Result<Inserted, LedgerError> {
        let handle = self.spot_handle(&spot_id)?;
        let mut guard = handle.write().await;
        if guard.retired {
            return Err(LedgerError::spot_not_found(spot_id));
        }
        // A concurrent delivery of the same token may have won the lock first.
        if let Some(existing) = token.as_deref().and_then(|t| self.reservation_for_token(t)) {
            return Ok(Inserted::Existing(existing));
        }
        if guard.slots.len() >= MAX_ACTIVE_PER_SPOT {
            return Err(LedgerError::LimitExceeded("too many active reservations on spot"));
        }
        if let Err(e) = check_no_conflict(&guard, &span) {
            metrics::counter!(RESERVE_CONFLICTS_TOTAL).increment(1);
            return Err(e);
        }

        let reservation = Reservation {
            id: Ulid::new(),
            principal,
            spot_id,
            start: instant(span.start),
            end: instant(span.end),
            active: true,
            plate_number: attrs.plate_number.as_deref().map(normalize_plate).filter(|p| !p.is_empty()),
            created_at: now(),
            payment_token: token,
            arrived_at: None,
            reminded: false,
            released: None,
        };
        let event = Event::ReservationCreated {
            reservation: reservation.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(Inserted::Created(reservation))
    }

    /// Record how a deferred confirmation ended, creating the checkout record
    /// if the gateway confirmed a payment this ledger never saw opened.
    #[allow(clippy::too_many_arguments)]
    async fn settle_checkout(
        &self,
        token: &str,
        spot_id: SpotId,
        principal: PrincipalId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        attrs: ReservationAttrs,
        state: CheckoutState,
    ) -> Result<(), LedgerError> {
        let _checkouts = self.checkout_lock.lock().await;
        let known = self.checkouts.get(token).map(|c| c.state.clone());
        match known {
            Some(CheckoutState::Pending) => {
                self.wal_append(&Event::CheckoutResolved {
                    token: token.to_string(),
                    state: state.clone(),
                })
                .await?;
                if let Some(mut c) = self.checkouts.get_mut(token) {
                    c.state = state;
                }
            }
            Some(_) => {}
            None => {
                let checkout = Checkout {
                    token: token.to_string(),
                    spot_id,
                    principal,
                    start: normalize(start),
                    end: normalize(end),
                    attrs,
                    amount_minor: self.tariff.quote(end - start),
                    opened_at: now(),
                    state,
                };
                self.wal_append(&Event::CheckoutOpened {
                    checkout: checkout.clone(),
                })
                .await?;
                self.checkouts.insert(checkout.token.clone(), checkout);
            }
        }
        Ok(())
    }

    pub(super) fn snapshot(&self, id: &ReservationId) -> Result<Reservation, LedgerError> {
        self.reservations
            .get(id)
            .map(|r| r.clone())
            .ok_or_else(|| LedgerError::reservation_not_found(id))
    }

    pub(super) fn reservation_for_token(&self, token: &str) -> Option<Reservation> {
        let id = *self.tokens.get(token)?;
        self.reservations.get(&id).map(|r| r.clone())
    }
}
