use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::models::{ResourceDelta, Subscription};
use super::usage::UsageTracker;

#[derive(Debug, Default)]
struct StateCell {
    initialized: bool,
    subscription: Option<Arc<Subscription>>,
    revision: u64,
    /// Revision of the last `replace`/`clear`; local charges do not move it.
    installed: u64,
    applied_at: Option<DateTime<Utc>>,
}

impl StateCell {
    fn adjust(&mut self, delta: ResourceDelta, charge: bool) -> bool {
        let Some(current) = self.subscription.as_ref() else {
            return false;
        };
        let mut next = Subscription::clone(current);
        if charge {
            next.usage.add(delta.resource, delta.units);
        } else {
            next.usage.remove(delta.resource, delta.units);
        }
        self.subscription = Some(Arc::new(next));
        self.revision += 1;
        true
    }
}

/// Units charged against the installed record ahead of a consuming action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub delta: ResourceDelta,
    installed: u64,
}

/// Point-in-time copy handed to readers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSnapshot {
    pub initialized: bool,
    pub subscription: Option<Arc<Subscription>>,
    pub revision: u64,
    pub applied_at: Option<DateTime<Utc>>,
}

/// key: access-state -> per-tenant subscription snapshot
///
/// Writers swap a whole `Arc<Subscription>` under the lock, so readers always
/// see either the previous or the next record, never a mix.
#[derive(Debug, Default)]
pub struct SubscriptionState {
    cell: RwLock<StateCell>,
}

impl SubscriptionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `subscription` (or the absence of one) and returns the new revision.
    pub fn replace(&self, subscription: Option<Subscription>, now: DateTime<Utc>) -> u64 {
        let mut cell = self.cell.write();
        cell.initialized = true;
        cell.subscription = subscription.map(Arc::new);
        cell.revision += 1;
        cell.installed = cell.revision;
        cell.applied_at = Some(now);
        cell.revision
    }

    pub fn get(&self) -> Option<Arc<Subscription>> {
        self.cell.read().subscription.clone()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let cell = self.cell.read();
        StateSnapshot {
            initialized: cell.initialized,
            subscription: cell.subscription.clone(),
            revision: cell.revision,
            applied_at: cell.applied_at,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.read().initialized
    }

    pub fn revision(&self) -> u64 {
        self.cell.read().revision
    }

    /// Back to the uninitialized state. The revision keeps counting.
    pub fn clear(&self) {
        let mut cell = self.cell.write();
        cell.initialized = false;
        cell.subscription = None;
        cell.revision += 1;
        cell.installed = cell.revision;
        cell.applied_at = None;
    }

    /// Checks the limit and charges `delta` under one write lock, so two
    /// callers can never both take the last unit. `None` when it does not fit
    /// or there is no subscription.
    pub fn try_reserve(&self, delta: ResourceDelta) -> Option<Reservation> {
        let mut cell = self.cell.write();
        let fits = cell
            .subscription
            .as_deref()
            .map_or(false, |subscription| {
                UsageTracker::new(Some(subscription)).can_add(delta.resource, delta.units)
            });
        if !fits {
            return None;
        }
        cell.adjust(delta, true);
        Some(Reservation {
            delta,
            installed: cell.installed,
        })
    }

    /// Charges `delta` without a limit check.
    pub fn charge(&self, delta: ResourceDelta) -> Option<Reservation> {
        let mut cell = self.cell.write();
        if !cell.adjust(delta, true) {
            return None;
        }
        Some(Reservation {
            delta,
            installed: cell.installed,
        })
    }

    /// Hands reserved units back. A no-op once a newer record was installed,
    /// since that record already carries authoritative counters.
    pub fn release(&self, reservation: Reservation) -> bool {
        let mut cell = self.cell.write();
        if cell.installed != reservation.installed {
            return false;
        }
        cell.adjust(reservation.delta, false)
    }
}
