//! Advisory field leases.
//!
//! Each participant keeps its own projection of who holds which field,
//! updated from `field_locked` / `field_unlocked` broadcasts. There is no
//! arbiter: two participants racing for the same field within one round
//! trip can both succeed. The lock is a collaboration hint, not mutual
//! exclusion; the double edit that results is settled by the conflict path
//! in [`update`](crate::update).
//!
//! Per field the state is a two-state machine:
//!
//! ```text
//!              lock_field / remote field_locked
//!   Unlocked ─────────────────────────────────────► LockedBy(lock)
//!      ▲                                                 │
//!      └──── unlock_field / expiry / field_unlocked ─────┘
//! ```
//!
//! Leases the local user holds carry a deadline in `leases`, keyed by field
//! name. Re-arming replaces the entry and firing removes it, so a deadline
//! fires at most once and a superseded one never fires.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::clock::to_chrono;
use crate::config::LeasePolicy;
use crate::messages::{BroadcastMessage, FieldLock, LocalUser, LockHolder};
use crate::transport::Outbox;

/// Lock state of one field as seen locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldLockState {
    Unlocked,
    LockedBy(FieldLock),
}

#[derive(Debug, Clone, Copy)]
struct Lease {
    issued: Instant,
    deadline: Instant,
}

#[derive(Debug)]
pub struct LockManager {
    local: LocalUser,
    ttl: Duration,
    policy: LeasePolicy,
    /// Latest known lock per field, local or remote.
    locks: HashMap<String, FieldLock>,
    /// Expiry deadlines of leases held by the local user.
    leases: HashMap<String, Lease>,
}

impl LockManager {
    pub fn new(local: LocalUser, ttl: Duration, policy: LeasePolicy) -> Self {
        Self {
            local,
            ttl,
            policy,
            locks: HashMap::new(),
            leases: HashMap::new(),
        }
    }

    /// Try to acquire a lease on `field`.
    ///
    /// Fails only if another user holds a live lease. Re-acquiring a field
    /// the local user already holds replaces the lease.
    pub fn lock_field(
        &mut self,
        field: &str,
        now: Instant,
        wall: DateTime<Utc>,
        outbox: &Outbox,
    ) -> bool {
        if let Some(existing) = self.locks.get(field) {
            if existing.user_id != self.local.user_id && existing.is_live(wall) {
                log::debug!(
                    "Lock on {field} refused: held by {} until {}",
                    existing.user_email,
                    existing.expires_at
                );
                return false;
            }
        }
        self.grant(field, now, wall, outbox);
        true
    }

    /// Release `field` if the local user holds it.
    pub fn unlock_field(&mut self, field: &str, outbox: &Outbox) {
        let held = self
            .locks
            .get(field)
            .is_some_and(|lock| lock.user_id == self.local.user_id);
        if !held {
            return;
        }
        self.locks.remove(field);
        self.leases.remove(field);
        log::debug!("Unlocked {field}");
        outbox.broadcast_lock(&BroadcastMessage::Unlocked {
            field_name: field.to_string(),
        });
    }

    /// True only for a live lock held by someone else.
    pub fn is_field_locked(&self, field: &str, wall: DateTime<Utc>) -> bool {
        self.locks.get(field).is_some_and(|lock| {
            lock.user_id != self.local.user_id && lock.is_live(wall)
        })
    }

    /// Holder of a live lock on `field`, local user included.
    pub fn get_field_locker(&self, field: &str, wall: DateTime<Utc>) -> Option<LockHolder> {
        self.locks
            .get(field)
            .filter(|lock| lock.is_live(wall))
            .map(FieldLock::holder)
    }

    pub fn lock_state(&self, field: &str, wall: DateTime<Utc>) -> FieldLockState {
        match self.locks.get(field) {
            Some(lock) if lock.is_live(wall) => FieldLockState::LockedBy(lock.clone()),
            _ => FieldLockState::Unlocked,
        }
    }

    /// Whether the local user holds a live lease on `field`.
    pub fn holds(&self, field: &str, wall: DateTime<Utc>) -> bool {
        self.leases.contains_key(field)
            && self.locks.get(field).is_some_and(|lock| {
                lock.user_id == self.local.user_id && lock.is_live(wall)
            })
    }

    /// Fields the local user currently holds, sorted.
    pub fn held_fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = self.leases.keys().cloned().collect();
        fields.sort();
        fields
    }

    /// Apply a broadcast from the lock channel.
    pub fn apply_remote(&mut self, msg: &BroadcastMessage, wall: DateTime<Utc>) {
        match msg {
            BroadcastMessage::Locked(lock) => {
                if lock.user_id == self.local.user_id {
                    // Own state is authoritative; this is an echo or a stale
                    // duplicate.
                    return;
                }
                if self.leases.remove(&lock.field_name).is_some() {
                    log::debug!(
                        "Lost race for {}: {} locked it concurrently",
                        lock.field_name,
                        lock.user_email
                    );
                }
                log::debug!("{} locked {}", lock.user_email, lock.field_name);
                self.locks.insert(lock.field_name.clone(), lock.clone());
            }
            BroadcastMessage::Unlocked { field_name } => {
                if self.holds(field_name, wall) {
                    // Only the holder or its expiry releases a lease; this
                    // unlock predates ours.
                    log::debug!("Ignoring stale unlock of {field_name} held locally");
                    return;
                }
                if self.locks.remove(field_name).is_some() {
                    log::debug!("{field_name} unlocked");
                }
            }
            BroadcastMessage::Updated(_) => {}
        }
    }

    /// Extend a held lease after local activity, if the policy asks for it.
    ///
    /// Returns `true` when a fresh lease was issued.
    pub fn on_activity(
        &mut self,
        field: &str,
        now: Instant,
        wall: DateTime<Utc>,
        outbox: &Outbox,
    ) -> bool {
        if self.policy != LeasePolicy::RenewOnActivity || !self.holds(field, wall) {
            return false;
        }
        let Some(lease) = self.leases.get(field) else {
            return false;
        };
        if now.saturating_duration_since(lease.issued) < self.ttl / 2 {
            return false;
        }
        self.grant(field, now, wall, outbox);
        true
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.leases.values().map(|l| l.deadline).min()
    }

    /// Expire due leases, broadcasting `field_unlocked` for each. Returns the
    /// expired field names.
    pub fn on_deadline(&mut self, now: Instant, wall: DateTime<Utc>, outbox: &Outbox) -> Vec<String> {
        let mut due: Vec<String> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(field, _)| field.clone())
            .collect();
        due.sort();

        for field in &due {
            self.leases.remove(field);
            let ours = self
                .locks
                .get(field)
                .is_some_and(|lock| lock.user_id == self.local.user_id);
            if ours {
                self.locks.remove(field);
                log::info!("Lease on {field} expired");
                outbox.broadcast_lock(&BroadcastMessage::Unlocked {
                    field_name: field.clone(),
                });
            }
        }

        // Forget remote locks that ran out without an unlock.
        let local_id = &self.local.user_id;
        self.locks
            .retain(|_, lock| &lock.user_id == local_id || lock.is_live(wall));

        due
    }

    /// Drop every remote lock (transport lost). Own leases survive.
    pub fn clear_remote(&mut self) {
        let local_id = &self.local.user_id;
        self.locks.retain(|_, lock| &lock.user_id == local_id);
    }

    /// Release all held leases and forget everything (session teardown).
    pub fn release_all(&mut self, outbox: &Outbox) {
        for field in self.held_fields() {
            self.unlock_field(&field, outbox);
        }
        self.locks.clear();
        self.leases.clear();
    }

    fn grant(&mut self, field: &str, now: Instant, wall: DateTime<Utc>, outbox: &Outbox) {
        let lock = FieldLock {
            field_name: field.to_string(),
            user_id: self.local.user_id.clone(),
            user_email: self.local.user_email.clone(),
            locked_at: wall,
            expires_at: wall + to_chrono(self.ttl),
        };
        self.leases.insert(
            field.to_string(),
            Lease {
                issued: now,
                deadline: now + self.ttl,
            },
        );
        log::debug!("Locked {field} until {}", lock.expires_at);
        let msg = BroadcastMessage::Locked(lock.clone());
        self.locks.insert(field.to_string(), lock);
        outbox.broadcast_lock(&msg);
    }
}
