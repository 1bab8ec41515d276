//! Pinned memory reservations held outside normal model allocations

use crate::types::DeviceId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

pub type ReservationId = Uuid;

/// Memory set aside on a device for a critical purpose
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub device_id: DeviceId,
    pub memory_size: u64,
    pub purpose: String,
    pub created_at: DateTime<Utc>,
    /// `None` pins the memory until cancelled
    pub expires_at: Option<DateTime<Utc>>,
}

impl Reservation {
    pub(crate) fn new(
        device_id: DeviceId,
        memory_size: u64,
        purpose: impl Into<String>,
        ttl: Option<Duration>,
    ) -> Self {
        let created_at = Utc::now();
        let expires_at = ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .and_then(|ttl| created_at.checked_add_signed(ttl));
        Self {
            id: Uuid::new_v4(),
            device_id,
            memory_size,
            purpose: purpose.into(),
            created_at,
            expires_at,
        }
    }

    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}
