//! Helpers for building `ParticipantFilter` values and their SQL form.

use chrono::{DateTime, Utc};
use sea_orm::{ColumnTrait, Condition};

use crate::error_handling::types::StorageError;
use crate::storage::db_entities as participants;

pub use crate::storage::types::ParticipantFilter;

/// Build a `ParticipantFilter` that matches participants by submission state.
pub fn by_submitted(submitted: bool) -> ParticipantFilter {
    ParticipantFilter {
        submitted: Some(submitted),
        ..Default::default()
    }
}

/// Translates a filter into a SeaORM condition on the `participants` table.
pub fn participant_conditions(filter: &ParticipantFilter) -> Condition {
    let mut condition = Condition::all();
    match filter.submitted {
        Some(true) => condition = condition.add(participants::Column::SubmittedAt.is_not_null()),
        Some(false) => condition = condition.add(participants::Column::SubmittedAt.is_null()),
        None => {}
    }
    if let Some(ip) = filter.client_ip {
        condition = condition.add(participants::Column::ClientIp.eq(ip.to_string()));
    }
    if let Some(after) = filter.created_after {
        condition = condition.add(participants::Column::CreatedAt.gte(after.to_rfc3339()));
    }
    condition
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|_| StorageError::ReadFailed)
}
