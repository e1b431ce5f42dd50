//! Divergence detection and classification

use crate::error::{Error, Result};
use crate::models::{is_volatile, Conflict, ConflictType, Entity, EntityKind, ResolutionStrategy};

/// Compare declared fields of two records of the same kind, ignoring
/// volatile timestamps.
pub fn deep_equal(a: &Entity, b: &Entity) -> Result<bool> {
    ensure_same_kind(a, b)?;
    let left = a.to_row()?;
    let right = b.to_row()?;
    Ok(a.kind()
        .fields()
        .iter()
        .filter(|field| !is_volatile(field))
        .all(|field| left.get(*field) == right.get(*field)))
}

/// Compare client and server copies of one entity.
///
/// `None` on either side means that side no longer has the record. Returns
/// `Ok(None)` when the copies agree.
pub fn detect(
    kind: EntityKind,
    entity_id: &str,
    client: Option<&Entity>,
    server: Option<&Entity>,
) -> Result<Option<Conflict>> {
    for side in [client, server].into_iter().flatten() {
        if side.kind() != kind || side.id() != entity_id {
            return Err(Error::InvalidInput(format!(
                "snapshot {} {} does not belong to {kind} {entity_id}",
                side.kind(),
                side.id()
            )));
        }
    }

    let conflict_type = match (client, server) {
        (None, None) => return Ok(None),
        (Some(_), None) | (None, Some(_)) => ConflictType::Delete,
        (Some(client), Some(server)) => {
            if deep_equal(client, server)? {
                return Ok(None);
            }
            match (client.updated_at(), server.updated_at()) {
                (Some(client_at), Some(server_at)) if client_at != server_at => {
                    ConflictType::Version
                }
                _ => ConflictType::Data,
            }
        }
    };

    tracing::debug!("Detected {conflict_type} conflict on {kind} {entity_id}");
    Ok(Some(Conflict::new(
        kind,
        entity_id,
        conflict_type,
        client.cloned(),
        server.cloned(),
    )))
}

/// Strategies a user may pick for `conflict`.
///
/// Merging a deletion is meaningless, so delete conflicts only offer the two
/// sides.
pub fn resolution_options(conflict: &Conflict) -> Vec<ResolutionStrategy> {
    match conflict.conflict_type {
        ConflictType::Delete => vec![ResolutionStrategy::Server, ResolutionStrategy::Client],
        ConflictType::Update | ConflictType::Version | ConflictType::Data => {
            ResolutionStrategy::ALL.to_vec()
        }
    }
}

pub(crate) fn ensure_same_kind(a: &Entity, b: &Entity) -> Result<()> {
    if a.kind() == b.kind() {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!(
            "cannot compare a {} with a {}",
            a.kind(),
            b.kind()
        )))
    }
}
