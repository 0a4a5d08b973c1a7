//! Change conflict detection.
//!
//! Compares an incoming change event with the events committed inside the
//! lookback window. Timestamps come from each writer's own clock, so under
//! skew a conflict can be missed or over-reported.

use std::collections::BTreeSet;
use std::time::Duration;

use tracing::warn;

use crate::domain::{
    ChangeAction, ChangeEvent, ConflictInfo, ConflictKind, ConflictSeverity, CoordinationError,
};
use crate::ports::IdGenerator;

/// An event that passed conflict checks, with the conflicts recorded on it.
#[derive(Debug, Clone)]
pub struct Admitted {
    pub event: ChangeEvent,
    pub conflicts: Vec<ConflictInfo>,
}

pub struct ConflictDetector<G> {
    ids: G,
    window: Duration,
}

impl<G: IdGenerator> ConflictDetector<G> {
    pub fn new(ids: G, window: Duration) -> Self {
        Self { ids, window }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Conflicts between `incoming` and `recent`, in the order of `recent`.
    ///
    /// Only updates by a different worker to the same entity can conflict,
    /// and only against events no older than `window` before `incoming`.
    /// Each recent event yields at most one conflict:
    ///
    /// - it took a lock that no later event released: `LockViolation`, high
    /// - it is an update touching an overlapping field: `ConcurrentEdit`, medium
    pub fn examine(&self, incoming: &ChangeEvent, recent: &[ChangeEvent]) -> Vec<ConflictInfo> {
        if incoming.action != ChangeAction::Update {
            return Vec::new();
        }
        let window = chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::MAX);
        let cutoff = incoming.timestamp.checked_sub_signed(window);
        let incoming_fields = incoming.changed_fields();

        let mut conflicts = Vec::new();
        for (i, existing) in recent.iter().enumerate() {
            if existing.id == incoming.id
                || existing.worker_id == incoming.worker_id
                || !existing.targets_same_entity(incoming)
                || cutoff.is_some_and(|c| existing.timestamp < c)
            {
                continue;
            }

            let fields: BTreeSet<_> = existing
                .changed_fields()
                .intersection(&incoming_fields)
                .cloned()
                .collect();

            let lock_held = existing.acquires_lock()
                && !recent[i + 1..]
                    .iter()
                    .any(|later| later.targets_same_entity(existing) && later.releases_lock());

            let (kind, severity, description) = if lock_held {
                (
                    ConflictKind::LockViolation,
                    ConflictSeverity::High,
                    format!(
                        "{} {} is locked by {}; update by {} rejected",
                        existing.entity_type,
                        existing.entity_id,
                        existing.worker_id,
                        incoming.worker_id
                    ),
                )
            } else if existing.action == ChangeAction::Update && !fields.is_empty() {
                let names: Vec<String> = fields.iter().map(ToString::to_string).collect();
                (
                    ConflictKind::ConcurrentEdit,
                    ConflictSeverity::Medium,
                    format!(
                        "{} and {} both updated {} of {} {}",
                        existing.worker_id,
                        incoming.worker_id,
                        names.join(", "),
                        existing.entity_type,
                        existing.entity_id
                    ),
                )
            } else {
                continue;
            };

            conflicts.push(ConflictInfo {
                id: self.ids.generate_conflict_id(),
                kind,
                severity,
                auto_resolvable: false,
                entity_type: existing.entity_type,
                entity_id: existing.entity_id.clone(),
                existing_event: existing.id,
                existing_worker: existing.worker_id,
                incoming_event: incoming.id,
                incoming_worker: incoming.worker_id,
                fields,
                description,
            });
        }
        conflicts
    }

    /// Apply the write policy to `incoming`.
    ///
    /// Any high-severity conflict rejects the write with `ConflictDetected`.
    /// Medium-severity conflicts are attached to the event and returned.
    pub fn admit(
        &self,
        mut incoming: ChangeEvent,
        recent: &[ChangeEvent],
    ) -> Result<Admitted, CoordinationError> {
        let conflicts = self.examine(&incoming, recent);
        if let Some(blocking) = conflicts.iter().find(|c| c.severity.blocks_write()) {
            warn!(
                entity = %blocking.entity_id,
                worker = %blocking.incoming_worker,
                holder = %blocking.existing_worker,
                "write rejected by lock conflict"
            );
            return Err(CoordinationError::ConflictDetected(Box::new(blocking.clone())));
        }

        for conflict in &conflicts {
            warn!(
                entity = %conflict.entity_id,
                fields = ?conflict.fields,
                "concurrent edit recorded"
            );
        }
        incoming.conflicts = conflicts.iter().map(|c| c.id).collect();
        Ok(Admitted {
            event: incoming,
            conflicts,
        })
    }
}
