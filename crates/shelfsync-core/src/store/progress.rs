use super::{ApplyContext, Dominance, SyncEntity, Verdict};
use crate::models::{
    datetime_from_ms, datetime_to_ms, EntityKind, MutationOp, PositionPatch, ReadingPosition,
};

impl SyncEntity for ReadingPosition {
    type Patch = PositionPatch;

    const KIND: EntityKind = EntityKind::Progress;
    const MONOTONIC: bool = true;

    fn key(&self) -> &str {
        &self.book_id
    }

    fn set_key(&mut self, key: &str) {
        self.book_id = key.to_string();
    }

    fn updated_at_ms(&self) -> u64 {
        datetime_to_ms(&self.updated_at)
    }

    fn source_device(&self) -> Option<&str> {
        self.source_device_id.as_deref()
    }

    fn apply(
        current: Option<&Self>,
        key: &str,
        op: MutationOp,
        patch: Option<&PositionPatch>,
        ctx: &ApplyContext<'_>,
    ) -> Option<Self> {
        match (op, patch) {
            (MutationOp::Delete, _) => None,
            (_, Some(patch)) => Some(ReadingPosition {
                book_id: key.to_string(),
                chapter_id: patch.chapter_id.clone(),
                offset: patch.offset,
                percentage: patch.percentage,
                updated_at: datetime_from_ms(ctx.timestamp),
                source_device_id: Some(ctx.device_id.to_string()),
            }),
            (_, None) => current.cloned(),
        }
    }

    /// A position only moves forward across devices
    ///
    /// Within the ambiguity window the furthest position wins; a strictly
    /// newer remote value wins unless it would move the reader backward.
    fn resolve(local: Option<&Self>, server: &Self, dominance: Dominance, echo: bool) -> Verdict {
        let Some(local) = local else {
            return if dominance == Dominance::ServerNewer && !echo {
                Verdict::AcceptServer
            } else {
                Verdict::KeepLocal
            };
        };
        if echo {
            return Verdict::KeepLocal;
        }

        match dominance {
            Dominance::LocalNewer => Verdict::KeepLocal,
            Dominance::Concurrent if server.percentage > local.percentage => Verdict::AcceptServer,
            Dominance::Concurrent => Verdict::KeepLocal,
            Dominance::ServerNewer if server.percentage >= local.percentage => {
                Verdict::AcceptServer
            }
            Dominance::ServerNewer => Verdict::KeepLocal,
        }
    }
}
