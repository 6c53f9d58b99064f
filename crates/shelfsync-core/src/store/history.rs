use super::{ApplyContext, SyncEntity};
use crate::models::{
    datetime_from_ms, datetime_to_ms, EntityKind, HistoryEntry, HistoryPatch, MutationOp,
};

impl SyncEntity for HistoryEntry {
    type Patch = HistoryPatch;

    const KIND: EntityKind = EntityKind::History;

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
        patch: Option<&HistoryPatch>,
        ctx: &ApplyContext<'_>,
    ) -> Option<Self> {
        let at = datetime_from_ms(ctx.timestamp);
        match (op, patch) {
            (MutationOp::Delete, _) => None,
            (_, Some(patch)) => Some(HistoryEntry {
                book_id: key.to_string(),
                chapter_id: patch.chapter_id.clone(),
                last_read_at: at,
                updated_at: at,
                source_device_id: Some(ctx.device_id.to_string()),
            }),
            (_, None) => current.cloned(),
        }
    }
}
