use super::{ApplyContext, SyncEntity};
use crate::models::{
    datetime_from_ms, datetime_to_ms, BookshelfEntry, EntityKind, MutationOp, ShelfPatch,
};

impl SyncEntity for BookshelfEntry {
    type Patch = ShelfPatch;

    const KIND: EntityKind = EntityKind::Bookshelf;
    const IDEMPOTENT_DELETE: bool = true;

    fn key(&self) -> &str {
        &self.book_id
    }

    fn set_key(&mut self, key: &str) {
        self.book_id = key.to_string();
    }

    fn updated_at_ms(&self) -> u64 {
        datetime_to_ms(&self.updated_at)
    }

    fn apply(
        current: Option<&Self>,
        key: &str,
        op: MutationOp,
        patch: Option<&ShelfPatch>,
        ctx: &ApplyContext<'_>,
    ) -> Option<Self> {
        let at = datetime_from_ms(ctx.timestamp);
        match (op, patch) {
            (MutationOp::Delete, _) => None,
            (_, Some(patch)) => Some(BookshelfEntry {
                book_id: key.to_string(),
                status: patch.status,
                // Re-adding keeps the original shelf date
                added_at: current.map(|c| c.added_at).unwrap_or(at),
                updated_at: at,
            }),
            (_, None) => current.cloned(),
        }
    }
}
