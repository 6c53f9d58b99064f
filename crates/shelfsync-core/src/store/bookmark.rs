use super::{ApplyContext, SyncEntity};
use crate::models::{
    datetime_from_ms, datetime_to_ms, Bookmark, BookmarkPatch, EntityKind, MutationOp,
};

impl SyncEntity for Bookmark {
    type Patch = BookmarkPatch;

    const KIND: EntityKind = EntityKind::Bookmark;
    const IDEMPOTENT_DELETE: bool = true;

    fn key(&self) -> &str {
        &self.id
    }

    fn set_key(&mut self, key: &str) {
        self.id = key.to_string();
    }

    fn updated_at_ms(&self) -> u64 {
        datetime_to_ms(&self.updated_at)
    }

    fn apply(
        current: Option<&Self>,
        key: &str,
        op: MutationOp,
        patch: Option<&BookmarkPatch>,
        ctx: &ApplyContext<'_>,
    ) -> Option<Self> {
        let at = datetime_from_ms(ctx.timestamp);
        match (op, current, patch) {
            (MutationOp::Delete, _, _) => None,
            (MutationOp::Create, None, Some(patch)) => Some(Bookmark {
                id: key.to_string(),
                book_id: patch.book_id.clone().unwrap_or_default(),
                chapter_id: patch.chapter_id.clone().unwrap_or_default(),
                position: patch.position.unwrap_or_default(),
                note: patch.note.clone(),
                highlight_text: patch.highlight_text.clone(),
                created_at: at,
                updated_at: at,
            }),
            (_, Some(current), Some(patch)) => {
                let mut next = current.clone();
                if let Some(book_id) = &patch.book_id {
                    next.book_id = book_id.clone();
                }
                if let Some(chapter_id) = &patch.chapter_id {
                    next.chapter_id = chapter_id.clone();
                }
                if let Some(position) = patch.position {
                    next.position = position;
                }
                if patch.note.is_some() {
                    next.note = patch.note.clone();
                }
                if patch.highlight_text.is_some() {
                    next.highlight_text = patch.highlight_text.clone();
                }
                next.updated_at = at;
                Some(next)
            }
            // Editing a bookmark that no longer exists changes nothing
            (_, current, _) => current.cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(timestamp: u64) -> ApplyContext<'static> {
        ApplyContext {
            timestamp,
            device_id: "d",
        }
    }

    #[test]
    fn test_create_then_partial_edit() {
        let create = BookmarkPatch {
            book_id: Some("b1".to_string()),
            chapter_id: Some("c2".to_string()),
            position: Some(400),
            highlight_text: Some("call me".to_string()),
            ..Default::default()
        };
        let bookmark =
            Bookmark::apply(None, "tmp-1", MutationOp::Create, Some(&create), &ctx(10)).unwrap();
        assert_eq!(bookmark.id, "tmp-1");
        assert_eq!(bookmark.position, 400);

        let edit = BookmarkPatch {
            note: Some("opening line".to_string()),
            ..Default::default()
        };
        let edited =
            Bookmark::apply(Some(&bookmark), "tmp-1", MutationOp::Update, Some(&edit), &ctx(20))
                .unwrap();
        assert_eq!(edited.note.as_deref(), Some("opening line"));
        assert_eq!(edited.highlight_text.as_deref(), Some("call me"));
        assert_eq!(edited.updated_at_ms(), 20);
        assert_eq!(datetime_to_ms(&edited.created_at), 10);
    }

    #[test]
    fn test_edit_of_missing_bookmark_is_ignored() {
        let edit = BookmarkPatch {
            note: Some("x".to_string()),
            ..Default::default()
        };
        assert!(Bookmark::apply(None, "bm-1", MutationOp::Update, Some(&edit), &ctx(1)).is_none());
    }
}
