use rusqlite::{params, types::Type, OptionalExtension, Row};

use crate::db::Database;
use crate::errors::EngineError;
use crate::models::{ActivityKind, QueryWindow, TrackItem};

fn parse_kind(value: &str) -> Result<ActivityKind, rusqlite::Error> {
    match value {
        "app" => Ok(ActivityKind::App),
        "status" => Ok(ActivityKind::Status),
        "log" => Ok(ActivityKind::Log),
        other => Err(rusqlite::Error::FromSqlConversionFailure(
            1,
            Type::Text,
            format!("unknown activity kind '{other}'").into(),
        )),
    }
}

fn row_to_item(row: &Row) -> Result<TrackItem, rusqlite::Error> {
    let kind_str: String = row.get("kind")?;

    Ok(TrackItem {
        id: Some(row.get("id")?),
        kind: parse_kind(&kind_str)?,
        identity: row.get("identity")?,
        begin_date: row.get("begin_date")?,
        end_date: row.get("end_date")?,
        color: row.get("color")?,
    })
}

/// Open-interior overlap probe for `[begin, end]` of the given kind.
/// Items that merely touch at an endpoint are not overlaps.
fn find_overlapping(
    conn: &rusqlite::Connection,
    kind: ActivityKind,
    begin: i64,
    end: i64,
    exclude_id: Option<i64>,
) -> Result<Option<i64>, rusqlite::Error> {
    conn.query_row(
        "SELECT id FROM track_items
         WHERE kind = ?1
           AND begin_date < ?3
           AND end_date > ?2
           AND (?4 IS NULL OR id != ?4)
         LIMIT 1",
        params![kind.as_str(), begin, end, exclude_id],
        |row| row.get(0),
    )
    .optional()
}

impl Database {
    /// Insert a closed or freshly opened item; returns the assigned id.
    /// Fails closed with `Overlap` if the interval's open interior
    /// intersects an existing item of the same kind.
    pub async fn insert_item(&self, item: &TrackItem) -> Result<i64, EngineError> {
        item.validate()?;

        let record = item.clone();
        self.execute(move |conn| {
            if find_overlapping(conn, record.kind, record.begin_date, record.end_date, None)?
                .is_some()
            {
                return Err(EngineError::Overlap {
                    kind: record.kind,
                    begin: record.begin_date,
                    end: record.end_date,
                });
            }

            conn.execute(
                "INSERT INTO track_items (kind, identity, begin_date, end_date, color)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.kind.as_str(),
                    record.identity,
                    record.begin_date,
                    record.end_date,
                    record.color,
                ],
            )?;

            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Rewrite every field of an existing item in one statement, so a
    /// concurrent reader never sees a half-applied update.
    pub async fn update_item(&self, id: i64, item: &TrackItem) -> Result<(), EngineError> {
        item.validate()?;

        let record = item.clone();
        self.execute(move |conn| {
            if find_overlapping(
                conn,
                record.kind,
                record.begin_date,
                record.end_date,
                Some(id),
            )?
            .is_some()
            {
                return Err(EngineError::Overlap {
                    kind: record.kind,
                    begin: record.begin_date,
                    end: record.end_date,
                });
            }

            let changed = conn.execute(
                "UPDATE track_items
                 SET kind = ?1,
                     identity = ?2,
                     begin_date = ?3,
                     end_date = ?4,
                     color = ?5
                 WHERE id = ?6",
                params![
                    record.kind.as_str(),
                    record.identity,
                    record.begin_date,
                    record.end_date,
                    record.color,
                    id,
                ],
            )?;

            if changed == 0 {
                return Err(EngineError::NotFound(id));
            }

            Ok(())
        })
        .await
    }

    /// Bulk delete by id; absent ids are skipped. Returns rows removed.
    pub async fn delete_items(&self, ids: Vec<i64>) -> Result<usize, EngineError> {
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let mut deleted = 0;

            for id in &ids {
                deleted += tx.execute("DELETE FROM track_items WHERE id = ?1", params![id])?;
            }

            tx.commit()?;
            Ok(deleted)
        })
        .await
    }

    /// Items of `kind` whose closed interval intersects `[from, to]`,
    /// ordered by beginDate then id so identical inputs give identical
    /// output.
    pub async fn find_in_range(
        &self,
        kind: ActivityKind,
        from: i64,
        to: i64,
    ) -> Result<Vec<TrackItem>, EngineError> {
        QueryWindow::new(from, to).validate()?;

        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, kind, identity, begin_date, end_date, color
                 FROM track_items
                 WHERE kind = ?1
                   AND begin_date <= ?3
                   AND end_date >= ?2
                 ORDER BY begin_date ASC, id ASC",
            )?;

            let rows = stmt.query_map(params![kind.as_str(), from, to], row_to_item)?;

            let mut items = Vec::new();
            for item in rows {
                items.push(item?);
            }

            Ok(items)
        })
        .await
    }

    /// Range query narrowed to items whose identity contains `needle`.
    pub async fn search_in_range(
        &self,
        kind: ActivityKind,
        from: i64,
        to: i64,
        needle: String,
    ) -> Result<Vec<TrackItem>, EngineError> {
        QueryWindow::new(from, to).validate()?;

        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, kind, identity, begin_date, end_date, color
                 FROM track_items
                 WHERE kind = ?1
                   AND begin_date <= ?3
                   AND end_date >= ?2
                   AND instr(identity, ?4) > 0
                 ORDER BY begin_date ASC, id ASC",
            )?;

            let rows = stmt.query_map(params![kind.as_str(), from, to, needle], row_to_item)?;

            let mut items = Vec::new();
            for item in rows {
                items.push(item?);
            }

            Ok(items)
        })
        .await
    }

    /// Earliest persisted item of `kind`, used to bound "since" queries.
    pub async fn find_first(&self, kind: ActivityKind) -> Result<Option<TrackItem>, EngineError> {
        self.execute(move |conn| {
            let item = conn
                .query_row(
                    "SELECT id, kind, identity, begin_date, end_date, color
                     FROM track_items
                     WHERE kind = ?1
                     ORDER BY begin_date ASC, id ASC
                     LIMIT 1",
                    params![kind.as_str()],
                    row_to_item,
                )
                .optional()?;

            Ok(item)
        })
        .await
    }

    /// Recolor every persisted item of `kind` with a matching identity.
    pub async fn update_color(
        &self,
        kind: ActivityKind,
        identity: String,
        color: Option<String>,
    ) -> Result<usize, EngineError> {
        self.execute(move |conn| {
            let changed = conn.execute(
                "UPDATE track_items SET color = ?1 WHERE kind = ?2 AND identity = ?3",
                params![color, kind.as_str(), identity],
            )?;

            Ok(changed)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(kind: ActivityKind, identity: &str, begin: i64, end: i64) -> TrackItem {
        TrackItem {
            id: None,
            kind,
            identity: identity.to_string(),
            begin_date: begin,
            end_date: end,
            color: None,
        }
    }

    #[tokio::test]
    async fn insert_assigns_id_and_roundtrips() {
        let db = Database::in_memory().unwrap();

        let id = db
            .insert_item(&item(ActivityKind::App, "editor", 100, 200))
            .await
            .unwrap();

        let items = db.find_in_range(ActivityKind::App, 0, 1_000).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, Some(id));
        assert_eq!(items[0].identity, "editor");
        assert_eq!(items[0].begin_date, 100);
        assert_eq!(items[0].end_date, 200);
    }

    #[tokio::test]
    async fn insert_rejects_inverted_interval() {
        let db = Database::in_memory().unwrap();

        let err = db
            .insert_item(&item(ActivityKind::App, "editor", 200, 100))
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::InvalidInterval { .. }));
    }

    #[tokio::test]
    async fn insert_rejects_overlap_of_same_kind() {
        let db = Database::in_memory().unwrap();
        db.insert_item(&item(ActivityKind::App, "editor", 100, 200))
            .await
            .unwrap();

        let err = db
            .insert_item(&item(ActivityKind::App, "browser", 150, 250))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Overlap { .. }));

        // A different kind may occupy the same span.
        db.insert_item(&item(ActivityKind::Status, "ONLINE", 150, 250))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn touching_endpoints_are_not_overlaps() {
        let db = Database::in_memory().unwrap();
        db.insert_item(&item(ActivityKind::App, "editor", 100, 200))
            .await
            .unwrap();

        db.insert_item(&item(ActivityKind::App, "browser", 200, 300))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn update_unknown_id_is_not_found() {
        let db = Database::in_memory().unwrap();

        let err = db
            .update_item(42, &item(ActivityKind::App, "editor", 100, 200))
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::NotFound(42)));
    }

    #[tokio::test]
    async fn update_may_extend_into_free_space_only() {
        let db = Database::in_memory().unwrap();
        let first = db
            .insert_item(&item(ActivityKind::App, "editor", 100, 200))
            .await
            .unwrap();
        db.insert_item(&item(ActivityKind::App, "browser", 300, 400))
            .await
            .unwrap();

        // Extending up to the neighbour's beginDate is allowed.
        db.update_item(first, &item(ActivityKind::App, "editor", 100, 300))
            .await
            .unwrap();

        // Extending into its interior is not.
        let err = db
            .update_item(first, &item(ActivityKind::App, "editor", 100, 350))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Overlap { .. }));
    }

    #[tokio::test]
    async fn delete_reports_removed_count() {
        let db = Database::in_memory().unwrap();
        let a = db
            .insert_item(&item(ActivityKind::App, "editor", 100, 200))
            .await
            .unwrap();
        let b = db
            .insert_item(&item(ActivityKind::App, "browser", 200, 300))
            .await
            .unwrap();

        let deleted = db.delete_items(vec![a, b, 9_999]).await.unwrap();
        assert_eq!(deleted, 2);

        let items = db.find_in_range(ActivityKind::App, 0, 1_000).await.unwrap();
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn find_in_range_returns_intersecting_items_in_order() {
        let db = Database::in_memory().unwrap();
        db.insert_item(&item(ActivityKind::App, "a", 0, 100)).await.unwrap();
        db.insert_item(&item(ActivityKind::App, "b", 150, 250)).await.unwrap();
        db.insert_item(&item(ActivityKind::App, "c", 300, 400)).await.unwrap();

        let items = db.find_in_range(ActivityKind::App, 100, 300).await.unwrap();
        let identities: Vec<_> = items.iter().map(|i| i.identity.as_str()).collect();
        // Items touching the window edges intersect it.
        assert_eq!(identities, vec!["a", "b", "c"]);

        let again = db.find_in_range(ActivityKind::App, 100, 300).await.unwrap();
        assert_eq!(items, again);

        let err = db.find_in_range(ActivityKind::App, 300, 100).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidWindow { .. }));
    }

    #[tokio::test]
    async fn search_filters_by_identity_substring() {
        let db = Database::in_memory().unwrap();
        db.insert_item(&item(ActivityKind::App, "code-editor", 0, 100))
            .await
            .unwrap();
        db.insert_item(&item(ActivityKind::App, "browser", 100, 200))
            .await
            .unwrap();

        let items = db
            .search_in_range(ActivityKind::App, 0, 1_000, "editor".into())
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].identity, "code-editor");
    }

    #[tokio::test]
    async fn find_first_returns_earliest() {
        let db = Database::in_memory().unwrap();
        assert!(db.find_first(ActivityKind::Log).await.unwrap().is_none());

        db.insert_item(&item(ActivityKind::Log, "task", 500, 600))
            .await
            .unwrap();
        db.insert_item(&item(ActivityKind::Log, "earlier", 100, 200))
            .await
            .unwrap();

        let first = db.find_first(ActivityKind::Log).await.unwrap().unwrap();
        assert_eq!(first.identity, "earlier");
    }

    #[tokio::test]
    async fn update_color_recolors_matching_identities() {
        let db = Database::in_memory().unwrap();
        db.insert_item(&item(ActivityKind::App, "editor", 0, 100))
            .await
            .unwrap();
        db.insert_item(&item(ActivityKind::App, "editor", 200, 300))
            .await
            .unwrap();
        db.insert_item(&item(ActivityKind::App, "browser", 100, 200))
            .await
            .unwrap();

        let changed = db
            .update_color(ActivityKind::App, "editor".into(), Some("#36aa1c".into()))
            .await
            .unwrap();
        assert_eq!(changed, 2);

        let items = db.find_in_range(ActivityKind::App, 0, 1_000).await.unwrap();
        let colored = items
            .iter()
            .filter(|i| i.color.as_deref() == Some("#36aa1c"))
            .count();
        assert_eq!(colored, 2);
    }
}
