//! SQLite persistence for deadlines, the duplicate review queue and reminders.

use std::str::FromStr;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use timely_core::{
    Category, Deadline, DeadlineDraft, ReminderRequest, ReminderTarget, ReviewItem, ReviewStatus,
};
use tracing::{debug, info};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

const DEADLINE_COLUMNS: &str = "id, identity_key, title, category, due_at, start_at, description, \
     link, is_critical, is_event, created_at, updated_at";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("deadline {0} not found")]
    DeadlineNotFound(i64),
    #[error("review item {0} not found or already closed")]
    ReviewNotFound(i64),
    #[error("reminder {0} not found")]
    ReminderNotFound(i64),
    #[error("invalid merge: {0}")]
    InvalidMerge(String),
    #[error("corrupt value {value:?} in column {column}")]
    Corrupt { column: &'static str, value: String },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::DeadlineNotFound(_)
                | StoreError::ReviewNotFound(_)
                | StoreError::ReminderNotFound(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "id", rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted(i64),
    Updated(i64),
    Unchanged(i64),
}

impl UpsertOutcome {
    pub fn id(&self) -> i64 {
        match self {
            UpsertOutcome::Inserted(id) | UpsertOutcome::Updated(id) | UpsertOutcome::Unchanged(id) => {
                *id
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeOutcome {
    pub kept: Deadline,
    pub removed_id: i64,
    pub reminders_moved: u64,
}

#[derive(Debug, Clone)]
pub struct NewReminder {
    pub target: ReminderTarget,
    pub deadline_id: i64,
    pub lead_minutes: i64,
    pub remind_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// A reminder whose time has come, with the deadline it points at.
#[derive(Debug, Clone)]
pub struct DueReminder {
    pub request: ReminderRequest,
    pub deadline: Deadline,
}

#[derive(Debug, Clone)]
pub struct DeadlineStore {
    pool: SqlitePool,
}

impl DeadlineStore {
    /// Opens (creating if needed) the database at `url` and applies migrations.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);

        // Each in-memory connection is its own database, so keep exactly one alive.
        let in_memory = url.contains(":memory:");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options.connect_with(options).await?;
        let store = Self { pool };
        store.migrate().await?;
        info!(in_memory, "deadline store ready");
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    /// Inserts or merges by identity key. Running the same draft twice leaves
    /// one row and reports `Unchanged` the second time.
    pub async fn upsert(&self, draft: &DeadlineDraft) -> Result<UpsertOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(&format!(
            "SELECT {DEADLINE_COLUMNS} FROM deadlines WHERE identity_key = ?"
        ))
        .bind(&draft.identity_key)
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| deadline_from_row(&row))
        .transpose()?;

        let Some(existing) = existing else {
            let result = sqlx::query(
                r#"
                INSERT INTO deadlines
                    (identity_key, title, category, due_at, start_at, description, link,
                     is_critical, is_event, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&draft.identity_key)
            .bind(&draft.title)
            .bind(draft.category.as_str())
            .bind(ts(draft.due_at))
            .bind(draft.start_at.map(ts))
            .bind(&draft.description)
            .bind(&draft.link)
            .bind(draft.is_critical)
            .bind(draft.is_event)
            .bind(ts(draft.observed_at))
            .bind(ts(draft.observed_at))
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            let id = result.last_insert_rowid();
            debug!(id, title = %draft.title, "inserted deadline");
            return Ok(UpsertOutcome::Inserted(id));
        };

        let description = if !draft.description.is_empty() && draft.description != existing.description
        {
            draft.description.clone()
        } else {
            existing.description.clone()
        };
        let link = draft.link.clone().or_else(|| existing.link.clone());

        let unchanged = existing.title == draft.title
            && existing.category == draft.category
            && ts(existing.due_at) == ts(draft.due_at)
            && existing.start_at.map(ts) == draft.start_at.map(ts)
            && existing.description == description
            && existing.link == link
            && existing.is_critical == draft.is_critical
            && existing.is_event == draft.is_event;

        if unchanged {
            tx.commit().await?;
            return Ok(UpsertOutcome::Unchanged(existing.id));
        }

        let created_at = existing.created_at.min(draft.observed_at);
        sqlx::query(
            r#"
            UPDATE deadlines
            SET title = ?, category = ?, due_at = ?, start_at = ?, description = ?, link = ?,
                is_critical = ?, is_event = ?, created_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&draft.title)
        .bind(draft.category.as_str())
        .bind(ts(draft.due_at))
        .bind(draft.start_at.map(ts))
        .bind(&description)
        .bind(&link)
        .bind(draft.is_critical)
        .bind(draft.is_event)
        .bind(ts(created_at))
        .bind(ts(draft.observed_at))
        .bind(existing.id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        debug!(id = existing.id, title = %draft.title, "updated deadline");
        Ok(UpsertOutcome::Updated(existing.id))
    }

    pub async fn get(&self, id: i64) -> Result<Option<Deadline>, StoreError> {
        sqlx::query(&format!("SELECT {DEADLINE_COLUMNS} FROM deadlines WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| deadline_from_row(&row))
            .transpose()
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM deadlines")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Deadlines not yet due, soonest first.
    pub async fn list_upcoming(&self, now: DateTime<Utc>) -> Result<Vec<Deadline>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {DEADLINE_COLUMNS} FROM deadlines WHERE due_at >= ? ORDER BY due_at ASC, id ASC"
        ))
        .bind(ts(now))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(deadline_from_row).collect()
    }

    pub async fn list_by_category(
        &self,
        category: Category,
        now: DateTime<Utc>,
    ) -> Result<Vec<Deadline>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {DEADLINE_COLUMNS} FROM deadlines \
             WHERE category = ? AND due_at >= ? ORDER BY due_at ASC, id ASC"
        ))
        .bind(category.as_str())
        .bind(ts(now))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(deadline_from_row).collect()
    }

    /// Deadlines with `now <= due_at <= now + window`, ascending by due time.
    pub async fn list_due_within(
        &self,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<Vec<Deadline>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {DEADLINE_COLUMNS} FROM deadlines \
             WHERE due_at >= ? AND due_at <= ? ORDER BY due_at ASC, id ASC"
        ))
        .bind(ts(now))
        .bind(ts(now + window))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(deadline_from_row).collect()
    }

    /// Case-insensitive substring search over title and description of
    /// deadlines that are still upcoming.
    pub async fn search(&self, query: &str, now: DateTime<Utc>) -> Result<Vec<Deadline>, StoreError> {
        let pattern = format!("%{}%", escape_like(query.trim()));
        let rows = sqlx::query(&format!(
            r#"SELECT {DEADLINE_COLUMNS} FROM deadlines
               WHERE (title LIKE ? ESCAPE '\' OR description LIKE ? ESCAPE '\')
                 AND due_at >= ?
               ORDER BY due_at ASC, id ASC"#
        ))
        .bind(&pattern)
        .bind(&pattern)
        .bind(ts(now))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(deadline_from_row).collect()
    }

    /// Removes deadlines due before `cutoff`; their reminders and review
    /// items are removed by cascade.
    pub async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM deadlines WHERE due_at < ?")
            .bind(ts(cutoff))
            .execute(&self.pool)
            .await?;
        let removed = result.rows_affected();
        info!(removed, cutoff = %cutoff, "deleted old deadlines");
        Ok(removed)
    }

    /// Queues a pair for admin review. Returns false when the pair was already
    /// queued (open or dismissed).
    pub async fn flag_for_review(
        &self,
        first: i64,
        second: i64,
        confidence: f64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let (a, b) = if first <= second { (first, second) } else { (second, first) };
        let result = sqlx::query(
            r#"
            INSERT INTO review_items (deadline_a, deadline_b, confidence, status, created_at)
            VALUES (?, ?, ?, 'open', ?)
            ON CONFLICT (deadline_a, deadline_b) DO NOTHING
            "#,
        )
        .bind(a)
        .bind(b)
        .bind(confidence)
        .bind(ts(now))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn open_review_items(&self) -> Result<Vec<ReviewItem>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT r.id, r.deadline_a, a.title AS title_a, r.deadline_b, b.title AS title_b,
                   r.confidence, r.status, r.created_at
            FROM review_items r
            JOIN deadlines a ON a.id = r.deadline_a
            JOIN deadlines b ON b.id = r.deadline_b
            WHERE r.status = 'open'
            ORDER BY r.confidence DESC, r.id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<ReviewItem, StoreError> {
                let status: String = row.try_get("status")?;
                Ok(ReviewItem {
                    id: row.try_get("id")?,
                    deadline_a: row.try_get("deadline_a")?,
                    title_a: row.try_get("title_a")?,
                    deadline_b: row.try_get("deadline_b")?,
                    title_b: row.try_get("title_b")?,
                    confidence: row.try_get("confidence")?,
                    status: ReviewStatus::from_str(&status).map_err(|value| StoreError::Corrupt {
                        column: "status",
                        value,
                    })?,
                    created_at: parse_ts("created_at", row.try_get("created_at")?)?,
                })
            })
            .collect()
    }

    pub async fn dismiss_review(&self, id: i64, now: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE review_items SET status = 'dismissed', resolved_at = ? WHERE id = ? AND status = 'open'",
        )
        .bind(ts(now))
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ReviewNotFound(id));
        }
        Ok(())
    }

    /// Folds `remove_id` into `keep_id`: reminders move over, missing
    /// description and link are taken from the removed row, then it is deleted.
    pub async fn merge(
        &self,
        keep_id: i64,
        remove_id: i64,
        now: DateTime<Utc>,
    ) -> Result<MergeOutcome, StoreError> {
        if keep_id == remove_id {
            return Err(StoreError::InvalidMerge(format!(
                "cannot merge deadline {keep_id} into itself"
            )));
        }

        let mut tx = self.pool.begin().await?;
        let select = format!("SELECT {DEADLINE_COLUMNS} FROM deadlines WHERE id = ?");
        let keep = sqlx::query(&select)
            .bind(keep_id)
            .fetch_optional(&mut *tx)
            .await?
            .map(|row| deadline_from_row(&row))
            .transpose()?
            .ok_or(StoreError::DeadlineNotFound(keep_id))?;
        let remove = sqlx::query(&select)
            .bind(remove_id)
            .fetch_optional(&mut *tx)
            .await?
            .map(|row| deadline_from_row(&row))
            .transpose()?
            .ok_or(StoreError::DeadlineNotFound(remove_id))?;

        // Moved reminders keep their lead but follow the kept deadline's due time.
        let leads = sqlx::query("SELECT id, lead_minutes FROM reminders WHERE deadline_id = ?")
            .bind(remove_id)
            .fetch_all(&mut *tx)
            .await?;
        let mut moved = 0u64;
        for row in &leads {
            let id: i64 = row.try_get("id")?;
            let lead_minutes: i64 = row.try_get("lead_minutes")?;
            let remind_at = Duration::try_minutes(lead_minutes)
                .and_then(|lead| keep.due_at.checked_sub_signed(lead))
                .unwrap_or(keep.due_at);
            moved += sqlx::query("UPDATE reminders SET deadline_id = ?, remind_at = ? WHERE id = ?")
                .bind(keep_id)
                .bind(ts(remind_at))
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }

        let description = if keep.description.is_empty() {
            remove.description.clone()
        } else {
            keep.description.clone()
        };
        let link = keep.link.clone().or_else(|| remove.link.clone());
        sqlx::query("UPDATE deadlines SET description = ?, link = ?, updated_at = ? WHERE id = ?")
            .bind(&description)
            .bind(&link)
            .bind(ts(now))
            .bind(keep_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM deadlines WHERE id = ?")
            .bind(remove_id)
            .execute(&mut *tx)
            .await?;

        let kept = sqlx::query(&select)
            .bind(keep_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(StoreError::from)
            .and_then(|row| deadline_from_row(&row))?;
        tx.commit().await?;

        info!(keep_id, remove_id, reminders_moved = moved, "merged deadlines");
        Ok(MergeOutcome {
            kept,
            removed_id: remove_id,
            reminders_moved: moved,
        })
    }

    pub async fn add_reminder(&self, reminder: &NewReminder) -> Result<ReminderRequest, StoreError> {
        if self.get(reminder.deadline_id).await?.is_none() {
            return Err(StoreError::DeadlineNotFound(reminder.deadline_id));
        }

        let result = sqlx::query(
            r#"
            INSERT INTO reminders (target, deadline_id, lead_minutes, remind_at, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(reminder.target.to_string())
        .bind(reminder.deadline_id)
        .bind(reminder.lead_minutes)
        .bind(ts(reminder.remind_at))
        .bind(ts(reminder.created_at))
        .execute(&self.pool)
        .await?;

        Ok(ReminderRequest {
            id: result.last_insert_rowid(),
            target: reminder.target,
            deadline_id: reminder.deadline_id,
            lead_minutes: reminder.lead_minutes,
            remind_at: reminder.remind_at,
            created_at: reminder.created_at,
        })
    }

    /// Reminders with `remind_at <= now`, oldest first.
    pub async fn due_reminders(&self, now: DateTime<Utc>) -> Result<Vec<DueReminder>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT r.id AS reminder_id, r.target, r.deadline_id, r.lead_minutes, r.remind_at,
                   r.created_at AS reminder_created_at,
                   d.id, d.identity_key, d.title, d.category, d.due_at, d.start_at,
                   d.description, d.link, d.is_critical, d.is_event, d.created_at, d.updated_at
            FROM reminders r
            JOIN deadlines d ON d.id = r.deadline_id
            WHERE r.remind_at <= ?
            ORDER BY r.remind_at ASC, r.id ASC
            "#,
        )
        .bind(ts(now))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<DueReminder, StoreError> {
                Ok(DueReminder {
                    request: ReminderRequest {
                        id: row.try_get("reminder_id")?,
                        target: parse_target(row.try_get("target")?)?,
                        deadline_id: row.try_get("deadline_id")?,
                        lead_minutes: row.try_get("lead_minutes")?,
                        remind_at: parse_ts("remind_at", row.try_get("remind_at")?)?,
                        created_at: parse_ts("created_at", row.try_get("reminder_created_at")?)?,
                    },
                    deadline: deadline_from_row(row)?,
                })
            })
            .collect()
    }

    pub async fn reminders_for_target(
        &self,
        target: ReminderTarget,
    ) -> Result<Vec<ReminderRequest>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, target, deadline_id, lead_minutes, remind_at, created_at
            FROM reminders WHERE target = ? ORDER BY remind_at ASC, id ASC
            "#,
        )
        .bind(target.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(reminder_from_row).collect()
    }

    pub async fn count_reminders(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM reminders")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn delete_reminder(&self, id: i64) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM reminders WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ReminderNotFound(id));
        }
        Ok(())
    }
}

fn ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_ts(column: &'static str, value: String) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::Corrupt { column, value })
}

fn parse_target(value: String) -> Result<ReminderTarget, StoreError> {
    ReminderTarget::from_str(&value).map_err(|_| StoreError::Corrupt {
        column: "target",
        value,
    })
}

fn escape_like(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn deadline_from_row(row: &SqliteRow) -> Result<Deadline, StoreError> {
    let category: String = row.try_get("category")?;
    let start_at: Option<String> = row.try_get("start_at")?;
    Ok(Deadline {
        id: row.try_get("id")?,
        identity_key: row.try_get("identity_key")?,
        title: row.try_get("title")?,
        category: Category::from_str(&category).map_err(|_| StoreError::Corrupt {
            column: "category",
            value: category.clone(),
        })?,
        due_at: parse_ts("due_at", row.try_get("due_at")?)?,
        start_at: start_at.map(|v| parse_ts("start_at", v)).transpose()?,
        description: row.try_get("description")?,
        link: row.try_get("link")?,
        is_critical: row.try_get("is_critical")?,
        is_event: row.try_get("is_event")?,
        created_at: parse_ts("created_at", row.try_get("created_at")?)?,
        updated_at: parse_ts("updated_at", row.try_get("updated_at")?)?,
    })
}

fn reminder_from_row(row: &SqliteRow) -> Result<ReminderRequest, StoreError> {
    Ok(ReminderRequest {
        id: row.try_get("id")?,
        target: parse_target(row.try_get("target")?)?,
        deadline_id: row.try_get("deadline_id")?,
        lead_minutes: row.try_get("lead_minutes")?,
        remind_at: parse_ts("remind_at", row.try_get("remind_at")?)?,
        created_at: parse_ts("created_at", row.try_get("created_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use timely_core::identity_key;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap()
    }

    fn draft(title: &str, due_at: DateTime<Utc>, category: Category) -> DeadlineDraft {
        DeadlineDraft {
            identity_key: identity_key(title, due_at),
            title: title.to_string(),
            category,
            due_at,
            start_at: None,
            description: format!("{title} details"),
            link: None,
            is_critical: false,
            is_event: false,
            observed_at: now(),
        }
    }

    async fn store() -> DeadlineStore {
        DeadlineStore::in_memory().await.expect("in-memory store")
    }

    #[tokio::test]
    async fn upsert_is_idempotent_and_keeps_created_at() {
        let store = store().await;
        let mut record = draft("Submit Health Forms", now() + Duration::days(3), Category::Medical);

        let first = store.upsert(&record).await.expect("insert");
        assert!(matches!(first, UpsertOutcome::Inserted(_)));
        let second = store.upsert(&record).await.expect("repeat");
        assert_eq!(second, UpsertOutcome::Unchanged(first.id()));
        assert_eq!(store.count().await.expect("count"), 1);

        record.description = "Upload the form to the health portal".into();
        record.observed_at = now() + Duration::hours(6);
        let third = store.upsert(&record).await.expect("update");
        assert_eq!(third, UpsertOutcome::Updated(first.id()));

        let stored = store.get(first.id()).await.expect("get").expect("row");
        assert_eq!(stored.description, "Upload the form to the health portal");
        assert_eq!(stored.created_at, now());
        assert_eq!(stored.updated_at, now() + Duration::hours(6));
        assert_eq!(store.count().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn empty_description_does_not_erase_stored_one() {
        let store = store().await;
        let mut record = draft("Housing Application", now() + Duration::days(9), Category::Housing);
        record.link = Some("https://example.edu/housing".into());
        let id = store.upsert(&record).await.expect("insert").id();

        record.description.clear();
        record.link = None;
        assert_eq!(
            store.upsert(&record).await.expect("upsert"),
            UpsertOutcome::Unchanged(id)
        );
        let stored = store.get(id).await.expect("get").expect("row");
        assert_eq!(stored.description, "Housing Application details");
        assert_eq!(stored.link.as_deref(), Some("https://example.edu/housing"));
    }

    #[tokio::test]
    async fn list_due_within_returns_window_ascending() {
        let store = store().await;
        for days in [10, 2, 5, 1] {
            store
                .upsert(&draft(&format!("Task {days}"), now() + Duration::days(days), Category::Other))
                .await
                .expect("insert");
        }

        let due = store
            .list_due_within(now(), Duration::days(3))
            .await
            .expect("list");
        let titles: Vec<_> = due.iter().map(|d| d.title.as_str()).collect();
        assert_eq!(titles, vec!["Task 1", "Task 2"]);
    }

    #[tokio::test]
    async fn listings_skip_past_deadlines() {
        let store = store().await;
        store
            .upsert(&draft("Old Tuition Bill", now() - Duration::days(1), Category::Financial))
            .await
            .expect("insert");
        store
            .upsert(&draft("Tuition Bill", now() + Duration::days(1), Category::Financial))
            .await
            .expect("insert");
        store
            .upsert(&draft("Roommate Form", now() + Duration::days(2), Category::Housing))
            .await
            .expect("insert");

        let financial = store
            .list_by_category(Category::Financial, now())
            .await
            .expect("list");
        assert_eq!(financial.len(), 1);
        assert_eq!(financial[0].title, "Tuition Bill");
        assert_eq!(store.list_upcoming(now()).await.expect("list").len(), 2);
    }

    #[tokio::test]
    async fn search_matches_substrings_and_escapes_wildcards() {
        let store = store().await;
        store
            .upsert(&draft("Meal Plan Selection", now() + Duration::days(4), Category::Financial))
            .await
            .expect("insert");
        store
            .upsert(&draft("100% Attendance Pledge", now() + Duration::days(4), Category::Other))
            .await
            .expect("insert");

        let hits = store.search("meal", now()).await.expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Meal Plan Selection");

        let hits = store.search("100%", now()).await.expect("search");
        assert_eq!(hits.len(), 1);
        assert!(store.search("%", now()).await.expect("search").len() == 1);
    }

    #[tokio::test]
    async fn merge_moves_reminders_and_deletes_removed_row() {
        let store = store().await;
        let due = now() + Duration::days(5);
        let keep = store
            .upsert(&draft("Housing Application", due, Category::Housing))
            .await
            .expect("keep")
            .id();
        let mut dup = draft("Housing Applications", due, Category::Housing);
        dup.link = Some("https://example.edu/apply".into());
        let remove = store.upsert(&dup).await.expect("dup").id();

        store
            .add_reminder(&NewReminder {
                target: ReminderTarget::User(7),
                deadline_id: remove,
                lead_minutes: 60,
                remind_at: due - Duration::hours(1),
                created_at: now(),
            })
            .await
            .expect("reminder");
        assert!(store.flag_for_review(remove, keep, 0.97, now()).await.expect("flag"));

        let outcome = store.merge(keep, remove, now()).await.expect("merge");
        assert_eq!(outcome.reminders_moved, 1);
        assert_eq!(outcome.kept.link.as_deref(), Some("https://example.edu/apply"));
        assert!(store.get(remove).await.expect("get").is_none());
        assert_eq!(store.count().await.expect("count"), 1);

        let reminders = store
            .reminders_for_target(ReminderTarget::User(7))
            .await
            .expect("reminders");
        assert_eq!(reminders[0].deadline_id, keep);
        assert!(store.open_review_items().await.expect("review").is_empty());
    }

    #[tokio::test]
    async fn merged_reminders_follow_the_kept_due_date() {
        let store = store().await;
        let keep_due = now() + Duration::days(5);
        let remove_due = now() + Duration::days(6);
        let keep = store
            .upsert(&draft("Meal Plan Selection", keep_due, Category::Financial))
            .await
            .expect("keep")
            .id();
        let remove = store
            .upsert(&draft("Meal Plan Selections", remove_due, Category::Financial))
            .await
            .expect("dup")
            .id();
        store
            .add_reminder(&NewReminder {
                target: ReminderTarget::Channel(3),
                deadline_id: remove,
                lead_minutes: 120,
                remind_at: remove_due - Duration::hours(2),
                created_at: now(),
            })
            .await
            .expect("reminder");

        store.merge(keep, remove, now()).await.expect("merge");

        let reminders = store
            .reminders_for_target(ReminderTarget::Channel(3))
            .await
            .expect("reminders");
        assert_eq!(reminders.len(), 1);
        assert_eq!(reminders[0].lead_minutes, 120);
        assert_eq!(reminders[0].remind_at, keep_due - Duration::hours(2));
    }

    #[tokio::test]
    async fn merge_rejects_self_and_missing_rows() {
        let store = store().await;
        let id = store
            .upsert(&draft("Exam Registration", now() + Duration::days(2), Category::Registration))
            .await
            .expect("insert")
            .id();

        assert!(matches!(
            store.merge(id, id, now()).await,
            Err(StoreError::InvalidMerge(_))
        ));
        assert!(matches!(
            store.merge(id, 999, now()).await,
            Err(StoreError::DeadlineNotFound(999))
        ));
    }

    #[tokio::test]
    async fn review_pairs_are_flagged_once_and_dismissable() {
        let store = store().await;
        let a = store
            .upsert(&draft("Submit Transcript", now() + Duration::days(3), Category::Academic))
            .await
            .expect("a")
            .id();
        let b = store
            .upsert(&draft("Submit Transcripts", now() + Duration::days(4), Category::Academic))
            .await
            .expect("b")
            .id();

        assert!(store.flag_for_review(a, b, 0.95, now()).await.expect("flag"));
        assert!(!store.flag_for_review(b, a, 0.95, now()).await.expect("reflag"));

        let open = store.open_review_items().await.expect("open");
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].title_a, "Submit Transcript");
        assert_eq!(open[0].status, ReviewStatus::Open);

        store.dismiss_review(open[0].id, now()).await.expect("dismiss");
        assert!(store.open_review_items().await.expect("open").is_empty());
        assert!(!store.flag_for_review(a, b, 0.95, now()).await.expect("after dismiss"));
        assert!(matches!(
            store.dismiss_review(open[0].id, now()).await,
            Err(StoreError::ReviewNotFound(_))
        ));
    }

    #[tokio::test]
    async fn due_reminders_and_cascading_cleanup() {
        let store = store().await;
        let id = store
            .upsert(&draft("Final Tuition Payment", now() + Duration::hours(2), Category::Financial))
            .await
            .expect("insert")
            .id();
        let reminder = store
            .add_reminder(&NewReminder {
                target: ReminderTarget::Channel(11),
                deadline_id: id,
                lead_minutes: 180,
                remind_at: now() - Duration::hours(1),
                created_at: now() - Duration::hours(2),
            })
            .await
            .expect("reminder");

        let due = store.due_reminders(now()).await.expect("due");
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].request, reminder);
        assert_eq!(due[0].deadline.title, "Final Tuition Payment");
        assert!(store
            .due_reminders(now() - Duration::hours(2))
            .await
            .expect("due")
            .is_empty());

        let removed = store
            .delete_older_than(now() + Duration::days(1))
            .await
            .expect("cleanup");
        assert_eq!(removed, 1);
        assert_eq!(store.count_reminders().await.expect("count"), 0);
        assert!(matches!(
            store.delete_reminder(reminder.id).await,
            Err(StoreError::ReminderNotFound(_))
        ));
    }

    #[tokio::test]
    async fn reminder_for_missing_deadline_is_rejected() {
        let store = store().await;
        let err = store
            .add_reminder(&NewReminder {
                target: ReminderTarget::User(1),
                deadline_id: 42,
                lead_minutes: 30,
                remind_at: now(),
                created_at: now(),
            })
            .await
            .expect_err("missing deadline");
        assert!(err.is_not_found());
    }
}
