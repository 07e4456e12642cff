//! `checkpoint_writes`: pending writes keyed by `(checkpoint, task_id, idx)`

use crate::checkpoint::is_overwritable;
use crate::error::Result;
use crate::loader::StoredWrite;
use crate::serializer::TypedPayload;
use sqlx::SqliteConnection;

const INSERT_IGNORE: &str = "INSERT INTO checkpoint_writes
    (thread_id, checkpoint_ns, checkpoint_id, task_id, idx, channel, type_tag, payload)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT (thread_id, checkpoint_ns, checkpoint_id, task_id, idx) DO NOTHING";

const INSERT_REPLACE: &str = "INSERT INTO checkpoint_writes
    (thread_id, checkpoint_ns, checkpoint_id, task_id, idx, channel, type_tag, payload)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT (thread_id, checkpoint_ns, checkpoint_id, task_id, idx)
    DO UPDATE SET channel = excluded.channel, type_tag = excluded.type_tag, payload = excluded.payload";

/// Log of writes produced by in-flight tasks.
///
/// Rows for control channels are replaced on conflict; all other rows keep
/// their first value, so a replayed task cannot duplicate side effects.
pub struct WriteLog;

impl WriteLog {
    /// Insert a task's writes; `idx` is the position within `writes`
    pub async fn insert_batch(
        conn: &mut SqliteConnection,
        thread_id: &str,
        checkpoint_ns: &str,
        checkpoint_id: &str,
        task_id: &str,
        writes: &[(String, TypedPayload)],
    ) -> Result<u64> {
        let mut affected = 0;
        for (idx, (channel, payload)) in writes.iter().enumerate() {
            let sql = if is_overwritable(channel) {
                INSERT_REPLACE
            } else {
                INSERT_IGNORE
            };
            affected += sqlx::query(sql)
                .bind(thread_id)
                .bind(checkpoint_ns)
                .bind(checkpoint_id)
                .bind(task_id)
                .bind(idx as i64)
                .bind(channel)
                .bind(&payload.type_tag)
                .bind(payload.payload.as_deref())
                .execute(&mut *conn)
                .await?
                .rows_affected();
        }
        Ok(affected)
    }

    /// All writes recorded against a checkpoint, ordered by task and index
    pub(crate) async fn load(
        conn: &mut SqliteConnection,
        thread_id: &str,
        checkpoint_ns: &str,
        checkpoint_id: &str,
    ) -> Result<Vec<StoredWrite>> {
        let rows: Vec<(String, i64, String, String, Option<Vec<u8>>)> = sqlx::query_as(
            "SELECT task_id, idx, channel, type_tag, payload FROM checkpoint_writes
             WHERE thread_id = ? AND checkpoint_ns = ? AND checkpoint_id = ?
             ORDER BY task_id, idx",
        )
        .bind(thread_id)
        .bind(checkpoint_ns)
        .bind(checkpoint_id)
        .fetch_all(&mut *conn)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(task_id, idx, channel, type_tag, payload)| StoredWrite {
                task_id,
                idx,
                channel,
                payload: TypedPayload::new(type_tag, payload),
            })
            .collect())
    }

    /// Replace a write's stored form, unless it changed since it was read
    #[allow(clippy::too_many_arguments)]
    pub async fn upgrade(
        conn: &mut SqliteConnection,
        thread_id: &str,
        checkpoint_ns: &str,
        checkpoint_id: &str,
        task_id: &str,
        idx: i64,
        original: &TypedPayload,
        upgraded: &TypedPayload,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE checkpoint_writes SET type_tag = ?, payload = ?
             WHERE thread_id = ? AND checkpoint_ns = ? AND checkpoint_id = ? AND task_id = ? AND idx = ?
               AND type_tag = ? AND payload IS ?",
        )
        .bind(&upgraded.type_tag)
        .bind(upgraded.payload.as_deref())
        .bind(thread_id)
        .bind(checkpoint_ns)
        .bind(checkpoint_id)
        .bind(task_id)
        .bind(idx)
        .bind(&original.type_tag)
        .bind(original.payload.as_deref())
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_thread(conn: &mut SqliteConnection, thread_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM checkpoint_writes WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected())
    }
}
