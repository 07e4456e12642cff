//! `checkpoint_blobs`: channel values addressed by `(thread, ns, channel, version)`

use crate::checkpoint::ChannelVersions;
use crate::error::Result;
use crate::serializer::TypedPayload;
use sqlx::SqliteConnection;
use std::collections::HashMap;

/// Append-only store of channel values.
///
/// A blob is written once per `(channel, version)`; re-inserting an existing
/// key is ignored. The only in-place change is a schema upgrade on read.
pub struct BlobStore;

impl BlobStore {
    /// Insert blobs, ignoring keys that already exist
    pub async fn insert_many(
        conn: &mut SqliteConnection,
        thread_id: &str,
        checkpoint_ns: &str,
        blobs: &[(String, String, TypedPayload)],
    ) -> Result<u64> {
        let mut inserted = 0;
        for (channel, version, payload) in blobs {
            inserted += sqlx::query(
                "INSERT INTO checkpoint_blobs (thread_id, checkpoint_ns, channel, version, type_tag, payload)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT (thread_id, checkpoint_ns, channel, version) DO NOTHING",
            )
            .bind(thread_id)
            .bind(checkpoint_ns)
            .bind(channel)
            .bind(version)
            .bind(&payload.type_tag)
            .bind(payload.payload.as_deref())
            .execute(&mut *conn)
            .await?
            .rows_affected();
        }
        Ok(inserted)
    }

    pub async fn exists(
        conn: &mut SqliteConnection,
        thread_id: &str,
        checkpoint_ns: &str,
        channel: &str,
        version: &str,
    ) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM checkpoint_blobs
             WHERE thread_id = ? AND checkpoint_ns = ? AND channel = ? AND version = ?",
        )
        .bind(thread_id)
        .bind(checkpoint_ns)
        .bind(channel)
        .bind(version)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(row.is_some())
    }

    /// Blobs at the versions a checkpoint references, keyed by channel.
    /// Channels without a row are left out.
    pub async fn load(
        conn: &mut SqliteConnection,
        thread_id: &str,
        checkpoint_ns: &str,
        versions: &ChannelVersions,
    ) -> Result<HashMap<String, TypedPayload>> {
        let mut blobs = HashMap::with_capacity(versions.len());
        for (channel, version) in versions {
            let row: Option<(String, Option<Vec<u8>>)> = sqlx::query_as(
                "SELECT type_tag, payload FROM checkpoint_blobs
                 WHERE thread_id = ? AND checkpoint_ns = ? AND channel = ? AND version = ?",
            )
            .bind(thread_id)
            .bind(checkpoint_ns)
            .bind(channel)
            .bind(version.as_str())
            .fetch_optional(&mut *conn)
            .await?;

            if let Some((type_tag, payload)) = row {
                blobs.insert(channel.clone(), TypedPayload::new(type_tag, payload));
            }
        }
        Ok(blobs)
    }

    /// Replace a blob's stored form with its upgraded encoding
    pub async fn upgrade(
        conn: &mut SqliteConnection,
        thread_id: &str,
        checkpoint_ns: &str,
        channel: &str,
        version: &str,
        upgraded: &TypedPayload,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE checkpoint_blobs SET type_tag = ?, payload = ?
             WHERE thread_id = ? AND checkpoint_ns = ? AND channel = ? AND version = ?",
        )
        .bind(&upgraded.type_tag)
        .bind(upgraded.payload.as_deref())
        .bind(thread_id)
        .bind(checkpoint_ns)
        .bind(channel)
        .bind(version)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_thread(conn: &mut SqliteConnection, thread_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM checkpoint_blobs WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected())
    }
}
