//! Image version cache repository

use rusqlite::{params, Row};

use crate::types::ImageVersion;

use super::{
    format_ts, format_ts_opt, parse_json, parse_ts, parse_ts_opt, Database, DatabaseError,
    DatabaseResult,
};

fn row_to_version(row: &Row<'_>) -> rusqlite::Result<RawVersion> {
    Ok(RawVersion {
        image_name: row.get(0)?,
        tag: row.get(1)?,
        registry_url: row.get(2)?,
        digest: row.get(3)?,
        size_bytes: row.get::<_, Option<i64>>(4)?,
        published_at: row.get(5)?,
        architecture: row.get(6)?,
        os: row.get(7)?,
        metadata: row.get(8)?,
        checked_at: row.get(9)?,
        is_latest: row.get::<_, i64>(10)? != 0,
    })
}

struct RawVersion {
    image_name: String,
    tag: String,
    registry_url: String,
    digest: String,
    size_bytes: Option<i64>,
    published_at: Option<String>,
    architecture: Option<String>,
    os: Option<String>,
    metadata: String,
    checked_at: String,
    is_latest: bool,
}

impl RawVersion {
    fn into_record(self) -> DatabaseResult<ImageVersion> {
        Ok(ImageVersion {
            image_name: self.image_name,
            tag: self.tag,
            registry_url: self.registry_url,
            digest: self.digest,
            size_bytes: self.size_bytes.map(|v| v as u64),
            published_at: parse_ts_opt(self.published_at)?,
            architecture: self.architecture,
            os: self.os,
            metadata: parse_json(&self.metadata)?,
            checked_at: parse_ts(&self.checked_at)?,
            is_latest: self.is_latest,
        })
    }
}

const SELECT_COLUMNS: &str = "image_name, tag, registry_url, digest, size_bytes, published_at, \
     architecture, os, metadata, checked_at, is_latest";

impl Database {
    /// Insert or refresh a cache row
    ///
    /// When the row is marked latest, every other row for the same
    /// `(image_name, registry_url)` loses the flag inside the same
    /// transaction.
    pub async fn upsert_image_version(&self, version: &ImageVersion) -> DatabaseResult<()> {
        let mut conn = self.lock().await;
        let tx = conn.transaction()?;

        if version.is_latest {
            tx.execute(
                "UPDATE image_versions SET is_latest = 0
                 WHERE image_name = ?1 AND registry_url = ?2",
                params![version.image_name, version.registry_url],
            )?;
        }

        tx.execute(
            r#"
            INSERT INTO image_versions
                (image_name, tag, registry_url, digest, size_bytes, published_at,
                 architecture, os, metadata, checked_at, is_latest)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT (image_name, tag, registry_url) DO UPDATE SET
                digest = excluded.digest,
                size_bytes = excluded.size_bytes,
                published_at = excluded.published_at,
                architecture = excluded.architecture,
                os = excluded.os,
                metadata = excluded.metadata,
                checked_at = excluded.checked_at,
                is_latest = excluded.is_latest
            "#,
            params![
                version.image_name,
                version.tag,
                version.registry_url,
                version.digest,
                version.size_bytes.map(|v| v as i64),
                format_ts_opt(version.published_at),
                version.architecture,
                version.os,
                serde_json::to_string(&version.metadata)
                    .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
                format_ts(version.checked_at),
                version.is_latest as i64,
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    pub async fn get_image_version(
        &self,
        image_name: &str,
        tag: &str,
        registry_url: &str,
    ) -> DatabaseResult<Option<ImageVersion>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM image_versions
             WHERE image_name = ?1 AND tag = ?2 AND registry_url = ?3",
            SELECT_COLUMNS
        ))?;

        let mut rows = stmt.query_map(params![image_name, tag, registry_url], row_to_version)?;
        match rows.next() {
            Some(raw) => Ok(Some(raw?.into_record()?)),
            None => Ok(None),
        }
    }

    /// The row currently flagged latest for an image
    pub async fn latest_image_version(
        &self,
        image_name: &str,
        registry_url: &str,
    ) -> DatabaseResult<Option<ImageVersion>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM image_versions
             WHERE image_name = ?1 AND registry_url = ?2 AND is_latest = 1",
            SELECT_COLUMNS
        ))?;

        let mut rows = stmt.query_map(params![image_name, registry_url], row_to_version)?;
        match rows.next() {
            Some(raw) => Ok(Some(raw?.into_record()?)),
            None => Ok(None),
        }
    }

    pub async fn list_image_versions(
        &self,
        image_name: &str,
        registry_url: &str,
    ) -> DatabaseResult<Vec<ImageVersion>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM image_versions
             WHERE image_name = ?1 AND registry_url = ?2 ORDER BY checked_at DESC",
            SELECT_COLUMNS
        ))?;

        let raws = stmt
            .query_map(params![image_name, registry_url], row_to_version)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(RawVersion::into_record).collect()
    }

    /// Merge keys into an existing cache row's metadata
    ///
    /// A missing row is a no-op: there is nothing to annotate yet.
    pub async fn merge_image_version_metadata(
        &self,
        image_name: &str,
        tag: &str,
        registry_url: &str,
        patch: &serde_json::Map<String, serde_json::Value>,
    ) -> DatabaseResult<()> {
        let mut conn = self.lock().await;
        let tx = conn.transaction()?;

        let metadata: Option<String> = tx
            .query_row(
                "SELECT metadata FROM image_versions
                 WHERE image_name = ?1 AND tag = ?2 AND registry_url = ?3",
                params![image_name, tag, registry_url],
                |row| row.get(0),
            )
            .ok();

        let Some(metadata) = metadata else {
            tx.commit()?;
            return Ok(());
        };

        let mut value = parse_json(&metadata)?;
        if !value.is_object() {
            value = serde_json::json!({});
        }
        for (key, patch_value) in patch {
            value[key] = patch_value.clone();
        }

        tx.execute(
            "UPDATE image_versions SET metadata = ?4
             WHERE image_name = ?1 AND tag = ?2 AND registry_url = ?3",
            params![image_name, tag, registry_url, value.to_string()],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Record the last check failure on an existing cache row
    pub async fn set_image_version_error(
        &self,
        image_name: &str,
        tag: &str,
        registry_url: &str,
        error: &str,
    ) -> DatabaseResult<()> {
        let mut patch = serde_json::Map::new();
        patch.insert(
            "last_error".to_string(),
            serde_json::Value::String(error.to_string()),
        );
        self.merge_image_version_metadata(image_name, tag, registry_url, &patch)
            .await
    }
}
