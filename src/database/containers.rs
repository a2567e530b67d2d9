//! Container record repository

use rusqlite::{params, Row};

use crate::types::{ContainerRecord, ContainerStatus, UpdatePolicy};

use super::{
    format_ts, parse_enum, parse_json, parse_ts, to_json, Database, DatabaseError, DatabaseResult,
};

fn row_to_container(row: &Row<'_>) -> rusqlite::Result<RawContainer> {
    Ok(RawContainer {
        id: row.get(0)?,
        name: row.get(1)?,
        image: row.get(2)?,
        tag: row.get(3)?,
        container_id: row.get(4)?,
        status: row.get(5)?,
        update_policy: row.get(6)?,
        registry_ref: row.get(7)?,
        config_json: row.get(8)?,
        created_by: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

struct RawContainer {
    id: String,
    name: String,
    image: String,
    tag: String,
    container_id: Option<String>,
    status: String,
    update_policy: String,
    registry_ref: Option<String>,
    config_json: String,
    created_by: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawContainer {
    fn into_record(self) -> DatabaseResult<ContainerRecord> {
        Ok(ContainerRecord {
            id: self.id,
            name: self.name,
            image: self.image,
            tag: self.tag,
            container_id: self.container_id,
            status: parse_enum::<ContainerStatus>(&self.status)?,
            update_policy: parse_enum::<UpdatePolicy>(&self.update_policy)?,
            registry_ref: self.registry_ref,
            config: parse_json(&self.config_json)?,
            created_by: self.created_by,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

const SELECT_COLUMNS: &str = "id, name, image, tag, container_id, status, update_policy, \
     registry_ref, config_json, created_by, created_at, updated_at";

impl Database {
    /// Insert a new container record; the name must be globally unique
    pub async fn insert_container(&self, record: &ContainerRecord) -> DatabaseResult<()> {
        if record.tag.is_empty() {
            return Err(DatabaseError::InvariantViolation(
                "container tag must not be empty".into(),
            ));
        }

        let conn = self.lock().await;
        conn.execute(
            r#"
            INSERT INTO containers
                (id, name, image, tag, container_id, status, update_policy,
                 registry_ref, config_json, created_by, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                record.id,
                record.name,
                record.image,
                record.tag,
                record.container_id,
                record.status.to_string(),
                record.update_policy.to_string(),
                record.registry_ref,
                to_json(&record.config)?,
                record.created_by,
                format_ts(record.created_at),
                format_ts(record.updated_at),
            ],
        )?;
        Ok(())
    }

    pub async fn get_container(&self, id: &str) -> DatabaseResult<Option<ContainerRecord>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM containers WHERE id = ?1",
            SELECT_COLUMNS
        ))?;

        let mut rows = stmt.query_map([id], row_to_container)?;
        match rows.next() {
            Some(raw) => Ok(Some(raw?.into_record()?)),
            None => Ok(None),
        }
    }

    pub async fn get_container_by_name(
        &self,
        name: &str,
    ) -> DatabaseResult<Option<ContainerRecord>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM containers WHERE name = ?1",
            SELECT_COLUMNS
        ))?;

        let mut rows = stmt.query_map([name], row_to_container)?;
        match rows.next() {
            Some(raw) => Ok(Some(raw?.into_record()?)),
            None => Ok(None),
        }
    }

    pub async fn list_containers(&self) -> DatabaseResult<Vec<ContainerRecord>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM containers ORDER BY name",
            SELECT_COLUMNS
        ))?;

        let raws = stmt
            .query_map([], row_to_container)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(RawContainer::into_record).collect()
    }

    pub async fn list_containers_by_policy(
        &self,
        policy: UpdatePolicy,
    ) -> DatabaseResult<Vec<ContainerRecord>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM containers WHERE update_policy = ?1 ORDER BY name",
            SELECT_COLUMNS
        ))?;

        let raws = stmt
            .query_map([policy.to_string()], row_to_container)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(RawContainer::into_record).collect()
    }

    /// Update the full record; `updated_at` comes from the caller
    pub async fn update_container(&self, record: &ContainerRecord) -> DatabaseResult<()> {
        if record.tag.is_empty() {
            return Err(DatabaseError::InvariantViolation(
                "container tag must not be empty".into(),
            ));
        }

        let conn = self.lock().await;
        let changed = conn.execute(
            r#"
            UPDATE containers SET
                name = ?2, image = ?3, tag = ?4, container_id = ?5, status = ?6,
                update_policy = ?7, registry_ref = ?8, config_json = ?9,
                updated_at = ?10
            WHERE id = ?1
            "#,
            params![
                record.id,
                record.name,
                record.image,
                record.tag,
                record.container_id,
                record.status.to_string(),
                record.update_policy.to_string(),
                record.registry_ref,
                to_json(&record.config)?,
                format_ts(record.updated_at),
            ],
        )?;

        if changed == 0 {
            return Err(DatabaseError::NotFound(format!("container {}", record.id)));
        }
        Ok(())
    }

    /// Update just the observed runtime state of a container
    pub async fn update_container_runtime_state(
        &self,
        id: &str,
        status: ContainerStatus,
        container_id: Option<&str>,
    ) -> DatabaseResult<()> {
        let conn = self.lock().await;
        let changed = conn.execute(
            "UPDATE containers SET status = ?2, container_id = ?3, updated_at = ?4 WHERE id = ?1",
            params![
                id,
                status.to_string(),
                container_id,
                format_ts(chrono::Utc::now()),
            ],
        )?;

        if changed == 0 {
            return Err(DatabaseError::NotFound(format!("container {}", id)));
        }
        Ok(())
    }

    pub async fn delete_container(&self, id: &str) -> DatabaseResult<bool> {
        let conn = self.lock().await;
        let changed = conn.execute("DELETE FROM containers WHERE id = ?1", [id])?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn record(name: &str) -> ContainerRecord {
        ContainerRecord {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            image: "nginx".into(),
            tag: "1.24".into(),
            container_id: None,
            status: ContainerStatus::Running,
            update_policy: UpdatePolicy::Auto,
            registry_ref: None,
            config: json!({"env": {"FOO": "bar"}}),
            created_by: Some("admin".into()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_and_fetch_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let rec = record("web");
        db.insert_container(&rec).await.unwrap();

        let loaded = db.get_container(&rec.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "web");
        assert_eq!(loaded.status, ContainerStatus::Running);
        assert_eq!(loaded.config["env"]["FOO"], "bar");

        let by_name = db.get_container_by_name("web").await.unwrap().unwrap();
        assert_eq!(by_name.id, rec.id);
    }

    #[tokio::test]
    async fn duplicate_name_is_a_constraint_violation() {
        let db = Database::open_in_memory().unwrap();
        db.insert_container(&record("web")).await.unwrap();
        let err = db.insert_container(&record("web")).await.unwrap_err();
        assert!(err.is_constraint_violation());
    }

    #[tokio::test]
    async fn empty_tag_is_rejected() {
        let db = Database::open_in_memory().unwrap();
        let mut rec = record("web");
        rec.tag = String::new();
        let err = db.insert_container(&rec).await.unwrap_err();
        assert!(matches!(err, DatabaseError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn policy_listing_filters() {
        let db = Database::open_in_memory().unwrap();
        db.insert_container(&record("a")).await.unwrap();
        let mut manual = record("b");
        manual.update_policy = UpdatePolicy::Manual;
        db.insert_container(&manual).await.unwrap();

        let auto = db.list_containers_by_policy(UpdatePolicy::Auto).await.unwrap();
        assert_eq!(auto.len(), 1);
        assert_eq!(auto[0].name, "a");
    }
}
