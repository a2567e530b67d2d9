//! Registry credential repository

use rusqlite::{params, Row};

use crate::types::{AuthType, RegistryCredentials};

use super::{format_ts, parse_enum, parse_ts, Database, DatabaseResult};

fn row_to_credentials(row: &Row<'_>) -> rusqlite::Result<RawCredentials> {
    Ok(RawCredentials {
        name: row.get(0)?,
        registry_url: row.get(1)?,
        auth_type: row.get(2)?,
        secret: row.get(3)?,
        is_default: row.get::<_, i64>(4)? != 0,
        created_at: row.get(5)?,
    })
}

struct RawCredentials {
    name: String,
    registry_url: String,
    auth_type: String,
    secret: String,
    is_default: bool,
    created_at: String,
}

impl RawCredentials {
    fn into_record(self) -> DatabaseResult<RegistryCredentials> {
        Ok(RegistryCredentials {
            name: self.name,
            registry_url: self.registry_url,
            auth_type: parse_enum::<AuthType>(&self.auth_type)?,
            secret: self.secret,
            is_default: self.is_default,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

impl Database {
    /// Insert or replace a credentials record
    ///
    /// Setting `is_default` clears the flag on every other record for the
    /// same registry in the same transaction, so at most one default exists
    /// per registry URL.
    pub async fn save_credentials(&self, record: &RegistryCredentials) -> DatabaseResult<()> {
        let mut conn = self.lock().await;
        let tx = conn.transaction()?;

        if record.is_default {
            tx.execute(
                "UPDATE registry_credentials SET is_default = 0 WHERE registry_url = ?1",
                [&record.registry_url],
            )?;
        }

        tx.execute(
            r#"
            INSERT OR REPLACE INTO registry_credentials
                (name, registry_url, auth_type, secret, is_default, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                record.name,
                record.registry_url,
                record.auth_type.to_string(),
                record.secret,
                record.is_default as i64,
                format_ts(record.created_at),
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    pub async fn get_credentials(&self, name: &str) -> DatabaseResult<Option<RegistryCredentials>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(
            "SELECT name, registry_url, auth_type, secret, is_default, created_at
             FROM registry_credentials WHERE name = ?1",
        )?;

        let mut rows = stmt.query_map([name], row_to_credentials)?;
        match rows.next() {
            Some(raw) => Ok(Some(raw?.into_record()?)),
            None => Ok(None),
        }
    }

    /// The default credentials for a registry, if any
    pub async fn default_credentials_for(
        &self,
        registry_url: &str,
    ) -> DatabaseResult<Option<RegistryCredentials>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(
            "SELECT name, registry_url, auth_type, secret, is_default, created_at
             FROM registry_credentials WHERE registry_url = ?1 AND is_default = 1",
        )?;

        let mut rows = stmt.query_map([registry_url], row_to_credentials)?;
        match rows.next() {
            Some(raw) => Ok(Some(raw?.into_record()?)),
            None => Ok(None),
        }
    }

    pub async fn list_credentials(&self) -> DatabaseResult<Vec<RegistryCredentials>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(
            "SELECT name, registry_url, auth_type, secret, is_default, created_at
             FROM registry_credentials ORDER BY name",
        )?;

        let raws = stmt
            .query_map([], row_to_credentials)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(RawCredentials::into_record).collect()
    }

    pub async fn delete_credentials(&self, name: &str) -> DatabaseResult<bool> {
        let conn = self.lock().await;
        let changed = conn.execute("DELETE FROM registry_credentials WHERE name = ?1", [name])?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(name: &str, registry: &str, is_default: bool) -> RegistryCredentials {
        RegistryCredentials {
            name: name.to_string(),
            registry_url: registry.to_string(),
            auth_type: AuthType::Basic,
            secret: "sealed".into(),
            is_default,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn at_most_one_default_per_registry() {
        let db = Database::open_in_memory().unwrap();
        db.save_credentials(&record("a", "harbor.example.com", true))
            .await
            .unwrap();
        db.save_credentials(&record("b", "harbor.example.com", true))
            .await
            .unwrap();
        db.save_credentials(&record("c", "docker.io", true)).await.unwrap();

        let default = db
            .default_credentials_for("harbor.example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(default.name, "b");

        let a = db.get_credentials("a").await.unwrap().unwrap();
        assert!(!a.is_default);

        // The other registry's default is untouched.
        let other = db.default_credentials_for("docker.io").await.unwrap().unwrap();
        assert_eq!(other.name, "c");
    }
}
