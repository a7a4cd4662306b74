use chrono::Utc;
use rusqlite::{Result, Row};

use super::database::DatabaseLogger;
use crate::routing::types::{Key, KeyOwner, ModelAgent, Status};

fn key_from_row(row: &Row<'_>) -> Result<Key> {
    let kind: String = row.get(1)?;
    let owner_id: String = row.get(2)?;
    let weight: i64 = row.get(4)?;
    let status: i64 = row.get(5)?;
    Ok(Key {
        id: row.get(0)?,
        owner: KeyOwner::from_db_value(&kind, owner_id),
        key: row.get(3)?,
        weight: weight.max(0) as u32,
        status: Status::from_db_value(status),
    })
}

fn agent_from_row(row: &Row<'_>) -> Result<ModelAgent> {
    let weight: i64 = row.get(4)?;
    let status: i64 = row.get(6)?;
    Ok(ModelAgent {
        id: row.get(0)?,
        name: row.get(1)?,
        base_url: row.get(2)?,
        path: row.get(3)?,
        weight: weight.max(0) as u32,
        remark: row.get(5)?,
        status: Status::from_db_value(status),
    })
}

impl DatabaseLogger {
    async fn list_keys_by_owner(&self, kind: &str, owner_id: &str) -> Result<Vec<Key>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, owner_kind, owner_id, key_value, weight, status FROM keys
             WHERE owner_kind = ?1 AND owner_id = ?2 ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map([kind, owner_id], key_from_row)?;
        rows.collect()
    }

    /// 模型自有密钥（含已禁用，由调用方过滤）
    pub async fn list_model_keys(&self, model_id: &str) -> Result<Vec<Key>> {
        self.list_keys_by_owner("model", model_id).await
    }

    pub async fn list_agent_keys(&self, agent_id: &str) -> Result<Vec<Key>> {
        self.list_keys_by_owner("agent", agent_id).await
    }

    pub async fn list_model_agents(&self, model_id: &str) -> Result<Vec<ModelAgent>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(
            "SELECT a.id, a.name, a.base_url, a.path, a.weight, a.remark, a.status
             FROM model_agents a
             JOIN model_agent_models m ON m.agent_id = a.id
             WHERE m.model_id = ?1
             ORDER BY a.created_at, a.id",
        )?;
        let rows = stmt.query_map([model_id], agent_from_row)?;
        rows.collect()
    }

    pub async fn insert_key(&self, key: &Key) -> Result<()> {
        let conn = self.connection.lock().await;
        let now = crate::logging::time::to_beijing_string(&Utc::now());
        conn.execute(
            "INSERT OR REPLACE INTO keys (id, owner_kind, owner_id, key_value, weight, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            (
                &key.id,
                key.owner.kind_db_value(),
                key.owner.id(),
                &key.key,
                i64::from(key.weight),
                key.status.as_db_value(),
                &now,
            ),
        )?;
        Ok(())
    }

    pub async fn insert_agent(&self, agent: &ModelAgent, model_ids: &[&str]) -> Result<()> {
        let mut conn = self.connection.lock().await;
        let now = crate::logging::time::to_beijing_string(&Utc::now());
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO model_agents (id, name, base_url, path, weight, remark, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            (
                &agent.id,
                &agent.name,
                &agent.base_url,
                &agent.path,
                i64::from(agent.weight),
                &agent.remark,
                agent.status.as_db_value(),
                &now,
            ),
        )?;
        for model_id in model_ids {
            tx.execute(
                "INSERT OR IGNORE INTO model_agent_models (agent_id, model_id) VALUES (?1, ?2)",
                (&agent.id, model_id),
            )?;
        }
        tx.commit()
    }

    pub async fn set_key_status(&self, key_id: &str, status: Status) -> Result<()> {
        let conn = self.connection.lock().await;
        let affected = conn.execute(
            "UPDATE keys SET status = ?1 WHERE id = ?2",
            (status.as_db_value(), key_id),
        )?;
        if affected == 0 {
            tracing::warn!(key_id = %key_id, "set_key_status matched no key");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn key(id: &str, owner: KeyOwner, weight: u32) -> Key {
        Key {
            id: id.into(),
            owner,
            key: format!("sk-{id}"),
            weight,
            status: Status::Active,
        }
    }

    #[tokio::test]
    async fn keys_are_partitioned_by_owner() {
        let dir = tempdir().unwrap();
        let db = DatabaseLogger::new(dir.path().join("k.db").to_str().unwrap())
            .await
            .unwrap();
        db.insert_key(&key("k1", KeyOwner::Model("m1".into()), 2)).await.unwrap();
        db.insert_key(&key("k2", KeyOwner::Agent("a1".into()), 0)).await.unwrap();

        let model_keys = db.list_model_keys("m1").await.unwrap();
        assert_eq!(model_keys.len(), 1);
        assert_eq!(model_keys[0].weight, 2);
        let agent_keys = db.list_agent_keys("a1").await.unwrap();
        assert_eq!(agent_keys[0].owner, KeyOwner::Agent("a1".into()));
    }

    #[tokio::test]
    async fn status_flip_is_persisted() {
        let dir = tempdir().unwrap();
        let db = DatabaseLogger::new(dir.path().join("k.db").to_str().unwrap())
            .await
            .unwrap();
        db.insert_key(&key("k1", KeyOwner::Model("m1".into()), 1)).await.unwrap();
        db.set_key_status("k1", Status::Disabled).await.unwrap();
        // 未知 id 不报错
        db.set_key_status("nope", Status::Disabled).await.unwrap();

        let keys = db.list_model_keys("m1").await.unwrap();
        assert_eq!(keys[0].status, Status::Disabled);
    }

    #[tokio::test]
    async fn agents_are_linked_to_models() {
        let dir = tempdir().unwrap();
        let db = DatabaseLogger::new(dir.path().join("k.db").to_str().unwrap())
            .await
            .unwrap();
        let agent = ModelAgent {
            id: "a1".into(),
            name: "relay".into(),
            base_url: "https://relay.example".into(),
            path: None,
            weight: 5,
            remark: Some("backup".into()),
            status: Status::Active,
        };
        db.insert_agent(&agent, &["m1", "m2"]).await.unwrap();

        assert_eq!(db.list_model_agents("m2").await.unwrap(), vec![agent]);
        assert!(db.list_model_agents("m3").await.unwrap().is_empty());
    }
}
