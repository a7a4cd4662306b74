use rusqlite::{Connection, Result};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct DatabaseLogger {
    pub(super) connection: Arc<Mutex<Connection>>,
}

impl DatabaseLogger {
    pub async fn new(database_path: &str) -> Result<Self> {
        // 确保数据库文件的目录存在
        if let Some(parent) = std::path::Path::new(database_path).parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            if let Err(e) = std::fs::create_dir_all(parent) {
                return Err(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CANTOPEN),
                    Some(format!("Failed to create directory: {}", e)),
                ));
            }
            tracing::info!("Created database directory: {}", parent.display());
        }

        let conn = Connection::open(database_path)?;
        tracing::info!("Database initialized at: {}", database_path);
        Self::init_schema(&conn)?;

        Ok(Self {
            connection: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS models (
                id TEXT PRIMARY KEY,
                corp TEXT NOT NULL,
                name TEXT NOT NULL UNIQUE,
                model TEXT NOT NULL,
                type TEXT NOT NULL DEFAULT 'text',
                text_quota TEXT NOT NULL DEFAULT '{}',
                image_quotas TEXT NOT NULL DEFAULT '[]',
                audio_quota TEXT NOT NULL DEFAULT '{}',
                multimodal_quota TEXT NOT NULL DEFAULT '{}',
                prompt TEXT,
                is_enable_model_agent INTEGER NOT NULL DEFAULT 0,
                status INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS model_agents (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                base_url TEXT NOT NULL,
                path TEXT,
                weight INTEGER NOT NULL DEFAULT 0,
                remark TEXT,
                status INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS model_agent_models (
                agent_id TEXT NOT NULL,
                model_id TEXT NOT NULL,
                PRIMARY KEY (agent_id, model_id)
            );

            CREATE TABLE IF NOT EXISTS keys (
                id TEXT PRIMARY KEY,
                owner_kind TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                key_value TEXT NOT NULL,
                weight INTEGER NOT NULL DEFAULT 0,
                status INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_keys_owner ON keys(owner_kind, owner_id);

            CREATE TABLE IF NOT EXISTS secrets (
                secret TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                app_id INTEGER NOT NULL,
                models TEXT NOT NULL DEFAULT '[]',
                status INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS chats (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trace_id TEXT NOT NULL,
                user_id INTEGER,
                app_id INTEGER,
                corp TEXT,
                model_id TEXT,
                name TEXT NOT NULL,
                model TEXT,
                type TEXT,
                stream INTEGER NOT NULL,
                prompt TEXT NOT NULL,
                completion TEXT NOT NULL,
                messages TEXT NOT NULL,
                billing_method INTEGER,
                prompt_ratio REAL NOT NULL,
                completion_ratio REAL NOT NULL,
                fixed_quota INTEGER NOT NULL,
                prompt_tokens INTEGER NOT NULL,
                completion_tokens INTEGER NOT NULL,
                total_tokens INTEGER NOT NULL,
                is_enable_model_agent INTEGER NOT NULL,
                model_agent TEXT,
                key_value TEXT,
                conn_time INTEGER NOT NULL,
                duration INTEGER NOT NULL,
                total_time INTEGER NOT NULL,
                internal_time INTEGER NOT NULL,
                req_time TEXT NOT NULL,
                req_date TEXT NOT NULL,
                retry_count INTEGER NOT NULL,
                status INTEGER NOT NULL,
                err_msg TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_chats_req_date ON chats(req_date);

            CREATE TABLE IF NOT EXISTS usage_totals (
                user_id INTEGER NOT NULL,
                app_id INTEGER NOT NULL,
                model_id TEXT NOT NULL,
                total_quota INTEGER NOT NULL DEFAULT 0,
                requests INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (user_id, app_id, model_id)
            );",
        )
    }
}
