use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::error::Result;
use crate::routing::load_balancer::{BalanceError, pick_weighted};
use crate::routing::types::{Key, KeyOwner, Model, ModelAgent, Status};
use crate::server::background::spawn_detached;
use crate::server::storage_traits::CredentialStore;
use crate::server::util::mask_key;

/// 单个密钥的运行时状态
pub struct KeySlot {
    pub key: Key,
    active: AtomicBool,
    errors: AtomicU64,
}

impl KeySlot {
    fn new(key: Key) -> Self {
        let active = key.status.is_active();
        Self {
            key,
            active: AtomicBool::new(active),
            errors: AtomicU64::new(0),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

/// 代理及其子密钥池，健康状态独立于其下的密钥
pub struct AgentSlot {
    pub agent: ModelAgent,
    active: AtomicBool,
    errors: AtomicU64,
    keys: Vec<Arc<KeySlot>>,
    loaded_at: Instant,
}

impl AgentSlot {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

struct ModelPool {
    keys: Vec<Arc<KeySlot>>,
    agent_ids: Vec<String>,
    loaded_at: Instant,
}

/// 凭证池：每个模型 / 代理各自一份密钥集合，互不加锁
pub struct CredentialPool {
    store: Arc<dyn CredentialStore>,
    ttl: Duration,
    models: DashMap<String, Arc<ModelPool>>,
    agents: DashMap<String, Arc<AgentSlot>>,
}

// 刷新时沿用旧槽位的禁用标志与错误计数，后台持久化尚未落库也不会复活密钥
fn rebuild_slots(keys: Vec<Key>, previous: Option<&[Arc<KeySlot>]>) -> Vec<Arc<KeySlot>> {
    keys.into_iter()
        .map(|key| {
            let slot = KeySlot::new(key);
            if let Some(old) = previous.and_then(|p| p.iter().find(|s| s.key.id == slot.key.id)) {
                if !old.is_active() {
                    slot.active.store(false, Ordering::Release);
                }
                slot.errors.store(old.error_count(), Ordering::Relaxed);
            }
            Arc::new(slot)
        })
        .collect()
}

// 只在活跃槽位中做加权随机，返回 (候选数, 选中槽位)
fn choose_slot<T>(slots: &[Arc<T>], is_active: impl Fn(&T) -> bool, weight: impl Fn(&T) -> u32) -> Option<(usize, Arc<T>)> {
    let eligible: Vec<&Arc<T>> = slots.iter().filter(|s| is_active(s)).collect();
    let mut rng = rand::rng();
    let picked = pick_weighted(&eligible, |s| weight(s), &mut rng)?;
    Some((eligible.len(), Arc::clone(picked)))
}

impl CredentialPool {
    pub fn new(store: Arc<dyn CredentialStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            models: DashMap::new(),
            agents: DashMap::new(),
        }
    }

    async fn model_pool(&self, model_id: &str) -> Result<Arc<ModelPool>> {
        if let Some(pool) = self.models.get(model_id)
            && pool.loaded_at.elapsed() < self.ttl
        {
            return Ok(Arc::clone(&pool));
        }
        let keys = self.store.list_model_keys(model_id).await?;
        let agents = self.store.list_model_agents(model_id).await?;
        let previous = self.models.get(model_id).map(|p| Arc::clone(&p));
        let pool = Arc::new(ModelPool {
            keys: rebuild_slots(keys, previous.as_ref().map(|p| p.keys.as_slice())),
            agent_ids: agents.iter().map(|a| a.id.clone()).collect(),
            loaded_at: Instant::now(),
        });
        for agent in agents {
            self.load_agent(agent).await?;
        }
        tracing::debug!(model_id = %model_id, keys = pool.keys.len(), agents = pool.agent_ids.len(), "credential pool loaded");
        self.models.insert(model_id.to_string(), Arc::clone(&pool));
        Ok(pool)
    }

    async fn load_agent(&self, agent: ModelAgent) -> Result<Arc<AgentSlot>> {
        if let Some(slot) = self.agents.get(&agent.id)
            && slot.loaded_at.elapsed() < self.ttl
        {
            return Ok(Arc::clone(&slot));
        }
        let keys = self.store.list_agent_keys(&agent.id).await?;
        let previous = self.agents.get(&agent.id).map(|s| Arc::clone(&s));
        let slot = Arc::new(AgentSlot {
            active: AtomicBool::new(agent.status.is_active()),
            errors: AtomicU64::new(previous.as_ref().map(|s| s.error_count()).unwrap_or(0)),
            keys: rebuild_slots(keys, previous.as_ref().map(|s| s.keys.as_slice())),
            loaded_at: Instant::now(),
            agent,
        });
        self.agents.insert(slot.agent.id.clone(), Arc::clone(&slot));
        Ok(slot)
    }

    async fn agent_slot(&self, agent: &ModelAgent) -> Result<Arc<AgentSlot>> {
        self.load_agent(agent.clone()).await
    }

    /// 从模型自有密钥中加权选择一个活跃密钥
    pub async fn pick_model_key(&self, model: &Model) -> Result<(usize, Key)> {
        let pool = self.model_pool(&model.id).await?;
        let (size, slot) = choose_slot(&pool.keys, KeySlot::is_active, |s| s.key.weight)
            .ok_or(BalanceError::NoAvailableCredential)?;
        Ok((size, slot.key.clone()))
    }

    /// 两段式选择的第一段：在活跃代理中按权重选择
    pub async fn pick_model_agent(&self, model: &Model) -> Result<ModelAgent> {
        let pool = self.model_pool(&model.id).await?;
        let slots: Vec<Arc<AgentSlot>> = pool
            .agent_ids
            .iter()
            .filter_map(|id| self.agents.get(id).map(|s| Arc::clone(&s)))
            .collect();
        let (_, slot) = choose_slot(&slots, AgentSlot::is_active, |s| s.agent.weight)
            .ok_or(BalanceError::NoAvailableAgent)?;
        Ok(slot.agent.clone())
    }

    /// 第二段：在代理子池中选择密钥；子池耗尽时记一次代理错误
    pub async fn pick_model_agent_key(&self, agent: &ModelAgent) -> Result<(usize, Key)> {
        let slot = self.agent_slot(agent).await?;
        match choose_slot(&slot.keys, KeySlot::is_active, |s| s.key.weight) {
            Some((size, key)) => Ok((size, key.key.clone())),
            None => {
                self.record_agent_error(agent);
                Err(BalanceError::NoAvailableCredential.into())
            }
        }
    }

    fn find_slot(&self, key: &Key) -> Option<Arc<KeySlot>> {
        let keys = match &key.owner {
            KeyOwner::Model(model_id) => self.models.get(model_id).map(|p| p.keys.clone()),
            KeyOwner::Agent(agent_id) => self.agents.get(agent_id).map(|a| a.keys.clone()),
        }?;
        keys.into_iter().find(|s| s.key.id == key.id)
    }

    /// 禁用密钥：内存标志立即生效，持久化放到后台任务
    pub fn disable_key(&self, key: &Key) {
        let was_active = self
            .find_slot(key)
            .map(|slot| slot.active.swap(false, Ordering::AcqRel))
            .unwrap_or(true);
        if !was_active {
            return;
        }
        tracing::warn!(key_id = %key.id, key = %mask_key(&key.key), owner = ?key.owner, "disabling credential");
        let store = Arc::clone(&self.store);
        let key_id = key.id.clone();
        spawn_detached("disable_key", async move {
            if let Err(e) = store.set_key_status(&key_id, Status::Disabled).await {
                tracing::error!(key_id = %key_id, error = %e, "failed to persist key status");
            }
        });
    }

    pub fn disable_agent_key(&self, key: &Key) {
        self.disable_key(key);
    }

    /// 仅用于观测的错误计数，不影响选择
    pub fn record_error(&self, model: &Model, key: &Key, agent: Option<&ModelAgent>) {
        let key_errors = self
            .find_slot(key)
            .map(|slot| slot.errors.fetch_add(1, Ordering::Relaxed) + 1)
            .unwrap_or(0);
        if let Some(agent) = agent {
            self.record_agent_error(agent);
        }
        tracing::warn!(
            model = %model.name,
            key = %mask_key(&key.key),
            agent = agent.map(|a| a.name.as_str()).unwrap_or("-"),
            key_errors,
            "provider error recorded"
        );
    }

    pub fn record_agent_error(&self, agent: &ModelAgent) {
        if let Some(slot) = self.agents.get(&agent.id) {
            slot.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn key_error_count(&self, key: &Key) -> u64 {
        self.find_slot(key).map(|s| s.error_count()).unwrap_or(0)
    }

    pub fn agent_error_count(&self, agent_id: &str) -> u64 {
        self.agents.get(agent_id).map(|s| s.error_count()).unwrap_or(0)
    }

    pub fn is_key_active(&self, key: &Key) -> bool {
        self.find_slot(key).map(|s| s.is_active()).unwrap_or(false)
    }

    /// 丢弃模型的缓存池，下一次选择时按存储重新加载（外部重新启用密钥后调用）
    pub fn invalidate_model(&self, model_id: &str) {
        if let Some((_, pool)) = self.models.remove(model_id) {
            for agent_id in &pool.agent_ids {
                self.agents.remove(agent_id);
            }
        }
    }
}
