use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tracing::Instrument;

use crate::config::{CorpEndpoint, Settings};
use crate::error::{GatewayError, Result};
use crate::logging::{CompletionsResult, LedgerWriter, Settlement};
use crate::providers::openai::types::response_text;
use crate::providers::openai::{ChatCompletionRequest, ChatCompletionResponse, default_chat_path};
use crate::providers::streaming::ChunkStream;
use crate::providers::{ApiError, DispatchTarget, ProviderClient, ProviderError};
use crate::routing::model_resolver::Caller;
use crate::routing::types::{Key, Model, ModelAgent};
use crate::routing::{CredentialPool, ModelResolver};
use crate::server::background::spawn_detached;
use crate::server::request_adapter::adapt;
use crate::server::streaming::{EventSink, relay};
use crate::server::util::mask_key;
use crate::usage::{Metered, TokenAccountant};

const CONTEXT_LENGTH_HINTS: [&str; 2] = [
    "please reduce the length of the messages",
    "maximum context length",
];
const QUOTA_EXCEEDED_HINT: &str = "you exceeded your current quota";
const INVALID_KEY_HINTS: [&str; 2] = ["incorrect api key provided", "invalid api key"];

/// 结构化上游错误的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// 直接返回，不再重试
    Fatal,
    /// 先禁用当前凭证再重试
    DisableAndRetry,
    Retry,
}

pub fn classify(err: &ApiError) -> Verdict {
    let message = err.message.to_lowercase();
    match err.status {
        400 if CONTEXT_LENGTH_HINTS.iter().any(|h| message.contains(h)) => Verdict::Fatal,
        400 => Verdict::Retry,
        429 if message.contains(QUOTA_EXCEEDED_HINT) => Verdict::DisableAndRetry,
        _ if INVALID_KEY_HINTS.iter().any(|h| message.contains(h)) => Verdict::DisableAndRetry,
        _ => Verdict::Retry,
    }
}

/// 预算检查：`attempts` 为已完成的下发次数，`max_pool` 为链路中观察到的最大池大小
pub fn budget_exhausted(retry_limit: i32, attempts: u32, max_pool: usize) -> bool {
    let retries_done = attempts.saturating_sub(1);
    match retry_limit {
        r if r > 0 => retries_done >= r as u32,
        r if r < 0 => attempts as usize >= max_pool,
        _ => true,
    }
}

#[derive(Debug, Clone)]
struct Route {
    pool_size: usize,
    key: Key,
    agent: Option<ModelAgent>,
}

/// 一次成功下发及其所用凭证
struct Dispatched<T> {
    output: T,
    key: Key,
    agent: Option<ModelAgent>,
    retries: u32,
}

/// 重试链最终失败
struct Failure {
    error: GatewayError,
    key: Option<Key>,
    agent: Option<ModelAgent>,
    retries: u32,
}

impl Failure {
    fn bare(error: GatewayError) -> Self {
        Self {
            error,
            key: None,
            agent: None,
            retries: 0,
        }
    }

    fn at(error: GatewayError, route: Route, attempts: u32) -> Self {
        Self {
            error,
            key: Some(route.key),
            agent: route.agent,
            retries: attempts.saturating_sub(1),
        }
    }
}

/// 结算时的计量方式
enum Metering {
    Unbilled,
    /// 后台按上游用量或本地计数计量
    Count,
    Done(Metered),
}

/// 账本结算：计量与写入都在脱离请求生命周期的后台任务里完成
#[derive(Clone)]
struct Settler {
    accountant: Arc<TokenAccountant>,
    ledger: LedgerWriter,
}

impl Settler {
    fn settle(&self, settlement: Settlement, metering: Metering) {
        let accountant = Arc::clone(&self.accountant);
        let ledger = self.ledger.clone();
        let now = Utc::now();
        spawn_detached("settle", async move {
            let breakdown = settlement.model.as_ref().and_then(|model| {
                let metered = match metering {
                    Metering::Unbilled => return None,
                    Metering::Count => accountant.fill_usage(
                        model,
                        &settlement.request.messages,
                        &settlement.result.completion,
                        settlement.result.usage.clone(),
                    ),
                    Metering::Done(metered) => metered,
                };
                Some(accountant.bill(model, &metered))
            });
            // 用量累计先于账本写入调度
            if let Some(record) = breakdown.as_ref().and_then(|b| settlement.usage_record(b)) {
                ledger.record_usage(record);
            }
            let entry = settlement.build_entry(breakdown.as_ref(), ledger.key_log_strategy(), now);
            ledger.write(entry);
        });
    }
}

/// 已建立连接、尚未转发的流式会话
pub struct StreamSession {
    chunks: ChunkStream,
    settlement: Settlement,
    settler: Settler,
}

impl StreamSession {
    /// 转发全部分块，结束后结算（包括调用方中途断开的情况）
    pub async fn relay<S>(self, sink: &mut S) -> CompletionsResult
    where
        S: EventSink + ?Sized,
    {
        let StreamSession {
            chunks,
            mut settlement,
            settler,
        } = self;
        let result = relay(chunks, sink).await;
        let billable = result.usage.as_ref().is_some_and(|u| u.total_tokens > 0)
            || !result.completion.is_empty();
        if let Some(err) = &result.error {
            tracing::warn!(trace_id = %settlement.trace_id, error = %err, "stream ended with error");
        }
        settlement.result = result.clone();
        let metering = if billable {
            Metering::Count
        } else {
            Metering::Unbilled
        };
        settler.settle(settlement, metering);
        result
    }
}

/// 聊天补全主流程：解析模型、选择凭证、适配请求、重试与结算
pub struct ChatService {
    resolver: Arc<ModelResolver>,
    pool: Arc<CredentialPool>,
    client: Arc<dyn ProviderClient>,
    settler: Settler,
    retry_limit: i32,
    corps: HashMap<String, CorpEndpoint>,
}

impl ChatService {
    pub fn new(
        settings: &Settings,
        resolver: Arc<ModelResolver>,
        pool: Arc<CredentialPool>,
        client: Arc<dyn ProviderClient>,
        accountant: Arc<TokenAccountant>,
        ledger: LedgerWriter,
    ) -> Self {
        Self {
            resolver,
            pool,
            client,
            settler: Settler { accountant, ledger },
            retry_limit: settings.api.retry,
            corps: settings.corps.clone(),
        }
    }

    pub fn resolver(&self) -> &ModelResolver {
        &self.resolver
    }

    async fn select(&self, model: &Model) -> Result<Route> {
        if model.is_enable_model_agent {
            let agent = self.pool.pick_model_agent(model).await?;
            let (pool_size, key) = self.pool.pick_model_agent_key(&agent).await?;
            Ok(Route {
                pool_size,
                key,
                agent: Some(agent),
            })
        } else {
            let (pool_size, key) = self.pool.pick_model_key(model).await?;
            Ok(Route {
                pool_size,
                key,
                agent: None,
            })
        }
    }

    fn target(&self, model: &Model, route: &Route, credential: String) -> Result<DispatchTarget> {
        let (base_url, path) = match &route.agent {
            Some(agent) => (agent.base_url.clone(), agent.path.clone()),
            None => {
                let endpoint = self.corps.get(model.corp.as_db_value()).ok_or_else(|| {
                    GatewayError::Config(format!(
                        "no endpoint configured for corp {}",
                        model.corp.as_db_value()
                    ))
                })?;
                (endpoint.base_url.clone(), endpoint.path.clone())
            }
        };
        let path = path
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| default_chat_path(model.corp).to_string());
        Ok(DispatchTarget {
            corp: model.corp,
            base_url,
            path,
            credential,
        })
    }

    fn disable(&self, route: &Route) {
        if route.agent.is_some() {
            self.pool.disable_agent_key(&route.key);
        } else {
            self.pool.disable_key(&route.key);
        }
    }

    // 重试链：每次重新选择凭证、从原始请求重新适配后下发
    async fn run_chain<T, F, Fut>(
        &self,
        model: &Model,
        original: &ChatCompletionRequest,
        mut call: F,
    ) -> std::result::Result<Dispatched<T>, Failure>
    where
        F: FnMut(DispatchTarget, ChatCompletionRequest) -> Fut,
        Fut: Future<Output = std::result::Result<T, ProviderError>>,
    {
        let mut attempts: u32 = 0;
        let mut max_pool: usize = 0;
        let mut last: Option<(ApiError, Route)> = None;

        loop {
            let route = match self.select(model).await {
                Ok(route) => route,
                Err(e) => {
                    return Err(match last {
                        Some((api, route)) => {
                            tracing::warn!(error = %e, "no credential left for retry, surfacing previous error");
                            Failure::at(ProviderError::Api(api).into(), route, attempts)
                        }
                        None => Failure::bare(e),
                    });
                }
            };
            max_pool = max_pool.max(route.pool_size);

            let adapted = match adapt(original, model, &route.key, Utc::now().timestamp_millis()) {
                Ok(adapted) => adapted,
                Err(e) => return Err(Failure::at(e, route, attempts + 1)),
            };
            let target = match self.target(model, &route, adapted.credential) {
                Ok(target) => target,
                Err(e) => return Err(Failure::at(e, route, attempts + 1)),
            };

            attempts += 1;
            tracing::debug!(
                attempt = attempts,
                pool_size = route.pool_size,
                key = %mask_key(&route.key.key),
                url = %target.url(),
                "dispatching"
            );

            let api = match call(target, adapted.request).await {
                Ok(output) => {
                    return Ok(Dispatched {
                        output,
                        key: route.key,
                        agent: route.agent,
                        retries: attempts - 1,
                    });
                }
                Err(ProviderError::Transport(msg)) => {
                    tracing::error!(attempt = attempts, error = %msg, "transport failure");
                    return Err(Failure::at(
                        ProviderError::Transport(msg).into(),
                        route,
                        attempts,
                    ));
                }
                Err(ProviderError::Api(api)) => api,
            };

            self.pool.record_error(model, &route.key, route.agent.as_ref());
            let verdict = classify(&api);
            tracing::warn!(
                attempt = attempts,
                status = api.status,
                verdict = ?verdict,
                key = %mask_key(&route.key.key),
                error = %api.message,
                "provider error"
            );
            match verdict {
                Verdict::Fatal => {
                    return Err(Failure::at(ProviderError::Api(api).into(), route, attempts));
                }
                Verdict::DisableAndRetry => self.disable(&route),
                Verdict::Retry => {}
            }
            if budget_exhausted(self.retry_limit, attempts, max_pool) {
                return Err(Failure::at(ProviderError::Api(api).into(), route, attempts));
            }
            last = Some((api, route));
        }
    }

    fn settlement(
        trace_id: &str,
        enter_time: DateTime<Utc>,
        resolved: Option<(Caller, Model)>,
        request: ChatCompletionRequest,
    ) -> Settlement {
        let (caller, model) = match resolved {
            Some((caller, model)) => (Some(caller), Some(model)),
            None => (None, None),
        };
        Settlement {
            trace_id: trace_id.to_string(),
            caller,
            model,
            key: None,
            agent: None,
            request,
            enter_time,
            retry_count: 0,
            result: CompletionsResult::default(),
        }
    }

    fn settle_failure(&self, mut settlement: Settlement, failure: Failure) -> GatewayError {
        settlement.key = failure.key;
        settlement.agent = failure.agent;
        settlement.retry_count = failure.retries;
        settlement.result.error = Some(failure.error.to_string());
        self.settler.settle(settlement, Metering::Unbilled);
        failure.error
    }

    /// 非流式补全：返回带用量的响应
    pub async fn complete(
        &self,
        trace_id: &str,
        secret: &str,
        request: ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse> {
        let enter_time = Utc::now();
        let (caller, model) = match self.resolver.resolve(&request.model, secret).await {
            Ok(resolved) => resolved,
            Err(e) => {
                let settlement = Self::settlement(trace_id, enter_time, None, request);
                return Err(self.settle_failure(settlement, Failure::bare(e)));
            }
        };

        let client = Arc::clone(&self.client);
        let outcome = self
            .run_chain(&model, &request, |target, req| {
                let client = Arc::clone(&client);
                async move { client.chat_completion(&target, &req).await }
            })
            .await;

        let mut settlement =
            Self::settlement(trace_id, enter_time, Some((caller, model.clone())), request);
        let dispatched = match outcome {
            Ok(d) => d,
            Err(failure) => return Err(self.settle_failure(settlement, failure)),
        };

        let mut outcome = dispatched.output;
        let completion = response_text(&outcome.response);
        let metered = self.settler.accountant.fill_usage(
            &model,
            &settlement.request.messages,
            &completion,
            outcome.response.usage.clone(),
        );
        outcome.response.usage = Some(metered.usage.clone());

        settlement.key = Some(dispatched.key);
        settlement.agent = dispatched.agent;
        settlement.retry_count = dispatched.retries;
        settlement.result = CompletionsResult {
            completion,
            usage: Some(metered.usage.clone()),
            conn_time: outcome.conn_time,
            duration: outcome.duration,
            total_time: outcome.total_time,
            error: None,
        };
        self.settler.settle(settlement, Metering::Done(metered));
        Ok(outcome.response)
    }

    /// 流式补全的建连阶段；失败在首个分块之前返回
    pub async fn open_stream(
        &self,
        trace_id: &str,
        secret: &str,
        request: ChatCompletionRequest,
    ) -> Result<StreamSession> {
        let enter_time = Utc::now();
        let (caller, model) = match self.resolver.resolve(&request.model, secret).await {
            Ok(resolved) => resolved,
            Err(e) => {
                let settlement = Self::settlement(trace_id, enter_time, None, request);
                return Err(self.settle_failure(settlement, Failure::bare(e)));
            }
        };

        let client = Arc::clone(&self.client);
        let outcome = self
            .run_chain(&model, &request, |target, req| {
                let client = Arc::clone(&client);
                async move { client.chat_completion_stream(&target, &req).await }
            })
            .await;

        let mut settlement = Self::settlement(trace_id, enter_time, Some((caller, model)), request);
        let dispatched = match outcome {
            Ok(d) => d,
            Err(failure) => return Err(self.settle_failure(settlement, failure)),
        };
        settlement.key = Some(dispatched.key);
        settlement.agent = dispatched.agent;
        settlement.retry_count = dispatched.retries;

        Ok(StreamSession {
            chunks: dispatched.output,
            settlement,
            settler: self.settler.clone(),
        })
    }

    /// 在独立任务里跑完整条非流式链路，调用方断开也照常结算
    pub async fn complete_detached(
        self: Arc<Self>,
        trace_id: String,
        secret: String,
        request: ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse> {
        let span = tracing::Span::current();
        tokio::spawn(
            async move { self.complete(&trace_id, &secret, request).await }.instrument(span),
        )
        .await
        .map_err(|e| GatewayError::Io(e.into()))?
    }

    /// 建连与转发都放进独立任务；返回时建连已结束，后续分块推给 `sink`
    pub async fn stream_detached<S>(
        self: Arc<Self>,
        trace_id: String,
        secret: String,
        request: ChatCompletionRequest,
        mut sink: S,
    ) -> Result<()>
    where
        S: EventSink + 'static,
    {
        let (dialed_tx, dialed_rx) = oneshot::channel::<Result<()>>();
        let span = tracing::Span::current();
        tokio::spawn(
            async move {
                let session = match self.open_stream(&trace_id, &secret, request).await {
                    Ok(session) => session,
                    Err(e) => {
                        let _ = dialed_tx.send(Err(e));
                        return;
                    }
                };
                // 调用方已走也继续转发，推送失败时由 relay 结算
                let _ = dialed_tx.send(Ok(()));
                let result = session.relay(&mut sink).await;
                tracing::info!(
                    chars = result.completion.chars().count(),
                    total_time = result.total_time,
                    "stream finished"
                );
            }
            .instrument(span),
        );
        dialed_rx
            .await
            .map_err(|_| GatewayError::Relay("stream task ended before dialing".into()))?
    }
}
