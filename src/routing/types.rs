use serde::{Deserialize, Serialize};

pub const CORP_OPENAI: &str = "OpenAI";
pub const CORP_ZHIPUAI: &str = "ZhipuAI";

/// 上游厂商
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Corp {
    OpenAI,
    Azure,
    Baidu,
    Xfyun,
    Aliyun,
    ZhipuAI,
    Google,
    DeepSeek,
    Other,
}

impl Corp {
    pub fn from_db_value(value: &str) -> Self {
        match value {
            "OpenAI" => Self::OpenAI,
            "Azure" => Self::Azure,
            "Baidu" => Self::Baidu,
            "Xfyun" => Self::Xfyun,
            "Aliyun" => Self::Aliyun,
            "ZhipuAI" => Self::ZhipuAI,
            "Google" => Self::Google,
            "DeepSeek" => Self::DeepSeek,
            _ => Self::Other,
        }
    }

    pub fn as_db_value(&self) -> &'static str {
        match self {
            Self::OpenAI => CORP_OPENAI,
            Self::Azure => "Azure",
            Self::Baidu => "Baidu",
            Self::Xfyun => "Xfyun",
            Self::Aliyun => "Aliyun",
            Self::ZhipuAI => CORP_ZHIPUAI,
            Self::Google => "Google",
            Self::DeepSeek => "DeepSeek",
            Self::Other => "Other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Active,
    Disabled,
}

impl Status {
    pub fn from_db_value(value: i64) -> Self {
        if value == 1 { Self::Active } else { Self::Disabled }
    }

    pub fn as_db_value(&self) -> i64 {
        match self {
            Self::Active => 1,
            Self::Disabled => 2,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

/// 计费方式：倍率 或 固定额度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingMethod {
    #[default]
    Ratio,
    Fixed,
}

impl BillingMethod {
    pub fn from_db_value(value: i64) -> Self {
        if value == 2 { Self::Fixed } else { Self::Ratio }
    }

    pub fn as_db_value(&self) -> i64 {
        match self {
            Self::Ratio => 1,
            Self::Fixed => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    #[default]
    Text,
    Image,
    Audio,
    Multimodal,
}

impl ModelType {
    pub fn from_db_value(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "image" => Self::Image,
            "audio" => Self::Audio,
            "multimodal" => Self::Multimodal,
            _ => Self::Text,
        }
    }

    pub fn as_db_value(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Audio => "audio",
            Self::Multimodal => "multimodal",
        }
    }
}

fn default_ratio() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextQuota {
    #[serde(default)]
    pub billing_method: BillingMethod,
    #[serde(default = "default_ratio")]
    pub prompt_ratio: f64,
    #[serde(default = "default_ratio")]
    pub completion_ratio: f64,
    #[serde(default)]
    pub fixed_quota: i64,
}

impl Default for TextQuota {
    fn default() -> Self {
        Self {
            billing_method: BillingMethod::Ratio,
            prompt_ratio: 1.0,
            completion_ratio: 1.0,
            fixed_quota: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageQuota {
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    /// low / high / auto
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub fixed_quota: i64,
    #[serde(default)]
    pub is_default: bool,
}

pub type AudioQuota = TextQuota;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MultimodalQuota {
    #[serde(default)]
    pub text_quota: TextQuota,
    #[serde(default)]
    pub image_quotas: Vec<ImageQuota>,
}

/// 面向调用方的逻辑模型
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub corp: Corp,
    /// 调用方使用的模型名
    pub name: String,
    /// 上游厂商的原生模型 id
    pub model: String,
    pub model_type: ModelType,
    pub text_quota: TextQuota,
    pub image_quotas: Vec<ImageQuota>,
    pub audio_quota: AudioQuota,
    pub multimodal_quota: MultimodalQuota,
    /// 预设系统提示词
    pub prompt: Option<String>,
    pub is_enable_model_agent: bool,
    pub status: Status,
}

impl Model {
    /// 当前请求适用的文本计费表（多模态模型使用其自带的文本额度）
    pub fn billing_quota(&self) -> &TextQuota {
        match self.model_type {
            ModelType::Multimodal => &self.multimodal_quota.text_quota,
            _ => &self.text_quota,
        }
    }

    pub fn preset_prompt(&self) -> Option<&str> {
        self.prompt.as_deref().filter(|p| !p.is_empty())
    }

    /// GLM 系列：需要签名凭证，并拒绝 0/1 边界采样参数
    pub fn is_glm_family(&self) -> bool {
        self.corp == Corp::ZhipuAI || self.model.starts_with("glm-")
    }
}

/// 密钥归属：模型密钥池 或 某个代理的子池
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum KeyOwner {
    Model(String),
    Agent(String),
}

impl KeyOwner {
    pub fn from_db_value(kind: &str, id: String) -> Self {
        if kind == "agent" { Self::Agent(id) } else { Self::Model(id) }
    }

    pub fn kind_db_value(&self) -> &'static str {
        match self {
            Self::Model(_) => "model",
            Self::Agent(_) => "agent",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Model(id) | Self::Agent(id) => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Key {
    pub id: String,
    pub owner: KeyOwner,
    pub key: String,
    /// 0 视为 1（均匀）
    pub weight: u32,
    pub status: Status,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelAgent {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub path: Option<String>,
    pub weight: u32,
    pub remark: Option<String>,
    pub status: Status,
}
