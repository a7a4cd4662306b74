pub mod client;
pub mod types;

pub use client::{HttpProviderClient, default_chat_path};
pub use types::{
    ChatCompletionRequest, ChatCompletionResponse, ContentPart, ImageRef, ModelCard,
    ModelListResponse, RequestMessage, Usage,
};
