//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 返回预置回复；默认回复为空计划 `{"plan": []}`。也可设置为始终失败，模拟后端不可用。

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::llm::{LlmClient, Message};

#[derive(Debug)]
pub struct MockLlmClient {
    response: Result<String, String>,
    calls: AtomicUsize,
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::with_response(r#"{"plan": []}"#)
    }
}

impl MockLlmClient {
    pub fn with_response(response: impl Into<String>) -> Self {
        Self {
            response: Ok(response.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(error: impl Into<String>) -> Self {
        Self {
            response: Err(error.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(messages = messages.len(), "mock llm complete");
        self.response.clone()
    }
}
