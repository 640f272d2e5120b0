//! 指令嵌入：把指令文本编码为固定维度向量，供经验库做相似度检索
//!
//! - HashingEmbedder：本地特征哈希（分词 + 相邻词二元组），确定性、无需网络，默认使用
//! - OpenAiEmbedder：调用 OpenAI 兼容的 /embeddings 端点
//!
//! 经验库只把向量当作不透明的定长数组，不对语义做任何假设。

use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::types::embeddings::{CreateEmbeddingRequestArgs, EmbeddingInput};
use async_openai::Client;

use crate::llm::openai::{openai_config, resolve_api_key};
use crate::memory::tokenizer::tokenize;

/// 可从 sync 上下文调用的嵌入提供方
pub trait EmbeddingProvider: Send + Sync {
    /// 将文本编码为长度恒为 dim() 的向量
    fn embed_sync(&self, text: &str) -> Result<Vec<f32>, String>;

    fn dim(&self) -> usize;
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(FNV_PRIME)
    })
}

/// 特征哈希嵌入：每个特征哈希到一个桶，最高位决定符号，最后做 L2 归一化
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dim: usize,
}

impl HashingEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }

    fn add_feature(&self, vec: &mut [f32], feature: &str, weight: f32) {
        let hash = fnv1a(feature.as_bytes());
        let bucket = (hash % self.dim as u64) as usize;
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        vec[bucket] += sign * weight;
    }
}

impl EmbeddingProvider for HashingEmbedder {
    fn embed_sync(&self, text: &str) -> Result<Vec<f32>, String> {
        let mut vec = vec![0.0f32; self.dim];
        let tokens = tokenize(text);
        for token in &tokens {
            self.add_feature(&mut vec, token, 1.0);
        }
        for pair in tokens.windows(2) {
            self.add_feature(&mut vec, &format!("{} {}", pair[0], pair[1]), 0.5);
        }
        let norm = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vec.iter_mut().for_each(|x| *x /= norm);
        }
        Ok(vec)
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

/// 使用 async-openai 调用 OpenAI 兼容的 embeddings API
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client<OpenAIConfig>,
    model: String,
    dim: usize,
}

impl OpenAiEmbedder {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>, dim: usize) -> Self {
        Self {
            client: Client::with_config(openai_config(base_url, api_key)),
            model: model.to_string(),
            dim,
        }
    }

    pub async fn embed_async(&self, text: &str) -> Result<Vec<f32>, String> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(vec![0.0; self.dim]);
        }
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(EmbeddingInput::String(text.to_string()))
            .build()
            .map_err(|e| e.to_string())?;
        let response = self
            .client
            .embeddings()
            .create(request)
            .await
            .map_err(|e| e.to_string())?;
        let vec = response
            .data
            .first()
            .map(|e| e.embedding.clone())
            .unwrap_or_default();
        if vec.len() != self.dim {
            return Err(format!(
                "embedding dimension mismatch: expected {}, got {}",
                self.dim,
                vec.len()
            ));
        }
        Ok(vec)
    }
}

impl EmbeddingProvider for OpenAiEmbedder {
    fn embed_sync(&self, text: &str) -> Result<Vec<f32>, String> {
        let text = text.to_string();
        let this = self.clone();
        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(this.embed_async(&text))
        })
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

/// 按配置选择嵌入提供方：provider 为 openai 且有 API key 时用远端，否则本地哈希
pub fn create_embedder_from_config(
    provider: &str,
    base_url: Option<&str>,
    model: &str,
    dim: usize,
) -> Arc<dyn EmbeddingProvider> {
    if provider == "openai" {
        if let Some(key) = resolve_api_key(None) {
            return Arc::new(OpenAiEmbedder::new(base_url, model, Some(&key), dim));
        }
        tracing::warn!("OPENAI_API_KEY not set, falling back to hashing embedder");
    }
    Arc::new(HashingEmbedder::new(dim))
}
