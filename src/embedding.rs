use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::config::Provider;
use crate::error::{IndexError, Result};

/// Hard per-call input limit; longer batches are chunked transparently.
pub const MAX_EMBED_BATCH: usize = 2048;

/// Fixed probe used to discover the model dimension once per client.
const DIMENSION_PROBE: &str = "get_embedding_dimension";

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const JINA_BASE_URL: &str = "https://api.jina.ai/v1";

/// Batching embedding model. Output length equals input length and preserves
/// order; `dimension` is probed once and cached.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>>;
    async fn dimension(&self) -> Result<usize>;
}

/// HTTP embedding client covering both recognized provider shapes. OpenAI
/// and Jina share the `/embeddings` wire format; they differ in base URL and
/// credential source.
#[derive(Debug)]
pub struct HttpEmbeddings {
    provider: Provider,
    model: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    dimension: OnceCell<usize>,
}

impl HttpEmbeddings {
    pub fn new(provider: Provider, model: &str) -> Result<Self> {
        let (key_var, url_var, default_base) = match provider {
            Provider::Openai => ("OPENAI_API_KEY", "OPENAI_BASE_URL", OPENAI_BASE_URL),
            Provider::Jina => ("JINA_API_KEY", "JINA_BASE_URL", JINA_BASE_URL),
        };
        let api_key = std::env::var(key_var)
            .map_err(|_| IndexError::Config(format!("{key_var} is not set")))?;
        let base_url = std::env::var(url_var).unwrap_or_else(|_| default_base.to_string());
        Ok(Self {
            provider,
            model: model.to_string(),
            base_url,
            api_key,
            client: reqwest::Client::new(),
            dimension: OnceCell::new(),
        })
    }

    async fn request_embeddings(&self, input: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.base_url);
        let request = EmbeddingRequest {
            model: self.model.clone(),
            input,
            // Jina rejects unknown fields, so only the OpenAI shape asks for
            // raw floats explicitly.
            encoding_format: match self.provider {
                Provider::Openai => Some("float".to_string()),
                Provider::Jina => None,
            },
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IndexError::Embedding(format!("{url}: {status}: {body}")));
        }

        let parsed: EmbeddingResponse = response.json().await?;
        let mut data = parsed.data;
        data.sort_by_key(|d| d.index);
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }
}

/// Split `inputs` at the provider's hard batch cap, issue one request per
/// batch, and concatenate the results in order. Every provider call in
/// `HttpEmbeddings::embed` goes through here.
async fn embed_in_batches<F, Fut>(inputs: &[String], mut request: F) -> Result<Vec<Vec<f32>>>
where
    F: FnMut(Vec<String>) -> Fut,
    Fut: std::future::Future<Output = Result<Vec<Vec<f32>>>>,
{
    if inputs.is_empty() {
        return Ok(Vec::new());
    }
    let mut vectors = Vec::with_capacity(inputs.len());
    for batch in inputs.chunks(MAX_EMBED_BATCH) {
        vectors.extend(request(batch.to_vec()).await?);
    }
    if vectors.len() != inputs.len() {
        return Err(IndexError::Embedding(format!(
            "provider returned {} vectors for {} inputs",
            vectors.len(),
            inputs.len()
        )));
    }
    Ok(vectors)
}

#[async_trait]
impl EmbeddingClient for HttpEmbeddings {
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        embed_in_batches(inputs, |batch| self.request_embeddings(batch)).await
    }

    async fn dimension(&self) -> Result<usize> {
        self.dimension
            .get_or_try_init(|| async {
                let vectors = self
                    .request_embeddings(vec![DIMENSION_PROBE.to_string()])
                    .await?;
                vectors
                    .first()
                    .map(|v| v.len())
                    .ok_or_else(|| IndexError::Embedding("empty dimension probe response".into()))
            })
            .await
            .copied()
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    encoding_format: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    index: i64,
    embedding: Vec<f32>,
}

/// Chat-completion client used by the optional code2desc step. OpenAI shape
/// only, matching the original service.
#[derive(Debug)]
pub struct ChatClient {
    model: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatClient {
    pub fn new(provider: Provider, model: &str) -> Result<Self> {
        if provider != Provider::Openai {
            return Err(IndexError::Config(
                "chat completions are only supported for the openai provider".into(),
            ));
        }
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| IndexError::Config("OPENAI_API_KEY is not set".into()))?;
        let base_url =
            std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| OPENAI_BASE_URL.to_string());
        Ok(Self {
            model: model.to_string(),
            base_url,
            api_key,
            client: reqwest::Client::new(),
        })
    }

    pub async fn complete(&self, messages: Vec<ChatMessage>) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "model": self.model, "messages": messages }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IndexError::Embedding(format!("{url}: {status}: {body}")));
        }

        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| IndexError::Embedding("chat response had no choices".into()))
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

/// Process-wide client cache keyed by (provider, model); clients are cheap
/// to share and their dimension probe should run once per process.
static EMBEDDING_CLIENTS: Lazy<Mutex<HashMap<(Provider, String), Arc<HttpEmbeddings>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

pub fn embedding_client(provider: Provider, model: &str) -> Result<Arc<HttpEmbeddings>> {
    let mut cache = EMBEDDING_CLIENTS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(client) = cache.get(&(provider, model.to_string())) {
        return Ok(client.clone());
    }
    let client = Arc::new(HttpEmbeddings::new(provider, model)?);
    cache.insert((provider, model.to_string()), client.clone());
    Ok(client)
}
