use snafu::Snafu;

pub const DEFAULT_MODEL_ID: &str = "gpt-4o-mini";

/// Provider settings the worker needs to reach an OpenAI-compatible endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub api_key: String,
    /// Base URL override. Empty means the provider default.
    pub endpoint: String,
    pub model_id: String,
    pub max_tokens: Option<u64>,
    pub temperature: Option<f64>,
    pub preamble: Option<String>,
}

impl WorkerConfig {
    pub fn new(api_key: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into().trim().to_string(),
            endpoint: String::new(),
            model_id: model_id.into().trim().to_string(),
            max_tokens: None,
            temperature: None,
            preamble: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim().to_string();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = Some(preamble.into());
        self
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.is_empty()
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::new("", DEFAULT_MODEL_ID)
    }
}

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum WorkerError {
    #[snafu(display("no API key configured for model '{model_id}'"))]
    MissingApiKey {
        stage: &'static str,
        model_id: String,
    },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("failed to finalize HTTP request body: {message}"))]
    BuildHttpRequestBody {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("model catalog returned status {status}: {body}"))]
    CatalogStatus {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("failed to parse model catalog: {details}"))]
    CatalogPayload {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("generation request has no user turn to answer"))]
    EmptyHistory { stage: &'static str },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    Completions {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
}
