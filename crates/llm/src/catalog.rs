use rig::http_client::{self, HttpClientExt, NoBody};
use rig::providers::openai;
use serde::Deserialize;
use snafu::{ResultExt, ensure};

use crate::config::{
    CatalogStatusSnafu, HttpClientSnafu, MissingApiKeySnafu, WorkerConfig, WorkerError,
    WorkerResult,
};

/// Resource name reported in load progress events while the catalog is fetched.
pub const CATALOG_RESOURCE: &str = "models";

/// Model identifiers served by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelCatalog {
    pub model_ids: Vec<String>,
    /// Size of the raw response body.
    pub payload_bytes: u64,
}

impl ModelCatalog {
    pub fn contains(&self, model_id: &str) -> bool {
        self.model_ids.iter().any(|id| id == model_id)
    }
}

pub(crate) fn build_client(config: &WorkerConfig) -> WorkerResult<openai::Client> {
    ensure!(
        config.has_api_key(),
        MissingApiKeySnafu {
            stage: "build-client",
            model_id: config.model_id.clone(),
        }
    );

    let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
    if !config.endpoint.is_empty() {
        builder = builder.base_url(config.endpoint.as_str());
    }
    builder.build().context(HttpClientSnafu {
        stage: "build-client",
    })
}

pub async fn fetch_catalog(config: &WorkerConfig) -> WorkerResult<ModelCatalog> {
    let client = build_client(config)?;
    let request = client
        .get("/models")
        .context(HttpClientSnafu {
            stage: "build-model-request",
        })?
        .body(NoBody)
        .map_err(|source| WorkerError::BuildHttpRequestBody {
            stage: "build-model-request-body",
            message: source.to_string(),
        })?;

    let response = client.send(request).await.context(HttpClientSnafu {
        stage: "send-model-request",
    })?;
    let status = response.status();
    let payload = http_client::text(response).await.context(HttpClientSnafu {
        stage: "read-model-response",
    })?;

    if !status.is_success() {
        return CatalogStatusSnafu {
            stage: "model-http-status",
            status: status.as_u16(),
            body: payload,
        }
        .fail();
    }

    Ok(ModelCatalog::from_payload(&payload))
}

#[derive(Debug, Deserialize)]
struct CatalogBody {
    #[serde(default)]
    data: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    id: String,
}

impl ModelCatalog {
    /// Builds a catalog from a `/models` body. An unreadable body yields an empty
    /// catalog so the configured model is still tried.
    pub fn from_payload(payload: &str) -> Self {
        let model_ids = extract_model_ids(payload).unwrap_or_else(|error| {
            tracing::warn!(
                error = %error,
                payload_bytes = payload.len(),
                "model catalog is unreadable; continuing with the configured model"
            );
            Vec::new()
        });

        Self {
            model_ids,
            payload_bytes: payload.len() as u64,
        }
    }
}

/// Parses the `data[].id` values of an OpenAI-style catalog, sorted and deduplicated.
pub fn extract_model_ids(payload: &str) -> WorkerResult<Vec<String>> {
    let body: CatalogBody =
        serde_json::from_str(payload).map_err(|source| WorkerError::CatalogPayload {
            stage: "parse-model-response",
            details: source.to_string(),
        })?;

    let mut ids: Vec<String> = body
        .data
        .into_iter()
        .map(|entry| entry.id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect();
    ids.sort();
    ids.dedup();
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_sorted_unique_ids() {
        let payload = r#"{"object":"list","data":[{"id":"gpt-4o","object":"model"},{"id":"gpt-4o-mini","object":"model"},{"id":"gpt-4o","object":"model"},{"id":"  ","object":"model"}]}"#;

        assert_eq!(
            extract_model_ids(payload).unwrap(),
            vec!["gpt-4o", "gpt-4o-mini"]
        );
    }

    #[test]
    fn extracts_ids_from_pretty_printed_catalog() {
        let payload = r#"{
  "object": "list",
  "data": [
    {
      "id": "gpt-4o-mini",
      "object": "model",
      "created": 1721172741,
      "owned_by": "system"
    },
    {
      "id": "o3",
      "object": "model",
      "created": 1744225308,
      "owned_by": "system"
    }
  ]
}"#;

        assert_eq!(extract_model_ids(payload).unwrap(), vec!["gpt-4o-mini", "o3"]);
    }

    #[test]
    fn unreadable_catalog_is_an_empty_listing() {
        let payload = r#"{"data":[{"id":"o3"},{"id":"o4-mi"#;
        assert!(matches!(
            extract_model_ids(payload),
            Err(WorkerError::CatalogPayload { .. })
        ));

        let catalog = ModelCatalog::from_payload(payload);
        assert!(catalog.model_ids.is_empty());
        assert_eq!(catalog.payload_bytes, payload.len() as u64);

        // A body without `data` lists nothing.
        assert!(extract_model_ids(r#"{"object":"list"}"#).unwrap().is_empty());
    }

    #[test]
    fn catalog_lookup() {
        let catalog = ModelCatalog {
            model_ids: vec!["gpt-4o".to_string()],
            payload_bytes: 42,
        };
        assert!(catalog.contains("gpt-4o"));
        assert!(!catalog.contains("gpt-4"));
    }

    #[test]
    fn client_requires_api_key() {
        assert!(matches!(
            build_client(&WorkerConfig::default()),
            Err(WorkerError::MissingApiKey { .. })
        ));
    }
}
