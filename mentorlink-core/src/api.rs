//! Call REST collaborators
//!
//! The platform's REST layer creates calls, stores end-of-call summaries and
//! hands out ICE server configuration. The core only consumes these
//! endpoints through [`CallApi`].

use crate::types::{CallId, IceServer, ParticipantId, ParticipantInfo};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// REST collaborator errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// Endpoint unreachable or timed out
    #[error("Call API unavailable: {0}")]
    Unavailable(String),

    /// Endpoint answered with an error status
    #[error("Call API returned {status}: {message}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body or reason
        message: String,
    },

    /// Response body could not be decoded
    #[error("Invalid call API response: {0}")]
    InvalidResponse(String),

    /// Client misconfigured
    #[error("Call API configuration error: {0}")]
    Config(String),
}

/// Request to initiate a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    /// Who is calling
    pub initiator: ParticipantInfo,
    /// Who is invited
    pub invitees: Vec<ParticipantId>,
    /// Mentorship the call belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mentorship_id: Option<String>,
}

/// Call context returned by the API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallContext {
    /// Call identifier
    pub call_id: CallId,
    /// Participants expected on the call
    pub participants: Vec<ParticipantInfo>,
}

/// End-of-call summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSummary {
    /// Connected duration in seconds
    pub duration: u64,
    /// Rating from 1 to 5
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<u8>,
    /// Free-form notes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Call REST endpoints
#[async_trait]
pub trait CallApi: Send + Sync {
    /// Create a call and return its context
    async fn create_call(&self, request: &CallRequest) -> Result<CallContext, ApiError>;

    /// Persist the summary of a finished call
    async fn submit_summary(&self, call_id: CallId, summary: &CallSummary)
        -> Result<(), ApiError>;

    /// STUN/TURN servers to use
    async fn ice_servers(&self) -> Result<Vec<IceServer>, ApiError>;
}

/// Resolve ICE servers: API first, then configured list, then public STUN
pub async fn resolve_ice_servers(api: Option<&dyn CallApi>, configured: &[IceServer]) -> Vec<IceServer> {
    if let Some(api) = api {
        match api.ice_servers().await {
            Ok(servers) if !servers.is_empty() => {
                tracing::debug!(count = servers.len(), "Using ICE servers from call API");
                return servers;
            }
            Ok(_) => tracing::warn!("Call API returned no ICE servers"),
            Err(e) => tracing::warn!(error = %e, "ICE server endpoint unavailable"),
        }
    }
    if !configured.is_empty() {
        tracing::debug!(count = configured.len(), "Using configured ICE servers");
        return configured.to_vec();
    }
    tracing::info!("Falling back to public STUN servers");
    IceServer::public_stun()
}

#[cfg(feature = "http-api")]
pub use http::HttpCallApi;

#[cfg(feature = "http-api")]
mod http {
    use super::{ApiError, CallApi, CallContext, CallRequest, CallSummary};
    use crate::types::{CallId, IceServer};
    use async_trait::async_trait;
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct IceServersResponse {
        ice_servers: Vec<IceServer>,
    }

    /// [`CallApi`] over HTTP
    ///
    /// `POST {base}/calls`, `POST {base}/calls/{id}/summary` and
    /// `GET {base}/ice-servers`, with an optional bearer token.
    pub struct HttpCallApi {
        base_url: String,
        auth_token: Option<String>,
        client: reqwest::Client,
    }

    impl HttpCallApi {
        /// Create a client for `base_url`
        ///
        /// # Errors
        ///
        /// Returns error if the URL is not http(s) or the client cannot be built
        pub fn new(base_url: impl Into<String>, auth_token: Option<String>) -> Result<Self, ApiError> {
            let base_url = base_url.into().trim_end_matches('/').to_string();
            if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
                return Err(ApiError::Config(format!(
                    "base_url must start with http:// or https://, got: {base_url}"
                )));
            }
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .map_err(|e| ApiError::Config(format!("Failed to create HTTP client: {e}")))?;
            Ok(Self {
                base_url,
                auth_token,
                client,
            })
        }

        fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
            let builder = self
                .client
                .request(method, format!("{}{}", self.base_url, path));
            match &self.auth_token {
                Some(token) => builder.bearer_auth(token),
                None => builder,
            }
        }

        async fn send(builder: reqwest::RequestBuilder) -> Result<reqwest::Response, ApiError> {
            let response = builder
                .send()
                .await
                .map_err(|e| ApiError::Unavailable(e.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                return Err(ApiError::Status {
                    status: status.as_u16(),
                    message,
                });
            }
            Ok(response)
        }
    }

    #[async_trait]
    impl CallApi for HttpCallApi {
        #[tracing::instrument(skip(self, request))]
        async fn create_call(&self, request: &CallRequest) -> Result<CallContext, ApiError> {
            let response = Self::send(self.request(reqwest::Method::POST, "/calls").json(request)).await?;
            response
                .json()
                .await
                .map_err(|e| ApiError::InvalidResponse(e.to_string()))
        }

        #[tracing::instrument(skip(self, summary), fields(%call_id))]
        async fn submit_summary(
            &self,
            call_id: CallId,
            summary: &CallSummary,
        ) -> Result<(), ApiError> {
            Self::send(
                self.request(reqwest::Method::POST, &format!("/calls/{call_id}/summary"))
                    .json(summary),
            )
            .await?;
            Ok(())
        }

        async fn ice_servers(&self) -> Result<Vec<IceServer>, ApiError> {
            let response = Self::send(self.request(reqwest::Method::GET, "/ice-servers")).await?;
            let body: IceServersResponse = response
                .json()
                .await
                .map_err(|e| ApiError::InvalidResponse(e.to_string()))?;
            Ok(body.ice_servers)
        }
    }

    #[cfg(test)]
    #[allow(clippy::unwrap_used)]
    mod tests {
        use super::*;

        #[test]
        fn test_rejects_non_http_url() {
            assert!(matches!(
                HttpCallApi::new("ftp://example.com", None),
                Err(ApiError::Config(_))
            ));
            assert!(HttpCallApi::new("https://api.example.com/", None).is_ok());
        }

        #[tokio::test]
        async fn test_unreachable_endpoint_is_unavailable() {
            let api = HttpCallApi::new("http://127.0.0.1:9", None).unwrap();
            assert!(matches!(
                api.ice_servers().await,
                Err(ApiError::Unavailable(_))
            ));
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::Role;
    use pretty_assertions::assert_eq;

    struct StaticApi(Result<Vec<IceServer>, ApiError>);

    #[async_trait]
    impl CallApi for StaticApi {
        async fn create_call(&self, _request: &CallRequest) -> Result<CallContext, ApiError> {
            Err(ApiError::Unavailable("static".to_string()))
        }

        async fn submit_summary(
            &self,
            _call_id: CallId,
            _summary: &CallSummary,
        ) -> Result<(), ApiError> {
            Ok(())
        }

        async fn ice_servers(&self) -> Result<Vec<IceServer>, ApiError> {
            self.0.clone()
        }
    }

    fn turn() -> IceServer {
        IceServer {
            urls: vec!["turn:turn.example.com:3478".to_string()],
            username: Some("u".to_string()),
            credential: Some("c".to_string()),
        }
    }

    #[tokio::test]
    async fn test_api_servers_win() {
        let api = StaticApi(Ok(vec![turn()]));
        let servers = resolve_ice_servers(Some(&api), &[]).await;
        assert_eq!(servers, vec![turn()]);
    }

    #[tokio::test]
    async fn test_configured_servers_when_api_fails() {
        let api = StaticApi(Err(ApiError::Unavailable("down".to_string())));
        let configured = vec![turn()];
        assert_eq!(resolve_ice_servers(Some(&api), &configured).await, configured);
    }

    #[tokio::test]
    async fn test_public_stun_fallback() {
        let api = StaticApi(Ok(vec![]));
        assert_eq!(
            resolve_ice_servers(Some(&api), &[]).await,
            IceServer::public_stun()
        );
        assert_eq!(resolve_ice_servers(None, &[]).await, IceServer::public_stun());
    }

    #[test]
    fn test_wire_shapes() {
        let request = CallRequest {
            initiator: ParticipantInfo::new(1, "Ada", Role::Mentor),
            invitees: vec![ParticipantId(2)],
            mentorship_id: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["invitees"], serde_json::json!([2]));
        assert!(json.get("mentorshipId").is_none());

        let summary = CallSummary {
            duration: 1800,
            rating: Some(5),
            notes: None,
        };
        assert_eq!(
            serde_json::to_value(&summary).unwrap(),
            serde_json::json!({"duration": 1800, "rating": 5})
        );

        let context: CallContext = serde_json::from_value(serde_json::json!({
            "callId": "6f1c3c1e-8a4b-4e0c-9f3e-2d6c2b8e7a10",
            "participants": [{"id": 1, "displayName": "Ada", "role": "mentor"}]
        }))
        .unwrap();
        assert_eq!(context.participants.len(), 1);
    }
}
