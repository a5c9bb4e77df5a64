//! HTTP client for single-entity reads and writes.
//!
//! Bypasses the WebSocket engine: each call is one bearer-authenticated
//! request against the hub's REST API.

use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::constants::HTTP_REQUEST_TIMEOUT;
use crate::error::HassError;
use crate::messages::EntityState;

/// REST API client for the hub.
#[derive(Debug, Clone)]
pub struct HassApi {
    client: Client,
    base_url: String,
    token: String,
}

#[derive(Serialize)]
struct StateUpdate<'a> {
    state: &'a str,
    attributes: &'a Map<String, Value>,
}

impl HassApi {
    /// Creates a client for the hub at `base_url` (e.g. `http://hub.local:8123`).
    ///
    /// # Errors
    ///
    /// Returns `HassError::Http` if the HTTP client cannot be created.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, HassError> {
        let client = Client::builder().timeout(HTTP_REQUEST_TIMEOUT).build()?;
        Ok(Self::with_client(client, base_url, token))
    }

    /// Creates a client with a pre-configured HTTP client.
    pub fn with_client(
        client: Client,
        base_url: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    /// Returns the base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Reads one entity's state. Returns `None` if the hub does not know it.
    ///
    /// # Errors
    ///
    /// Returns `HassError::Http` on a failed request or non-success status,
    /// `HassError::Deserialization` on a malformed body.
    pub async fn get_state(&self, entity_id: &str) -> Result<Option<EntityState>, HassError> {
        let url = format!("{}/api/states/{}", self.base_url, entity_id);
        let response = self.client.get(&url).bearer_auth(&self.token).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            log::debug!("[HassApi] {} not found", entity_id);
            return Ok(None);
        }
        let body = checked(response, "get state").await?;
        Ok(Some(serde_json::from_str(&body)?))
    }

    /// Writes one entity's state and attributes on the hub.
    ///
    /// This only changes the hub's representation; no device is actuated.
    ///
    /// # Errors
    ///
    /// Same as [`HassApi::get_state`].
    pub async fn set_state(
        &self,
        entity_id: &str,
        state: &str,
        attributes: &Map<String, Value>,
    ) -> Result<EntityState, HassError> {
        let url = format!("{}/api/states/{}", self.base_url, entity_id);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&StateUpdate { state, attributes })
            .send()
            .await?;

        let body = checked(response, "set state").await?;
        log::debug!("[HassApi] Set {} to {}", entity_id, state);
        Ok(serde_json::from_str(&body)?)
    }

    /// Invokes `domain.service`, returning the states it changed.
    ///
    /// # Errors
    ///
    /// Same as [`HassApi::get_state`].
    pub async fn call_service(
        &self,
        domain: &str,
        service: &str,
        service_data: Option<&Value>,
    ) -> Result<Vec<EntityState>, HassError> {
        let url = format!("{}/api/services/{}/{}", self.base_url, domain, service);
        let empty = Value::Object(Map::new());
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(service_data.unwrap_or(&empty))
            .send()
            .await?;

        let body = checked(response, "call service").await?;
        Ok(serde_json::from_str(&body)?)
    }
}

async fn checked(response: reqwest::Response, action: &str) -> Result<String, HassError> {
    let status = response.status();
    let body = response.text().await?;
    if status.is_success() {
        Ok(body)
    } else {
        Err(HassError::Http(format!("Failed to {action}: {status} {body}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::StateValue;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn state_json(entity_id: &str, state: &str) -> Value {
        json!({
            "entity_id": entity_id,
            "state": state,
            "attributes": {"friendly_name": "Kitchen"},
            "last_changed": "2024-03-01T10:00:00+00:00",
            "last_updated": "2024-03-01T10:00:00+00:00"
        })
    }

    #[tokio::test]
    async fn test_get_state() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/states/sensor.temperature"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(state_json("sensor.temperature", "19")),
            )
            .mount(&server)
            .await;

        let api = HassApi::new(server.uri(), "secret").unwrap();
        let state = api.get_state("sensor.temperature").await.unwrap().unwrap();
        assert_eq!(state.state, StateValue::Integer(19));
    }

    #[tokio::test]
    async fn test_get_state_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/states/light.nowhere"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"message": "Entity not found."})))
            .mount(&server)
            .await;

        let api = HassApi::new(server.uri(), "secret").unwrap();
        assert_eq!(api.get_state("light.nowhere").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_state_posts_state_and_attributes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/states/light.kitchen"))
            .and(body_json(json!({"state": "on", "attributes": {"brightness": 10}})))
            .respond_with(ResponseTemplate::new(201).set_body_json(state_json("light.kitchen", "on")))
            .expect(1)
            .mount(&server)
            .await;

        let api = HassApi::new(format!("{}/", server.uri()), "secret").unwrap();
        let mut attributes = Map::new();
        attributes.insert("brightness".into(), json!(10));
        let state = api
            .set_state("light.kitchen", "on", &attributes)
            .await
            .unwrap();
        assert_eq!(state.entity_id, "light.kitchen");
    }

    #[tokio::test]
    async fn test_call_service_and_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/services/light/turn_on"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([state_json("light.kitchen", "on")])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/services/light/turn_on"))
            .respond_with(ResponseTemplate::new(401).set_body_string("401: Unauthorized"))
            .mount(&server)
            .await;

        let api = HassApi::new(server.uri(), "secret").unwrap();
        let changed = api
            .call_service("light", "turn_on", Some(&json!({"entity_id": "light.kitchen"})))
            .await
            .unwrap();
        assert_eq!(changed.len(), 1);

        let denied = HassApi::new(server.uri(), "wrong").unwrap();
        let result = denied.call_service("light", "turn_on", None).await;
        assert!(matches!(result, Err(HassError::Http(msg)) if msg.contains("401")));
    }
}
