use super::{Action, ActionError, CredentialRequirement, Credentials};
use serde::Deserialize;
use std::time::Duration;

/// Returns its config, plus the services it was given credentials for.
///
/// A `credential` field in the config names an optional service to resolve.
pub struct EchoAction;

#[async_trait::async_trait]
impl Action for EchoAction {
    fn name(&self) -> &str {
        "echo"
    }

    fn credentials(&self, config: &serde_json::Value) -> Vec<CredentialRequirement> {
        config
            .get("credential")
            .and_then(|v| v.as_str())
            .map(|service| vec![CredentialRequirement::optional(service)])
            .unwrap_or_default()
    }

    async fn invoke(
        &self,
        config: &serde_json::Value,
        credentials: &Credentials,
    ) -> Result<serde_json::Value, ActionError> {
        let services: Vec<String> = config
            .get("credential")
            .and_then(|v| v.as_str())
            .filter(|service| credentials.get(service).is_some())
            .map(|service| vec![service.to_string()])
            .unwrap_or_default();

        Ok(serde_json::json!({
            "config": config,
            "credentials": services,
        }))
    }
}

#[derive(Debug, Deserialize)]
struct DelayConfig {
    #[serde(default)]
    ms: u64,
}

/// Sleeps for `config.ms` milliseconds
pub struct DelayAction;

#[async_trait::async_trait]
impl Action for DelayAction {
    fn name(&self) -> &str {
        "delay"
    }

    async fn invoke(
        &self,
        config: &serde_json::Value,
        _credentials: &Credentials,
    ) -> Result<serde_json::Value, ActionError> {
        let delay: DelayConfig = serde_json::from_value(config.clone())
            .map_err(|e| ActionError::permanent(format!("invalid delay config: {}", e)))?;

        tokio::time::sleep(Duration::from_millis(delay.ms)).await;

        Ok(serde_json::json!({ "slept_ms": delay.ms }))
    }
}
