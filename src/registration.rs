use std::time::Duration;

use log::info;
use serde::Serialize;

use crate::error::RegistrationError;
use crate::hashing::AgentIdentity;

pub const REGISTER_PATH: &str = "/api/agents/add";

#[derive(Debug, Serialize)]
struct RegistrationRequest<'a> {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Hostname")]
    hostname: &'a str,
    #[serde(rename = "HostOS")]
    host_os: &'a str,
}

impl<'a> From<&'a AgentIdentity> for RegistrationRequest<'a> {
    fn from(identity: &'a AgentIdentity) -> Self {
        RegistrationRequest {
            id: identity.hash().to_string(),
            hostname: identity.hostname(),
            host_os: identity.host_os(),
        }
    }
}

/// Announces this agent to the collector once at startup.
pub async fn register(server: &str, identity: &AgentIdentity, timeout: Duration) -> Result<(), RegistrationError> {
    info!("Registering agent...");

    let client = reqwest::Client::builder().timeout(timeout).build()?;
    let url = format!("http://{}{}", server, REGISTER_PATH);

    let response = client
        .post(&url)
        .json(&RegistrationRequest::from(identity))
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        return Err(RegistrationError::Status(status.as_u16()));
    }

    info!("Agent {} registered with {}", identity.hash(), server);
    Ok(())
}
