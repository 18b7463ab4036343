//! Device certificate issuance
//!
//! 1. `generate_challenge` with the device address
//! 2. Sign the challenge as an Ethereum personal message
//! 3. `submit_challenge` for an access token
//! 4. Hand the token to the CA as a one-time token with the CSR

use std::time::Duration;

use edge_core::Signer;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use sha3::{Digest, Keccak256};
use tracing::{info, instrument};
use url::Url;

use crate::error::{ClientError, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Keccak-256 of `"\x19Ethereum Signed Message:\n" + len + message`
pub fn personal_message_hash(message: &str) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(format!("\x19Ethereum Signed Message:\n{}", message.len()).as_bytes());
    hasher.update(message.as_bytes());
    hasher.finalize().into()
}

/// Auth endpoints and the identity this device authenticates as
#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub auth_host: String,
    pub ca_host: String,
    pub client_id: String,
    pub domain: String,
}

#[derive(Debug, Deserialize)]
struct Challenge {
    state: String,
    challenge: String,
}

#[derive(Debug, Deserialize)]
struct Token {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    crt: String,
    #[serde(default)]
    ca: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CertificateIssuer {
    client: Client,
    auth_host: Url,
    ca_host: Url,
    client_id: String,
    domain: String,
}

impl CertificateIssuer {
    pub fn new(settings: &AuthSettings) -> Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(DEFAULT_TIMEOUT).build()?,
            auth_host: Url::parse(&settings.auth_host)?,
            ca_host: Url::parse(&settings.ca_host)?,
            client_id: settings.client_id.clone(),
            domain: settings.domain.clone(),
        })
    }

    /// Run the full flow and return the PEM chain
    #[instrument(skip(self, signer, csr_pem))]
    pub async fn issue(&self, signer: &dyn Signer, csr_pem: &str) -> Result<String> {
        let address = signer
            .ethereum_address()
            .await
            .map_err(|e| ClientError::Rejected(format!("no device address: {}", e)))?;

        let challenge = self.generate_challenge(&address).await?;
        let signature = signer
            .sign_hash(personal_message_hash(&challenge.challenge))
            .await
            .map_err(|e| ClientError::Rejected(format!("challenge signing failed: {}", e)))?;
        let token = self
            .submit_challenge(&challenge.state, &format!("0x{}", hex::encode(signature)))
            .await?;
        let pem = self.sign_csr(csr_pem, &token).await?;

        info!(address = %address, "Device certificate issued");
        Ok(pem)
    }

    async fn generate_challenge(&self, address: &str) -> Result<Challenge> {
        let url = self.auth_host.join("/auth/web3/generate_challenge")?;
        let form = [
            ("domain", self.domain.as_str()),
            ("client_id", self.client_id.as_str()),
            ("response_type", "code"),
            ("scope", "openid email"),
            ("address", address),
        ];
        let response = self.client.post(url).form(&form).send().await?;
        parse(response).await
    }

    async fn submit_challenge(&self, state: &str, signature: &str) -> Result<String> {
        let url = self.auth_host.join("/auth/web3/submit_challenge")?;
        let form = [
            ("client_id", self.client_id.as_str()),
            ("domain", self.domain.as_str()),
            ("grant_type", "authorization_code"),
            ("state", state),
            ("signature", signature),
        ];
        let response = self.client.post(url).form(&form).send().await?;
        let token: Token = parse(response).await?;
        Ok(token.access_token)
    }

    async fn sign_csr(&self, csr_pem: &str, ott: &str) -> Result<String> {
        let url = self.ca_host.join("/1.0/sign")?;
        let response = self
            .client
            .post(url)
            .json(&json!({ "csr": csr_pem, "ott": ott }))
            .send()
            .await?;
        let signed: SignResponse = parse(response).await?;

        let mut pem = signed.crt.trim_end().to_string();
        if let Some(ca) = signed.ca {
            pem.push('\n');
            pem.push_str(ca.trim_end());
        }
        pem.push('\n');
        Ok(pem)
    }
}

async fn parse<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_else(|_| format!("HTTP {}", status));
        return Err(match status.as_u16() {
            400 => ClientError::BadRequest(message),
            404 => ClientError::NotFound(message),
            401 | 403 => ClientError::Rejected(message),
            code => ClientError::server_error(code, message),
        });
    }
    response
        .json()
        .await
        .map_err(|e| ClientError::ParseError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_personal_message_hash() {
        // keccak256("\x19Ethereum Signed Message:\n5hello")
        assert_eq!(
            hex::encode(personal_message_hash("hello")),
            "50b2c43fd39106bafbba0da34fc430e1f91e3c96ea2acee2bc34119f92b37750"
        );
    }
}
