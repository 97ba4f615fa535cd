use std::time::Duration;

use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use reqwest::Client;

use super::{SignatureRequest, SignatureResponse, ValidatorClient};

/// Validator reached over HTTP at `POST {endpoint}/sign`
#[derive(Debug, Clone)]
pub struct HttpValidatorClient {
    client: Client,
    endpoint: String,
}

impl HttpValidatorClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .wrap_err("Failed to build HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    fn sign_url(&self) -> String {
        format!("{}/sign", self.endpoint.trim_end_matches('/'))
    }
}

#[async_trait]
impl ValidatorClient for HttpValidatorClient {
    async fn request_signature(&self, request: &SignatureRequest) -> Result<SignatureResponse> {
        let response = self
            .client
            .post(self.sign_url())
            .json(request)
            .send()
            .await
            .wrap_err_with(|| format!("Signature request to {} failed", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(eyre!(
                "Validator {} answered {}: {}",
                self.endpoint,
                status,
                body
            ));
        }

        response
            .json::<SignatureResponse>()
            .await
            .wrap_err_with(|| format!("Validator {} returned an invalid response", self.endpoint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Address, Bytes};

    #[test]
    fn test_sign_url() {
        let client = HttpValidatorClient::new("http://v1:8000/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.sign_url(), "http://v1:8000/sign");
    }

    #[test]
    fn test_response_wire_format() {
        let json = format!(
            r#"{{"validator":"0x1111111111111111111111111111111111111111","signature":"0x{}"}}"#,
            "ab".repeat(65)
        );
        let response: SignatureResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(response.validator, Address::repeat_byte(0x11));
        assert_eq!(response.signature, Bytes::from(vec![0xab; 65]));
    }
}
