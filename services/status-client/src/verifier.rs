//! Receipt verification transport.
//!
//! The reconciler only sees the [`ReceiptVerifier`] trait; the HTTP client
//! below is the production implementation.

use std::future::Future;
use std::time::Duration;

use sc_protocol::{VerifyReceiptRequest, VerifyReceiptResponse, receipt_status};
use tracing::{debug, info};

pub const PRODUCTION_URL: &str = "https://buy.itunes.apple.com/verifyReceipt";
pub const SANDBOX_URL: &str = "https://sandbox.itunes.apple.com/verifyReceipt";

#[derive(Clone, Default)]
pub struct VerifyOptions {
    /// Shared secret for auto-renewable subscriptions.
    pub secret: Option<String>,
    /// Never fall back to the sandbox endpoint.
    pub exclude_sandbox: bool,
}

impl std::fmt::Debug for VerifyOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerifyOptions")
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("exclude_sandbox", &self.exclude_sandbox)
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VerifierError {
    #[error("verification request failed: {0}")]
    Transport(String),
    #[error("verification endpoint returned HTTP {0}")]
    Http(u16),
    #[error("malformed verification response: {0}")]
    Malformed(String),
}

pub trait ReceiptVerifier: Send + Sync {
    fn verify_receipt(
        &self,
        receipt: &str,
        options: &VerifyOptions,
    ) -> impl Future<Output = Result<VerifyReceiptResponse, VerifierError>> + Send;
}

/// Posts receipts to the verification service over HTTPS.
#[derive(Debug, Clone)]
pub struct HttpReceiptVerifier {
    client: reqwest::Client,
    production_url: String,
    sandbox_url: String,
}

impl HttpReceiptVerifier {
    pub fn new(
        production_url: impl Into<String>,
        sandbox_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, VerifierError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3).min(timeout))
            .timeout(timeout)
            .build()
            .map_err(|e| VerifierError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            production_url: production_url.into(),
            sandbox_url: sandbox_url.into(),
        })
    }

    async fn post(
        &self,
        url: &str,
        request: &VerifyReceiptRequest,
    ) -> Result<VerifyReceiptResponse, VerifierError> {
        let response = self
            .client
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(|e| VerifierError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(VerifierError::Http(response.status().as_u16()));
        }
        let body = response
            .text()
            .await
            .map_err(|e| VerifierError::Transport(e.to_string()))?;
        let parsed: VerifyReceiptResponse =
            serde_json::from_str(&body).map_err(|e| VerifierError::Malformed(e.to_string()))?;
        debug!(url, status = parsed.status, "verification response");
        Ok(parsed)
    }
}

impl ReceiptVerifier for HttpReceiptVerifier {
    async fn verify_receipt(
        &self,
        receipt: &str,
        options: &VerifyOptions,
    ) -> Result<VerifyReceiptResponse, VerifierError> {
        let request = VerifyReceiptRequest {
            receipt_data: receipt.to_owned(),
            password: options.secret.clone(),
            exclude_old_transactions: true,
        };
        let response = self.post(&self.production_url, &request).await?;
        if response.status == receipt_status::SANDBOX_RECEIPT && !options.exclude_sandbox {
            info!("sandbox receipt; retrying against sandbox endpoint");
            return self.post(&self.sandbox_url, &request).await;
        }
        Ok(response)
    }
}
