//! Invoice creation and settlement lookup against the payment provider.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

/// A created invoice: the opaque provider id plus the URL the user pays at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invoice {
    pub id: String,
    pub url: String,
}

/// The two operations the workflow needs from the payment provider.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create an invoice for a whole-USD amount. `order_id` must be unique
    /// per charge attempt.
    async fn create_invoice(
        &self,
        amount_usd: u32,
        order_id: &str,
        description: &str,
    ) -> Result<Invoice>;

    /// Whether the invoice has settled. Transport failures count as unpaid.
    async fn is_paid(&self, invoice_id: &str) -> bool;
}

/// Build a per-attempt order id from the charge purpose, its target, the
/// paying user, and the current timestamp.
pub fn order_id(purpose: &str, target: u64, user: i64, now: chrono::DateTime<chrono::Utc>) -> String {
    format!("{purpose}:{target}:{user}:{}", now.timestamp())
}

/// HTTP adapter for a JSON invoice API.
pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Deserialize)]
struct InvoiceCreated {
    invoice_id: String,
    payment_url: String,
}

#[derive(Deserialize)]
struct InvoiceStatus {
    status: String,
}

impl HttpGateway {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("building payment client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn create_invoice(
        &self,
        amount_usd: u32,
        order_id: &str,
        description: &str,
    ) -> Result<Invoice> {
        let url = format!("{}/invoices", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "amount_usd": amount_usd,
                "order_id": order_id,
                "description": description,
            }))
            .send()
            .await
            .context("invoice request failed")?
            .error_for_status()
            .context("invoice request rejected")?;
        let created: InvoiceCreated = resp.json().await.context("decoding invoice response")?;
        Ok(Invoice {
            id: created.invoice_id,
            url: created.payment_url,
        })
    }

    async fn is_paid(&self, invoice_id: &str) -> bool {
        let url = format!("{}/invoices/{}", self.base_url, invoice_id);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await;
        match resp {
            Ok(resp) => match resp.json::<InvoiceStatus>().await {
                Ok(body) => body.status == "paid",
                Err(e) => {
                    warn!(invoice = invoice_id, error = %e, "unreadable invoice status, treating as unpaid");
                    false
                }
            },
            Err(e) => {
                warn!(invoice = invoice_id, error = %e, "invoice status lookup failed, treating as unpaid");
                false
            }
        }
    }
}
