//! Coinbase Commerce charges for crypto payments.
//!
//! Crypto charges are one-off: a "subscription" paid in crypto is a single
//! charge covering one billing interval, keyed by the charge id, and it is
//! expired by the sweep once the period ends.

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::info;
use uuid::Uuid;

use crate::images::Image;
use crate::payment_events::{CryptoEvent, OrderMetadata, PaymentEvent, UserRef};
use crate::plans::{PlanSelection, format_cents, parse_cents};
use crate::provider_error::ProviderError;
use crate::subscriptions::PaymentProvider;

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_API_BASE: &str = "https://api.commerce.coinbase.com";
const API_VERSION: &str = "2018-03-22";
const PROVIDER: PaymentProvider = PaymentProvider::Crypto;

pub const SIGNATURE_HEADER: &str = "x-cc-webhook-signature";

#[derive(Clone)]
pub struct CoinbaseConfig {
    pub api_key: String,
    pub webhook_secret: String,
    pub api_base: String,
}

impl CoinbaseConfig {
    pub fn from_env() -> Result<Self> {
        let api_key =
            std::env::var("COINBASE_COMMERCE_API_KEY").context("COINBASE_COMMERCE_API_KEY must be set")?;
        let webhook_secret = std::env::var("COINBASE_COMMERCE_WEBHOOK_SECRET")
            .context("COINBASE_COMMERCE_WEBHOOK_SECRET must be set")?;
        let api_base = std::env::var("COINBASE_COMMERCE_API_BASE")
            .unwrap_or_else(|_| DEFAULT_API_BASE.to_string())
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            api_key,
            webhook_secret,
            api_base,
        })
    }
}

impl std::fmt::Debug for CoinbaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoinbaseConfig")
            .field("api_key", &"[REDACTED]")
            .field("webhook_secret", &"[REDACTED]")
            .field("api_base", &self.api_base)
            .finish()
    }
}

/// Check `X-CC-Webhook-Signature`: hex HMAC-SHA256 of the raw body, compared in constant time
pub fn verify_signature(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Price {
    pub amount: String,
    pub currency: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Pricing {
    pub local: Option<Price>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimelineEntry {
    pub status: String,
    pub context: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Charge {
    pub id: String,
    pub code: Option<String>,
    pub hosted_url: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub pricing: Pricing,
    #[serde(default)]
    pub timeline: Vec<TimelineEntry>,
}

impl Charge {
    /// Paid in full, or resolved manually after an over/underpayment
    pub fn is_settled(&self) -> bool {
        self.timeline
            .iter()
            .any(|entry| matches!(entry.status.as_str(), "COMPLETED" | "RESOLVED"))
    }

    pub fn last_status(&self) -> Option<&str> {
        self.timeline.last().map(|entry| entry.status.as_str())
    }

    /// Settlement event for this charge
    pub fn confirmed_event(&self) -> PaymentEvent {
        let metadata = OrderMetadata::from_json(&self.metadata);
        let (amount_cents, currency) = match &self.pricing.local {
            Some(price) => (parse_cents(&price.amount).ok(), Some(price.currency.clone())),
            None => (None, None),
        };
        PaymentEvent::Crypto(CryptoEvent::ChargeConfirmed {
            charge_id: self.id.clone(),
            user: UserRef::from_provider(metadata.user_id),
            metadata,
            amount_cents,
            currency,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ChargeEnvelope {
    data: Charge,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventBody {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Charge,
}

/// Webhook delivery: `{"id": <attempt number>, "event": {...}}`. Deliveries are keyed by `event.id`.
#[derive(Debug, Clone, Deserialize)]
pub struct CoinbaseWebhook {
    pub event: WebhookEventBody,
}

impl CoinbaseWebhook {
    /// Map to a payment event. None for event types we do not act on.
    pub fn payment_event(&self) -> Option<PaymentEvent> {
        let charge = &self.event.data;
        match self.event.event_type.as_str() {
            "charge:confirmed" | "charge:resolved" => Some(charge.confirmed_event()),
            "charge:failed" => Some(PaymentEvent::Crypto(CryptoEvent::ChargeFailed {
                charge_id: charge.id.clone(),
                reason: charge
                    .timeline
                    .last()
                    .and_then(|entry| entry.context.clone())
                    .unwrap_or_else(|| "EXPIRED".to_string()),
            })),
            "charge:pending" | "charge:created" => {
                Some(PaymentEvent::Crypto(CryptoEvent::ChargePending {
                    charge_id: charge.id.clone(),
                }))
            }
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct CoinbaseClient {
    config: CoinbaseConfig,
    http: reqwest::Client,
}

impl CoinbaseClient {
    pub fn new(config: CoinbaseConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    pub fn from_env() -> Result<Self> {
        Ok(Self::new(CoinbaseConfig::from_env()?))
    }

    pub fn verify_webhook(&self, body: &[u8], signature_hex: &str) -> bool {
        verify_signature(&self.config.webhook_secret, body, signature_hex)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.config.api_base, path))
            .header("X-CC-Api-Key", &self.config.api_key)
            .header("X-CC-Version", API_VERSION)
    }

    async fn read_charge(response: reqwest::Response) -> Result<Charge, ProviderError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(PROVIDER, status, &body));
        }
        let envelope: ChargeEnvelope = response
            .json()
            .await
            .map_err(|e| ProviderError::from_reqwest(PROVIDER, e))?;
        Ok(envelope.data)
    }

    async fn create_charge(
        &self,
        name: &str,
        amount_cents: i64,
        metadata: OrderMetadata,
        base_url: &str,
    ) -> Result<Charge, ProviderError> {
        let body = serde_json::json!({
            "name": name,
            "description": name,
            "pricing_type": "fixed_price",
            "local_price": Price {
                amount: format_cents(amount_cents),
                currency: "USD".to_string(),
            },
            "metadata": metadata.to_json(),
            "redirect_url": format!("{}/billing/success?provider=crypto", base_url),
            "cancel_url": format!("{}/billing/cancel", base_url),
        });

        let response = self
            .request(reqwest::Method::POST, "/charges")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(PROVIDER, e))?;
        let charge = Self::read_charge(response).await?;
        info!(charge_id = %charge.id, amount_cents, "Created Coinbase charge");
        Ok(charge)
    }

    /// Charge covering one billing interval of `plan`
    pub async fn create_subscription_charge(
        &self,
        plan: PlanSelection,
        amount_cents: i64,
        user_id: Uuid,
        base_url: &str,
    ) -> Result<Charge, ProviderError> {
        self.create_charge(
            &format!("Gallery {}", plan.label()),
            amount_cents,
            OrderMetadata::for_subscription(Some(user_id), plan),
            base_url,
        )
        .await
    }

    pub async fn create_purchase_charge(
        &self,
        image: &Image,
        user_id: Uuid,
        base_url: &str,
    ) -> Result<Charge, ProviderError> {
        self.create_charge(
            &image.title,
            image.price_cents as i64,
            OrderMetadata::for_purchase(Some(user_id), image.id),
            base_url,
        )
        .await
    }

    pub async fn get_charge(&self, charge_id: &str) -> Result<Charge, ProviderError> {
        let response = self
            .request(reqwest::Method::GET, &format!("/charges/{}", charge_id))
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(PROVIDER, e))?;
        Self::read_charge(response).await
    }
}
