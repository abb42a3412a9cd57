//! PayPal REST client: subscriptions, one-time orders and webhook verification.

use anyhow::{Context, Result};
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::images::Image;
use crate::payment_events::{PayPalEvent, PaymentEvent, UserRef, parse_uuid};
use crate::plans::{PlanSelection, format_cents, parse_cents, plan_ids_from_env};
use crate::provider_error::ProviderError;
use crate::subscriptions::{PaymentProvider, SubscriptionStatus};

const SANDBOX_API_BASE: &str = "https://api-m.sandbox.paypal.com";
const PROVIDER: PaymentProvider = PaymentProvider::PayPal;
/// Refresh the OAuth token this long before PayPal says it expires
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct PayPalConfig {
    pub client_id: String,
    pub client_secret: String,
    /// Id of the webhook registered in the PayPal dashboard, used for signature verification
    pub webhook_id: String,
    pub api_base: String,
    pub plan_ids: HashMap<PlanSelection, String>,
}

impl PayPalConfig {
    pub fn from_env() -> Result<Self> {
        let client_id =
            std::env::var("PAYPAL_CLIENT_ID").context("PAYPAL_CLIENT_ID must be set")?;
        let client_secret =
            std::env::var("PAYPAL_CLIENT_SECRET").context("PAYPAL_CLIENT_SECRET must be set")?;
        let webhook_id =
            std::env::var("PAYPAL_WEBHOOK_ID").context("PAYPAL_WEBHOOK_ID must be set")?;
        let api_base = std::env::var("PAYPAL_API_BASE")
            .unwrap_or_else(|_| SANDBOX_API_BASE.to_string())
            .trim_end_matches('/')
            .to_string();
        let plan_ids = plan_ids_from_env("PAYPAL_PLAN");
        if plan_ids.is_empty() {
            anyhow::bail!("At least one PAYPAL_PLAN_<PLAN>_<INTERVAL> must be set");
        }

        Ok(Self {
            client_id,
            client_secret,
            webhook_id,
            api_base,
            plan_ids,
        })
    }

    pub fn plan_id(&self, plan: PlanSelection) -> Option<&str> {
        self.plan_ids.get(&plan).map(String::as_str)
    }

    /// Reverse lookup of a PayPal plan id
    pub fn plan_for_id(&self, plan_id: &str) -> Option<PlanSelection> {
        self.plan_ids
            .iter()
            .find(|(_, id)| id.as_str() == plan_id)
            .map(|(plan, _)| *plan)
    }
}

impl std::fmt::Debug for PayPalConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayPalConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("webhook_id", &self.webhook_id)
            .field("api_base", &self.api_base)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct AccessToken {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Link {
    pub href: String,
    pub rel: String,
}

fn approval_link(links: &[Link]) -> Option<String> {
    links
        .iter()
        .find(|l| l.rel == "approve" || l.rel == "payer-action")
        .map(|l| l.href.clone())
}

#[derive(Debug, Clone, Deserialize)]
pub struct PayPalSubscription {
    pub id: String,
    pub status: String,
    pub plan_id: Option<String>,
    pub custom_id: Option<String>,
    #[serde(default)]
    pub links: Vec<Link>,
}

impl PayPalSubscription {
    pub fn approval_url(&self) -> Option<String> {
        approval_link(&self.links)
    }

    /// ACTIVE, or APPROVED (buyer approved, first payment still settling)
    pub fn is_approved(&self) -> bool {
        matches!(self.status.as_str(), "ACTIVE" | "APPROVED")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Money {
    pub currency_code: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Capture {
    pub id: String,
    pub status: String,
    pub amount: Option<Money>,
    pub custom_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Payments {
    #[serde(default)]
    pub captures: Vec<Capture>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PurchaseUnit {
    pub custom_id: Option<String>,
    pub amount: Option<Money>,
    pub payments: Option<Payments>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PayPalOrder {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub purchase_units: Vec<PurchaseUnit>,
    #[serde(default)]
    pub links: Vec<Link>,
}

impl PayPalOrder {
    pub fn approval_url(&self) -> Option<String> {
        approval_link(&self.links)
    }

    pub fn is_completed(&self) -> bool {
        self.status == "COMPLETED"
    }
}

/// Webhook envelope. `resource` depends on `event_type`.
#[derive(Debug, Clone, Deserialize)]
pub struct PayPalWebhookEvent {
    pub id: String,
    pub event_type: String,
    #[serde(default)]
    pub resource: serde_json::Value,
}

/// `PAYPAL-*` transmission headers sent with every webhook delivery
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookHeaders {
    pub auth_algo: String,
    pub cert_url: String,
    pub transmission_id: String,
    pub transmission_sig: String,
    pub transmission_time: String,
}

impl WebhookHeaders {
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let get = |name: &str| -> Option<String> {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Some(Self {
            auth_algo: get("paypal-auth-algo")?,
            cert_url: get("paypal-cert-url")?,
            transmission_id: get("paypal-transmission-id")?,
            transmission_sig: get("paypal-transmission-sig")?,
            transmission_time: get("paypal-transmission-time")?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct VerifySignatureResponse {
    verification_status: String,
}

/// Order `custom_id` is `<user_id>:<image_id>`
pub fn order_custom_id(user_id: Uuid, image_id: Uuid) -> String {
    format!("{}:{}", user_id, image_id)
}

pub fn parse_order_custom_id(custom_id: &str) -> (Option<Uuid>, Option<Uuid>) {
    match custom_id.split_once(':') {
        Some((user, image)) => (parse_uuid(user), parse_uuid(image)),
        None => (None, parse_uuid(custom_id)),
    }
}

pub fn map_subscription_status(status: &str) -> Option<SubscriptionStatus> {
    match status {
        "ACTIVE" => Some(SubscriptionStatus::Active),
        "SUSPENDED" => Some(SubscriptionStatus::PastDue),
        "CANCELLED" => Some(SubscriptionStatus::Cancelled),
        "EXPIRED" => Some(SubscriptionStatus::Expired),
        _ => None,
    }
}

#[derive(Clone)]
pub struct PayPalClient {
    config: PayPalConfig,
    http: reqwest::Client,
    token: Arc<Mutex<Option<AccessToken>>>,
}

impl PayPalClient {
    pub fn new(config: PayPalConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            token: Arc::new(Mutex::new(None)),
        }
    }

    pub fn from_env() -> Result<Self> {
        Ok(Self::new(PayPalConfig::from_env()?))
    }

    async fn access_token(&self) -> Result<String, ProviderError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref()
            && token.expires_at > Instant::now()
        {
            return Ok(token.value.clone());
        }

        let response = self
            .http
            .post(format!("{}/v1/oauth2/token", self.config.api_base))
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .body("grant_type=client_credentials")
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(PROVIDER, e))?;
        let token: TokenResponse = Self::read_json(response).await?;

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        debug!(expires_in = token.expires_in, "Fetched PayPal access token");
        *cached = Some(AccessToken {
            value: token.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ProviderError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(PROVIDER, status, &body));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| ProviderError::from_reqwest(PROVIDER, e))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ProviderError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .get(format!("{}{}", self.config.api_base, path))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(PROVIDER, e))?;
        Self::read_json(response).await
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, ProviderError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .post(format!("{}{}", self.config.api_base, path))
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(PROVIDER, e))?;
        Self::read_json(response).await
    }

    /// Create a subscription for `plan`. The buyer approves it at the returned approval link.
    pub async fn create_subscription(
        &self,
        plan: PlanSelection,
        user_id: Uuid,
        base_url: &str,
    ) -> Result<PayPalSubscription, ProviderError> {
        let plan_id = self
            .config
            .plan_id(plan)
            .ok_or(ProviderError::NotConfigured { provider: PROVIDER })?;
        let body = serde_json::json!({
            "plan_id": plan_id,
            "custom_id": user_id.to_string(),
            "application_context": {
                "user_action": "SUBSCRIBE_NOW",
                "return_url": format!("{}/billing/success?provider=paypal", base_url),
                "cancel_url": format!("{}/billing/cancel", base_url),
            }
        });

        let subscription: PayPalSubscription =
            self.post_json("/v1/billing/subscriptions", &body).await?;
        info!(subscription_id = %subscription.id, user_id = %user_id, plan = %plan.label(), "Created PayPal subscription");
        Ok(subscription)
    }

    pub async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<PayPalSubscription, ProviderError> {
        self.get_json(&format!("/v1/billing/subscriptions/{}", subscription_id))
            .await
    }

    pub async fn cancel_subscription(
        &self,
        subscription_id: &str,
        reason: &str,
    ) -> Result<(), ProviderError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .post(format!(
                "{}/v1/billing/subscriptions/{}/cancel",
                self.config.api_base, subscription_id
            ))
            .bearer_auth(token)
            .json(&serde_json::json!({ "reason": reason }))
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(PROVIDER, e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        // Cancelling twice is not an error for us
        if status == reqwest::StatusCode::UNPROCESSABLE_ENTITY
            && body.contains("SUBSCRIPTION_STATUS_INVALID")
        {
            warn!(subscription_id, "PayPal subscription was not active when cancelling");
            return Ok(());
        }
        Err(ProviderError::from_status(PROVIDER, status, &body))
    }

    /// Create a capture-intent order for one image license
    pub async fn create_order(
        &self,
        image: &Image,
        user_id: Uuid,
        base_url: &str,
    ) -> Result<PayPalOrder, ProviderError> {
        let body = serde_json::json!({
            "intent": "CAPTURE",
            "purchase_units": [{
                "reference_id": image.id.to_string(),
                "custom_id": order_custom_id(user_id, image.id),
                "description": image.title,
                "amount": Money {
                    currency_code: "USD".to_string(),
                    value: format_cents(image.price_cents as i64),
                },
            }],
            "application_context": {
                "user_action": "PAY_NOW",
                "return_url": format!("{}/billing/success?provider=paypal", base_url),
                "cancel_url": format!("{}/images/{}", base_url, image.id),
            }
        });

        let order: PayPalOrder = self.post_json("/v2/checkout/orders", &body).await?;
        info!(order_id = %order.id, image_id = %image.id, "Created PayPal order");
        Ok(order)
    }

    pub async fn get_order(&self, order_id: &str) -> Result<PayPalOrder, ProviderError> {
        self.get_json(&format!("/v2/checkout/orders/{}", order_id))
            .await
    }

    /// Capture an approved order. An order captured earlier is fetched and returned as is.
    pub async fn capture_order(&self, order_id: &str) -> Result<PayPalOrder, ProviderError> {
        let path = format!("/v2/checkout/orders/{}/capture", order_id);
        match self.post_json(&path, &serde_json::json!({})).await {
            Ok(order) => Ok(order),
            Err(ProviderError::Rejected {
                status: 422,
                message,
                ..
            }) if message.contains("ORDER_ALREADY_CAPTURED") => {
                info!(order_id, "PayPal order already captured");
                self.get_order(order_id).await
            }
            Err(e) => Err(e),
        }
    }

    /// Ask PayPal whether a webhook delivery is authentic.
    ///
    /// The raw body is embedded verbatim; re-serialising it would change the signed bytes.
    pub async fn verify_webhook_signature(
        &self,
        headers: &WebhookHeaders,
        raw_body: &str,
    ) -> Result<bool, ProviderError> {
        let quote = |s: &str| serde_json::Value::String(s.to_string()).to_string();
        let body = format!(
            r#"{{"auth_algo":{},"cert_url":{},"transmission_id":{},"transmission_sig":{},"transmission_time":{},"webhook_id":{},"webhook_event":{}}}"#,
            quote(&headers.auth_algo),
            quote(&headers.cert_url),
            quote(&headers.transmission_id),
            quote(&headers.transmission_sig),
            quote(&headers.transmission_time),
            quote(&self.config.webhook_id),
            raw_body,
        );

        let token = self.access_token().await?;
        let response = self
            .http
            .post(format!(
                "{}/v1/notifications/verify-webhook-signature",
                self.config.api_base
            ))
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(PROVIDER, e))?;
        let result: VerifySignatureResponse = Self::read_json(response).await?;
        Ok(result.verification_status == "SUCCESS")
    }

    /// Activation event for a subscription the buyer approved
    pub fn subscription_event(&self, subscription: &PayPalSubscription) -> PaymentEvent {
        PaymentEvent::PayPal(PayPalEvent::SubscriptionActivated {
            subscription_id: subscription.id.clone(),
            plan: subscription
                .plan_id
                .as_deref()
                .and_then(|id| self.config.plan_for_id(id)),
            user: UserRef::from_provider(subscription.custom_id.as_deref().and_then(parse_uuid)),
        })
    }

    /// Map a verified webhook. None for event types we do not act on.
    pub fn webhook_event(&self, event: &PayPalWebhookEvent) -> Option<PaymentEvent> {
        match event.event_type.as_str() {
            "BILLING.SUBSCRIPTION.ACTIVATED" => {
                let subscription: PayPalSubscription =
                    serde_json::from_value(event.resource.clone()).ok()?;
                Some(self.subscription_event(&subscription))
            }
            "BILLING.SUBSCRIPTION.CANCELLED"
            | "BILLING.SUBSCRIPTION.SUSPENDED"
            | "BILLING.SUBSCRIPTION.EXPIRED" => {
                let subscription: PayPalSubscription =
                    serde_json::from_value(event.resource.clone()).ok()?;
                Some(PaymentEvent::PayPal(PayPalEvent::SubscriptionStatusChanged {
                    status: map_subscription_status(&subscription.status)?,
                    subscription_id: subscription.id,
                }))
            }
            "PAYMENT.CAPTURE.COMPLETED" => capture_webhook_event(&event.resource),
            _ => None,
        }
    }
}

/// Purchase completion for a captured order. Fails if the order carries no usable amount.
pub fn order_event(order: &PayPalOrder) -> Result<PaymentEvent, ProviderError> {
    let invalid = |message: String| ProviderError::InvalidResponse {
        provider: PROVIDER,
        message,
    };
    let unit = order
        .purchase_units
        .first()
        .ok_or_else(|| invalid(format!("Order {} has no purchase units", order.id)))?;
    let capture = unit
        .payments
        .as_ref()
        .and_then(|p| p.captures.first());
    let amount = capture
        .and_then(|c| c.amount.as_ref())
        .or(unit.amount.as_ref())
        .ok_or_else(|| invalid(format!("Order {} has no amount", order.id)))?;
    let custom_id = unit
        .custom_id
        .as_deref()
        .or(capture.and_then(|c| c.custom_id.as_deref()))
        .unwrap_or_default();
    let (user_id, image_id) = parse_order_custom_id(custom_id);

    Ok(PaymentEvent::PayPal(PayPalEvent::OrderCompleted {
        order_id: order.id.clone(),
        image_id,
        amount_cents: parse_cents(&amount.value).map_err(|e| invalid(e.to_string()))?,
        currency: amount.currency_code.to_ascii_lowercase(),
        user: UserRef::from_provider(user_id),
    }))
}

/// `PAYMENT.CAPTURE.COMPLETED` carries a capture; the purchase is keyed by its order id
fn capture_webhook_event(resource: &serde_json::Value) -> Option<PaymentEvent> {
    let order_id = resource
        .pointer("/supplementary_data/related_ids/order_id")
        .and_then(|v| v.as_str())?;
    let amount: Money = serde_json::from_value(resource.get("amount")?.clone()).ok()?;
    let custom_id = resource
        .get("custom_id")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    let (user_id, image_id) = parse_order_custom_id(custom_id);

    Some(PaymentEvent::PayPal(PayPalEvent::OrderCompleted {
        order_id: order_id.to_string(),
        image_id,
        amount_cents: parse_cents(&amount.value).ok()?,
        currency: amount.currency_code.to_ascii_lowercase(),
        user: UserRef::from_provider(user_id),
    }))
}
