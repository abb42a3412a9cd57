//! Common helpers for router-level integration tests
//!
//! `TestApp` builds the real axum router over an in-memory billing store, so
//! handlers, extractors and the webhook ledger run exactly as in production
//! without PostgreSQL.
//!
//! # Usage
//!
//! ```no_run
//! use common::TestApp;
//!
//! #[tokio::test]
//! async fn my_test() {
//!     let app = TestApp::new();
//!     let (status, body) = app.get("/api/purchases", Some(user_id)).await;
//! }
//! ```

#![allow(dead_code)]

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use hmac::{Hmac, Mac};
use http_body_util::BodyExt;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

use gallery_billing::auth::JwtService;
use gallery_billing::coinbase_client::{CoinbaseClient, CoinbaseConfig, SIGNATURE_HEADER};
use gallery_billing::memory_store::MemoryBillingStore;
use gallery_billing::paypal_client::{PayPalClient, PayPalConfig};
use gallery_billing::plans::PlanCatalog;
use gallery_billing::stripe_client::StripeConfig;
use gallery_billing::web::{AppState, build_router};

pub const JWT_SECRET: &str = "integration-test-secret";
pub const COINBASE_WEBHOOK_SECRET: &str = "coinbase-webhook-secret";
pub const STRIPE_WEBHOOK_SECRET: &str = "whsec_integration";
/// Nothing listens here, so any outbound provider call fails fast
const DEAD_API_BASE: &str = "http://127.0.0.1:9";

pub struct TestApp {
    pub router: Router,
    pub store: Arc<MemoryBillingStore>,
    jwt: Arc<JwtService>,
}

impl TestApp {
    /// Router with Coinbase Commerce configured and Stripe/PayPal disabled
    pub fn new() -> Self {
        Self::build(None, None)
    }

    /// Router with every provider configured against an unreachable API
    pub fn with_all_providers() -> Self {
        let stripe = StripeConfig {
            client: stripe::Client::new("sk_test_integration"),
            webhook_secret: STRIPE_WEBHOOK_SECRET.to_string(),
            price_ids: HashMap::new(),
        };
        let paypal = PayPalClient::new(PayPalConfig {
            client_id: "paypal-client".to_string(),
            client_secret: "paypal-secret".to_string(),
            webhook_id: "WH-INTEGRATION".to_string(),
            api_base: DEAD_API_BASE.to_string(),
            plan_ids: HashMap::new(),
        });
        Self::build(Some(stripe), Some(paypal))
    }

    fn build(stripe: Option<StripeConfig>, paypal: Option<PayPalClient>) -> Self {
        let store = Arc::new(MemoryBillingStore::new());
        let jwt = Arc::new(JwtService::new(JWT_SECRET));

        let coinbase = CoinbaseClient::new(CoinbaseConfig {
            api_key: "test-api-key".to_string(),
            webhook_secret: COINBASE_WEBHOOK_SECRET.to_string(),
            api_base: DEAD_API_BASE.to_string(),
        });

        let state = AppState {
            store: store.clone(),
            jwt: jwt.clone(),
            stripe,
            paypal,
            coinbase: Some(coinbase),
            plans: PlanCatalog::default(),
            base_url: "http://localhost:5173".to_string(),
        };

        Self {
            router: build_router(state),
            store,
            jwt,
        }
    }

    pub fn token_for(&self, user_id: Uuid) -> String {
        self.jwt
            .generate_token(user_id, None)
            .expect("Failed to generate test token")
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Router failed");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to read body")
            .to_bytes();
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, body)
    }

    pub async fn get(&self, path: &str, user_id: Option<Uuid>) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method("GET").uri(path);
        if let Some(user_id) = user_id {
            builder = builder.header(
                header::AUTHORIZATION,
                format!("Bearer {}", self.token_for(user_id)),
            );
        }
        self.send(builder.body(Body::empty()).unwrap()).await
    }

    pub async fn post_json(
        &self,
        path: &str,
        user_id: Option<Uuid>,
        body: serde_json::Value,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder()
            .method("POST")
            .uri(path)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(user_id) = user_id {
            builder = builder.header(
                header::AUTHORIZATION,
                format!("Bearer {}", self.token_for(user_id)),
            );
        }
        self.send(builder.body(Body::from(body.to_string())).unwrap())
            .await
    }

    /// POST a raw body with extra headers, as providers deliver webhooks
    pub async fn post_raw(
        &self,
        path: &str,
        headers: &[(&str, &str)],
        body: &str,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder()
            .method("POST")
            .uri(path)
            .header(header::CONTENT_TYPE, "application/json");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        self.send(builder.body(Body::from(body.to_string())).unwrap())
            .await
    }

    /// Deliver a Coinbase webhook body with the given signature header (None omits it)
    pub async fn coinbase_webhook(
        &self,
        body: &str,
        signature: Option<String>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/crypto/webhook")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(signature) = signature {
            builder = builder.header(SIGNATURE_HEADER, signature);
        }
        self.send(builder.body(Body::from(body.to_string())).unwrap())
            .await
    }
}

/// Hex HMAC-SHA256 the way Coinbase Commerce signs deliveries
pub fn sign_coinbase(body: &str, secret: &str) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// A Coinbase webhook delivery for a charge with the given metadata
pub fn coinbase_delivery(
    event_id: &str,
    event_type: &str,
    charge_id: &str,
    metadata: serde_json::Value,
    amount: &str,
    last_status: &str,
) -> String {
    serde_json::json!({
        "id": 1,
        "scheduled_for": "2024-05-01T12:00:00Z",
        "event": {
            "id": event_id,
            "type": event_type,
            "api_version": "2018-03-22",
            "created_at": "2024-05-01T12:00:00Z",
            "data": {
                "id": charge_id,
                "code": "ABCD1234",
                "hosted_url": format!("https://commerce.coinbase.com/charges/{}", charge_id),
                "metadata": metadata,
                "pricing": {
                    "local": { "amount": amount, "currency": "USD" }
                },
                "timeline": [
                    { "time": "2024-05-01T11:50:00Z", "status": "NEW" },
                    { "time": "2024-05-01T12:00:00Z", "status": last_status }
                ]
            }
        }
    })
    .to_string()
}
