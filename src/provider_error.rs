use axum::http::StatusCode;
use thiserror::Error;

use crate::subscriptions::PaymentProvider;

/// Failure talking to a payment provider's API
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider} is not configured")]
    NotConfigured { provider: PaymentProvider },

    /// The provider answered with a 4xx: the id or request we sent is wrong
    #[error("{provider} rejected the request ({status}): {message}")]
    Rejected {
        provider: PaymentProvider,
        status: u16,
        message: String,
    },

    #[error("{provider} request failed: {message}")]
    Unavailable {
        provider: PaymentProvider,
        message: String,
    },

    #[error("unexpected {provider} response: {message}")]
    InvalidResponse {
        provider: PaymentProvider,
        message: String,
    },
}

impl ProviderError {
    pub fn provider(&self) -> PaymentProvider {
        match self {
            ProviderError::NotConfigured { provider }
            | ProviderError::Rejected { provider, .. }
            | ProviderError::Unavailable { provider, .. }
            | ProviderError::InvalidResponse { provider, .. } => *provider,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ProviderError::NotConfigured { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ProviderError::Rejected { .. } => StatusCode::BAD_REQUEST,
            ProviderError::Unavailable { .. } | ProviderError::InvalidResponse { .. } => {
                StatusCode::BAD_GATEWAY
            }
        }
    }

    pub fn from_reqwest(provider: PaymentProvider, error: reqwest::Error) -> Self {
        if error.is_decode() {
            return ProviderError::InvalidResponse {
                provider,
                message: error.to_string(),
            };
        }
        match error.status() {
            Some(status) if status.is_client_error() => ProviderError::Rejected {
                provider,
                status: status.as_u16(),
                message: error.to_string(),
            },
            _ => ProviderError::Unavailable {
                provider,
                message: error.to_string(),
            },
        }
    }

    /// Build from a non-success HTTP response body
    pub fn from_status(provider: PaymentProvider, status: reqwest::StatusCode, body: &str) -> Self {
        let message = if body.is_empty() {
            status.to_string()
        } else {
            body.chars().take(500).collect()
        };
        if status.is_client_error() {
            ProviderError::Rejected {
                provider,
                status: status.as_u16(),
                message,
            }
        } else {
            ProviderError::Unavailable { provider, message }
        }
    }
}

impl From<stripe::StripeError> for ProviderError {
    fn from(error: stripe::StripeError) -> Self {
        let provider = PaymentProvider::Stripe;
        match error {
            stripe::StripeError::Stripe(request_error) if request_error.http_status < 500 => {
                ProviderError::Rejected {
                    provider,
                    status: request_error.http_status,
                    message: request_error
                        .message
                        .unwrap_or_else(|| "request rejected".to_string()),
                }
            }
            stripe::StripeError::JSONSerialize(e) => ProviderError::InvalidResponse {
                provider,
                message: e.to_string(),
            },
            other => ProviderError::Unavailable {
                provider,
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let not_configured = ProviderError::NotConfigured {
            provider: PaymentProvider::Crypto,
        };
        assert_eq!(not_configured.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(not_configured.to_string(), "crypto is not configured");

        let rejected = ProviderError::from_status(
            PaymentProvider::PayPal,
            reqwest::StatusCode::NOT_FOUND,
            "{\"name\":\"RESOURCE_NOT_FOUND\"}",
        );
        assert_eq!(rejected.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(rejected.provider(), PaymentProvider::PayPal);

        let down = ProviderError::from_status(
            PaymentProvider::PayPal,
            reqwest::StatusCode::SERVICE_UNAVAILABLE,
            "",
        );
        assert_eq!(down.status_code(), StatusCode::BAD_GATEWAY);
    }
}
