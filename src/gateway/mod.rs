//! Payment gateway abstraction.
//!
//! One `PaymentGateway` implementation per provider, selected by a
//! routing table built from configuration. The registry is an explicit
//! object constructed once at startup and passed by reference to the
//! orchestrator. Provider instances are built lazily and cached by
//! identity; a provider with missing credentials fails at construction
//! rather than on first use.

pub mod cards;
pub mod pse;

use async_trait::async_trait;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use http::HeaderMap;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::{AppConfig, GatewaySettings};
use crate::entities::payment::PaymentState;
use crate::entities::payment_method;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway call timed out")]
    Timeout,

    #[error("gateway request failed: {0}")]
    Http(String),

    #[error("gateway declined the request: {0}")]
    Declined(String),

    #[error("unexpected gateway response: {0}")]
    InvalidResponse(String),

    #[error("missing gateway configuration: {0}")]
    MissingConfiguration(String),

    #[error("operation not supported by the {0} gateway")]
    Unsupported(&'static str),
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Timeout
        } else {
            // reqwest errors can embed the full request URL; keep only
            // the display form, which reqwest already strips of
            // credentials
            GatewayError::Http(err.to_string())
        }
    }
}

/// Static description of a provider.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayInfo {
    pub id: String,
    pub display_name: String,
    pub supports_refunds: bool,
    pub currencies: Vec<String>,
}

/// PSE participating bank.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bank {
    pub code: String,
    pub name: String,
}

/// Card charge parameters. The card itself never transits this
/// service, only the token minted by the provider's client SDK.
#[derive(Debug, Clone)]
pub struct CardChargeRequest {
    pub reference: String,
    pub amount: Decimal,
    pub currency: String,
    pub card_token: String,
    pub installments: u32,
    pub customer_email: String,
}

/// PSE bank-redirect charge parameters.
#[derive(Debug, Clone)]
pub struct PseChargeRequest {
    pub reference: String,
    pub amount: Decimal,
    pub currency: String,
    pub bank_code: String,
    /// "0" natural person, "1" legal entity
    pub user_type: String,
    pub user_legal_id: String,
    pub customer_email: String,
    pub redirect_url: String,
}

/// Normalized result of a gateway call. `raw` keeps the provider
/// payload verbatim for the payment audit trail.
#[derive(Debug, Clone)]
pub struct ChargeOutcome {
    pub transaction_id: String,
    pub state: PaymentState,
    pub status_message: Option<String>,
    /// PSE returns the bank's redirect URL for the shopper
    pub redirect_url: Option<String>,
    pub raw: serde_json::Value,
}

/// Parsed asynchronous notification.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub event_type: String,
    pub transaction_id: String,
    pub state: PaymentState,
    pub raw: serde_json::Value,
}

/// Uniform capability set over heterogeneous provider APIs.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn info(&self) -> GatewayInfo;

    async fn process_card_payment(
        &self,
        request: &CardChargeRequest,
    ) -> Result<ChargeOutcome, GatewayError>;

    async fn process_pse_payment(
        &self,
        request: &PseChargeRequest,
    ) -> Result<ChargeOutcome, GatewayError>;

    async fn verify_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<ChargeOutcome, GatewayError>;

    async fn refund_transaction(
        &self,
        transaction_id: &str,
        amount: Decimal,
    ) -> Result<ChargeOutcome, GatewayError>;

    /// PSE only; card providers return `Unsupported`.
    async fn banks(&self) -> Result<Vec<Bank>, GatewayError>;

    async fn test_connection(&self) -> Result<(), GatewayError>;

    /// Must be checked before any webhook-driven state mutation.
    fn verify_webhook_signature(&self, headers: &HeaderMap, payload: &[u8]) -> bool;

    /// Event types this provider is allowed to deliver.
    fn allowed_webhook_events(&self) -> &'static [&'static str];

    fn parse_webhook(&self, payload: &[u8]) -> Result<WebhookEvent, GatewayError>;
}

/// Routing table + lazily-constructed provider cache.
pub struct GatewayRegistry {
    settings: HashMap<String, GatewaySettings>,
    /// payment-method routing key -> gateway id
    routing: HashMap<String, String>,
    timeout: Duration,
    instances: DashMap<String, Arc<dyn PaymentGateway>>,
}

impl GatewayRegistry {
    pub fn from_config(cfg: &AppConfig) -> Self {
        let settings = cfg
            .gateways
            .iter()
            .cloned()
            .map(|g| (g.id.clone(), g))
            .collect();
        Self {
            settings,
            routing: cfg.gateway_routing.clone(),
            timeout: Duration::from_secs(cfg.gateway_timeout_secs),
            instances: DashMap::new(),
        }
    }

    /// Resolves the provider for a payment method and amount. The
    /// method's own `gateway_id` overrides the routing table; the
    /// selected provider must be enabled and must support the amount
    /// and currency.
    pub fn resolve_for_method(
        &self,
        method: &payment_method::Model,
        amount: Decimal,
        currency: &str,
    ) -> Result<Arc<dyn PaymentGateway>, GatewayError> {
        let gateway_id = method
            .gateway_id
            .as_deref()
            .or_else(|| self.routing.get(method.kind.routing_key()).map(String::as_str))
            .ok_or_else(|| {
                GatewayError::MissingConfiguration(format!(
                    "no gateway routed for payment method kind '{}'",
                    method.kind.routing_key()
                ))
            })?;

        let settings = self.settings.get(gateway_id).ok_or_else(|| {
            GatewayError::MissingConfiguration(format!("gateway '{}' is not configured", gateway_id))
        })?;

        if !settings.enabled {
            return Err(GatewayError::MissingConfiguration(format!(
                "gateway '{}' is disabled",
                gateway_id
            )));
        }
        if !settings.currencies.iter().any(|c| c == currency) {
            return Err(GatewayError::MissingConfiguration(format!(
                "gateway '{}' does not support currency {}",
                gateway_id, currency
            )));
        }
        let amount_f64 = amount.to_f64().unwrap_or(f64::MAX);
        if settings.min_amount.map(|min| amount_f64 < min).unwrap_or(false)
            || settings.max_amount.map(|max| amount_f64 > max).unwrap_or(false)
        {
            return Err(GatewayError::MissingConfiguration(format!(
                "gateway '{}' does not accept amount {}",
                gateway_id, amount
            )));
        }

        self.get(gateway_id)
    }

    /// Returns the cached provider instance, constructing it on first
    /// use. Construction validates credentials and fails fast.
    pub fn get(&self, gateway_id: &str) -> Result<Arc<dyn PaymentGateway>, GatewayError> {
        if let Some(instance) = self.instances.get(gateway_id) {
            return Ok(instance.clone());
        }

        let settings = self.settings.get(gateway_id).ok_or_else(|| {
            GatewayError::MissingConfiguration(format!("gateway '{}' is not configured", gateway_id))
        })?;

        let instance: Arc<dyn PaymentGateway> = match settings.kind.as_str() {
            "pse" => Arc::new(pse::PseGateway::from_settings(settings, self.timeout)?),
            "cards" => Arc::new(cards::CardGateway::from_settings(settings, self.timeout)?),
            other => {
                return Err(GatewayError::MissingConfiguration(format!(
                    "unknown gateway kind '{}'",
                    other
                )))
            }
        };

        info!(gateway_id, kind = %settings.kind, "constructed payment gateway");
        self.instances
            .insert(gateway_id.to_string(), instance.clone());
        Ok(instance)
    }

    /// Resolves the default provider for a routing key (e.g. "pse")
    /// without a payment-method row; used for the bank list.
    pub fn route_for(&self, routing_key: &str) -> Result<Arc<dyn PaymentGateway>, GatewayError> {
        let gateway_id = self.routing.get(routing_key).ok_or_else(|| {
            GatewayError::MissingConfiguration(format!(
                "no gateway routed for payment method kind '{}'",
                routing_key
            ))
        })?;
        self.get(gateway_id)
    }

    pub fn configured_ids(&self) -> Vec<String> {
        self.settings.keys().cloned().collect()
    }
}

/// HMAC-SHA256 over `payload`, hex-encoded.
pub(crate) fn hmac_sha256_hex(secret: &str, payload: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut res = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        res |= x ^ y;
    }
    res == 0
}

/// Shared by provider constructors: reject empty credentials up front.
fn require_setting(settings: &GatewaySettings, field: &str, value: &str) -> Result<(), GatewayError> {
    if value.trim().is_empty() {
        return Err(GatewayError::MissingConfiguration(format!(
            "gateway '{}' is missing {}",
            settings.id, field
        )));
    }
    Ok(())
}

pub(crate) fn validate_credentials(settings: &GatewaySettings) -> Result<(), GatewayError> {
    require_setting(settings, "base_url", &settings.base_url)?;
    require_setting(settings, "secret_key", &settings.secret_key)?;
    require_setting(settings, "webhook_secret", &settings.webhook_secret)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::payment_method::PaymentMethodKind;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn settings(id: &str, kind: &str) -> GatewaySettings {
        GatewaySettings {
            id: id.into(),
            kind: kind.into(),
            enabled: true,
            base_url: "https://gateway.test".into(),
            public_key: "pub_test".into(),
            secret_key: "sec_test".into(),
            webhook_secret: "whsec_test".into(),
            currencies: vec!["COP".into()],
            min_amount: None,
            max_amount: Some(1_000_000.0),
        }
    }

    fn registry_with(gateways: Vec<GatewaySettings>, routing: &[(&str, &str)]) -> GatewayRegistry {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".into(),
            "redis://127.0.0.1:6379".into(),
            "127.0.0.1".into(),
            8080,
            "test".into(),
        );
        cfg.gateways = gateways;
        cfg.gateway_routing = routing
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        GatewayRegistry::from_config(&cfg)
    }

    fn method(kind: PaymentMethodKind, gateway_id: Option<&str>) -> payment_method::Model {
        payment_method::Model {
            id: Uuid::new_v4(),
            name: "method".into(),
            kind,
            enabled: true,
            min_amount: None,
            max_amount: None,
            currency: "COP".into(),
            gateway_id: gateway_id.map(String::from),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn resolves_via_routing_table() {
        let registry = registry_with(
            vec![settings("pse-main", "pse"), settings("cards-main", "cards")],
            &[("pse", "pse-main"), ("credit_card", "cards-main")],
        );
        let gw = registry
            .resolve_for_method(&method(PaymentMethodKind::Pse, None), dec!(100), "COP")
            .unwrap();
        assert_eq!(gw.info().id, "pse-main");
    }

    #[test]
    fn method_override_beats_routing_table() {
        let registry = registry_with(
            vec![settings("pse-main", "pse"), settings("pse-alt", "pse")],
            &[("pse", "pse-main")],
        );
        let gw = registry
            .resolve_for_method(
                &method(PaymentMethodKind::Pse, Some("pse-alt")),
                dec!(100),
                "COP",
            )
            .unwrap();
        assert_eq!(gw.info().id, "pse-alt");
    }

    #[test]
    fn unrouted_method_kind_is_a_configuration_error() {
        let registry = registry_with(vec![settings("pse-main", "pse")], &[("pse", "pse-main")]);
        let err = registry
            .resolve_for_method(&method(PaymentMethodKind::Cash, None), dec!(100), "COP")
            .err()
            .unwrap();
        assert!(matches!(err, GatewayError::MissingConfiguration(_)));
    }

    #[test]
    fn disabled_gateway_is_rejected() {
        let mut s = settings("pse-main", "pse");
        s.enabled = false;
        let registry = registry_with(vec![s], &[("pse", "pse-main")]);
        assert!(registry
            .resolve_for_method(&method(PaymentMethodKind::Pse, None), dec!(100), "COP")
            .is_err());
    }

    #[test]
    fn unsupported_currency_is_rejected() {
        let registry = registry_with(vec![settings("pse-main", "pse")], &[("pse", "pse-main")]);
        assert!(registry
            .resolve_for_method(&method(PaymentMethodKind::Pse, None), dec!(100), "USD")
            .is_err());
    }

    #[test]
    fn amount_outside_gateway_window_is_rejected() {
        let registry = registry_with(vec![settings("pse-main", "pse")], &[("pse", "pse-main")]);
        assert!(registry
            .resolve_for_method(
                &method(PaymentMethodKind::Pse, None),
                dec!(2000000),
                "COP"
            )
            .is_err());
    }

    #[test]
    fn missing_credentials_fail_at_construction() {
        let mut s = settings("pse-main", "pse");
        s.secret_key = String::new();
        let registry = registry_with(vec![s], &[("pse", "pse-main")]);
        let err = registry.get("pse-main").err().unwrap();
        assert!(matches!(err, GatewayError::MissingConfiguration(_)));
    }

    #[test]
    fn instances_are_cached_by_identity() {
        let registry = registry_with(vec![settings("pse-main", "pse")], &[("pse", "pse-main")]);
        let a = registry.get("pse-main").unwrap();
        let b = registry.get("pse-main").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn hmac_helpers_round_trip() {
        let sig = hmac_sha256_hex("secret", b"payload");
        assert_eq!(sig, hmac_sha256_hex("secret", b"payload"));
        assert!(constant_time_eq(&sig, &sig.clone()));
        assert!(!constant_time_eq(&sig, &hmac_sha256_hex("other", b"payload")));
    }
}
