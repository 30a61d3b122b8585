//! Card tokenization provider.
//!
//! Cards are tokenized in the shopper's browser by the provider SDK;
//! this side only ever handles the single-use token. Charges settle
//! synchronously in most cases, with the webhook as the source of
//! truth for anything that comes back `pending`.

use async_trait::async_trait;
use http::HeaderMap;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{instrument, warn};

use super::{
    constant_time_eq, hmac_sha256_hex, validate_credentials, Bank, CardChargeRequest,
    ChargeOutcome, GatewayError, GatewayInfo, PaymentGateway, PseChargeRequest, WebhookEvent,
};
use crate::config::GatewaySettings;
use crate::entities::payment::PaymentState;

const SIGNATURE_HEADER: &str = "x-signature";
const TIMESTAMP_HEADER: &str = "x-timestamp";
const ALLOWED_EVENTS: &[&str] = &[
    "charge.pending",
    "charge.succeeded",
    "charge.failed",
    "charge.refunded",
];

pub struct CardGateway {
    id: String,
    client: reqwest::Client,
    base_url: String,
    secret_key: String,
    webhook_secret: String,
    currencies: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Charge {
    id: String,
    status: String,
    #[serde(default)]
    failure_message: Option<String>,
}

impl CardGateway {
    pub fn from_settings(
        settings: &GatewaySettings,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        validate_credentials(settings)?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Http(e.to_string()))?;
        Ok(Self {
            id: settings.id.clone(),
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            secret_key: settings.secret_key.clone(),
            webhook_secret: settings.webhook_secret.clone(),
            currencies: settings.currencies.clone(),
        })
    }

    /// Maps the provider's status vocabulary onto the shared enum.
    pub fn normalize_status(status: &str) -> Result<PaymentState, GatewayError> {
        match status.to_ascii_lowercase().as_str() {
            "pending" => Ok(PaymentState::Pending),
            "processing" | "authorized" => Ok(PaymentState::Processing),
            "succeeded" | "approved" | "captured" => Ok(PaymentState::Approved),
            "declined" => Ok(PaymentState::Rejected),
            "failed" | "error" => Ok(PaymentState::Failed),
            "voided" | "cancelled" => Ok(PaymentState::Cancelled),
            "refunded" => Ok(PaymentState::Refunded),
            other => Err(GatewayError::InvalidResponse(format!(
                "unknown card charge status '{}'",
                other
            ))),
        }
    }

    async fn request_charge(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<ChargeOutcome, GatewayError> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self
            .client
            .request(method, url)
            .bearer_auth(&self.secret_key);
        if let Some(body) = body {
            req = req.json(&body);
        }

        let response = req.send().await?;
        let status = response.status();
        let raw: serde_json::Value = response.json().await?;

        if !status.is_success() {
            let message = raw
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("card charge rejected");
            return Err(GatewayError::Declined(message.to_string()));
        }

        let charge: Charge = serde_json::from_value(raw.clone())
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
        Ok(ChargeOutcome {
            state: Self::normalize_status(&charge.status)?,
            transaction_id: charge.id,
            status_message: charge.failure_message,
            redirect_url: None,
            raw,
        })
    }
}

#[async_trait]
impl PaymentGateway for CardGateway {
    fn info(&self) -> GatewayInfo {
        GatewayInfo {
            id: self.id.clone(),
            display_name: "Tokenized cards".to_string(),
            supports_refunds: true,
            currencies: self.currencies.clone(),
        }
    }

    #[instrument(skip(self, request), fields(reference = %request.reference))]
    async fn process_card_payment(
        &self,
        request: &CardChargeRequest,
    ) -> Result<ChargeOutcome, GatewayError> {
        let body = json!({
            "reference": request.reference,
            "amount": request.amount,
            "currency": request.currency,
            "source": request.card_token,
            "installments": request.installments,
            "customer_email": request.customer_email,
        });
        self.request_charge(reqwest::Method::POST, "/v1/charges", Some(body))
            .await
    }

    async fn process_pse_payment(
        &self,
        _request: &PseChargeRequest,
    ) -> Result<ChargeOutcome, GatewayError> {
        Err(GatewayError::Unsupported("cards"))
    }

    async fn verify_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<ChargeOutcome, GatewayError> {
        self.request_charge(
            reqwest::Method::GET,
            &format!("/v1/charges/{}", transaction_id),
            None,
        )
        .await
    }

    async fn refund_transaction(
        &self,
        transaction_id: &str,
        amount: Decimal,
    ) -> Result<ChargeOutcome, GatewayError> {
        let body = json!({ "amount": amount });
        self.request_charge(
            reqwest::Method::POST,
            &format!("/v1/charges/{}/refund", transaction_id),
            Some(body),
        )
        .await
    }

    async fn banks(&self) -> Result<Vec<Bank>, GatewayError> {
        Err(GatewayError::Unsupported("cards"))
    }

    async fn test_connection(&self) -> Result<(), GatewayError> {
        let url = format!("{}/v1/ping", self.base_url);
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.secret_key)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(GatewayError::InvalidResponse(format!(
                "ping returned {}",
                response.status()
            )))
        }
    }

    /// Timestamped signature: hex HMAC-SHA256 over `"{timestamp}.{body}"`.
    fn verify_webhook_signature(&self, headers: &HeaderMap, payload: &[u8]) -> bool {
        let (Some(signature), Some(timestamp)) = (
            headers.get(SIGNATURE_HEADER).and_then(|h| h.to_str().ok()),
            headers.get(TIMESTAMP_HEADER).and_then(|h| h.to_str().ok()),
        ) else {
            warn!(gateway_id = %self.id, "webhook missing signature headers");
            return false;
        };

        let mut signed = Vec::with_capacity(timestamp.len() + 1 + payload.len());
        signed.extend_from_slice(timestamp.as_bytes());
        signed.push(b'.');
        signed.extend_from_slice(payload);

        let expected = hmac_sha256_hex(&self.webhook_secret, &signed);
        constant_time_eq(&expected, signature)
    }

    fn allowed_webhook_events(&self) -> &'static [&'static str] {
        ALLOWED_EVENTS
    }

    fn parse_webhook(&self, payload: &[u8]) -> Result<WebhookEvent, GatewayError> {
        let raw: serde_json::Value = serde_json::from_slice(payload)
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
        let event_type = raw
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| GatewayError::InvalidResponse("missing type field".into()))?
            .to_string();
        let charge = raw
            .get("data")
            .and_then(|d| d.get("object"))
            .ok_or_else(|| GatewayError::InvalidResponse("missing data.object".into()))?;
        let transaction_id = charge
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| GatewayError::InvalidResponse("missing charge id".into()))?
            .to_string();
        let status = charge
            .get("status")
            .and_then(|v| v.as_str())
            .ok_or_else(|| GatewayError::InvalidResponse("missing status".into()))?;

        Ok(WebhookEvent {
            event_type,
            transaction_id,
            state: Self::normalize_status(status)?,
            raw,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> CardGateway {
        let settings = GatewaySettings {
            id: "cards-main".into(),
            kind: "cards".into(),
            enabled: true,
            base_url: "https://cards.test".into(),
            public_key: "pub".into(),
            secret_key: "sec".into(),
            webhook_secret: "whsec".into(),
            currencies: vec!["COP".into()],
            min_amount: None,
            max_amount: None,
        };
        CardGateway::from_settings(&settings, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn status_normalization_table() {
        assert_eq!(
            CardGateway::normalize_status("succeeded").unwrap(),
            PaymentState::Approved
        );
        assert_eq!(
            CardGateway::normalize_status("DECLINED").unwrap(),
            PaymentState::Rejected
        );
        assert_eq!(
            CardGateway::normalize_status("authorized").unwrap(),
            PaymentState::Processing
        );
        assert_eq!(
            CardGateway::normalize_status("voided").unwrap(),
            PaymentState::Cancelled
        );
        assert!(CardGateway::normalize_status("mystery").is_err());
    }

    #[test]
    fn timestamped_signature_round_trip() {
        let gw = gateway();
        let payload = br#"{"type":"charge.succeeded"}"#;
        let ts = "1754550000";

        let mut signed = Vec::new();
        signed.extend_from_slice(ts.as_bytes());
        signed.push(b'.');
        signed.extend_from_slice(payload);
        let sig = hmac_sha256_hex("whsec", &signed);

        let mut headers = HeaderMap::new();
        headers.insert(TIMESTAMP_HEADER, ts.parse().unwrap());
        headers.insert(SIGNATURE_HEADER, sig.parse().unwrap());
        assert!(gw.verify_webhook_signature(&headers, payload));

        // Tampered body fails
        assert!(!gw.verify_webhook_signature(&headers, br#"{"type":"charge.failed"}"#));
    }

    #[test]
    fn parse_webhook_extracts_charge() {
        let gw = gateway();
        let payload = br#"{
            "id": "evt_1",
            "type": "charge.succeeded",
            "data": { "object": { "id": "ch_123", "status": "succeeded" } }
        }"#;
        let event = gw.parse_webhook(payload).unwrap();
        assert_eq!(event.event_type, "charge.succeeded");
        assert_eq!(event.transaction_id, "ch_123");
        assert_eq!(event.state, PaymentState::Approved);
    }
}
