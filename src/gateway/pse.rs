//! PSE bank-redirect provider.
//!
//! The shopper is redirected to their bank to approve the debit, so a
//! fresh charge normally comes back `PENDING` with a redirect URL and
//! the final outcome arrives through the webhook.

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

const SIGNATURE_HEADER: &str = "x-event-signature";
const ALLOWED_EVENTS: &[&str] = &["transaction.updated"];

pub struct PseGateway {
    id: String,
    client: reqwest::Client,
    base_url: String,
    secret_key: String,
    webhook_secret: String,
    currencies: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PseTransaction {
    transaction_id: String,
    status: String,
    #[serde(default)]
    status_message: Option<String>,
    #[serde(default)]
    bank_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PseBankList {
    banks: Vec<Bank>,
}

impl PseGateway {
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
        match status.to_ascii_uppercase().as_str() {
            "CREATED" | "PENDING" => Ok(PaymentState::Pending),
            "IN_PROGRESS" | "PROCESSING" => Ok(PaymentState::Processing),
            "APPROVED" | "OK" => Ok(PaymentState::Approved),
            "DECLINED" | "REJECTED" | "NOT_AUTHORIZED" => Ok(PaymentState::Rejected),
            "FAILED" | "ERROR" => Ok(PaymentState::Failed),
            "CANCELLED" | "EXPIRED" => Ok(PaymentState::Cancelled),
            "REFUNDED" => Ok(PaymentState::Refunded),
            other => Err(GatewayError::InvalidResponse(format!(
                "unknown PSE transaction status '{}'",
                other
            ))),
        }
    }

    fn outcome_from(&self, tx: PseTransaction, raw: serde_json::Value) -> Result<ChargeOutcome, GatewayError> {
        Ok(ChargeOutcome {
            state: Self::normalize_status(&tx.status)?,
            transaction_id: tx.transaction_id,
            status_message: tx.status_message,
            redirect_url: tx.bank_url,
            raw,
        })
    }

    async fn request_transaction(
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
                .unwrap_or("PSE request rejected");
            return Err(GatewayError::Declined(message.to_string()));
        }

        let tx: PseTransaction = serde_json::from_value(raw.clone())
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
        self.outcome_from(tx, raw)
    }
}

#[async_trait]
impl PaymentGateway for PseGateway {
    fn info(&self) -> GatewayInfo {
        GatewayInfo {
            id: self.id.clone(),
            display_name: "PSE bank redirect".to_string(),
            supports_refunds: true,
            currencies: self.currencies.clone(),
        }
    }

    async fn process_card_payment(
        &self,
        _request: &CardChargeRequest,
    ) -> Result<ChargeOutcome, GatewayError> {
        Err(GatewayError::Unsupported("PSE"))
    }

    #[instrument(skip(self, request), fields(reference = %request.reference))]
    async fn process_pse_payment(
        &self,
        request: &PseChargeRequest,
    ) -> Result<ChargeOutcome, GatewayError> {
        let body = json!({
            "reference": request.reference,
            "amount": request.amount,
            "currency": request.currency,
            "bank_code": request.bank_code,
            "user_type": request.user_type,
            "user_legal_id": request.user_legal_id,
            "customer_email": request.customer_email,
            "redirect_url": request.redirect_url,
        });
        self.request_transaction(reqwest::Method::POST, "/v1/pse/transactions", Some(body))
            .await
    }

    async fn verify_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<ChargeOutcome, GatewayError> {
        self.request_transaction(
            reqwest::Method::GET,
            &format!("/v1/pse/transactions/{}", transaction_id),
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
        self.request_transaction(
            reqwest::Method::POST,
            &format!("/v1/pse/transactions/{}/refund", transaction_id),
            Some(body),
        )
        .await
    }

    async fn banks(&self) -> Result<Vec<Bank>, GatewayError> {
        let url = format!("{}/v1/pse/banks", self.base_url);
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.secret_key)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(GatewayError::InvalidResponse(format!(
                "bank list request returned {}",
                response.status()
            )));
        }
        let list: PseBankList = response.json().await?;
        Ok(list.banks)
    }

    async fn test_connection(&self) -> Result<(), GatewayError> {
        self.banks().await.map(|_| ())
    }

    fn verify_webhook_signature(&self, headers: &HeaderMap, payload: &[u8]) -> bool {
        let Some(signature) = headers
            .get(SIGNATURE_HEADER)
            .and_then(|h| h.to_str().ok())
        else {
            warn!(gateway_id = %self.id, "webhook missing signature header");
            return false;
        };
        let expected = hmac_sha256_hex(&self.webhook_secret, payload);
        constant_time_eq(&expected, signature)
    }

    fn allowed_webhook_events(&self) -> &'static [&'static str] {
        ALLOWED_EVENTS
    }

    fn parse_webhook(&self, payload: &[u8]) -> Result<WebhookEvent, GatewayError> {
        let raw: serde_json::Value = serde_json::from_slice(payload)
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
        let event_type = raw
            .get("event")
            .and_then(|v| v.as_str())
            .ok_or_else(|| GatewayError::InvalidResponse("missing event field".into()))?
            .to_string();
        let tx = raw
            .get("data")
            .and_then(|d| d.get("transaction"))
            .ok_or_else(|| GatewayError::InvalidResponse("missing data.transaction".into()))?;
        let transaction_id = tx
            .get("transaction_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| GatewayError::InvalidResponse("missing transaction_id".into()))?
            .to_string();
        let status = tx
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

    fn gateway() -> PseGateway {
        let settings = GatewaySettings {
            id: "pse-main".into(),
            kind: "pse".into(),
            enabled: true,
            base_url: "https://pse.test".into(),
            public_key: "pub".into(),
            secret_key: "sec".into(),
            webhook_secret: "whsec".into(),
            currencies: vec!["COP".into()],
            min_amount: None,
            max_amount: None,
        };
        PseGateway::from_settings(&settings, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn status_normalization_table() {
        assert_eq!(
            PseGateway::normalize_status("PENDING").unwrap(),
            PaymentState::Pending
        );
        assert_eq!(
            PseGateway::normalize_status("approved").unwrap(),
            PaymentState::Approved
        );
        assert_eq!(
            PseGateway::normalize_status("DECLINED").unwrap(),
            PaymentState::Rejected
        );
        assert_eq!(
            PseGateway::normalize_status("ERROR").unwrap(),
            PaymentState::Failed
        );
        assert_eq!(
            PseGateway::normalize_status("EXPIRED").unwrap(),
            PaymentState::Cancelled
        );
        assert!(PseGateway::normalize_status("WAT").is_err());
    }

    #[test]
    fn webhook_signature_accepts_valid_hmac() {
        let gw = gateway();
        let payload = br#"{"event":"transaction.updated"}"#;
        let mut headers = HeaderMap::new();
        headers.insert(
            SIGNATURE_HEADER,
            hmac_sha256_hex("whsec", payload).parse().unwrap(),
        );
        assert!(gw.verify_webhook_signature(&headers, payload));
    }

    #[test]
    fn webhook_signature_rejects_bad_hmac_and_missing_header() {
        let gw = gateway();
        let payload = br#"{"event":"transaction.updated"}"#;

        let mut headers = HeaderMap::new();
        headers.insert(SIGNATURE_HEADER, "deadbeef".parse().unwrap());
        assert!(!gw.verify_webhook_signature(&headers, payload));

        assert!(!gw.verify_webhook_signature(&HeaderMap::new(), payload));
    }

    #[test]
    fn parse_webhook_extracts_transaction_and_state() {
        let gw = gateway();
        let payload = br#"{
            "event": "transaction.updated",
            "data": { "transaction": { "transaction_id": "pse-123", "status": "APPROVED" } }
        }"#;
        let event = gw.parse_webhook(payload).unwrap();
        assert_eq!(event.event_type, "transaction.updated");
        assert_eq!(event.transaction_id, "pse-123");
        assert_eq!(event.state, PaymentState::Approved);
    }

    #[test]
    fn parse_webhook_rejects_malformed_payload() {
        let gw = gateway();
        assert!(gw.parse_webhook(b"not json").is_err());
        assert!(gw.parse_webhook(br#"{"event":"x"}"#).is_err());
    }
}
