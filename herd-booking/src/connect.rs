use std::collections::HashMap;
use serde::Serialize;
use uuid::Uuid;
use tracing::info;
use herd_core::payment::ConnectedAccountRequest;
use crate::error::BookingResult;
use crate::orchestrator::BookingOrchestrator;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConnectOutcome {
    pub account_id: String,
    pub onboarding_url: String,
    pub charges_enabled: bool,
    pub payouts_enabled: bool,
}

impl BookingOrchestrator {
    /// Create or reuse the host's connected account and hand back an onboarding link
    pub async fn connect_host_account(&self, host_id: Uuid, email: Option<String>) -> BookingResult<ConnectOutcome> {
        let account = match self.catalog.host_payout_account(host_id).await? {
            Some(existing) => self.gateway.retrieve_connected_account(&existing).await?,
            None => {
                let mut metadata = HashMap::new();
                metadata.insert("host_id".to_string(), host_id.to_string());
                let created = self
                    .gateway
                    .create_connected_account(&ConnectedAccountRequest {
                        email,
                        country: "US".to_string(),
                        metadata,
                    })
                    .await?;
                self.catalog.set_host_payout_account(host_id, &created.id).await?;
                info!(host_id = %host_id, account = %created.id, "Connected account created");
                created
            }
        };

        let app_url = self.rules.app_url.trim_end_matches('/');
        let onboarding_url = self
            .gateway
            .create_account_link(
                &account.id,
                &format!("{}/host/payouts?refresh=1", app_url),
                &format!("{}/host/payouts?onboarded=1", app_url),
            )
            .await?;

        Ok(ConnectOutcome {
            account_id: account.id,
            onboarding_url,
            charges_enabled: account.charges_enabled,
            payouts_enabled: account.payouts_enabled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BookingError;
    use crate::mock::{fixture, GatewayCall};

    #[tokio::test]
    async fn test_first_connect_creates_and_stores_account() {
        let fx = fixture();
        let host = Uuid::new_v4();

        let first = fx.orchestrator.connect_host_account(host, Some("host@example.com".to_string())).await.unwrap();
        assert!(first.onboarding_url.contains(&first.account_id));
        assert_eq!(fx.store.payout_account(host), Some(first.account_id.clone()));

        let second = fx.orchestrator.connect_host_account(host, None).await.unwrap();
        assert_eq!(second.account_id, first.account_id);
        assert_eq!(fx.gateway.count(GatewayCall::CreateAccount).await, 1);
        assert_eq!(fx.gateway.count(GatewayCall::RetrieveAccount).await, 1);
        assert_eq!(fx.gateway.count(GatewayCall::AccountLink).await, 2);
    }

    #[tokio::test]
    async fn test_gateway_failure_stores_nothing() {
        let fx = fixture();
        let host = Uuid::new_v4();
        fx.gateway.fail_next(GatewayCall::CreateAccount).await;

        let err = fx.orchestrator.connect_host_account(host, None).await.unwrap_err();
        assert!(matches!(err, BookingError::Gateway(_)));
        assert_eq!(fx.store.payout_account(host), None);
    }
}
