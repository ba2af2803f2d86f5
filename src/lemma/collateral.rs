//! Un-deployed and deployed collateral of the position manager.

use crate::error::{LemmaError, LemmaResult};
use crate::ledger::{Address, PerpLedger};
use crate::utils::decimal::truncate_to_decimals;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// Settlement token held by the manager versus deposited in the vault.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CollateralBalances {
    pub undeployed: Decimal,
    pub deployed: Decimal,
}

/// View over the manager's settlement token and vault balances.
pub struct CollateralLedger {
    account: Address,
    ledger: Arc<dyn PerpLedger>,
}

impl CollateralLedger {
    pub fn new(account: Address, ledger: Arc<dyn PerpLedger>) -> Self {
        Self { account, ledger }
    }

    pub fn account(&self) -> Address {
        self.account
    }

    /// Truncate to the settlement token's native precision.
    pub fn normalize(&self, amount: Decimal) -> Decimal {
        truncate_to_decimals(amount, self.ledger.collateral_decimals())
    }

    /// Accept settlement token from any account.
    pub async fn receive(&self, from: &Address, amount: Decimal) -> LemmaResult<()> {
        if amount <= Decimal::ZERO {
            return Err(LemmaError::InvalidAmount(format!(
                "transfer amount must be positive, got {amount}"
            )));
        }
        self.ledger.transfer(from, &self.account, amount).await?;
        debug!(%from, %amount, "Collateral received");
        Ok(())
    }

    pub async fn undeployed(&self) -> LemmaResult<Decimal> {
        Ok(self.ledger.balance_of(&self.account).await?)
    }

    pub async fn deployed(&self) -> LemmaResult<Decimal> {
        Ok(self.ledger.get_balance(&self.account).await?)
    }

    pub async fn balances(&self) -> LemmaResult<CollateralBalances> {
        Ok(CollateralBalances {
            undeployed: self.undeployed().await?,
            deployed: self.deployed().await?,
        })
    }

    /// Move `amount` from the manager into the vault.
    pub(crate) async fn deploy(&self, amount: Decimal) -> LemmaResult<()> {
        let available = self.undeployed().await?;
        if available < amount {
            return Err(LemmaError::InsufficientCollateral(format!(
                "{available} un-deployed, {amount} required"
            )));
        }
        let token = self.ledger.settlement_token();
        self.ledger.deposit(&self.account, &token, amount).await?;
        debug!(%amount, "Collateral deployed to vault");
        Ok(())
    }

    /// Move `amount` from the vault back to the manager.
    pub(crate) async fn reclaim(&self, amount: Decimal) -> LemmaResult<()> {
        let token = self.ledger.settlement_token();
        self.ledger.withdraw(&self.account, &token, amount).await?;
        debug!(%amount, "Collateral reclaimed from vault");
        Ok(())
    }

    /// Send un-deployed collateral to another account.
    pub(crate) async fn send(&self, to: &Address, amount: Decimal) -> LemmaResult<()> {
        self.ledger.transfer(&self.account, to, amount).await?;
        debug!(%to, %amount, "Collateral sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{SimulatedLedger, SimulatedLedgerConfig};
    use rust_decimal_macros::dec;

    async fn setup() -> (Arc<SimulatedLedger>, CollateralLedger) {
        let ledger = Arc::new(SimulatedLedger::new(SimulatedLedgerConfig::default()));
        let collateral = CollateralLedger::new(Address::from_label("perp_lemma"), ledger.clone());
        (ledger, collateral)
    }

    #[tokio::test]
    async fn test_receive_from_any_account() {
        let (ledger, collateral) = setup().await;
        let anyone = Address::from_label("anyone");
        ledger.mint(&anyone, dec!(10)).await;

        collateral.receive(&anyone, dec!(4)).await.unwrap();

        assert_eq!(collateral.undeployed().await.unwrap(), dec!(4));
        assert_eq!(ledger.balance_of(&anyone).await.unwrap(), dec!(6));
    }

    #[tokio::test]
    async fn test_failed_transfer_fails_receive() {
        let (_ledger, collateral) = setup().await;
        let broke = Address::from_label("broke");

        let err = collateral.receive(&broke, dec!(1)).await.unwrap_err();
        assert!(matches!(err, LemmaError::InsufficientCollateral(_)));
        assert_eq!(collateral.undeployed().await.unwrap(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_deploy_requires_undeployed_balance() {
        let (ledger, collateral) = setup().await;
        let issuer = Address::from_label("usd_lemma");
        ledger.mint(&issuer, dec!(50)).await;
        collateral.receive(&issuer, dec!(50)).await.unwrap();

        let err = collateral.deploy(dec!(100)).await.unwrap_err();
        assert!(matches!(err, LemmaError::InsufficientCollateral(_)));
    }

    #[tokio::test]
    async fn test_deploy_and_reclaim() {
        let (ledger, collateral) = setup().await;
        let issuer = Address::from_label("usd_lemma");
        ledger.mint(&issuer, dec!(50)).await;
        collateral.receive(&issuer, dec!(50)).await.unwrap();
        let vault = ledger.vault_address();
        ledger
            .approve(&collateral.account(), &vault, Decimal::MAX)
            .await
            .unwrap();

        collateral.deploy(dec!(30)).await.unwrap();
        assert_eq!(
            collateral.balances().await.unwrap(),
            CollateralBalances {
                undeployed: dec!(20),
                deployed: dec!(30),
            }
        );

        collateral.reclaim(dec!(10)).await.unwrap();
        assert_eq!(collateral.undeployed().await.unwrap(), dec!(30));
        assert_eq!(collateral.deployed().await.unwrap(), dec!(20));
    }

    #[tokio::test]
    async fn test_normalize_truncates_to_token_precision() {
        let (_ledger, collateral) = setup().await;
        assert_eq!(collateral.normalize(dec!(1.0000019)), dec!(1.000001));
    }
}
