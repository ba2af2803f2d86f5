//! Owner-gated settings and role checks.

use crate::error::{LemmaError, LemmaResult, Role};
use crate::ledger::{Address, ReferrerCode};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::info;

/// Mutable configuration of the position manager.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LemmaSettings {
    pub owner: Address,
    pub usd_issuer: Address,
    pub rebalancer: Option<Address>,
    pub referrer_code: ReferrerCode,
    /// Cap on the position's open notional, in quote units (not base size).
    ///
    /// An open is refused when `|open notional| + new notional` would exceed
    /// it. `Decimal::MAX` means unbounded.
    pub max_position: Decimal,
}

impl LemmaSettings {
    /// Settings with only the owner and USD issuer assigned.
    pub fn new(owner: Address, usd_issuer: Address) -> Self {
        Self {
            owner,
            usd_issuer,
            rebalancer: None,
            referrer_code: ReferrerCode::EMPTY,
            max_position: Decimal::MAX,
        }
    }
}

/// Guards the settings record; every setter is owner-only.
pub struct AccessGuard {
    settings: RwLock<LemmaSettings>,
}

impl AccessGuard {
    pub fn new(settings: LemmaSettings) -> Self {
        Self {
            settings: RwLock::new(settings),
        }
    }

    /// Copy of the current settings.
    pub async fn settings(&self) -> LemmaSettings {
        self.settings.read().await.clone()
    }

    /// Fail with `Unauthorized` unless `caller` holds `role`.
    pub async fn ensure(&self, caller: &Address, role: Role) -> LemmaResult<()> {
        let settings = self.settings.read().await;
        let allowed = match role {
            Role::Owner => settings.owner == *caller,
            Role::UsdIssuer => settings.usd_issuer == *caller,
            Role::Rebalancer => settings.rebalancer == Some(*caller),
        };
        if allowed {
            Ok(())
        } else {
            Err(LemmaError::Unauthorized {
                caller: *caller,
                role,
            })
        }
    }

    /// Rebalance authorization: `actor` must be the configured rebalancer,
    /// and the call must come from the rebalancer itself or the USD issuer
    /// relaying for it.
    pub async fn ensure_rebalance(&self, caller: &Address, actor: &Address) -> LemmaResult<()> {
        let settings = self.settings.read().await;
        let actor_ok = settings.rebalancer == Some(*actor);
        let caller_ok = *caller == *actor || *caller == settings.usd_issuer;
        if actor_ok && caller_ok {
            Ok(())
        } else {
            Err(LemmaError::Unauthorized {
                caller: *caller,
                role: Role::Rebalancer,
            })
        }
    }

    async fn update<F>(&self, caller: &Address, field: &'static str, apply: F) -> LemmaResult<()>
    where
        F: FnOnce(&mut LemmaSettings),
    {
        let mut settings = self.settings.write().await;
        if settings.owner != *caller {
            return Err(LemmaError::Unauthorized {
                caller: *caller,
                role: Role::Owner,
            });
        }
        apply(&mut *settings);
        info!(%caller, field, "Settings updated");
        Ok(())
    }

    pub async fn set_usd_issuer(&self, caller: &Address, usd_issuer: Address) -> LemmaResult<()> {
        self.update(caller, "usd_issuer", |s| s.usd_issuer = usd_issuer).await
    }

    pub async fn set_rebalancer(&self, caller: &Address, rebalancer: Address) -> LemmaResult<()> {
        self.update(caller, "rebalancer", |s| s.rebalancer = Some(rebalancer)).await
    }

    pub async fn set_referrer_code(&self, caller: &Address, code: ReferrerCode) -> LemmaResult<()> {
        self.update(caller, "referrer_code", |s| s.referrer_code = code).await
    }

    pub async fn set_max_position(&self, caller: &Address, max_position: Decimal) -> LemmaResult<()> {
        if max_position.is_sign_negative() {
            return Err(LemmaError::InvalidAmount(format!(
                "max position must not be negative, got {max_position}"
            )));
        }
        self.update(caller, "max_position", |s| s.max_position = max_position).await
    }

    pub async fn transfer_ownership(&self, caller: &Address, new_owner: Address) -> LemmaResult<()> {
        if new_owner == Address::ZERO {
            return Err(LemmaError::InvalidAmount("new owner is the zero address".to_string()));
        }
        self.update(caller, "owner", |s| s.owner = new_owner).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn guard() -> AccessGuard {
        AccessGuard::new(LemmaSettings::new(
            Address::from_label("owner"),
            Address::from_label("usd_lemma"),
        ))
    }

    #[tokio::test]
    async fn test_owner_can_update_every_field() {
        let guard = guard();
        let owner = Address::from_label("owner");
        let signer1 = Address::from_label("signer1");

        guard.set_usd_issuer(&owner, signer1).await.unwrap();
        guard.set_rebalancer(&owner, signer1).await.unwrap();
        guard
            .set_referrer_code(&owner, "Hello World".parse().unwrap())
            .await
            .unwrap();
        guard.set_max_position(&owner, dec!(1)).await.unwrap();

        let settings = guard.settings().await;
        assert_eq!(settings.usd_issuer, signer1);
        assert_eq!(settings.rebalancer, Some(signer1));
        assert_eq!(settings.referrer_code.as_string(), "Hello World");
        assert_eq!(settings.max_position, dec!(1));
    }

    #[tokio::test]
    async fn test_non_owner_is_rejected_and_nothing_changes() {
        let guard = guard();
        let signer1 = Address::from_label("signer1");
        let before = guard.settings().await;

        let err = guard.set_usd_issuer(&signer1, signer1).await.unwrap_err();
        assert_eq!(
            err,
            LemmaError::Unauthorized {
                caller: signer1,
                role: Role::Owner
            }
        );
        assert!(guard.set_rebalancer(&signer1, signer1).await.is_err());
        assert!(guard
            .set_referrer_code(&signer1, "Hello World".parse().unwrap())
            .await
            .is_err());
        assert!(guard.set_max_position(&signer1, dec!(5)).await.is_err());
        assert!(guard.transfer_ownership(&signer1, signer1).await.is_err());

        assert_eq!(guard.settings().await, before);
    }

    #[tokio::test]
    async fn test_transfer_ownership() {
        let guard = guard();
        let owner = Address::from_label("owner");
        let next = Address::from_label("next_owner");

        guard.transfer_ownership(&owner, next).await.unwrap();
        assert!(guard.set_max_position(&owner, dec!(1)).await.is_err());
        assert!(guard.set_max_position(&next, dec!(1)).await.is_ok());
        assert!(guard.transfer_ownership(&next, Address::ZERO).await.is_err());
    }

    #[tokio::test]
    async fn test_role_checks() {
        let guard = guard();
        let owner = Address::from_label("owner");
        let usd_lemma = Address::from_label("usd_lemma");

        assert!(guard.ensure(&usd_lemma, Role::UsdIssuer).await.is_ok());
        assert!(guard.ensure(&owner, Role::UsdIssuer).await.is_err());
        // No rebalancer configured yet
        assert!(guard.ensure(&owner, Role::Rebalancer).await.is_err());
    }

    #[tokio::test]
    async fn test_rebalance_authorization() {
        let guard = guard();
        let owner = Address::from_label("owner");
        let usd_lemma = Address::from_label("usd_lemma");
        let rebalancer = Address::from_label("rebalancer");
        let stranger = Address::from_label("stranger");
        guard.set_rebalancer(&owner, rebalancer).await.unwrap();

        assert!(guard.ensure_rebalance(&rebalancer, &rebalancer).await.is_ok());
        assert!(guard.ensure_rebalance(&usd_lemma, &rebalancer).await.is_ok());
        assert!(guard.ensure_rebalance(&stranger, &rebalancer).await.is_err());
        assert!(guard.ensure_rebalance(&usd_lemma, &stranger).await.is_err());
        assert!(guard.ensure_rebalance(&stranger, &stranger).await.is_err());
    }
}
