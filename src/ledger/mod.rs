//! Ledger
//!
//! Per-account balance plus an append-only transaction log. Debit and
//! credit are atomic read-modify-write operations under one write lock, so
//! concurrent charges against one account never interleave and the entry
//! history of an account always forms a consistent running balance.

pub mod api;
pub mod rewards;

use bigdecimal::BigDecimal;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::shared::models::{Account, EntryType, LedgerEntry};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("account not found: {0}")]
    AccountNotFound(Uuid),
    #[error("insufficient funds: balance {balance}, requested debit {amount}")]
    InsufficientFunds {
        balance: BigDecimal,
        amount: BigDecimal,
    },
    #[error("amount must not be negative: {0}")]
    NegativeAmount(BigDecimal),
}

#[derive(Default)]
struct LedgerInner {
    accounts: HashMap<Uuid, Account>,
    entries: Vec<LedgerEntry>,
}

pub struct LedgerService {
    inner: Arc<RwLock<LedgerInner>>,
}

impl LedgerService {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(LedgerInner::default())),
        }
    }

    pub async fn get_account(&self, account_id: Uuid) -> Result<Account, LedgerError> {
        let inner = self.inner.read().await;
        inner
            .accounts
            .get(&account_id)
            .cloned()
            .ok_or(LedgerError::AccountNotFound(account_id))
    }

    pub async fn entries_for_account(&self, account_id: Uuid) -> Vec<LedgerEntry> {
        let inner = self.inner.read().await;
        inner
            .entries
            .iter()
            .filter(|e| e.account_id == account_id)
            .cloned()
            .collect()
    }

    /// Rejects the debit without any mutation when it would drive the
    /// balance negative.
    pub async fn debit(
        &self,
        account_id: Uuid,
        amount: BigDecimal,
        related_generation_id: Option<Uuid>,
        description: &str,
    ) -> Result<LedgerEntry, LedgerError> {
        if amount < BigDecimal::from(0) {
            return Err(LedgerError::NegativeAmount(amount));
        }
        let mut inner = self.inner.write().await;
        let account = inner
            .accounts
            .get(&account_id)
            .ok_or(LedgerError::AccountNotFound(account_id))?;
        let balance_before = account.balance.clone();
        let balance_after = &balance_before - &amount;
        if balance_after < BigDecimal::from(0) {
            return Err(LedgerError::InsufficientFunds {
                balance: balance_before,
                amount,
            });
        }
        Ok(Self::append(
            &mut inner,
            account_id,
            EntryType::Debit,
            amount,
            balance_before,
            balance_after,
            related_generation_id,
            description,
        ))
    }

    pub async fn credit(
        &self,
        account_id: Uuid,
        amount: BigDecimal,
        related_generation_id: Option<Uuid>,
        description: &str,
    ) -> Result<LedgerEntry, LedgerError> {
        self.credit_as(
            account_id,
            EntryType::Credit,
            amount,
            related_generation_id,
            description,
        )
        .await
    }

    /// Creator-reward share. Same mechanics as a credit, distinct entry
    /// type so reward income stays auditable apart from top-ups.
    pub async fn reward(
        &self,
        account_id: Uuid,
        amount: BigDecimal,
        related_generation_id: Option<Uuid>,
        description: &str,
    ) -> Result<LedgerEntry, LedgerError> {
        self.credit_as(
            account_id,
            EntryType::Reward,
            amount,
            related_generation_id,
            description,
        )
        .await
    }

    async fn credit_as(
        &self,
        account_id: Uuid,
        entry_type: EntryType,
        amount: BigDecimal,
        related_generation_id: Option<Uuid>,
        description: &str,
    ) -> Result<LedgerEntry, LedgerError> {
        if amount < BigDecimal::from(0) {
            return Err(LedgerError::NegativeAmount(amount));
        }
        let mut inner = self.inner.write().await;
        // First credit provisions the account.
        let balance_before = inner
            .accounts
            .entry(account_id)
            .or_insert_with(|| Account {
                id: account_id,
                balance: BigDecimal::from(0),
                updated_at: Utc::now(),
            })
            .balance
            .clone();
        let balance_after = &balance_before + &amount;
        Ok(Self::append(
            &mut inner,
            account_id,
            entry_type,
            amount,
            balance_before,
            balance_after,
            related_generation_id,
            description,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn append(
        inner: &mut LedgerInner,
        account_id: Uuid,
        entry_type: EntryType,
        amount: BigDecimal,
        balance_before: BigDecimal,
        balance_after: BigDecimal,
        related_generation_id: Option<Uuid>,
        description: &str,
    ) -> LedgerEntry {
        let now = Utc::now();
        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            account_id,
            entry_type,
            amount,
            balance_before,
            balance_after: balance_after.clone(),
            related_generation_id,
            description: description.to_string(),
            created_at: now,
        };
        if let Some(account) = inner.accounts.get_mut(&account_id) {
            account.balance = balance_after;
            account.updated_at = now;
        }
        inner.entries.push(entry.clone());
        entry
    }
}

impl Default for LedgerService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn bd(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    #[tokio::test]
    async fn test_credit_provisions_account_and_chains_balance() {
        let ledger = LedgerService::new();
        let account = Uuid::new_v4();
        ledger.credit(account, bd("10"), None, "top-up").await.unwrap();
        ledger.debit(account, bd("2.5"), None, "charge").await.unwrap();
        ledger.credit(account, bd("1"), None, "refund").await.unwrap();

        let entries = ledger.entries_for_account(account).await;
        assert_eq!(entries.len(), 3);
        for pair in entries.windows(2) {
            assert_eq!(pair[0].balance_after, pair[1].balance_before);
        }
        assert_eq!(ledger.get_account(account).await.unwrap().balance, bd("8.5"));
    }

    #[tokio::test]
    async fn test_overdraft_debit_rejected_with_no_entry() {
        let ledger = LedgerService::new();
        let account = Uuid::new_v4();
        ledger.credit(account, bd("1"), None, "top-up").await.unwrap();

        let err = ledger.debit(account, bd("1.01"), None, "charge").await;
        assert!(matches!(err, Err(LedgerError::InsufficientFunds { .. })));
        assert_eq!(ledger.entries_for_account(account).await.len(), 1);
        assert_eq!(ledger.get_account(account).await.unwrap().balance, bd("1"));
    }

    #[tokio::test]
    async fn test_debit_unknown_account_fails() {
        let ledger = LedgerService::new();
        let err = ledger.debit(Uuid::new_v4(), bd("1"), None, "charge").await;
        assert!(matches!(err, Err(LedgerError::AccountNotFound(_))));
    }

    #[tokio::test]
    async fn test_negative_amounts_rejected() {
        let ledger = LedgerService::new();
        let account = Uuid::new_v4();
        assert!(ledger.credit(account, bd("-1"), None, "bad").await.is_err());
        ledger.credit(account, bd("5"), None, "top-up").await.unwrap();
        assert!(ledger.debit(account, bd("-1"), None, "bad").await.is_err());
    }

    #[tokio::test]
    async fn test_reward_entry_type_recorded() {
        let ledger = LedgerService::new();
        let creator = Uuid::new_v4();
        let generation = Uuid::new_v4();
        let entry = ledger
            .reward(creator, bd("0.0025"), Some(generation), "creator fee share")
            .await
            .unwrap();
        assert_eq!(entry.entry_type, EntryType::Reward);
        assert_eq!(entry.related_generation_id, Some(generation));
    }

    #[tokio::test]
    async fn test_concurrent_debits_serialize() {
        let ledger = Arc::new(LedgerService::new());
        let account = Uuid::new_v4();
        ledger.credit(account, bd("100"), None, "top-up").await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                ledger.debit(account, bd("1"), None, "charge").await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(ledger.get_account(account).await.unwrap().balance, bd("80"));
        let entries = ledger.entries_for_account(account).await;
        for pair in entries.windows(2) {
            assert_eq!(pair[0].balance_after, pair[1].balance_before);
        }
    }
}
