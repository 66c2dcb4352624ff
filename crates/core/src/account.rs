//! Balance ledger: accounts, append-only history entries and withdrawals.
//!
//! Pure domain logic only; the storage layer is responsible for applying
//! these changes inside one transaction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::UserId;
use crate::order::OrderNumber;
use crate::points::Points;

/// Kind of balance-affecting event recorded in the history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// Points credited for a finalized order
    Accrual,
    /// Points spent against an order
    Withdrawn,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Accrual => "accrual",
            EntryKind::Withdrawn => "withdrawn",
        }
    }
}

impl core::str::FromStr for EntryKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accrual" => Ok(EntryKind::Accrual),
            "withdrawn" => Ok(EntryKind::Withdrawn),
            other => Err(DomainError::validation(format!("unknown ledger entry kind: {other}"))),
        }
    }
}

/// One immutable line of the balance history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub order: OrderNumber,
    pub kind: EntryKind,
    /// Non-negative; the sign comes from `kind`.
    pub amount: Points,
    pub recorded_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn accrual(order: OrderNumber, amount: Points) -> Self {
        Self {
            order,
            kind: EntryKind::Accrual,
            amount,
            recorded_at: Utc::now(),
        }
    }

    pub fn withdrawn(order: OrderNumber, amount: Points) -> Self {
        Self {
            order,
            kind: EntryKind::Withdrawn,
            amount,
            recorded_at: Utc::now(),
        }
    }

    /// Effect of this entry on the balance, in hundredths.
    pub fn signed_hundredths(&self) -> i128 {
        match self.kind {
            EntryKind::Accrual => self.amount.hundredths() as i128,
            EntryKind::Withdrawn => -(self.amount.hundredths() as i128),
        }
    }
}

/// Balance implied by a user's history: Σ accruals − Σ withdrawals.
pub fn history_balance<'a>(entries: impl IntoIterator<Item = &'a LedgerEntry>) -> i128 {
    entries.into_iter().map(LedgerEntry::signed_hundredths).sum()
}

/// A request to spend points against an order number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Withdrawal {
    pub order: OrderNumber,
    pub sum: Points,
    pub processed_at: DateTime<Utc>,
}

impl Withdrawal {
    pub fn new(order: OrderNumber, sum: Points) -> DomainResult<Self> {
        if sum.is_negative() || sum.is_zero() {
            return Err(DomainError::validation("withdrawal sum must be positive"));
        }
        Ok(Self {
            order,
            sum,
            processed_at: Utc::now(),
        })
    }
}

/// One balance per user.
///
/// Invariant: `balance >= 0`. `withdrawn` only ever grows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub user_id: UserId,
    pub balance: Points,
    pub withdrawn: Points,
}

impl Account {
    pub fn open(user_id: UserId) -> Self {
        Self {
            user_id,
            balance: Points::ZERO,
            withdrawn: Points::ZERO,
        }
    }

    /// Credit an accrual.
    pub fn credit(&mut self, amount: Points) -> DomainResult<()> {
        if amount.is_negative() {
            return Err(DomainError::validation("credit must not be negative"));
        }
        self.balance = self
            .balance
            .checked_add(amount)
            .ok_or_else(|| DomainError::invariant("balance overflow"))?;
        Ok(())
    }

    /// Spend points; fails without side effects if the balance is too low.
    pub fn debit(&mut self, amount: Points) -> DomainResult<()> {
        if amount.is_negative() || amount.is_zero() {
            return Err(DomainError::validation("withdrawal sum must be positive"));
        }
        if amount > self.balance {
            return Err(DomainError::invariant(format!(
                "insufficient funds: balance {}, requested {}",
                self.balance, amount
            )));
        }
        let balance = self
            .balance
            .checked_sub(amount)
            .ok_or_else(|| DomainError::invariant("balance underflow"))?;
        let withdrawn = self
            .withdrawn
            .checked_add(amount)
            .ok_or_else(|| DomainError::invariant("withdrawn overflow"))?;
        self.balance = balance;
        self.withdrawn = withdrawn;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn order(raw: &str) -> OrderNumber {
        OrderNumber::parse(raw).unwrap()
    }

    #[test]
    fn debit_beyond_balance_changes_nothing() {
        let mut account = Account::open(UserId::new());
        account.credit(Points::whole(100)).unwrap();

        let err = account.debit(Points::whole(101)).unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
        assert_eq!(account.balance, Points::whole(100));
        assert_eq!(account.withdrawn, Points::ZERO);
    }

    #[test]
    fn debit_moves_points_to_withdrawn() {
        let mut account = Account::open(UserId::new());
        account.credit(Points::whole(100)).unwrap();
        account.debit(Points::from_hundredths(2550)).unwrap();

        assert_eq!(account.balance, Points::from_hundredths(7450));
        assert_eq!(account.withdrawn, Points::from_hundredths(2550));
    }

    #[test]
    fn withdrawal_requires_positive_sum() {
        assert!(Withdrawal::new(order("2377225624"), Points::ZERO).is_err());
        assert!(Withdrawal::new(order("2377225624"), Points::whole(-1)).is_err());
        assert!(Withdrawal::new(order("2377225624"), Points::whole(1)).is_ok());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: for any sequence of credits and attempted debits applied
        /// alongside history entries, the balance never goes negative and
        /// always equals the history sum.
        #[test]
        fn balance_matches_history(
            ops in prop::collection::vec((any::<bool>(), 1i64..100_000i64), 1..40)
        ) {
            let mut account = Account::open(UserId::new());
            let mut history = Vec::new();
            let number = order("12345678903");

            for (is_credit, amount) in ops {
                let amount = Points::from_hundredths(amount);
                if is_credit {
                    account.credit(amount).unwrap();
                    history.push(LedgerEntry::accrual(number.clone(), amount));
                } else if account.debit(amount).is_ok() {
                    history.push(LedgerEntry::withdrawn(number.clone(), amount));
                }
                prop_assert!(!account.balance.is_negative());
            }

            prop_assert_eq!(history_balance(&history), account.balance.hundredths() as i128);
        }
    }
}
