use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

use loyalty_core::{
    Account, EntryKind, LedgerEntry, Order, OrderNumber, OrderStatus, UserId, Withdrawal,
};

use super::r#trait::{LedgerStorage, NewUser, StorageError, UserCredentials};

#[derive(Debug, Clone, Default)]
struct LedgerState {
    users: HashMap<String, UserCredentials>,
    accounts: HashMap<UserId, Account>,
    /// Upload order; newest last.
    orders: Vec<Order>,
    history: Vec<(UserId, LedgerEntry)>,
}

impl LedgerState {
    fn order_mut(&mut self, number: &OrderNumber) -> Result<&mut Order, StorageError> {
        self.orders
            .iter_mut()
            .find(|o| &o.number == number)
            .ok_or_else(|| StorageError::not_found(format!("order {number}")))
    }

    fn account_mut(&mut self, user_id: UserId) -> Result<&mut Account, StorageError> {
        self.accounts
            .get_mut(&user_id)
            .ok_or_else(|| StorageError::not_found(format!("account of user {user_id}")))
    }
}

/// In-memory ledger storage.
///
/// Intended for tests/dev. Multi-step operations stage their changes on a copy
/// of the state and swap it in only when every step succeeded.
#[derive(Debug, Default)]
pub struct InMemoryLedgerStorage {
    state: RwLock<LedgerState>,
    faults: Mutex<VecDeque<StorageError>>,
    commit_faults: Mutex<VecDeque<StorageError>>,
    calls: AtomicUsize,
    closed: AtomicBool,
}

impl InMemoryLedgerStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next operation fail with `err` before touching any state.
    /// Queued faults are consumed in order, one per call.
    pub fn fail_next(&self, err: StorageError) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.push_back(err);
        }
    }

    /// Make the next multi-step operation fail with `err` after all its
    /// steps were staged but before they are committed.
    pub fn fail_next_commit(&self, err: StorageError) {
        if let Ok(mut faults) = self.commit_faults.lock() {
            faults.push_back(err);
        }
    }

    /// Number of operations invoked so far, including failed ones.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn enter(&self) -> Result<(), StorageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("storage is closed".to_string()));
        }
        match self.faults.lock() {
            Ok(mut faults) => faults.pop_front().map_or(Ok(()), Err),
            Err(_) => Err(poisoned()),
        }
    }

    fn read<T>(
        &self,
        f: impl FnOnce(&LedgerState) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        self.enter()?;
        let state = self.state.read().map_err(|_| poisoned())?;
        f(&state)
    }

    fn transaction<T>(
        &self,
        f: impl FnOnce(&mut LedgerState) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        self.enter()?;
        let mut state = self.state.write().map_err(|_| poisoned())?;
        let mut staged = state.clone();
        let out = f(&mut staged)?;

        let commit_fault = self
            .commit_faults
            .lock()
            .map_err(|_| poisoned())?
            .pop_front();
        if let Some(err) = commit_fault {
            return Err(err);
        }

        *state = staged;
        Ok(out)
    }
}

fn poisoned() -> StorageError {
    StorageError::Backend("lock poisoned".to_string())
}

#[async_trait::async_trait]
impl LedgerStorage for InMemoryLedgerStorage {
    async fn register(&self, user: &NewUser) -> Result<UserId, StorageError> {
        self.transaction(|state| {
            if state.users.contains_key(&user.login) {
                return Err(StorageError::conflict(format!("login {} is taken", user.login)));
            }
            let user_id = UserId::new();
            state.users.insert(
                user.login.clone(),
                UserCredentials {
                    user_id,
                    login: user.login.clone(),
                    password_hash: user.password_hash.clone(),
                },
            );
            state.accounts.insert(user_id, Account::open(user_id));
            Ok(user_id)
        })
    }

    async fn login(&self, login: &str) -> Result<UserCredentials, StorageError> {
        self.read(|state| {
            state
                .users
                .get(login)
                .cloned()
                .ok_or_else(|| StorageError::not_found(format!("user {login}")))
        })
    }

    async fn get_order_by_number(&self, number: &OrderNumber) -> Result<Order, StorageError> {
        self.read(|state| {
            state
                .orders
                .iter()
                .find(|o| &o.number == number)
                .cloned()
                .ok_or_else(|| StorageError::not_found(format!("order {number}")))
        })
    }

    async fn add_order(&self, order: &Order) -> Result<(), StorageError> {
        self.transaction(|state| {
            if !state.accounts.contains_key(&order.user_id) {
                return Err(StorageError::not_found(format!("user {}", order.user_id)));
            }
            if state.orders.iter().any(|o| o.number == order.number) {
                return Err(StorageError::conflict(format!(
                    "order {} already uploaded",
                    order.number
                )));
            }
            state.orders.push(order.clone());
            Ok(())
        })
    }

    async fn update_order_status(
        &self,
        number: &OrderNumber,
        status: OrderStatus,
    ) -> Result<(), StorageError> {
        self.transaction(|state| {
            let order = state.order_mut(number)?;
            if order.is_terminal() {
                return Err(StorageError::AlreadyFinalized(number.clone()));
            }
            if status.is_terminal() {
                return Err(StorageError::conflict(format!(
                    "{status} can only be set by processing the order"
                )));
            }
            order.status = status;
            Ok(())
        })
    }

    async fn process_order(&self, order: &Order) -> Result<(), StorageError> {
        self.transaction(|state| {
            let stored = state.order_mut(&order.number)?;
            if stored.is_terminal() {
                return Err(StorageError::AlreadyFinalized(order.number.clone()));
            }
            stored
                .finalize(order.status, order.accrual)
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            let user_id = stored.user_id;
            let credit = stored.credit();

            state
                .account_mut(user_id)?
                .credit(credit)
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            state
                .history
                .push((user_id, LedgerEntry::accrual(order.number.clone(), credit)));
            Ok(())
        })
    }

    async fn list_orders(&self, user_id: UserId) -> Result<Vec<Order>, StorageError> {
        self.read(|state| {
            Ok(state
                .orders
                .iter()
                .rev()
                .filter(|o| o.user_id == user_id)
                .cloned()
                .collect())
        })
    }

    async fn list_unfinished_orders(&self) -> Result<Vec<Order>, StorageError> {
        self.read(|state| {
            Ok(state
                .orders
                .iter()
                .filter(|o| !o.is_terminal())
                .cloned()
                .collect())
        })
    }

    async fn get_account(&self, user_id: UserId) -> Result<Account, StorageError> {
        self.read(|state| {
            state
                .accounts
                .get(&user_id)
                .cloned()
                .ok_or_else(|| StorageError::not_found(format!("account of user {user_id}")))
        })
    }

    async fn withdraw(&self, user_id: UserId, withdrawal: &Withdrawal) -> Result<(), StorageError> {
        self.transaction(|state| {
            let duplicate = state.history.iter().any(|(_, e)| {
                e.kind == EntryKind::Withdrawn && e.order == withdrawal.order
            });
            if duplicate {
                return Err(StorageError::conflict(format!(
                    "withdrawal for order {} already recorded",
                    withdrawal.order
                )));
            }

            let account = state.account_mut(user_id)?;
            if withdrawal.sum > account.balance {
                return Err(StorageError::InsufficientFunds(format!(
                    "balance {}, requested {}",
                    account.balance, withdrawal.sum
                )));
            }
            account
                .debit(withdrawal.sum)
                .map_err(|e| StorageError::Backend(e.to_string()))?;

            let mut entry = LedgerEntry::withdrawn(withdrawal.order.clone(), withdrawal.sum);
            entry.recorded_at = withdrawal.processed_at;
            state.history.push((user_id, entry));
            Ok(())
        })
    }

    async fn list_withdrawals(&self, user_id: UserId) -> Result<Vec<Withdrawal>, StorageError> {
        self.read(|state| {
            Ok(state
                .history
                .iter()
                .rev()
                .filter(|(owner, e)| *owner == user_id && e.kind == EntryKind::Withdrawn)
                .map(|(_, e)| Withdrawal {
                    order: e.order.clone(),
                    sum: e.amount,
                    processed_at: e.recorded_at,
                })
                .collect())
        })
    }

    async fn ledger_entries(&self, user_id: UserId) -> Result<Vec<LedgerEntry>, StorageError> {
        self.read(|state| {
            Ok(state
                .history
                .iter()
                .filter(|(owner, _)| *owner == user_id)
                .map(|(_, e)| e.clone())
                .collect())
        })
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.read(|_| Ok(()))
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loyalty_core::{history_balance, Points};

    fn number(raw: &str) -> OrderNumber {
        OrderNumber::parse(raw).unwrap()
    }

    async fn user_with_order(store: &InMemoryLedgerStorage, raw: &str) -> (UserId, Order) {
        let user_id = store
            .register(&NewUser {
                login: format!("user-{raw}"),
                password_hash: "hash".to_string(),
            })
            .await
            .unwrap();
        let order = Order::new(number(raw), user_id);
        store.add_order(&order).await.unwrap();
        (user_id, order)
    }

    fn finalized(order: &Order, status: OrderStatus, accrual: Option<Points>) -> Order {
        let mut order = order.clone();
        order.finalize(status, accrual).unwrap();
        order
    }

    #[tokio::test]
    async fn register_rejects_duplicate_login() {
        let store = InMemoryLedgerStorage::new();
        let user = NewUser {
            login: "alice".to_string(),
            password_hash: "h".to_string(),
        };
        let id = store.register(&user).await.unwrap();

        assert!(matches!(store.register(&user).await, Err(StorageError::Conflict(_))));
        assert_eq!(store.login("alice").await.unwrap().user_id, id);
        assert_eq!(store.get_account(id).await.unwrap(), Account::open(id));
    }

    #[tokio::test]
    async fn add_order_rejects_duplicates_and_unknown_users() {
        let store = InMemoryLedgerStorage::new();
        let (_, order) = user_with_order(&store, "79927398713").await;

        assert!(matches!(store.add_order(&order).await, Err(StorageError::Conflict(_))));

        let stranger = Order::new(number("4561261212345467"), UserId::new());
        assert!(matches!(store.add_order(&stranger).await, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn processed_order_credits_once() {
        let store = InMemoryLedgerStorage::new();
        let (user_id, order) = user_with_order(&store, "79927398713").await;
        let done = finalized(&order, OrderStatus::Processed, Some(Points::whole(500)));

        store.process_order(&done).await.unwrap();
        assert!(matches!(
            store.process_order(&done).await,
            Err(StorageError::AlreadyFinalized(_))
        ));

        let account = store.get_account(user_id).await.unwrap();
        assert_eq!(account.balance, Points::whole(500));
        let entries = store.ledger_entries(user_id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            store.get_order_by_number(&order.number).await.unwrap().status,
            OrderStatus::Processed
        );
    }

    #[tokio::test]
    async fn invalid_order_records_zero_entry() {
        let store = InMemoryLedgerStorage::new();
        let (user_id, order) = user_with_order(&store, "79927398713").await;

        store
            .process_order(&finalized(&order, OrderStatus::Invalid, None))
            .await
            .unwrap();

        assert_eq!(store.get_account(user_id).await.unwrap().balance, Points::ZERO);
        let entries = store.ledger_entries(user_id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].amount, Points::ZERO);
    }

    #[tokio::test]
    async fn failed_commit_leaves_no_partial_state() {
        let store = InMemoryLedgerStorage::new();
        let (user_id, order) = user_with_order(&store, "79927398713").await;
        let done = finalized(&order, OrderStatus::Processed, Some(Points::whole(500)));

        store.fail_next_commit(StorageError::unavailable("connection reset"));
        assert!(store.process_order(&done).await.is_err());

        assert_eq!(store.get_account(user_id).await.unwrap().balance, Points::ZERO);
        assert!(store.ledger_entries(user_id).await.unwrap().is_empty());
        assert_eq!(
            store.get_order_by_number(&order.number).await.unwrap().status,
            OrderStatus::New
        );

        store.process_order(&done).await.unwrap();
        assert_eq!(store.get_account(user_id).await.unwrap().balance, Points::whole(500));
    }

    #[tokio::test]
    async fn withdraw_checks_balance_and_duplicates() {
        let store = InMemoryLedgerStorage::new();
        let (user_id, order) = user_with_order(&store, "79927398713").await;
        store
            .process_order(&finalized(&order, OrderStatus::Processed, Some(Points::whole(100))))
            .await
            .unwrap();

        let too_much = Withdrawal::new(number("2377225624"), Points::whole(101)).unwrap();
        assert!(matches!(
            store.withdraw(user_id, &too_much).await,
            Err(StorageError::InsufficientFunds(_))
        ));

        let ok = Withdrawal::new(number("2377225624"), Points::whole(40)).unwrap();
        store.withdraw(user_id, &ok).await.unwrap();
        assert!(matches!(
            store.withdraw(user_id, &ok).await,
            Err(StorageError::Conflict(_))
        ));

        let account = store.get_account(user_id).await.unwrap();
        assert_eq!(account.balance, Points::whole(60));
        assert_eq!(account.withdrawn, Points::whole(40));
        assert_eq!(store.list_withdrawals(user_id).await.unwrap().len(), 1);

        let entries = store.ledger_entries(user_id).await.unwrap();
        assert_eq!(history_balance(&entries), account.balance.hundredths() as i128);
    }

    #[tokio::test]
    async fn unfinished_orders_exclude_terminal_ones() {
        let store = InMemoryLedgerStorage::new();
        let (user_id, first) = user_with_order(&store, "79927398713").await;
        let second = Order::new(number("4561261212345467"), user_id);
        store.add_order(&second).await.unwrap();
        store
            .process_order(&finalized(&first, OrderStatus::Invalid, None))
            .await
            .unwrap();

        let unfinished = store.list_unfinished_orders().await.unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].number, second.number);

        let listed = store.list_orders(user_id).await.unwrap();
        assert_eq!(listed[0].number, second.number);
    }

    #[tokio::test]
    async fn update_status_refuses_terminal_transitions() {
        let store = InMemoryLedgerStorage::new();
        let (_, order) = user_with_order(&store, "79927398713").await;

        store
            .update_order_status(&order.number, OrderStatus::Processing)
            .await
            .unwrap();
        assert!(store
            .update_order_status(&order.number, OrderStatus::Processed)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn injected_faults_are_consumed_in_order() {
        let store = InMemoryLedgerStorage::new();
        store.fail_next(StorageError::unavailable("down"));

        assert!(matches!(store.ping().await, Err(StorageError::Unavailable(_))));
        store.ping().await.unwrap();
        assert_eq!(store.call_count(), 2);
    }
}
