//! Banking operations over a shared in-memory account store.
//!
//! All operations take the full credential set and authenticate against the
//! account owner before touching balances. The store sits behind a single
//! mutex, which makes every operation atomic. TRANSFER in particular must
//! debit and credit under one critical section so no reader can observe a
//! half-applied transfer.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use ledgerwire_proto::{Currency, StatusCode};
use thiserror::Error;

use crate::Account;

/// First account number issued is `ACC-1001`.
const ACCOUNT_COUNTER_START: u64 = 1000;

/// Business-rule failures, mapped 1:1 onto wire status codes.
///
/// Authentication failures never reveal whether the username, the password,
/// or the account ownership was at fault.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BankError {
    #[error("malformed or out-of-range request")]
    BadRequest,
    #[error("authentication failed")]
    AuthFail,
    #[error("account not found")]
    NotFound,
    #[error("insufficient funds")]
    InsufficientFunds,
    #[error("currency mismatch")]
    CurrencyMismatch,
    #[error("username already exists")]
    AlreadyExists,
}

impl From<BankError> for StatusCode {
    fn from(err: BankError) -> Self {
        match err {
            BankError::BadRequest => Self::BadRequest,
            BankError::AuthFail => Self::AuthFail,
            BankError::NotFound => Self::NotFound,
            BankError::InsufficientFunds => Self::InsufficientFunds,
            BankError::CurrencyMismatch => Self::CurrencyMismatch,
            BankError::AlreadyExists => Self::AlreadyExists,
        }
    }
}

/// Result of a successful OPEN_ACCOUNT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedAccount {
    /// Newly assigned account number.
    pub account_no: String,
    /// Initial balance in minor units.
    pub balance_cents: i64,
}

/// Result of a successful TRANSFER.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOutcome {
    /// New balance of the debited account.
    pub source_balance_cents: i64,
    /// New balance of the credited account.
    pub dest_balance_cents: i64,
}

struct Ledger {
    /// Account number → account.
    accounts: HashMap<String, Account>,
    /// Username → account number (usernames are globally unique).
    by_username: HashMap<String, String>,
    /// Monotonic account number source.
    counter: u64,
}

impl Ledger {
    fn authenticated<'a>(
        &'a self,
        username: &str,
        password: &str,
        account_no: &str,
    ) -> Result<&'a Account, BankError> {
        let account = self.accounts.get(account_no).ok_or(BankError::NotFound)?;
        if !account.authenticates(username, password) {
            return Err(BankError::AuthFail);
        }
        Ok(account)
    }

    fn authenticated_mut<'a>(
        &'a mut self,
        username: &str,
        password: &str,
        account_no: &str,
    ) -> Result<&'a mut Account, BankError> {
        let account = self
            .accounts
            .get_mut(account_no)
            .ok_or(BankError::NotFound)?;
        if !account.authenticates(username, password) {
            return Err(BankError::AuthFail);
        }
        Ok(account)
    }
}

/// Thread-safe banking service.
///
/// Cloning is cheap and shares the underlying ledger.
#[derive(Clone)]
pub struct BankService {
    ledger: Arc<Mutex<Ledger>>,
}

impl Default for BankService {
    fn default() -> Self {
        Self::new()
    }
}

impl BankService {
    /// Create an empty service.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ledger: Arc::new(Mutex::new(Ledger {
                accounts: HashMap::new(),
                by_username: HashMap::new(),
                counter: ACCOUNT_COUNTER_START,
            })),
        }
    }

    #[allow(clippy::expect_used)]
    fn lock(&self) -> std::sync::MutexGuard<'_, Ledger> {
        // A poisoned ledger mutex means a panic inside a balance mutation;
        // the ledger can no longer be trusted, so propagating the panic is
        // the only sound option.
        self.ledger.lock().expect("ledger mutex poisoned")
    }

    /// Open a new account for a globally unique username.
    ///
    /// # Errors
    ///
    /// `BadRequest` for a negative initial balance or empty credentials,
    /// `AlreadyExists` when the username is taken.
    pub fn open_account(
        &self,
        username: &str,
        password: &str,
        currency: Currency,
        initial_balance_cents: i64,
    ) -> Result<OpenedAccount, BankError> {
        if username.is_empty() || password.is_empty() || initial_balance_cents < 0 {
            return Err(BankError::BadRequest);
        }

        let mut ledger = self.lock();
        if ledger.by_username.contains_key(username) {
            return Err(BankError::AlreadyExists);
        }

        ledger.counter += 1;
        let account_no = format!("ACC-{}", ledger.counter);
        let account = Account::new(
            account_no.clone(),
            username.to_string(),
            password.to_string(),
            currency,
            initial_balance_cents,
        );

        ledger
            .by_username
            .insert(username.to_string(), account_no.clone());
        ledger.accounts.insert(account_no.clone(), account);

        tracing::info!(%account_no, username, %currency, "account opened");

        Ok(OpenedAccount {
            account_no,
            balance_cents: initial_balance_cents,
        })
    }

    /// Close an account, returning its final balance.
    ///
    /// # Errors
    ///
    /// `NotFound` or `AuthFail`.
    pub fn close_account(
        &self,
        username: &str,
        password: &str,
        account_no: &str,
    ) -> Result<i64, BankError> {
        let mut ledger = self.lock();
        let final_balance = ledger
            .authenticated(username, password, account_no)?
            .balance_cents();

        ledger.accounts.remove(account_no);
        ledger.by_username.remove(username);

        tracing::info!(account_no, username, "account closed");
        Ok(final_balance)
    }

    /// Deposit into an account, returning the new balance.
    ///
    /// When `currency` is given it must match the account's currency.
    ///
    /// # Errors
    ///
    /// `BadRequest` for a non-positive amount, `NotFound`, `AuthFail`, or
    /// `CurrencyMismatch`.
    pub fn deposit(
        &self,
        username: &str,
        password: &str,
        account_no: &str,
        currency: Option<Currency>,
        amount_cents: i64,
    ) -> Result<i64, BankError> {
        if amount_cents <= 0 {
            return Err(BankError::BadRequest);
        }

        let mut ledger = self.lock();
        let account = ledger.authenticated_mut(username, password, account_no)?;
        if currency.is_some_and(|c| c != account.currency()) {
            return Err(BankError::CurrencyMismatch);
        }

        account.credit(amount_cents);
        Ok(account.balance_cents())
    }

    /// Withdraw from an account, returning the new balance.
    ///
    /// # Errors
    ///
    /// `BadRequest` for a non-positive amount, `NotFound`, `AuthFail`,
    /// `CurrencyMismatch`, or `InsufficientFunds`.
    pub fn withdraw(
        &self,
        username: &str,
        password: &str,
        account_no: &str,
        currency: Option<Currency>,
        amount_cents: i64,
    ) -> Result<i64, BankError> {
        if amount_cents <= 0 {
            return Err(BankError::BadRequest);
        }

        let mut ledger = self.lock();
        let account = ledger.authenticated_mut(username, password, account_no)?;
        if currency.is_some_and(|c| c != account.currency()) {
            return Err(BankError::CurrencyMismatch);
        }
        if !account.debit(amount_cents) {
            return Err(BankError::InsufficientFunds);
        }

        Ok(account.balance_cents())
    }

    /// Query an account's balance and currency.
    ///
    /// # Errors
    ///
    /// `NotFound` or `AuthFail`.
    pub fn query_balance(
        &self,
        username: &str,
        password: &str,
        account_no: &str,
    ) -> Result<(i64, Currency), BankError> {
        let ledger = self.lock();
        let account = ledger.authenticated(username, password, account_no)?;
        Ok((account.balance_cents(), account.currency()))
    }

    /// Transfer between two accounts atomically.
    ///
    /// Both balance updates happen under one ledger lock: either both
    /// accounts change or neither does. Existence of both accounts is
    /// established before the source credentials are examined, so a
    /// missing destination reports `NotFound` even when the credentials
    /// are also wrong.
    ///
    /// # Errors
    ///
    /// `BadRequest` for a non-positive amount or identical accounts,
    /// `NotFound` if either account is missing, `AuthFail` on source
    /// credentials, `CurrencyMismatch`, or `InsufficientFunds`.
    pub fn transfer(
        &self,
        username: &str,
        password: &str,
        from_account_no: &str,
        to_account_no: &str,
        amount_cents: i64,
    ) -> Result<TransferOutcome, BankError> {
        if amount_cents <= 0 || from_account_no == to_account_no {
            return Err(BankError::BadRequest);
        }

        let mut ledger = self.lock();

        if !ledger.accounts.contains_key(from_account_no) {
            return Err(BankError::NotFound);
        }
        let dest_currency = ledger
            .accounts
            .get(to_account_no)
            .ok_or(BankError::NotFound)?
            .currency();

        let source = ledger.authenticated(username, password, from_account_no)?;
        if source.currency() != dest_currency {
            return Err(BankError::CurrencyMismatch);
        }

        // All checks passed; apply both sides.
        let source = ledger
            .accounts
            .get_mut(from_account_no)
            .ok_or(BankError::NotFound)?;
        if !source.debit(amount_cents) {
            return Err(BankError::InsufficientFunds);
        }
        let source_balance_cents = source.balance_cents();

        let dest = ledger
            .accounts
            .get_mut(to_account_no)
            .ok_or(BankError::NotFound)?;
        dest.credit(amount_cents);
        let dest_balance_cents = dest.balance_cents();

        Ok(TransferOutcome {
            source_balance_cents,
            dest_balance_cents,
        })
    }

    /// Balance of an account without authentication.
    ///
    /// Test and preload accessor only; never called on a client-facing
    /// path.
    #[must_use]
    pub fn peek_balance(&self, account_no: &str) -> Option<i64> {
        self.lock().accounts.get(account_no).map(Account::balance_cents)
    }

    /// Number of open accounts.
    #[must_use]
    pub fn account_count(&self) -> usize {
        self.lock().accounts.len()
    }
}
