use super::*;

/// Accounts and their lock state, guarded by the pool mutex.
#[derive(Default)]
struct PoolState {
    /// All accounts in insertion order.
    order: Vec<AccountHash>,
    accounts: HashMap<AccountHash, Arc<Account>>,
    /// Unlocked accounts; acquisition takes the head, release pushes to the tail.
    unlocked: VecDeque<AccountHash>,
    /// Locked accounts and their optional owner tag.
    locked: HashMap<AccountHash, Option<String>>,
    owners: HashMap<String, Vec<AccountHash>>,
    /// Set while acquisitions must not wait.
    interrupted: bool,
}

impl PoolState {
    fn lock_account(
        &mut self,
        hash: AccountHash,
        owner: Option<&str>,
    ) -> Result<Arc<Account>, FleetError> {
        let account = self.accounts.get(&hash).cloned().ok_or_else(|| {
            FleetError::InternalServerError(format!("unlocked account {hash} is not pooled"))
        })?;
        self.locked.insert(hash, owner.map(str::to_string));
        if let Some(owner) = owner {
            self.owners.entry(owner.to_string()).or_default().push(hash);
        }
        Ok(account)
    }

    fn unlock_account(&mut self, hash: AccountHash) {
        if self.locked.remove(&hash).is_some() {
            self.unlocked.push_back(hash);
        }
    }
}

/// A thread-safe pool of accounts with exclusive, fairness-ordered access.
///
/// Unlocked accounts form a FIFO queue: an unqualified acquisition always
/// returns the account that has been unlocked the longest, so accounts are
/// handed out round-robin.
#[derive(Default)]
pub struct AccountPool {
    state: Mutex<PoolState>,
    unlocked_cond: Condvar,
}

impl AccountPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a pool holding the given accounts.
    pub fn with_accounts<I>(accounts: I) -> Self
    where
        I: IntoIterator<Item = Account>,
    {
        let pool = Self::new();
        pool.add_accounts(accounts);
        pool
    }

    /// Creates a pool from an external credential store.
    pub fn from_source(source: &dyn CredentialSource) -> Result<Self, FleetError> {
        Ok(Self::with_accounts(source.load_accounts()?))
    }

    /// Adds an account to the unlocked set.
    ///
    /// An account whose identity is already pooled is not duplicated; the
    /// pooled instance is returned instead.
    pub fn add_account(&self, account: impl Into<Arc<Account>>) -> Arc<Account> {
        let account = account.into();
        let hash = account.hash();
        let mut state = lock(&self.state);
        if let Some(existing) = state.accounts.get(&hash) {
            trace!("Account '{}' already pooled", account.name());
            return existing.clone();
        }
        state.order.push(hash);
        state.accounts.insert(hash, account.clone());
        state.unlocked.push_back(hash);
        drop(state);
        self.unlocked_cond.notify_all();
        account
    }

    /// Adds several accounts at once.
    pub fn add_accounts<I>(&self, accounts: I)
    where
        I: IntoIterator<Item = Account>,
    {
        for account in accounts {
            self.add_account(account);
        }
    }

    /// Looks up an account by identity, regardless of its lock state.
    pub fn get_account_from_hash(&self, hash: &AccountHash) -> Option<Arc<Account>> {
        lock(&self.state).accounts.get(hash).cloned()
    }

    /// Looks up the first added account with the given name.
    pub fn get_account_from_name(&self, name: &str) -> Option<Arc<Account>> {
        let state = lock(&self.state);
        state
            .order
            .iter()
            .filter_map(|hash| state.accounts.get(hash))
            .find(|account| account.name() == name)
            .cloned()
    }

    /// Returns true if the account is pooled, locked or not.
    pub fn has_account(&self, account: &Account) -> bool {
        lock(&self.state).accounts.contains_key(&account.hash())
    }

    /// Total number of accounts regardless of lock state.
    pub fn n_accounts(&self) -> usize {
        lock(&self.state).accounts.len()
    }

    /// Number of accounts currently available.
    pub fn n_unlocked(&self) -> usize {
        lock(&self.state).unlocked.len()
    }

    pub fn is_locked(&self, account: &Account) -> bool {
        lock(&self.state).locked.contains_key(&account.hash())
    }

    /// Returns the owner tag of a locked account.
    pub fn owner_of(&self, account: &Account) -> Option<String> {
        lock(&self.state)
            .locked
            .get(&account.hash())
            .cloned()
            .flatten()
    }

    /// Blocks until an account is available, locks it and returns it.
    ///
    /// With `account` set, waits for exactly that account; otherwise takes
    /// the head of the unlocked queue. An account unknown to the pool fails
    /// immediately with [`FleetError::UnknownAccount`].
    pub fn acquire_account(
        &self,
        account: Option<&Account>,
        owner: Option<&str>,
    ) -> Result<Arc<Account>, FleetError> {
        match account {
            Some(account) => self.acquire_account_by_hash(&account.hash(), owner),
            None => self.acquire_next(owner),
        }
    }

    /// Blocks until the account with the given identity is unlocked, then locks it.
    pub fn acquire_account_by_hash(
        &self,
        hash: &AccountHash,
        owner: Option<&str>,
    ) -> Result<Arc<Account>, FleetError> {
        let mut state = lock(&self.state);
        loop {
            if !state.accounts.contains_key(hash) {
                return Err(FleetError::UnknownAccount(hash.to_string()));
            }
            if let Some(pos) = state.unlocked.iter().position(|h| h == hash) {
                state.unlocked.remove(pos);
                let account = state.lock_account(*hash, owner)?;
                debug!("Account '{}' acquired by {:?}", account.name(), owner);
                return Ok(account);
            }
            if state.interrupted {
                return Err(FleetError::AcquisitionInterrupted);
            }
            state = self
                .unlocked_cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn acquire_next(&self, owner: Option<&str>) -> Result<Arc<Account>, FleetError> {
        let mut state = lock(&self.state);
        loop {
            if state.accounts.is_empty() {
                return Err(FleetError::EmptyAccountPool);
            }
            if let Some(hash) = state.unlocked.pop_front() {
                let account = state.lock_account(hash, owner)?;
                debug!("Account '{}' acquired by {:?}", account.name(), owner);
                return Ok(account);
            }
            if state.interrupted {
                return Err(FleetError::AcquisitionInterrupted);
            }
            state = self
                .unlocked_cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Locks the head of the unlocked queue if there is one, without blocking.
    pub fn try_acquire_account(
        &self,
        owner: Option<&str>,
    ) -> Result<Option<Arc<Account>>, FleetError> {
        let mut state = lock(&self.state);
        if state.accounts.is_empty() {
            return Err(FleetError::EmptyAccountPool);
        }
        match state.unlocked.pop_front() {
            Some(hash) => state.lock_account(hash, owner).map(Some),
            None => Ok(None),
        }
    }

    /// Unlocks every account held by `owner`, appending them to the unlocked queue.
    ///
    /// Releasing an owner that holds nothing is a no-op.
    pub fn release_accounts(&self, owner: &str) {
        let mut state = lock(&self.state);
        let Some(hashes) = state.owners.remove(owner) else {
            return;
        };
        for hash in hashes {
            state.unlock_account(hash);
        }
        drop(state);
        debug!("Accounts of {:?} released", owner);
        self.unlocked_cond.notify_all();
    }

    /// Unlocks a single account regardless of its owner.
    pub fn release_account(&self, account: &Account) -> Result<(), FleetError> {
        let hash = account.hash();
        let mut state = lock(&self.state);
        if !state.accounts.contains_key(&hash) {
            return Err(FleetError::UnknownAccount(account.name().to_string()));
        }
        if let Some(Some(owner)) = state.locked.get(&hash).cloned()
            && let Some(held) = state.owners.get_mut(&owner)
        {
            held.retain(|h| *h != hash);
            if held.is_empty() {
                state.owners.remove(&owner);
            }
        }
        state.unlock_account(hash);
        drop(state);
        self.unlocked_cond.notify_all();
        Ok(())
    }

    /// Removes every account from the pool.
    ///
    /// Threads blocked in an acquisition are woken and fail.
    pub fn reset(&self) {
        let mut state = lock(&self.state);
        let interrupted = state.interrupted;
        *state = PoolState {
            interrupted,
            ..PoolState::default()
        };
        drop(state);
        self.unlocked_cond.notify_all();
    }

    /// Wakes every blocked acquisition with
    /// [`FleetError::AcquisitionInterrupted`]. Until
    /// [`resume`](AccountPool::resume), acquisitions that would block fail
    /// the same way; free accounts are still handed out.
    pub fn interrupt(&self) {
        lock(&self.state).interrupted = true;
        debug!("Account pool interrupted");
        self.unlocked_cond.notify_all();
    }

    /// Lets acquisitions wait again after [`interrupt`](AccountPool::interrupt).
    pub fn resume(&self) {
        lock(&self.state).interrupted = false;
    }

    pub fn is_interrupted(&self) -> bool {
        lock(&self.state).interrupted
    }
}

impl fmt::Debug for AccountPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("AccountPool")
            .field("accounts", &state.accounts.len())
            .field("unlocked", &state.unlocked.len())
            .finish()
    }
}
