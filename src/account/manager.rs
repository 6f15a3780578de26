use super::*;

/// Decides whether a pool serves a host.
pub type PoolMatcher = Box<dyn Fn(&Host) -> bool + Send + Sync>;

/// Routes credential requests to one of several pools.
///
/// Pools registered with a matcher are consulted in registration order;
/// the first pool whose matcher accepts a host serves it. Hosts that no
/// matcher accepts are served by the default pool.
pub struct AccountManager {
    default_pool: RwLock<Arc<AccountPool>>,
    pools: RwLock<Vec<(PoolMatcher, Arc<AccountPool>)>>,
}

impl Default for AccountManager {
    fn default() -> Self {
        Self {
            default_pool: RwLock::new(Arc::new(AccountPool::new())),
            pools: RwLock::new(Vec::new()),
        }
    }
}

impl AccountManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the pool used for hosts no matcher accepts.
    pub fn default_pool(&self) -> Arc<AccountPool> {
        self.default_pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Registers a pool.
    ///
    /// Without a matcher the pool replaces the default pool.
    pub fn add_pool(&self, pool: Arc<AccountPool>, matcher: Option<PoolMatcher>) {
        match matcher {
            Some(matcher) => {
                debug!("Adding matched pool with {} accounts", pool.n_accounts());
                self.pools
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push((matcher, pool));
            }
            None => {
                debug!("Replacing default pool ({} accounts)", pool.n_accounts());
                *self
                    .default_pool
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = pool;
            }
        }
    }

    /// Adds an account to the default pool.
    pub fn add_account(&self, account: impl Into<Arc<Account>>) -> Arc<Account> {
        self.default_pool().add_account(account)
    }

    fn all_pools(&self) -> Vec<Arc<AccountPool>> {
        let mut pools = vec![self.default_pool()];
        pools.extend(
            self.pools
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .map(|(_, pool)| pool.clone()),
        );
        pools
    }

    /// Returns the pool that serves `host`.
    pub fn pool_for(&self, host: &Host) -> Arc<AccountPool> {
        let matched = self
            .pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(matcher, _)| matcher(host))
            .map(|(_, pool)| pool.clone());
        matched.unwrap_or_else(|| self.default_pool())
    }

    /// Looks up an account in every pool.
    pub fn get_account_from_hash(&self, hash: &AccountHash) -> Option<Arc<Account>> {
        self.all_pools()
            .iter()
            .find_map(|pool| pool.get_account_from_hash(hash))
    }

    /// Blocks until the given account is free in whichever pool holds it.
    pub fn acquire_account(
        &self,
        account: &Account,
        owner: Option<&str>,
    ) -> Result<Arc<Account>, FleetError> {
        let pool = self
            .all_pools()
            .into_iter()
            .find(|pool| pool.has_account(account))
            .ok_or_else(|| FleetError::UnknownAccount(account.name().to_string()))?;
        pool.acquire_account(Some(account), owner)
    }

    /// Acquires an account for a host.
    ///
    /// An account attached to the host is locked by identity; otherwise the
    /// next free account of the pool serving the host is taken.
    pub fn acquire_account_for(
        &self,
        host: &Host,
        owner: Option<&str>,
    ) -> Result<Arc<Account>, FleetError> {
        if let Some(account) = host.account() {
            return self.acquire_account(account, owner);
        }
        self.pool_for(host).acquire_account(None, owner)
    }

    /// Releases everything `owner` holds, in every pool.
    pub fn release_accounts(&self, owner: &str) {
        for pool in self.all_pools() {
            pool.release_accounts(owner);
        }
    }

    /// Fails every blocked acquisition in every pool; see
    /// [`AccountPool::interrupt`].
    pub fn interrupt(&self) {
        for pool in self.all_pools() {
            pool.interrupt();
        }
    }

    pub fn resume(&self) {
        for pool in self.all_pools() {
            pool.resume();
        }
    }

    /// Empties every pool and forgets the matched ones.
    pub fn reset(&self) {
        for pool in self.all_pools() {
            pool.reset();
        }
        self.pools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Total number of accounts across all pools.
    pub fn n_accounts(&self) -> usize {
        self.all_pools().iter().map(|pool| pool.n_accounts()).sum()
    }
}

impl fmt::Debug for AccountManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountManager")
            .field("default_pool", &self.default_pool())
            .field(
                "matched_pools",
                &self
                    .pools
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .len(),
            )
            .finish()
    }
}
