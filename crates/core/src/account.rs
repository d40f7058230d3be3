//! Account / AccountsDatabase: the RPC authentication and rights layer.

use std::collections::HashMap;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

/// Rights are a bitmask of coarse RPC capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rights(pub u32);

impl Rights {
    pub const NONE: Rights = Rights(0);
    pub const CLEAR: Rights = Rights(1 << 0);
    pub const DETACH: Rights = Rights(1 << 1);
    pub const SET_PARAMETERS: Rights = Rights(1 << 2);
    pub const GET: Rights = Rights(1 << 3);
    pub const RESTART: Rights = Rights(1 << 4);
    pub const INSPECT_BASIC_INFO: Rights = Rights(1 << 5);
    pub const INSPECT_SENSITIVE_INFO: Rights = Rights(1 << 6);
    pub const INSPECT_REQUESTS: Rights = Rights(1 << 7);
    pub const INSPECT_BACKTRACES: Rights = Rights(1 << 8);
    pub const EXIT: Rights = Rights(1 << 9);

    pub const ALL: Rights = Rights(
        Rights::CLEAR.0
            | Rights::DETACH.0
            | Rights::SET_PARAMETERS.0
            | Rights::GET.0
            | Rights::RESTART.0
            | Rights::INSPECT_BASIC_INFO.0
            | Rights::INSPECT_SENSITIVE_INFO.0
            | Rights::INSPECT_REQUESTS.0
            | Rights::INSPECT_BACKTRACES.0
            | Rights::EXIT.0,
    );

    pub fn contains(&self, other: Rights) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: Rights) -> Rights {
        Rights(self.0 | other.0)
    }
}

impl std::ops::BitOr for Rights {
    type Output = Rights;
    fn bitor(self, rhs: Rights) -> Rights {
        self.union(rhs)
    }
}

#[derive(Debug, Clone)]
pub struct Account {
    pub username: String,
    password_or_hash: String,
    hashed: bool,
    pub rights: Rights,
}

impl Account {
    pub fn with_plain_password(
        username: impl Into<String>,
        password: impl Into<String>,
        rights: Rights,
    ) -> Self {
        Account {
            username: username.into(),
            password_or_hash: password.into(),
            hashed: false,
            rights,
        }
    }

    pub fn with_hashed_password(
        username: impl Into<String>,
        password_hash_hex: impl Into<String>,
        rights: Rights,
    ) -> Self {
        Account {
            username: username.into(),
            password_or_hash: password_hash_hex.into(),
            hashed: true,
            rights,
        }
    }

    fn hash(password: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(password.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Constant-time-ish comparison: for the hashed path we compare fixed
    /// length hex digests with a constant-time loop; for the plaintext
    /// path we still avoid short-circuiting on the first differing byte.
    pub fn check_password(&self, submitted: &str) -> bool {
        let candidate = if self.hashed {
            Self::hash(submitted)
        } else {
            submitted.to_string()
        };
        constant_time_eq(candidate.as_bytes(), self.password_or_hash.as_bytes())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// In-memory username -> Account map, guarded by a single mutex.
///
/// Independent of the pool lock.
#[derive(Default)]
pub struct AccountsDatabase {
    accounts: Mutex<HashMap<String, Account>>,
}

impl AccountsDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, account: Account) {
        self.accounts
            .lock()
            .insert(account.username.clone(), account);
    }

    pub fn remove(&self, username: &str) -> Option<Account> {
        self.accounts.lock().remove(username)
    }

    /// Authenticate a username/password pair. Returns the account's rights
    /// on success. Looking up a missing username and checking a wrong
    /// password both simply return `None` — the caller must not
    /// distinguish the two in its reply (see MessageServer login flow).
    pub fn authenticate(&self, username: &str, password: &str) -> Option<Rights> {
        let accounts = self.accounts.lock();
        let account = accounts.get(username)?;
        if account.check_password(password) {
            Some(account.rights)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plaintext_round_trip() {
        let db = AccountsDatabase::new();
        db.add(Account::with_plain_password(
            "alice",
            "s3cret",
            Rights::GET,
        ));
        assert_eq!(db.authenticate("alice", "s3cret"), Some(Rights::GET));
        assert_eq!(db.authenticate("alice", "wrong"), None);
        assert_eq!(db.authenticate("bob", "s3cret"), None);
    }

    #[test]
    fn hashed_round_trip() {
        let hash = Account::hash("s3cret");
        let db = AccountsDatabase::new();
        db.add(Account::with_hashed_password(
            "alice",
            hash,
            Rights::GET | Rights::CLEAR,
        ));
        let rights = db.authenticate("alice", "s3cret").unwrap();
        assert!(rights.contains(Rights::GET));
        assert!(rights.contains(Rights::CLEAR));
        assert_eq!(db.authenticate("alice", "wrong"), None);
    }

    #[test]
    fn rights_union_and_contains() {
        let r = Rights::GET | Rights::RESTART;
        assert!(r.contains(Rights::GET));
        assert!(r.contains(Rights::RESTART));
        assert!(!r.contains(Rights::CLEAR));
    }
}
