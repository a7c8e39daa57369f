//! Accounts: lookup, first-login creation and the administrative lock.

use rusqlite::{OptionalExtension, Row, TransactionBehavior, params};

use crate::error::StoreError;
use crate::model::{Account, AccountId, Identity, Role};
use crate::store::SqliteStore;

const ACCOUNT_COLUMNS: &str =
    "account_id, external_id, email, display_name, role, balance, locked, created_at";

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    let role: String = row.get(4)?;
    Ok(Account {
        account_id: row.get(0)?,
        external_id: row.get(1)?,
        email: row.get(2)?,
        display_name: row.get(3)?,
        // Unknown roles are treated as the least privileged one.
        role: role.parse().unwrap_or(Role::User),
        balance: row.get(5)?,
        locked: row.get(6)?,
        created_at: row.get(7)?,
    })
}

pub(crate) fn fetch_account(
    conn: &rusqlite::Connection,
    account_id: AccountId,
) -> rusqlite::Result<Option<Account>> {
    conn.query_row(
        &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE account_id = ?1"),
        [account_id],
        account_from_row,
    )
    .optional()
}

impl SqliteStore {
    /// Point lookup without locking.
    pub async fn account(&self, account_id: AccountId) -> Result<Option<Account>, StoreError> {
        self.call(move |conn| Ok(fetch_account(conn, account_id)?))
            .await
    }

    /// Find the account for an external identity, creating it on first login.
    ///
    /// New accounts start unlocked with role `user` and a zero balance.
    pub async fn get_or_create_account(
        &self,
        identity: Identity,
        now: i64,
    ) -> Result<Account, StoreError> {
        self.call(move |conn| {
            let display_name = identity
                .display_name
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| identity.email.clone());

            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let inserted = tx.execute(
                "INSERT INTO accounts (external_id, email, display_name, role, balance, locked, created_at)
                 VALUES (?1, ?2, ?3, ?4, 0, 0, ?5)
                 ON CONFLICT(external_id) DO NOTHING",
                params![
                    identity.external_id,
                    identity.email,
                    display_name,
                    Role::User.as_str(),
                    now
                ],
            )?;
            let account = tx.query_row(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE external_id = ?1"),
                [&identity.external_id],
                account_from_row,
            )?;
            tx.commit()?;

            if inserted > 0 {
                log::info!(
                    "Created account {} for {}",
                    account.account_id,
                    account.email
                );
            }
            Ok(account)
        })
        .await
    }

    /// Administrative lock/unlock. Locked accounts fail admission.
    pub async fn set_locked(&self, account_id: AccountId, locked: bool) -> Result<(), StoreError> {
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE accounts SET locked = ?2 WHERE account_id = ?1",
                params![account_id, locked],
            )?;
            if changed == 0 {
                return Err(StoreError::UnknownAccount(account_id));
            }
            Ok(())
        })
        .await
    }

    pub async fn set_role(&self, account_id: AccountId, role: Role) -> Result<(), StoreError> {
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE accounts SET role = ?2 WHERE account_id = ?1",
                params![account_id, role.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::UnknownAccount(account_id));
            }
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::temp_store;

    fn identity(external_id: &str) -> Identity {
        Identity {
            external_id: external_id.to_string(),
            email: format!("{external_id}@example.com"),
            display_name: None,
        }
    }

    #[tokio::test]
    async fn first_login_creates_account_once() {
        let (_dir, store) = temp_store().await;

        let first = store
            .get_or_create_account(identity("google-1"), 100)
            .await
            .unwrap();
        let again = store
            .get_or_create_account(identity("google-1"), 200)
            .await
            .unwrap();

        assert_eq!(first.account_id, again.account_id);
        assert_eq!(again.created_at, 100);
        assert_eq!(first.balance, 0);
        assert!(!first.locked);
        assert_eq!(first.role, Role::User);
        // Display name falls back to the email.
        assert_eq!(first.display_name, "google-1@example.com");
    }

    #[tokio::test]
    async fn lookup_unknown_account_is_none() {
        let (_dir, store) = temp_store().await;
        assert!(store.account(42).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lock_and_unlock() {
        let (_dir, store) = temp_store().await;
        let account = store
            .get_or_create_account(identity("a"), 0)
            .await
            .unwrap();

        store.set_locked(account.account_id, true).await.unwrap();
        assert!(store.account(account.account_id).await.unwrap().unwrap().locked);

        store.set_locked(account.account_id, false).await.unwrap();
        assert!(!store.account(account.account_id).await.unwrap().unwrap().locked);

        let err = store.set_locked(999, true).await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownAccount(999)));
    }

    #[tokio::test]
    async fn role_can_be_promoted() {
        let (_dir, store) = temp_store().await;
        let account = store
            .get_or_create_account(identity("b"), 0)
            .await
            .unwrap();

        store.set_role(account.account_id, Role::Admin).await.unwrap();
        let reloaded = store.account(account.account_id).await.unwrap().unwrap();
        assert_eq!(reloaded.role, Role::Admin);
    }
}
