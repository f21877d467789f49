//! The account lifecycle contract every service connector implements.

use async_trait::async_trait;
use std::collections::BTreeSet;

use crate::error::{ConnectorError, ConnectorResult};
use crate::groups::GroupDiff;
use crate::naming::NamingPolicy;
use crate::types::{
    AccountRef, ExternalAccountState, ProvisionRequest, ProvisionedAccount, ServiceKind,
};

/// Adapter between the hub and one external store.
///
/// Each implementation owns its store client (SQL pool or HTTP client); no
/// two connectors share one.
#[async_trait]
pub trait ServiceConnector: Send + Sync {
    /// The product this connector speaks to.
    fn kind(&self) -> ServiceKind;

    /// Display name for this connector instance.
    fn display_name(&self) -> &str;

    /// Spelling rules for account names in this store.
    fn naming_policy(&self) -> NamingPolicy {
        NamingPolicy::VERBATIM
    }

    /// Test the connection to the external store.
    async fn test_connection(&self) -> ConnectorResult<()>;

    /// Check whether an account with this username exists externally.
    async fn user_exists(&self, username: &str) -> ConnectorResult<bool>;

    /// Lifecycle state of the named account.
    ///
    /// Connectors that support revocation override this to tell revoked
    /// rows apart from active ones.
    async fn account_state(&self, username: &str) -> ConnectorResult<ExternalAccountState> {
        if self.user_exists(username).await? {
            Ok(ExternalAccountState::Active)
        } else {
            Ok(ExternalAccountState::Absent)
        }
    }

    /// Create the account described by `request`.
    ///
    /// Calling this for an account that already exists must not create a
    /// second row: connectors either adopt the existing account (refresh
    /// its e-mail and password, report `adopted = true`) or fail with
    /// [`ConnectorError::ObjectAlreadyExists`].
    async fn create_user(&self, request: &ProvisionRequest) -> ConnectorResult<ProvisionedAccount>;

    /// Delete an account. Returns `Ok(false)` when it was already gone.
    async fn delete_user(&self, account: &AccountRef) -> ConnectorResult<bool>;

    /// Lock an account out without deleting it.
    ///
    /// Returns `Ok(false)` when the account was already gone.
    async fn disable_user(&self, _account: &AccountRef) -> ConnectorResult<bool> {
        Err(ConnectorError::unsupported(self.kind().as_str(), "disable_user"))
    }

    /// Generate and store a fresh password, returning the plaintext once.
    ///
    /// Fails with [`ConnectorError::ObjectNotFound`] when the account does
    /// not exist, distinct from a store failure.
    async fn reset_password(&self, account: &AccountRef) -> ConnectorResult<String>;

    /// Store a caller-chosen password. Same contract as `reset_password`.
    async fn set_password(&self, account: &AccountRef, plaintext: &str)
        -> ConnectorResult<String>;

    /// Make the external membership equal `desired` exactly.
    ///
    /// Returns the diff that was applied; an empty diff means nothing was
    /// written.
    async fn sync_groups(
        &self,
        account: &AccountRef,
        desired: &BTreeSet<String>,
    ) -> ConnectorResult<GroupDiff>;

    /// Update the display name shown in the service.
    async fn sync_nickname(&self, _account: &AccountRef, _nickname: &str) -> ConnectorResult<()> {
        Err(ConnectorError::unsupported(self.kind().as_str(), "sync_nickname"))
    }

    /// Check if the connector is currently healthy.
    fn is_healthy(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopConnector;

    #[async_trait]
    impl ServiceConnector for NoopConnector {
        fn kind(&self) -> ServiceKind {
            ServiceKind::Ips4
        }

        fn display_name(&self) -> &str {
            "noop"
        }

        async fn test_connection(&self) -> ConnectorResult<()> {
            Ok(())
        }

        async fn user_exists(&self, _username: &str) -> ConnectorResult<bool> {
            Ok(false)
        }

        async fn create_user(
            &self,
            request: &ProvisionRequest,
        ) -> ConnectorResult<ProvisionedAccount> {
            Ok(ProvisionedAccount {
                username: request.username.clone(),
                password: None,
                external_id: "1".to_string(),
                adopted: false,
            })
        }

        async fn delete_user(&self, _account: &AccountRef) -> ConnectorResult<bool> {
            Ok(false)
        }

        async fn reset_password(&self, account: &AccountRef) -> ConnectorResult<String> {
            Err(ConnectorError::not_found(account.username.clone()))
        }

        async fn set_password(
            &self,
            _account: &AccountRef,
            plaintext: &str,
        ) -> ConnectorResult<String> {
            Ok(plaintext.to_string())
        }

        async fn sync_groups(
            &self,
            _account: &AccountRef,
            _desired: &BTreeSet<String>,
        ) -> ConnectorResult<GroupDiff> {
            Ok(GroupDiff::default())
        }
    }

    #[tokio::test]
    async fn test_optional_operations_default_to_unsupported() {
        let connector = NoopConnector;
        let account = AccountRef::new("alice", None);

        let err = connector.disable_user(&account).await.unwrap_err();
        assert_eq!(err.error_code(), "UNSUPPORTED");

        let err = connector.sync_nickname(&account, "Alice").await.unwrap_err();
        assert_eq!(err.to_string(), "ips4 does not support sync_nickname");
        assert!(connector.is_healthy());
        assert_eq!(
            connector.account_state("alice").await.unwrap(),
            ExternalAccountState::Absent
        );
        assert_eq!(connector.naming_policy(), NamingPolicy::VERBATIM);
    }
}
