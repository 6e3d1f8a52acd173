//! Actor identity.

use async_trait::async_trait;
use std::sync::Arc;

use stockledger_core::UserId;

use crate::store::StoreError;

/// Source of the currently authenticated user.
///
/// Returns `Ok(None)` when nobody is signed in. Like the document store, the
/// provider may be remote and can fail with a transport error.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn current_user(&self) -> Result<Option<UserId>, StoreError>;
}

/// Fixed identity, for tests and single-user tools.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StaticIdentity {
    user: Option<UserId>,
}

impl StaticIdentity {
    pub fn signed_in(user: UserId) -> Self {
        Self { user: Some(user) }
    }

    pub fn anonymous() -> Self {
        Self { user: None }
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn current_user(&self) -> Result<Option<UserId>, StoreError> {
        Ok(self.user)
    }
}

#[async_trait]
impl<I> IdentityProvider for Arc<I>
where
    I: IdentityProvider + ?Sized,
{
    async fn current_user(&self) -> Result<Option<UserId>, StoreError> {
        (**self).current_user().await
    }
}
