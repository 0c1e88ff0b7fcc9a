// Account operations for the signed-in learner

use std::sync::Arc;

use super::refresh::RefreshCoordinator;
use super::types::{Credential, CredentialScope, Profile, ValidateResponse};
use crate::error::Result;
use crate::http_client::ApiClient;

pub struct AccountService {
    api: Arc<ApiClient>,
    refresh: Arc<RefreshCoordinator>,
}

impl AccountService {
    pub fn new(api: Arc<ApiClient>, refresh: Arc<RefreshCoordinator>) -> Self {
        Self { api, refresh }
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<Credential> {
        self.refresh
            .login(CredentialScope::User, username, password)
            .await
    }

    /// Ask the backend whether the stored credential is still accepted
    pub async fn validate(&self) -> Result<bool> {
        let path = self.api.endpoints().validate();
        let response: ValidateResponse = self
            .api
            .send_json(CredentialScope::User, self.api.get(&path))
            .await?;
        Ok(response.valid)
    }

    pub async fn profile(&self) -> Result<Profile> {
        let path = self.api.endpoints().profile();
        self.api
            .send_json(CredentialScope::User, self.api.get(&path))
            .await
    }

    pub fn logout(&self) {
        self.refresh.logout(CredentialScope::User, "logged out");
    }
}
