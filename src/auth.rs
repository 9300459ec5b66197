use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{PgWireError, PgWireResult};

use crate::observability::AUTH_FAILURES_TOTAL;

/// Single-account cleartext credentials. Logins under any other user name
/// are refused before the password exchange.
#[derive(Debug)]
pub struct RoomBookAuthSource {
    user: String,
    password: String,
}

impl RoomBookAuthSource {
    pub fn new(user: String, password: String) -> Self {
        Self { user, password }
    }

    fn accepts(&self, login: &LoginInfo) -> bool {
        login.user().is_some_and(|u| u == self.user)
    }
}

#[async_trait]
impl AuthSource for RoomBookAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        if !self.accepts(login) {
            metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
            let user = login.user().unwrap_or_default().to_string();
            tracing::warn!("login refused for unknown user {user:?}");
            return Err(PgWireError::InvalidPassword(user));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
