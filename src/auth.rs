use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::observability::AUTH_FAILURES_TOTAL;
use crate::tenant::wal_stem;

/// One shared password for every agency. The database named at login picks
/// the agency, so a name that can never become a tenant is refused here
/// rather than on the first statement.
#[derive(Debug)]
pub struct AgencyAuthSource {
    password: String,
}

impl AgencyAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

fn refuse(code: &str, message: String) -> PgWireError {
    metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
    PgWireError::UserError(Box::new(ErrorInfo::new("FATAL".into(), code.into(), message)))
}

#[async_trait]
impl AuthSource for AgencyAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let Some(database) = login.database() else {
            return Err(refuse("3D000", "no agency database given".into()));
        };
        if let Err(e) = wal_stem(database) {
            tracing::debug!(database, error = %e, "login refused");
            return Err(refuse("3D000", format!("agency \"{database}\" is not usable: {e}")));
        }
        tracing::debug!(user = ?login.user(), database, "password lookup");
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
