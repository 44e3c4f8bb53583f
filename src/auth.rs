use crate::engine::{AuthError, Engine};
use crate::model::User;

/// Connection login: a shared secret plus the email of a registered user.
#[derive(Debug, Clone)]
pub struct Authenticator {
    password: String,
}

impl Authenticator {
    pub fn new(password: String) -> Self {
        Self { password }
    }

    /// Resolve the user a connection acts as. Unknown emails and wrong
    /// secrets fail the same way.
    pub fn login(&self, engine: &Engine, email: &str, password: &str) -> Result<User, AuthError> {
        if !constant_time_eq::constant_time_eq(self.password.as_bytes(), password.as_bytes()) {
            return Err(AuthError::NotAuthenticated);
        }
        engine
            .find_user_by_email(email)
            .ok_or(AuthError::NotAuthenticated)
    }
}
