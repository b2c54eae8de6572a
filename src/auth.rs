use std::collections::HashSet;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Shared cleartext password for every connecting user.
#[derive(Debug)]
pub struct SlotbookAuthSource {
    password: String,
}

impl SlotbookAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for SlotbookAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

/// Identities allowed to create slots and cancel bookings.
///
/// An empty list privileges nobody.
#[derive(Debug, Default, Clone)]
pub struct Operators {
    names: HashSet<String>,
}

impl Operators {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_privileged(&self, identity: &str) -> bool {
        self.names.contains(identity)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
