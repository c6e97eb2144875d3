use modgate_core::UserId;

/// An already-authenticated identity handed to the engine by the auth layer.
///
/// The engine never inspects the token; it only forwards it as a bearer
/// credential when loading permissions.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    user_id: UserId,
    token: String,
}

impl Session {
    pub fn new(user_id: UserId, token: impl Into<String>) -> Self {
        Self {
            user_id,
            token: token.into(),
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn bearer_token(&self) -> &str {
        &self.token
    }
}

impl core::fmt::Debug for Session {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("token", &"<redacted>")
            .finish()
    }
}
