//! Identity provider — opaque bearer credential for the current patient.

use secrecy::SecretString;

use crate::error::ConfigError;

/// The only two things the core needs from the identity provider.
pub trait Identity: Send + Sync {
    fn current_user_id(&self) -> &str;
    fn auth_token(&self) -> &SecretString;
}

/// Environment-backed identity for the service process.
pub struct EnvIdentity {
    user_id: String,
    token: SecretString,
}

impl EnvIdentity {
    pub fn from_env() -> Result<Self, ConfigError> {
        let user_id = std::env::var("VITA_PATIENT_ID")
            .map_err(|_| ConfigError::MissingEnvVar("VITA_PATIENT_ID".to_string()))?;
        let token = std::env::var("VITA_AUTH_TOKEN")
            .map_err(|_| ConfigError::MissingEnvVar("VITA_AUTH_TOKEN".to_string()))?;
        Ok(Self {
            user_id,
            token: SecretString::from(token),
        })
    }

    pub fn new(user_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            token: SecretString::from(token.into()),
        }
    }
}

impl Identity for EnvIdentity {
    fn current_user_id(&self) -> &str {
        &self.user_id
    }

    fn auth_token(&self) -> &SecretString {
        &self.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn identity_exposes_user_and_token() {
        let identity = EnvIdentity::new("patient-1", "tok");
        assert_eq!(identity.current_user_id(), "patient-1");
        assert_eq!(identity.auth_token().expose_secret(), "tok");
    }
}
