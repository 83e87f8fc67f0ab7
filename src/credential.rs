//! Application credentials shared by the stream and open API clients.

use secrecy::SecretString;

/// Client id and secret issued for an application.
///
/// The secret stays wrapped in [`SecretString`] so it never ends up in debug
/// output or logs.
#[derive(Clone, Debug)]
pub struct Credential {
    /// Application key / client id.
    pub client_id: String,
    /// Application secret / client secret.
    pub client_secret: SecretString,
}

impl Credential {
    /// Creates a credential from a client id and secret.
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: SecretString::new(client_secret.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use secrecy::ExposeSecret;

    use super::Credential;

    #[test]
    fn debug_output_redacts_secret() {
        let credential = Credential::new("ding-app", "super-secret");
        let rendered = format!("{credential:?}");
        assert!(rendered.contains("ding-app"));
        assert!(!rendered.contains("super-secret"));
        assert_eq!(credential.client_secret.expose_secret(), "super-secret");
    }
}
