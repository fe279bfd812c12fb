//! SASL credential objects.
//!
//! Credentials are opaque to the engine: the handshake only asks for the
//! mechanism name and the response bytes. Only PLAIN is shipped; a custom
//! mechanism can be supplied as long as the server never sends a challenge
//! (the handshake treats `connection.secure` as an error).

use bytes::Bytes;

/// A SASL mechanism name plus the bytes to answer it with.
#[derive(Debug, Clone)]
pub struct Credentials {
    mechanism: String,
    response: Bytes,
}

impl Credentials {
    /// SASL PLAIN (RFC 4616): `\0user\0password`.
    pub fn plain(username: &str, password: &str) -> Self {
        let mut response = Vec::with_capacity(username.len() + password.len() + 2);
        response.push(0);
        response.extend_from_slice(username.as_bytes());
        response.push(0);
        response.extend_from_slice(password.as_bytes());
        Self {
            mechanism: "PLAIN".to_string(),
            response: Bytes::from(response),
        }
    }

    /// A custom single-shot mechanism.
    pub fn custom(mechanism: impl Into<String>, response: impl Into<Bytes>) -> Self {
        Self {
            mechanism: mechanism.into(),
            response: response.into(),
        }
    }

    /// Mechanism name sent in `start-ok`.
    pub fn mechanism(&self) -> &str {
        &self.mechanism
    }

    /// Response bytes sent in `start-ok`.
    pub fn response(&self) -> Bytes {
        self.response.clone()
    }
}

impl Default for Credentials {
    /// The conventional development default.
    fn default() -> Self {
        Self::plain("guest", "guest")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_response_layout() {
        let creds = Credentials::plain("user", "pass");
        assert_eq!(creds.mechanism(), "PLAIN");
        assert_eq!(&creds.response()[..], b"\0user\0pass");
    }

    #[test]
    fn custom_mechanism_passthrough() {
        let creds = Credentials::custom("EXTERNAL", Bytes::from_static(b""));
        assert_eq!(creds.mechanism(), "EXTERNAL");
        assert!(creds.response().is_empty());
    }
}
