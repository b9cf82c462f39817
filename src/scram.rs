//! SCRAM-SHA-256 client (RFC 5802, RFC 7677) as PostgreSQL uses it.
//!
//! Channel binding is not offered (`n,,` GS2 header); PostgreSQL accepts
//! that unless the server demands `SCRAM-SHA-256-PLUS`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Length of the random part of the client nonce, before base64.
const NONCE_LEN: usize = 18;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScramError {
    #[error("malformed SCRAM message from server")]
    InvalidServerMessage,
    #[error("invalid salt encoding")]
    InvalidSalt,
    #[error("invalid iteration count")]
    InvalidIterations,
    #[error("server-first-message lacks the {0} attribute")]
    MissingAttribute(char),
    #[error("server nonce does not extend the client nonce")]
    NonceVerificationFailed,
    #[error("malformed server signature")]
    InvalidServerSignature,
    #[error("server signature does not match")]
    ServerSignatureVerificationFailed,
    #[error("server reported SCRAM error: {0}")]
    Server(String),
    #[error("server-final-message before server-first-message")]
    InvalidState,
    #[error("key derivation failed")]
    KeyDerivation,
}

/// Attributes of a server-first-message.
struct ServerFirst<'a> {
    nonce: &'a str,
    salt: Vec<u8>,
    iterations: u32,
}

impl<'a> ServerFirst<'a> {
    /// `r=<nonce>,s=<salt>,i=<iterations>`, extensions ignored.
    fn parse(message: &'a str) -> Result<Self, ScramError> {
        let (mut nonce, mut salt, mut iterations) = (None, None, None);

        for attribute in message.split(',') {
            match attribute.split_once('=') {
                Some(("r", value)) => nonce = Some(value),
                Some(("s", value)) => {
                    salt = Some(BASE64.decode(value).map_err(|_| ScramError::InvalidSalt)?)
                }
                Some(("i", value)) => {
                    let count = value.parse::<u32>().map_err(|_| ScramError::InvalidIterations)?;
                    if count == 0 {
                        return Err(ScramError::InvalidIterations);
                    }
                    iterations = Some(count);
                }
                Some(("e", value)) => return Err(ScramError::Server(value.to_string())),
                Some(_) => {}
                None => return Err(ScramError::InvalidServerMessage),
            }
        }

        Ok(Self {
            nonce: nonce.ok_or(ScramError::MissingAttribute('r'))?,
            salt: salt.ok_or(ScramError::MissingAttribute('s'))?,
            iterations: iterations.ok_or(ScramError::MissingAttribute('i'))?,
        })
    }
}

/// One SCRAM-SHA-256 exchange.
pub struct ScramClient {
    username: String,
    password: String,
    client_nonce: String,
    /// Server signature the server-final-message must carry, known once
    /// the server-first-message has been processed.
    expected_signature: Option<[u8; 32]>,
}

impl ScramClient {
    pub fn new(username: &str, password: &str) -> Self {
        let random: [u8; NONCE_LEN] = rand::thread_rng().gen();
        Self::with_nonce(username, password, &BASE64.encode(random))
    }

    /// Start an exchange with a caller-chosen nonce.
    pub fn with_nonce(username: &str, password: &str, client_nonce: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            client_nonce: client_nonce.to_string(),
            expected_signature: None,
        }
    }

    fn client_first_bare(&self) -> String {
        format!("n={},r={}", sasl_name(&self.username), self.client_nonce)
    }

    /// `n,,n=<user>,r=<client nonce>`
    pub fn client_first_message(&self) -> Vec<u8> {
        format!("n,,{}", self.client_first_bare()).into_bytes()
    }

    /// Answer the server-first-message with the client-final-message
    /// carrying the client proof.
    pub fn process_server_first(&mut self, message: &[u8]) -> Result<Vec<u8>, ScramError> {
        let message = std::str::from_utf8(message).map_err(|_| ScramError::InvalidServerMessage)?;
        let server = ServerFirst::parse(message)?;

        // The server must extend our nonce, not echo it
        if server.nonce.len() <= self.client_nonce.len()
            || !server.nonce.starts_with(&self.client_nonce)
        {
            return Err(ScramError::NonceVerificationFailed);
        }

        let salted = salted_password(&self.password, &server.salt, server.iterations)?;
        let client_key = hmac_sha256(&salted, b"Client Key")?;
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();

        // biws = base64("n,,")
        let without_proof = format!("c=biws,r={}", server.nonce);
        let auth_message = format!("{},{},{}", self.client_first_bare(), message, without_proof);

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes())?;
        let mut proof = client_key;
        proof
            .iter_mut()
            .zip(client_signature)
            .for_each(|(p, s)| *p ^= s);

        let server_key = hmac_sha256(&salted, b"Server Key")?;
        self.expected_signature = Some(hmac_sha256(&server_key, auth_message.as_bytes())?);

        Ok(format!("{without_proof},p={}", BASE64.encode(proof)).into_bytes())
    }

    /// Check the server-final-message: `v=<signature>` or `e=<error>`.
    pub fn verify_server_final(&self, message: &[u8]) -> Result<(), ScramError> {
        let message = std::str::from_utf8(message).map_err(|_| ScramError::InvalidServerMessage)?;
        if let Some(error) = message.strip_prefix("e=") {
            return Err(ScramError::Server(error.to_string()));
        }
        let expected = self.expected_signature.ok_or(ScramError::InvalidState)?;

        // Extensions may follow the verifier
        let signature = message
            .split(',')
            .next()
            .and_then(|v| v.strip_prefix("v="))
            .and_then(|v| BASE64.decode(v).ok())
            .ok_or(ScramError::InvalidServerSignature)?;

        if signature != expected {
            return Err(ScramError::ServerSignatureVerificationFailed);
        }
        Ok(())
    }
}

/// `Hi()` from RFC 5802: PBKDF2 with HMAC-SHA-256.
fn salted_password(password: &str, salt: &[u8], iterations: u32) -> Result<[u8; 32], ScramError> {
    let mut output = [0u8; 32];
    pbkdf2::pbkdf2::<HmacSha256>(password.as_bytes(), salt, iterations, &mut output)
        .map_err(|_| ScramError::KeyDerivation)?;
    Ok(output)
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], ScramError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| ScramError::KeyDerivation)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// Escape a username for the `n=` attribute (RFC 5802 `saslname`).
///
/// PostgreSQL takes the role from the startup packet and ignores this value,
/// so SASLprep normalization is not applied.
fn sasl_name(s: &str) -> String {
    s.replace('=', "=3D").replace(',', "=2C")
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 7677 section 3
    const CLIENT_NONCE: &str = "rOprNGfwEbeRWgbNEkqO";
    const SERVER_FIRST: &str =
        "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";
    const CLIENT_FINAL: &str = "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ=";
    const SERVER_FINAL: &str = "v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=";

    #[test]
    fn test_rfc7677_vector() {
        let mut client = ScramClient::with_nonce("user", "pencil", CLIENT_NONCE);
        assert_eq!(
            client.client_first_message(),
            b"n,,n=user,r=rOprNGfwEbeRWgbNEkqO".to_vec()
        );

        let final_msg = client.process_server_first(SERVER_FIRST.as_bytes()).unwrap();
        assert_eq!(String::from_utf8(final_msg).unwrap(), CLIENT_FINAL);

        client.verify_server_final(SERVER_FINAL.as_bytes()).unwrap();
    }

    #[test]
    fn test_wrong_server_signature() {
        let mut client = ScramClient::with_nonce("user", "pencil", CLIENT_NONCE);
        client.process_server_first(SERVER_FIRST.as_bytes()).unwrap();
        let forged = format!("v={}", BASE64.encode([0u8; 32]));
        assert_eq!(
            client.verify_server_final(forged.as_bytes()),
            Err(ScramError::ServerSignatureVerificationFailed)
        );
    }

    #[test]
    fn test_nonce_must_extend_client_nonce() {
        let mut client = ScramClient::with_nonce("user", "pencil", CLIENT_NONCE);
        let echoed = format!("r={CLIENT_NONCE},s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096");
        assert_eq!(
            client.process_server_first(echoed.as_bytes()),
            Err(ScramError::NonceVerificationFailed)
        );

        let foreign = "r=someoneelse123,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";
        assert_eq!(
            client.process_server_first(foreign.as_bytes()),
            Err(ScramError::NonceVerificationFailed)
        );
    }

    #[test]
    fn test_final_before_first_is_invalid_state() {
        let client = ScramClient::new("user", "pencil");
        assert_eq!(
            client.verify_server_final(SERVER_FINAL.as_bytes()),
            Err(ScramError::InvalidState)
        );
    }

    #[test]
    fn test_server_error_attribute() {
        let client = ScramClient::new("user", "pencil");
        assert_eq!(
            client.verify_server_final(b"e=invalid-proof"),
            Err(ScramError::Server("invalid-proof".to_string()))
        );
    }

    #[test]
    fn test_missing_attribute() {
        let mut client = ScramClient::with_nonce("user", "pencil", CLIENT_NONCE);
        let no_salt = format!("r={CLIENT_NONCE}xyz,i=4096");
        assert_eq!(
            client.process_server_first(no_salt.as_bytes()),
            Err(ScramError::MissingAttribute('s'))
        );
        assert_eq!(
            client.process_server_first(b"r=abc,s=!!!,i=1"),
            Err(ScramError::InvalidSalt)
        );
    }

    #[test]
    fn test_sasl_name_escaping() {
        assert_eq!(sasl_name("a=b,c"), "a=3Db=2Cc");
    }
}
