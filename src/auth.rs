//! Authentication handshake as a sans-I/O state machine.
//!
//! The connection feeds every `Authentication*` message (and any error the
//! server sends meanwhile) to [`Authenticator::step`] and writes back the
//! response it yields. No I/O happens here, which keeps the handshake
//! identical for the blocking and async transports.

use bytes::Bytes;

use crate::error::{PgError, PgResult};
use crate::protocol::{BackendMessage, FrontendMessage};
use crate::scram::ScramClient;

const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// Where the handshake stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// Startup sent, waiting for the server to pick a method.
    Requested,
    /// Cleartext password sent.
    Cleartext,
    /// MD5 hash sent.
    Md5,
    /// SASL initial response sent, waiting for the server-first-message.
    SaslInit,
    /// Client-final-message sent, waiting for the server signature.
    SaslContinue,
    /// Server verified, waiting for AuthenticationOk.
    AwaitingOk,
    Ok,
}

/// A message the client must send next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResponse {
    Password(String),
    SaslInitial { mechanism: &'static str, data: Vec<u8> },
    Sasl(Vec<u8>),
}

impl AuthResponse {
    pub fn as_message(&self) -> FrontendMessage<'_> {
        match self {
            AuthResponse::Password(password) => FrontendMessage::Password { password },
            AuthResponse::SaslInitial { mechanism, data } => {
                FrontendMessage::SaslInitialResponse { mechanism, data }
            }
            AuthResponse::Sasl(data) => FrontendMessage::SaslResponse { data },
        }
    }
}

/// Client side of the authentication exchange.
pub struct Authenticator {
    user: String,
    password: Option<String>,
    state: AuthState,
    scram: Option<ScramClient>,
}

impl Authenticator {
    pub fn new(user: &str, password: Option<&str>) -> Self {
        Self {
            user: user.to_string(),
            password: password.map(str::to_string),
            state: AuthState::Requested,
            scram: None,
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == AuthState::Ok
    }

    /// Name of the method the server chose, once known.
    pub fn method(&self) -> &'static str {
        match self.state {
            AuthState::Requested => "pending",
            AuthState::Cleartext => "cleartext",
            AuthState::Md5 => "md5",
            AuthState::SaslInit | AuthState::SaslContinue | AuthState::AwaitingOk => SCRAM_SHA_256,
            AuthState::Ok if self.scram.is_some() => SCRAM_SHA_256,
            AuthState::Ok => "trust",
        }
    }

    /// Consume one server message; return the reply to send, if any.
    ///
    /// Every failure is reported as `PgError::Authentication` with the
    /// underlying cause as its source.
    pub fn step(&mut self, msg: BackendMessage) -> PgResult<Option<AuthResponse>> {
        self.advance(msg).map_err(PgError::into_auth)
    }

    fn advance(&mut self, msg: BackendMessage) -> PgResult<Option<AuthResponse>> {
        match (self.state, msg) {
            (_, BackendMessage::ErrorResponse(err)) => Err(PgError::Server(err)),

            (
                AuthState::Requested
                | AuthState::Cleartext
                | AuthState::Md5
                | AuthState::AwaitingOk,
                BackendMessage::AuthenticationOk,
            ) => {
                self.state = AuthState::Ok;
                Ok(None)
            }

            (AuthState::Requested, BackendMessage::AuthenticationCleartextPassword) => {
                let password = self.require_password()?.to_string();
                self.state = AuthState::Cleartext;
                Ok(Some(AuthResponse::Password(password)))
            }

            (AuthState::Requested, BackendMessage::AuthenticationMD5Password { salt }) => {
                let hash = md5_password(&self.user, self.require_password()?, &salt);
                self.state = AuthState::Md5;
                Ok(Some(AuthResponse::Password(hash)))
            }

            (AuthState::Requested, BackendMessage::AuthenticationSASL { mechanisms }) => {
                // Channel binding (SCRAM-SHA-256-PLUS) is not supported
                if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
                    return Err(PgError::auth(format!(
                        "Server requires unsupported SASL mechanisms: {:?}",
                        mechanisms
                    )));
                }
                let scram = ScramClient::new(&self.user, self.require_password()?);
                let data = scram.client_first_message();
                self.scram = Some(scram);
                self.state = AuthState::SaslInit;
                Ok(Some(AuthResponse::SaslInitial {
                    mechanism: SCRAM_SHA_256,
                    data,
                }))
            }

            (AuthState::SaslInit, BackendMessage::AuthenticationSASLContinue { data }) => {
                let client_final = self
                    .scram_mut()?
                    .process_server_first(&data)
                    .map_err(|e| PgError::auth(e.to_string()))?;
                self.state = AuthState::SaslContinue;
                Ok(Some(AuthResponse::Sasl(client_final)))
            }

            (AuthState::SaslContinue, BackendMessage::AuthenticationSASLFinal { data }) => {
                self.verify_final(&data)?;
                self.state = AuthState::AwaitingOk;
                Ok(None)
            }

            (_, other) => Err(PgError::unexpected(other.tag(), "authenticating")),
        }
    }

    fn require_password(&self) -> PgResult<&str> {
        self.password
            .as_deref()
            .ok_or_else(|| PgError::auth("Password required"))
    }

    fn scram_mut(&mut self) -> PgResult<&mut ScramClient> {
        self.scram
            .as_mut()
            .ok_or_else(|| PgError::auth("SCRAM exchange was not started"))
    }

    fn verify_final(&mut self, data: &Bytes) -> PgResult<()> {
        self.scram_mut()?
            .verify_server_final(data)
            .map_err(|e| PgError::auth(e.to_string()))
    }
}

/// Compute MD5 password hash.
pub fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    // MD5(MD5(password + user) + salt)
    let inner = format!("{}{}", password, user);
    let inner_hash = md5::compute(inner.as_bytes());

    // Convert inner hash to hex string, then append salt bytes
    let inner_hex = format!("{:x}", inner_hash);
    let mut hasher_input = inner_hex.as_bytes().to_vec();
    hasher_input.extend_from_slice(salt);

    let outer_hash = md5::compute(&hasher_input);
    format!("md5{:x}", outer_hash)
}
