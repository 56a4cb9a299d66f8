use thiserror::Error;

pub type AcmeResult<T> = Result<T, AcmeError>;
pub type AutoTlsResult<T> = Result<T, AutoTlsError>;

/// Errors raised by the ACME protocol core (directory, nonce, signed requests,
/// accounts, authorizations, orders).
#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("argument error: {0}")]
    Argument(String),

    #[error("component must be constructed through its async factory method")]
    MustBeInstantiatedViaAsyncFactoryMethod,

    #[error("unsupported identity type: {0}")]
    UnsupportedIdentityType(String),

    #[error("component is not initialised")]
    NotInitialised,

    #[error("no account has been set on this request")]
    AccountNotSet,

    #[error("acme server rejected the request: {0}")]
    Request(String),

    #[error("missing expected field in server response: {0}")]
    MissingExpectedField(&'static str),

    #[error("missing expected header in server response: {0}")]
    MissingExpectedHeader(&'static str),

    #[error("could not parse certificate: {0}")]
    CertificateParse(String),

    #[error("timed out waiting for {0} to reach a terminal state")]
    PollTimeout(&'static str),

    #[error("domains must be a non-empty list of hostnames")]
    DomainsArrayIsNotAnArrayOfStrings,

    #[error("{0}")]
    InvalidState(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Opaque wrapper around cryptographic failures from `ring`/`rsa`/`rcgen`, which do not
/// themselves implement `std::error::Error` uniformly.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct CryptoError(pub String);

impl CryptoError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Errors raised by the AutoTLS integration layer (SNI hook, OCSP stapling, the HTTP
/// front door, and certificate renewal scheduling).
#[derive(Debug, Error)]
pub enum AutoTlsError {
    #[error(transparent)]
    Acme(#[from] AcmeError),

    #[error("{0} is not a domain served by this AutoTLS instance")]
    SniIgnoreUnsupportedDomain(String),

    #[error("certificate renewal failed and the certificate has since expired: {0}")]
    RenewalFailed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tls configuration error: {0}")]
    Tls(String),
}
