//! Error types for client operations.

use nimbus_core::CoreError;
use serde::Deserialize;
use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

macro_rules! error_codes {
    ($($(#[$doc:meta])* $name:ident = $code:expr,)+) => {
        /// Error codes reported by the server.
        ///
        /// Codes the client does not recognize map to
        /// [`ErrorCode::OtherCause`].
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(i32)]
        pub enum ErrorCode {
            $($(#[$doc])* $name = $code,)+
        }

        impl ErrorCode {
            /// Maps a numeric code to its variant.
            pub fn from_code(code: i64) -> Self {
                match code {
                    $(c if c == $code => ErrorCode::$name,)+
                    _ => ErrorCode::OtherCause,
                }
            }
        }
    };
}

error_codes! {
    /// Unclassified failure.
    OtherCause = -1,
    /// Server-side failure.
    InternalServerError = 1,
    /// The server could not be reached.
    ConnectionFailed = 100,
    /// The record does not exist or is not readable.
    ObjectNotFound = 101,
    /// The query was malformed.
    InvalidQuery = 102,
    /// Bad class name.
    InvalidClassName = 103,
    /// An object id was required.
    MissingObjectId = 104,
    /// Bad key name.
    InvalidKeyName = 105,
    /// Malformed pointer.
    InvalidPointer = 106,
    /// Malformed JSON in request or response.
    InvalidJson = 107,
    /// Feature disabled.
    CommandUnavailable = 108,
    /// Client used before configuration.
    NotInitialized = 109,
    /// A field was set to the wrong type.
    IncorrectType = 111,
    /// Bad channel name.
    InvalidChannelName = 112,
    /// Push is not configured.
    PushMisconfigured = 115,
    /// The record exceeded the size limit.
    ObjectTooLarge = 116,
    /// The operation is not allowed for clients.
    OperationForbidden = 119,
    /// Result not in cache.
    CacheMiss = 120,
    /// Bad nested key.
    InvalidNestedKey = 121,
    /// Bad file name.
    InvalidFileName = 122,
    /// Bad ACL.
    InvalidAcl = 123,
    /// The request timed out on the server.
    Timeout = 124,
    /// Bad email address.
    InvalidEmailAddress = 125,
    /// Missing content type.
    MissingContentType = 126,
    /// Missing content length.
    MissingContentLength = 127,
    /// Bad content length.
    InvalidContentLength = 128,
    /// File too large.
    FileTooLarge = 129,
    /// File could not be saved.
    FileSaveError = 130,
    /// A unique field already holds the value.
    DuplicateValue = 137,
    /// Bad role name.
    InvalidRoleName = 139,
    /// Quota exceeded.
    ExceededQuota = 140,
    /// Cloud code failed.
    ScriptFailed = 141,
    /// Cloud validation failed.
    ValidationError = 142,
    /// Bad image data.
    InvalidImageData = 150,
    /// An unsaved file was referenced.
    UnsavedFileError = 151,
    /// Bad push time.
    InvalidPushTimeError = 152,
    /// File could not be deleted.
    FileDeleteError = 153,
    /// Rate limited.
    RequestLimitExceeded = 155,
    /// Bad analytics event name.
    InvalidEventName = 160,
    /// Username missing.
    UsernameMissing = 200,
    /// Password missing.
    PasswordMissing = 201,
    /// Username taken.
    UsernameTaken = 202,
    /// Email taken.
    EmailTaken = 203,
    /// Email missing.
    EmailMissing = 204,
    /// Email not found.
    EmailNotFound = 205,
    /// Session missing.
    SessionMissing = 206,
    /// Users must sign up.
    MustCreateUserThroughSignup = 207,
    /// Account already linked.
    AccountAlreadyLinked = 208,
    /// Session token invalid.
    InvalidSessionToken = 209,
    /// Linked id missing.
    LinkedIdMissing = 250,
    /// Linked session invalid.
    InvalidLinkedSession = 251,
    /// Unsupported auth service.
    UnsupportedService = 252,
    /// Several errors at once.
    AggregateError = 600,
    /// File read failed.
    FileReadError = 601,
    /// Cross-domain request failed.
    XDomainRequest = 602,
}

impl ErrorCode {
    /// Numeric code.
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// A failure reported by the transport itself (no usable response).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("transport error: {message}")]
pub struct TransportError {
    /// Error message.
    pub message: String,
}

impl TransportError {
    /// Creates a transport error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Errors that can occur in client operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClientError {
    /// Rejected locally; no request was sent.
    #[error(transparent)]
    Local(#[from] CoreError),

    /// The server (or the path to it) reported a failure.
    #[error("remote error {}: {message}", code.code())]
    Remote {
        /// Error code.
        code: ErrorCode,
        /// Server message.
        message: String,
    },

    /// The record does not exist.
    #[error("{class_name} {id} not found")]
    NotFound {
        /// Class of the record.
        class_name: String,
        /// Requested object id.
        id: String,
    },
}

impl ClientError {
    /// Creates a remote error.
    pub fn remote(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Remote {
            code,
            message: message.into(),
        }
    }

    /// Creates a local validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Local(CoreError::validation(message))
    }

    /// Error code of a remote failure, `None` for local errors.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Local(_) => None,
            ClientError::Remote { code, .. } => Some(*code),
            ClientError::NotFound { .. } => Some(ErrorCode::ObjectNotFound),
        }
    }

    /// Returns true if the error was raised before any request was sent.
    pub fn is_local(&self) -> bool {
        matches!(self, ClientError::Local(_))
    }

    /// Converts an object-not-found remote error into [`ClientError::NotFound`].
    pub(crate) fn not_found_as(self, class_name: &str, id: &str) -> Self {
        match self {
            ClientError::Remote {
                code: ErrorCode::ObjectNotFound,
                ..
            } => ClientError::NotFound {
                class_name: class_name.to_string(),
                id: id.to_string(),
            },
            other => other,
        }
    }
}

impl From<TransportError> for ClientError {
    fn from(err: TransportError) -> Self {
        ClientError::remote(ErrorCode::ConnectionFailed, err.message)
    }
}

impl From<nimbus_codec::CodecError> for ClientError {
    fn from(err: nimbus_codec::CodecError) -> Self {
        ClientError::Local(CoreError::Codec(err))
    }
}

/// Error body returned by the server: `{"code": 101, "error": "..."}`.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default = "unknown_code")]
    pub code: i64,
    #[serde(default)]
    pub error: String,
}

fn unknown_code() -> i64 {
    -1
}
