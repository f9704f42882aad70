//! Client-facing protocol conditions.
//!
//! Internal failures travel as `anyhow::Error`; the conditions below are the
//! ones a client is expected to see and act on. They are wrapped in
//! `anyhow::Error` like everything else and recovered with
//! [`protocol_error`].

/// A condition reported back to the requesting client rather than logged as a
/// system failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("badArgument: {0}")]
    BadArgument(String),
    #[error("badResumptionToken: {0}")]
    BadResumptionToken(String),
    #[error("cannotDisseminateFormat: {0}")]
    CannotDisseminateFormat(String),
    #[error("idDoesNotExist: {0}")]
    IdDoesNotExist(String),
    #[error("noMetadataFormats: {0}")]
    NoMetadataFormats(String),
    #[error("noRecordsMatch: {0}")]
    NoRecordsMatch(String),
    #[error("noSetHierarchy: {0}")]
    NoSetHierarchy(String),
}

impl ProtocolError {
    /// The protocol error code for this condition.
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::BadArgument(_) => "badArgument",
            ProtocolError::BadResumptionToken(_) => "badResumptionToken",
            ProtocolError::CannotDisseminateFormat(_) => "cannotDisseminateFormat",
            ProtocolError::IdDoesNotExist(_) => "idDoesNotExist",
            ProtocolError::NoMetadataFormats(_) => "noMetadataFormats",
            ProtocolError::NoRecordsMatch(_) => "noRecordsMatch",
            ProtocolError::NoSetHierarchy(_) => "noSetHierarchy",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ProtocolError::BadArgument(m)
            | ProtocolError::BadResumptionToken(m)
            | ProtocolError::CannotDisseminateFormat(m)
            | ProtocolError::IdDoesNotExist(m)
            | ProtocolError::NoMetadataFormats(m)
            | ProtocolError::NoRecordsMatch(m)
            | ProtocolError::NoSetHierarchy(m) => m,
        }
    }

    pub fn no_such_format() -> Self {
        ProtocolError::CannotDisseminateFormat("the metadataPrefix is unrecognized".to_string())
    }

    pub fn no_records_match() -> Self {
        ProtocolError::NoRecordsMatch("no records match your selection criteria".to_string())
    }

    pub fn no_set_hierarchy() -> Self {
        ProtocolError::NoSetHierarchy("there are no sets in the repository".to_string())
    }

    pub fn item_does_not_exist() -> Self {
        ProtocolError::IdDoesNotExist("the indicated item does not exist".to_string())
    }

    pub fn bad_format_for_item() -> Self {
        ProtocolError::CannotDisseminateFormat(
            "the indicated item does not support that metadata format".to_string(),
        )
    }

    pub fn no_formats_for_item() -> Self {
        ProtocolError::NoMetadataFormats("the indicated item has no metadata formats".to_string())
    }

    pub fn bad_token(message: &str) -> Self {
        ProtocolError::BadResumptionToken(message.to_string())
    }
}

/// Find the protocol condition carried by an error, if any.
pub fn protocol_error(err: &anyhow::Error) -> Option<&ProtocolError> {
    err.downcast_ref::<ProtocolError>()
}
