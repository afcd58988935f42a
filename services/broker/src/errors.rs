// Error taxonomy surfaced to clients. Every handler failure maps onto one
// of these; none of them escape the handler boundary.
use serde::Serialize;

/// Error reply sent to clients as a JSON envelope. `status` is the HTTP-style
/// family, `code` distinguishes variants inside a family.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("{message} (status {status})")]
pub struct ErrorReply {
    #[serde(rename = "req", skip_serializing_if = "Option::is_none")]
    pub request: Option<u16>,
    pub status: u16,
    pub code: u16,
    pub message: &'static str,
}

impl ErrorReply {
    const fn new(status: u16, code: u16, message: &'static str) -> Self {
        Self {
            request: None,
            status,
            code,
            message,
        }
    }

    pub const fn bad_request() -> Self {
        Self::new(400, 400, "the request was invalid or cannot be otherwise served")
    }

    pub const fn unauthorized() -> Self {
        Self::new(401, 401, "the security key provided is not authorized to perform this operation")
    }

    pub const fn unauthorized_ext() -> Self {
        Self::new(
            401,
            4011,
            "the security key provided is not able to be extended or used directly",
        )
    }

    pub const fn forbidden() -> Self {
        Self::new(403, 403, "the request is understood, but it has been refused or access is not allowed")
    }

    pub const fn not_found() -> Self {
        Self::new(404, 404, "the resource requested does not exist")
    }

    pub const fn link_invalid() -> Self {
        Self::new(400, 4001, "the link name is invalid, it must be alphanumeric and up to 2 characters")
    }

    pub const fn server_error() -> Self {
        Self::new(500, 500, "an unexpected condition was encountered while serving the request")
    }

    pub fn for_request(&mut self, id: u16) {
        self.request = Some(id);
    }
}
