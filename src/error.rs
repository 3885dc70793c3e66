// Error taxonomy for runtime, swapchain and graphics calls
//
// Runtime calls report a numeric status. Non-negative statuses are successes
// (positive ones are advisory and only logged), negative ones are fatal and
// travel up to the main loop, where the loop exits.

use std::fmt;
use thiserror::Error;

use crate::backend::RenderError;

/// Numeric status reported by the XR runtime (OpenXR numbering).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusCode(pub i32);

impl StatusCode {
    pub const SUCCESS: Self = Self(0);
    pub const TIMEOUT_EXPIRED: Self = Self(1);
    pub const SESSION_LOSS_PENDING: Self = Self(3);
    pub const EVENT_UNAVAILABLE: Self = Self(4);
    pub const SPACE_BOUNDS_UNSUPPORTED: Self = Self(7);
    pub const SESSION_NOT_FOCUSED: Self = Self(8);
    pub const FRAME_DISCARDED: Self = Self(9);

    pub const ERROR_VALIDATION_FAILURE: Self = Self(-1);
    pub const ERROR_RUNTIME_FAILURE: Self = Self(-2);
    pub const ERROR_OUT_OF_MEMORY: Self = Self(-3);
    pub const ERROR_HANDLE_INVALID: Self = Self(-12);
    pub const ERROR_INSTANCE_LOST: Self = Self(-13);
    pub const ERROR_SESSION_RUNNING: Self = Self(-14);
    pub const ERROR_SESSION_NOT_RUNNING: Self = Self(-16);
    pub const ERROR_SESSION_LOST: Self = Self(-17);
    pub const ERROR_LAYER_INVALID: Self = Self(-23);
    pub const ERROR_SWAPCHAIN_FORMAT_UNSUPPORTED: Self = Self(-26);
    pub const ERROR_SESSION_NOT_READY: Self = Self(-28);
    pub const ERROR_SESSION_NOT_STOPPING: Self = Self(-29);
    pub const ERROR_TIME_INVALID: Self = Self(-30);
    pub const ERROR_CALL_ORDER_INVALID: Self = Self(-37);
    pub const ERROR_INDEX_OUT_OF_RANGE: Self = Self(-40);

    pub fn is_success(self) -> bool {
        self.0 >= 0
    }

    pub fn is_advisory(self) -> bool {
        self.0 > 0
    }

    pub fn is_failure(self) -> bool {
        self.0 < 0
    }

    /// Symbolic name for the well-known codes, `None` for anything else.
    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            Self::SUCCESS => "XR_SUCCESS",
            Self::TIMEOUT_EXPIRED => "XR_TIMEOUT_EXPIRED",
            Self::SESSION_LOSS_PENDING => "XR_SESSION_LOSS_PENDING",
            Self::EVENT_UNAVAILABLE => "XR_EVENT_UNAVAILABLE",
            Self::SPACE_BOUNDS_UNSUPPORTED => "XR_SPACE_BOUNDS_UNSUPPORTED",
            Self::SESSION_NOT_FOCUSED => "XR_SESSION_NOT_FOCUSED",
            Self::FRAME_DISCARDED => "XR_FRAME_DISCARDED",
            Self::ERROR_VALIDATION_FAILURE => "XR_ERROR_VALIDATION_FAILURE",
            Self::ERROR_RUNTIME_FAILURE => "XR_ERROR_RUNTIME_FAILURE",
            Self::ERROR_OUT_OF_MEMORY => "XR_ERROR_OUT_OF_MEMORY",
            Self::ERROR_HANDLE_INVALID => "XR_ERROR_HANDLE_INVALID",
            Self::ERROR_INSTANCE_LOST => "XR_ERROR_INSTANCE_LOST",
            Self::ERROR_SESSION_RUNNING => "XR_ERROR_SESSION_RUNNING",
            Self::ERROR_SESSION_NOT_RUNNING => "XR_ERROR_SESSION_NOT_RUNNING",
            Self::ERROR_SESSION_LOST => "XR_ERROR_SESSION_LOST",
            Self::ERROR_LAYER_INVALID => "XR_ERROR_LAYER_INVALID",
            Self::ERROR_SWAPCHAIN_FORMAT_UNSUPPORTED => "XR_ERROR_SWAPCHAIN_FORMAT_UNSUPPORTED",
            Self::ERROR_SESSION_NOT_READY => "XR_ERROR_SESSION_NOT_READY",
            Self::ERROR_SESSION_NOT_STOPPING => "XR_ERROR_SESSION_NOT_STOPPING",
            Self::ERROR_TIME_INVALID => "XR_ERROR_TIME_INVALID",
            Self::ERROR_CALL_ORDER_INVALID => "XR_ERROR_CALL_ORDER_INVALID",
            Self::ERROR_INDEX_OUT_OF_RANGE => "XR_ERROR_INDEX_OUT_OF_RANGE",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({})", name, self.0),
            None => write!(f, "XR_UNKNOWN_RESULT ({})", self.0),
        }
    }
}

/// Outcome of a call that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Success,
    Advisory(StatusCode),
}

impl Completion {
    pub fn is_advisory(self) -> bool {
        matches!(self, Completion::Advisory(_))
    }
}

#[derive(Debug, Error)]
pub enum XrError {
    /// The runtime rejected a call. Never retried: the runtime's verdict is final.
    #[error("{operation} failed: {status}")]
    Runtime {
        operation: &'static str,
        status: StatusCode,
    },

    /// View, swapchain or submission counts disagree, or a required list came back empty.
    #[error("consistency violation: {0}")]
    Consistency(String),

    /// A call was issued out of order (detected before reaching the runtime).
    #[error("protocol violation in {operation}: {detail}")]
    Protocol {
        operation: &'static str,
        detail: String,
    },

    #[error("graphics backend: {0}")]
    Graphics(#[from] RenderError),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl XrError {
    pub fn runtime(operation: &'static str, status: StatusCode) -> Self {
        XrError::Runtime { operation, status }
    }

    pub fn protocol(operation: &'static str, detail: impl Into<String>) -> Self {
        XrError::Protocol {
            operation,
            detail: detail.into(),
        }
    }

    /// Status carried by a runtime failure, if this is one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            XrError::Runtime { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type XrResult<T> = Result<T, XrError>;

/// Classify a raw status returned by `operation`.
///
/// Advisory statuses are logged as warnings and reported as
/// [`Completion::Advisory`]; failures become [`XrError::Runtime`].
pub fn check(operation: &'static str, status: StatusCode) -> XrResult<Completion> {
    if status.is_failure() {
        log::error!("{} failed: {}", operation, status);
        return Err(XrError::runtime(operation, status));
    }
    if status.is_advisory() {
        log::warn!("{} returned {}", operation, status);
        return Ok(Completion::Advisory(status));
    }
    Ok(Completion::Success)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_is_plain_completion() {
        assert_eq!(check("xrBeginFrame", StatusCode::SUCCESS).unwrap(), Completion::Success);
    }

    #[test]
    fn positive_status_is_advisory() {
        let completion = check("xrBeginFrame", StatusCode::FRAME_DISCARDED).unwrap();
        assert_eq!(completion, Completion::Advisory(StatusCode::FRAME_DISCARDED));
        assert!(completion.is_advisory());
    }

    #[test]
    fn negative_status_is_fatal_with_operation_name() {
        let err = check("xrEndFrame", StatusCode::ERROR_SESSION_LOST).unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::ERROR_SESSION_LOST));
        let message = err.to_string();
        assert!(message.contains("xrEndFrame"));
        assert!(message.contains("XR_ERROR_SESSION_LOST (-17)"));
    }

    #[test]
    fn unknown_codes_keep_their_number() {
        assert_eq!(StatusCode(-9999).to_string(), "XR_UNKNOWN_RESULT (-9999)");
        assert!(StatusCode(-9999).is_failure());
        assert!(StatusCode(42).is_advisory());
    }
}
