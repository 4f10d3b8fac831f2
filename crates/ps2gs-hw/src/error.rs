use thiserror::Error;

/// Errors surfaced by the GS device and its backends.
///
/// Precondition violations (unsupported selector combinations, full barrier
/// requests) are not represented here; they trip an `assert!` instead.
#[derive(Debug, Error)]
pub enum GsError {
    #[error("failed to create {what}: {reason}")]
    ResourceCreation { what: &'static str, reason: String },

    #[error("{what} overflow: requested {requested} bytes, capacity is {capacity} bytes")]
    CapacityExceeded {
        what: &'static str,
        requested: u64,
        capacity: u64,
    },

    #[error("shader compilation failed for entry point `{entry_point}`: {message}")]
    ShaderCompile { entry_point: String, message: String },

    #[error("shader source `{0}` is not available")]
    MissingShaderSource(String),

    #[error("exclusive fullscreen mode was lost")]
    DeviceTransient,

    #[error("device lost: {0}")]
    DeviceLost(String),

    #[error("{0} is not supported by this backend")]
    Unsupported(&'static str),

    #[error("invalid {kind} handle {id}")]
    InvalidHandle { kind: &'static str, id: u32 },

    #[error("backend error: {0}")]
    Backend(String),
}

impl GsError {
    /// Errors that indicate the native device is gone and must be recreated.
    pub fn is_fatal(&self) -> bool {
        matches!(self, GsError::DeviceLost(_))
    }

    pub(crate) fn resource(what: &'static str, reason: impl Into<String>) -> Self {
        GsError::ResourceCreation {
            what,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_message_names_the_stream() {
        let err = GsError::CapacityExceeded {
            what: "vertex stream",
            requested: 64,
            capacity: 32,
        };
        assert_eq!(
            err.to_string(),
            "vertex stream overflow: requested 64 bytes, capacity is 32 bytes"
        );
        assert!(!err.is_fatal());
        assert!(GsError::DeviceLost("surface".into()).is_fatal());
    }
}
