/// A `Result` alias where the `Err` case is `gantry_core::Error`.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid {resource_type} {resource_name:?}: {message}")]
    InvalidXds {
        resource_type: &'static str,
        resource_name: String,
        message: String,
    },

    #[error("failed to encode xDS: {0}")]
    Encode(#[from] prost::EncodeError),

    #[error("failed to serialize bootstrap: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to run envoy: {0}")]
    Io(#[from] std::io::Error),

    /// Envoy ran and refused the bootstrap. Carries everything Envoy printed
    /// and the exact config it was given.
    #[error("envoy validation mode output: {output}, exit code: {exit_code:?}")]
    Rejected {
        exit_code: Option<i32>,
        output: String,
        bootstrap: String,
    },
}

impl Error {
    pub(crate) fn invalid_xds(
        resource_type: &'static str,
        resource_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidXds {
            resource_type,
            resource_name: resource_name.into(),
            message: message.into(),
        }
    }

    /// Returns `true` if this error came from Envoy refusing a config, as
    /// opposed to the control plane failing to produce or deliver one.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Error::Rejected { .. })
    }
}
