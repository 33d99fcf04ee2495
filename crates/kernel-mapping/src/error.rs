//! Errors surfaced by the mapping core and its registries.

/// Error type for kernel mapping operations.
#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    /// The registry does not know this kernel id.
    #[error("Kernel does not exist: {kernel_id}")]
    KernelNotFound { kernel_id: String },

    /// The registry could not launch a kernel.
    #[error("Failed to start kernel: {0:#}")]
    KernelStart(anyhow::Error),

    /// Any other registry failure, passed through with its own detail.
    #[error("Kernel registry error: {0:#}")]
    Registry(anyhow::Error),
}

impl MappingError {
    pub fn not_found(kernel_id: impl Into<String>) -> Self {
        MappingError::KernelNotFound {
            kernel_id: kernel_id.into(),
        }
    }

    /// HTTP status an adapter should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            MappingError::KernelNotFound { .. } => 404,
            MappingError::KernelStart(_) | MappingError::Registry(_) => 500,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, MappingError::KernelNotFound { .. })
    }
}
