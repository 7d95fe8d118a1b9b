use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BiometricResult {
    pub success: bool,
    pub error: Option<String>,
}

impl BiometricResult {
    pub fn success() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Platform biometric prompt (Face ID, fingerprint). Hardware access lives
/// in the host app; the session manager only sees the outcome.
#[async_trait]
pub trait BiometricPrompt: Send + Sync {
    async fn authenticate(&self, prompt: &str) -> BiometricResult;
}
