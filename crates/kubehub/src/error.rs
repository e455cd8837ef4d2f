use kube::error::ErrorResponse;

/// Failures talking to the resource store.
///
/// `NotFound` and `AlreadyExists` are the only conditions callers branch on;
/// everything else travels as `Transport`.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound { kind: String, namespace: String, name: String },
    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists { kind: String, namespace: String, name: String },
    #[error("manifest is missing metadata.{0}")]
    MissingIdentity(&'static str),
    #[error("encoding manifest: {0}")]
    Codec(#[from] serde_json::Error),
    #[error(transparent)]
    Transport(kube::Error),
}

impl StoreError {
    /// Classify a kube error for the object `kind namespace/name`.
    pub fn from_kube(err: kube::Error, kind: &str, namespace: &str, name: &str) -> Self {
        match &err {
            kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound {
                kind: kind.to_string(),
                namespace: namespace.to_string(),
                name: name.to_string(),
            },
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => StoreError::AlreadyExists {
                kind: kind.to_string(),
                namespace: namespace.to_string(),
                name: name.to_string(),
            },
            _ => StoreError::Transport(err),
        }
    }

    /// Build a store error from a raw API status, classified like a real response.
    pub fn api(code: u16, reason: &str, message: &str, kind: &str, namespace: &str, name: &str) -> Self {
        let resp = ErrorResponse {
            status: "Failure".to_string(),
            message: message.to_string(),
            reason: reason.to_string(),
            code,
        };
        Self::from_kube(kube::Error::Api(resp), kind, namespace, name)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }

    /// HTTP status code for API rejections, if any.
    pub fn code(&self) -> Option<u16> {
        match self {
            StoreError::NotFound { .. } => Some(404),
            StoreError::AlreadyExists { .. } => Some(409),
            StoreError::Transport(kube::Error::Api(ae)) => Some(ae.code),
            _ => None,
        }
    }
}
