use std::error::Error;
use std::fmt;

/// Crate-wide error taxonomy. One variant per error kind named in the
/// error handling design; every variant carries the context needed to
/// reconstruct a sanitized, client-facing message without re-deriving it
/// at the call site.
#[derive(Debug, Clone)]
pub enum OrchestratorError {
    InvalidWorkflow(String),
    UnresolvedReference { node_id: String, token: String },
    WorkerUnreachable { worker: String, detail: String },
    WorkerProtocolError { worker: String, detail: String },
    ToolError { worker: String, tool: String, body: String },
    UntrustedPublisher { publisher_id: String },
    InvalidSignature { package: String },
    ChecksumMismatch { package: String },
    LlmAuthError(String),
    LlmQuota(String),
    LlmTimeout(String),
    LlmBlocked(String),
    MaxIterationsExceeded { agent_id: String, iterations: u32 },
    ExecutionCancelled,
    NotFound(String),
    Io(String),
    Serialization(String),
}

impl OrchestratorError {
    /// Stable string discriminator, used as the `kind` field of the
    /// streaming `error` event and in tests asserting S5/S6-style
    /// scenarios.
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::InvalidWorkflow(_) => "invalid_workflow",
            OrchestratorError::UnresolvedReference { .. } => "unresolved_reference",
            OrchestratorError::WorkerUnreachable { .. } => "worker_unreachable",
            OrchestratorError::WorkerProtocolError { .. } => "worker_protocol_error",
            OrchestratorError::ToolError { .. } => "tool_error",
            OrchestratorError::UntrustedPublisher { .. } => "untrusted_publisher",
            OrchestratorError::InvalidSignature { .. } => "invalid_signature",
            OrchestratorError::ChecksumMismatch { .. } => "checksum_mismatch",
            OrchestratorError::LlmAuthError(_) => "llm_auth_error",
            OrchestratorError::LlmQuota(_) => "llm_quota",
            OrchestratorError::LlmTimeout(_) => "llm_timeout",
            OrchestratorError::LlmBlocked(_) => "llm_blocked",
            OrchestratorError::MaxIterationsExceeded { .. } => "max_iterations_exceeded",
            OrchestratorError::ExecutionCancelled => "execution_cancelled",
            OrchestratorError::NotFound(_) => "not_found",
            OrchestratorError::Io(_) => "io_error",
            OrchestratorError::Serialization(_) => "serialization_error",
        }
    }

    /// Strips anything that looks like a local filesystem path and caps
    /// length, so internal layout never leaks to a client.
    pub fn sanitized_message(&self) -> String {
        let raw = self.to_string();
        let mut cleaned = String::with_capacity(raw.len());
        for line in raw.lines() {
            if line.contains("/root/") || line.contains("C:\\") {
                cleaned.push_str("[path redacted]");
            } else {
                cleaned.push_str(line);
            }
            cleaned.push(' ');
        }
        match cleaned.char_indices().nth(500) {
            Some((byte_idx, _)) => cleaned.truncate(byte_idx),
            None => {}
        }
        cleaned
    }
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorError::InvalidWorkflow(msg) => write!(f, "invalid workflow: {}", msg),
            OrchestratorError::UnresolvedReference { node_id, token } => {
                write!(f, "node '{}' has an unresolved reference: {}", node_id, token)
            }
            OrchestratorError::WorkerUnreachable { worker, detail } => {
                write!(f, "worker '{}' unreachable: {}", worker, detail)
            }
            OrchestratorError::WorkerProtocolError { worker, detail } => {
                write!(f, "worker '{}' returned an invalid response: {}", worker, detail)
            }
            OrchestratorError::ToolError { worker, tool, body } => {
                write!(f, "tool '{}/{}' failed: {}", worker, tool, body)
            }
            OrchestratorError::UntrustedPublisher { publisher_id } => {
                write!(f, "publisher '{}' is not in the trusted keyring", publisher_id)
            }
            OrchestratorError::InvalidSignature { package } => {
                write!(f, "signature verification failed for package '{}'", package)
            }
            OrchestratorError::ChecksumMismatch { package } => {
                write!(f, "checksum mismatch for package '{}'", package)
            }
            OrchestratorError::LlmAuthError(msg) => write!(f, "LLM auth error: {}", msg),
            OrchestratorError::LlmQuota(msg) => write!(f, "LLM quota exceeded: {}", msg),
            OrchestratorError::LlmTimeout(msg) => write!(f, "LLM call timed out: {}", msg),
            OrchestratorError::LlmBlocked(msg) => write!(f, "LLM response blocked: {}", msg),
            OrchestratorError::MaxIterationsExceeded { agent_id, iterations } => write!(
                f,
                "agent '{}' exceeded its iteration budget of {}",
                agent_id, iterations
            ),
            OrchestratorError::ExecutionCancelled => write!(f, "execution was cancelled"),
            OrchestratorError::NotFound(what) => write!(f, "not found: {}", what),
            OrchestratorError::Io(msg) => write!(f, "I/O error: {}", msg),
            OrchestratorError::Serialization(msg) => write!(f, "serialization error: {}", msg),
        }
    }
}

impl Error for OrchestratorError {}

impl From<std::io::Error> for OrchestratorError {
    fn from(e: std::io::Error) -> Self {
        OrchestratorError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(e: serde_json::Error) -> Self {
        OrchestratorError::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for OrchestratorError {
    fn from(e: reqwest::Error) -> Self {
        OrchestratorError::WorkerUnreachable {
            worker: "unknown".to_string(),
            detail: e.to_string(),
        }
    }
}
