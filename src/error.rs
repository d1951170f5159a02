use thiserror::Error;

/// Errors surfaced while loading and validating [`crate::config::AppConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid environment variable {name}: {value}")]
    InvalidEnvVar { name: String, value: String },

    #[error("port range {min}..={max} is invalid (must satisfy 1 <= min <= max <= 65535)")]
    InvalidPortRange { min: u16, max: u16 },

    #[error("maxPorts must be greater than zero")]
    InvalidMaxPorts,

    #[error("threadPoolSize must be greater than zero")]
    InvalidThreadPoolSize,

    #[error("idleThresholdMs must be >= 1000, got {0}")]
    InvalidIdleThreshold(u64),

    #[error("scannerTimeoutMs must be >= 1000, got {0}")]
    InvalidScannerTimeout(u64),

    #[error("bufferSize must be >= 265, got {0}")]
    InvalidBufferSize(usize),
}

/// Errors from [`crate::port_probe::PortProbe`]. A port already bound by
/// another process is reported through `ProbeOutcome::InUse`, not as an
/// error here — it is an ordinary probe result, not a failure.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("socket error probing port {port}: {source}")]
    Socket {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from [`crate::listener::Listener`].
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("port {0} already has an active listener")]
    PortAlreadyInUse(u16),

    #[error("socket error on port {port}: {source}")]
    Socket {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode MAVLink frame on port {port}: {reason}")]
    Decode { port: u16, reason: String },
}

/// Errors from [`crate::persister::Persister`] and [`crate::store::Store`] implementations.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("I/O error persisting state: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error persisting state: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("corrupt record in store: {0}")]
    Corrupt(String),
}

/// The outward-facing error code returned by the HTTP error-surface adapter,
/// per the external `{code, message}` contract. Construction of this surface
/// (HTTP status mapping) is an external collaborator's responsibility; this
/// enum only carries the stable machine-readable codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    PortInUse,
    TelemetryError,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::PortInUse => "PORT_IN_USE",
            ErrorCode::TelemetryError => "TELEMETRY_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl From<&ListenerError> for ErrorCode {
    fn from(err: &ListenerError) -> Self {
        match err {
            ListenerError::PortAlreadyInUse(_) => ErrorCode::PortInUse,
            ListenerError::Decode { .. } => ErrorCode::TelemetryError,
            ListenerError::Socket { .. } => ErrorCode::InternalError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_in_use_maps_to_409_code() {
        let err = ListenerError::PortAlreadyInUse(14550);
        let code: ErrorCode = (&err).into();
        assert_eq!(code.as_str(), "PORT_IN_USE");
    }

    #[test]
    fn decode_error_maps_to_telemetry_error_code() {
        let err = ListenerError::Decode {
            port: 14550,
            reason: "short frame".into(),
        };
        let code: ErrorCode = (&err).into();
        assert_eq!(code.as_str(), "TELEMETRY_ERROR");
    }
}
