use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub const CONNECTION_ESTABLISHED: &str = "Connection established with agent process.";

/// One frame of agent output as relayed to a viewer.
///
/// Serialized with a `type` tag, e.g. `{"type":"stdout","data":"ready\n"}` or
/// `{"type":"exit","code":0}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OutputEvent {
    System {
        data: String,
    },
    Stdout {
        data: String,
    },
    Stderr {
        data: String,
    },
    ModuleError {
        data: String,
    },
    ImportError {
        data: String,
    },
    FileError {
        data: String,
    },
    Exit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<String>,
    },
    Error {
        error: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputKind {
    System,
    Stdout,
    Stderr,
    ModuleError,
    ImportError,
    FileError,
    Exit,
    Error,
}

impl OutputKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::ModuleError => "module-error",
            Self::ImportError => "import-error",
            Self::FileError => "file-error",
            Self::Exit => "exit",
            Self::Error => "error",
        }
    }
}

impl OutputEvent {
    pub fn system(data: impl Into<String>) -> Self {
        Self::System { data: data.into() }
    }

    pub fn connection_established() -> Self {
        Self::system(CONNECTION_ESTABLISHED)
    }

    pub fn stdout(data: impl Into<String>) -> Self {
        Self::Stdout { data: data.into() }
    }

    /// Tags a stderr chunk by sniffing for well-known interpreter failures.
    pub fn from_stderr(data: impl Into<String>) -> Self {
        let data = data.into();
        if data.contains("ModuleNotFoundError") {
            Self::ModuleError { data }
        } else if data.contains("ImportError") {
            Self::ImportError { data }
        } else if data.contains("FileNotFoundError") {
            Self::FileError { data }
        } else {
            Self::Stderr { data }
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
        }
    }

    pub fn kind(&self) -> OutputKind {
        match self {
            Self::System { .. } => OutputKind::System,
            Self::Stdout { .. } => OutputKind::Stdout,
            Self::Stderr { .. } => OutputKind::Stderr,
            Self::ModuleError { .. } => OutputKind::ModuleError,
            Self::ImportError { .. } => OutputKind::ImportError,
            Self::FileError { .. } => OutputKind::FileError,
            Self::Exit { .. } => OutputKind::Exit,
            Self::Error { .. } => OutputKind::Error,
        }
    }

    /// Text payload for output-carrying variants.
    pub fn data(&self) -> Option<&str> {
        match self {
            Self::System { data }
            | Self::Stdout { data }
            | Self::Stderr { data }
            | Self::ModuleError { data }
            | Self::ImportError { data }
            | Self::FileError { data } => Some(data),
            Self::Exit { .. } | Self::Error { .. } => None,
        }
    }

    /// Exit and error end a viewer's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exit { .. } | Self::Error { .. })
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","error":"failed to serialize output event"}"#.to_string()
        })
    }
}
