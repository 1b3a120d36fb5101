use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    // input
    #[error("empty container URL")]
    EmptyUrl,
    #[error("directory not specified")]
    DirectoryNotSpecified,
    #[error("invalid directory")]
    DirectoryInvalid,
    #[error("failed validation")]
    FailedValidation,
    #[error("nested output directories")]
    NestedOutputDirs,
    #[error("duplicate output directories")]
    DuplicateOutputDirs,
    #[error("environment variable undefined")]
    EnvVarUndefined,
    #[error("invalid JSON")]
    VerboseJson,

    // dependency graph
    #[error("undefined dependency")]
    DependencyTreeUndefDep,
    #[error("undefined target")]
    DependencyTreeUndefTarget,
    #[error("dependency output missing")]
    DependencyOutputMissing,

    // container
    #[error("container is discontinued")]
    ContainerDiscontinued,
    #[error("failed to export artifacts")]
    ExportFailed,
    #[error("container synchronization failed")]
    ContainerSyncFailed,
    #[error("failed to parse address")]
    ParseAddress,
    #[error("cancelled")]
    Cancelled,

    // filesystem
    #[error("file or directory does not exist")]
    NotExist,
    #[error("file or directory already exists")]
    Exist,
    #[error("path is a directory")]
    PathIsDirectory,

    // stitching
    #[error("failed to detect ROM size from IFD")]
    FailedToDetectRomSize,
    #[error("base file is bigger than the size declared in IFD")]
    BaseFileBiggerThanIfd,

    // build steps
    #[error("build failed")]
    BuildFailed,
    #[error("unknown architecture for cross-compilation")]
    UnknownArchCrossCompile,

    #[error("build is up-to-date")]
    BuildUpToDate,

    #[error("i/o error")]
    Io,
    #[error("json error")]
    Json,
    #[error("error")]
    Other,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self {
            kind: ErrorKind::Other,
            msg: msg.into(),
        }
    }

    pub fn new<M: Into<String>>(kind: ErrorKind, msg: M) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    pub fn message(&self) -> &str {
        &self.msg
    }

    /// Re-classify an error under `kind`, keeping the original text as the cause.
    pub fn wrap<M: AsRef<str>>(self, kind: ErrorKind, context: M) -> Self {
        Self {
            kind,
            msg: format!("{}: {}", context.as_ref(), self),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ErrorKind::Other => write!(f, "{}", self.msg),
            kind if self.msg.is_empty() => write!(f, "{kind}"),
            kind => write!(f, "{kind}: {}", self.msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::new(ErrorKind::Io, err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorKind::Json, err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_prefixes_kind() {
        let e = Error::new(ErrorKind::NotExist, "/tmp/missing");
        assert_eq!(e.to_string(), "file or directory does not exist: /tmp/missing");
        assert!(e.is(ErrorKind::NotExist));
    }

    #[test]
    fn wrap_keeps_cause_text() {
        let e = Error::msg("exit status 2").wrap(ErrorKind::BuildFailed, "make");
        assert!(e.is(ErrorKind::BuildFailed));
        assert_eq!(e.to_string(), "build failed: make: exit status 2");
    }
}
