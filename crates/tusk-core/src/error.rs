use thiserror::Error;

/// The closed set of failure kinds a command can surface.
///
/// Every fallible operation in the engine reports one of these; the binary
/// maps them to exit codes (user errors exit 1, internal errors exit 2).
#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Parse(String),

    #[error("{0}")]
    Validation(String),

    #[error("no task matched: {0}")]
    NotFound(String),

    #[error("a task with uuid {0} already exists")]
    Conflict(String),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("sync failed: {0}")]
    Sync(String),

    #[error("hook {script} failed: {reason}")]
    Hook { script: String, reason: String },
}

impl Error {
    /// Exit code for the invocation boundary: 1 for user errors, 2 for
    /// internal errors.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Parse(_) | Error::Validation(_) | Error::NotFound(_) | Error::Conflict(_) => 1,
            Error::Io(_) | Error::Sync(_) | Error::Hook { .. } => 2,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Non-fatal findings collected during a command and printed after its
/// output.
#[derive(Debug, Default, Clone)]
pub struct Warnings {
    notes: Vec<String>,
}

impl Warnings {
    pub fn push(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    pub fn drain(&mut self) -> Vec<String> {
        std::mem::take(&mut self.notes)
    }
}
