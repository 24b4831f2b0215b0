use std::fmt;

use async_trait::async_trait;
use tokio::process::Child;

/// The capture programs this server knows how to launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Program {
    Still,
    Vid,
    Motion,
}

impl Program {
    pub fn suffix(self) -> &'static str {
        match self {
            Program::Still => "still",
            Program::Vid => "vid",
            Program::Motion => "motion",
        }
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Turns a program and its encoded argument tokens into a running OS process.
/// Implementations must pipe stdout; the supervisor reads it.
#[async_trait]
pub trait CaptureBackend: Send + Sync + 'static {
    fn binary(&self, program: Program) -> String;
    async fn spawn(&self, program: Program, args: &[String]) -> std::io::Result<Child>;
}
