use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use super::traits::{CaptureBackend, Program};

#[derive(Debug, Clone)]
pub struct LibcameraBackend {
    binary_prefix: String,
}

impl LibcameraBackend {
    pub fn new(binary_prefix: String) -> Self {
        Self { binary_prefix }
    }
}

#[async_trait]
impl CaptureBackend for LibcameraBackend {
    fn binary(&self, program: Program) -> String {
        format!("{}-{}", self.binary_prefix, program.suffix())
    }

    async fn spawn(&self, program: Program, args: &[String]) -> std::io::Result<Child> {
        Command::new(self.binary(program))
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
    }
}
