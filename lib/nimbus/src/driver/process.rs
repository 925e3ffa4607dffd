// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Mutex;
use std::thread::JoinHandle;

use slog::{error, info, o, Logger};

use super::{DriverChannel, DriverError};

/// A driver running as a child process: requests go to its stdin, replies
/// are read line by line from its stdout.
pub struct ProcessDriver {
    name: String,
    child: Mutex<Child>,
    stdin: Mutex<Option<ChildStdin>>,
    stdout: Mutex<Option<ChildStdout>>,
    log: Logger,
}

impl ProcessDriver {
    pub fn spawn(
        name: &str,
        executable: &Path,
        arguments: &[String],
        log: &Logger,
    ) -> Result<Self, DriverError> {
        let log = log.new(o!("driver" => name.to_string()));
        let mut child = Command::new(executable)
            .args(arguments)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()?;
        info!(log, "driver started"; "pid" => child.id(),
            "executable" => %executable.display());
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        Ok(Self {
            name: name.to_string(),
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(stdout),
            log,
        })
    }

    /// Starts the reader thread, handing every reply line to `sink`.
    pub fn start<F>(&self, sink: F) -> Result<JoinHandle<()>, DriverError>
    where
        F: Fn(String) + Send + 'static,
    {
        let stdout = self
            .stdout
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| DriverError::Closed(self.name.clone()))?;
        let log = self.log.clone();
        let th = std::thread::Builder::new()
            .name(format!("driver-{}", self.name))
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    match line {
                        Ok(line) if line.trim().is_empty() => continue,
                        Ok(line) => sink(line),
                        Err(e) => {
                            error!(log, "error reading from driver"; "error" => %e);
                            break;
                        }
                    }
                }
                info!(log, "driver closed its output");
            })?;
        Ok(th)
    }

    /// Closes stdin so the driver can exit, then waits for it.
    pub fn stop(&self) {
        self.stdin.lock().unwrap().take();
        match self.child.lock().unwrap().wait() {
            Ok(status) => info!(self.log, "driver exited"; "status" => %status),
            Err(e) => error!(self.log, "failed to wait for driver"; "error" => %e),
        }
    }
}

impl DriverChannel for ProcessDriver {
    fn write(&self, message: &str) -> Result<(), DriverError> {
        let mut stdin = self.stdin.lock().unwrap();
        let stdin = stdin
            .as_mut()
            .ok_or_else(|| DriverError::Closed(self.name.clone()))?;
        writeln!(stdin, "{message}")?;
        stdin.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::test_logger;
    use std::sync::mpsc;

    #[test]
    fn echoes_through_cat() {
        let driver =
            ProcessDriver::spawn("cat", Path::new("cat"), &[], &test_logger())
                .unwrap();
        let (tx, rx) = mpsc::channel();
        let th = driver
            .start(move |line| {
                let _ = tx.send(line);
            })
            .unwrap();
        driver.write("TRANSFER SUCCESS 3 -").unwrap();
        assert_eq!(rx.recv().unwrap(), "TRANSFER SUCCESS 3 -");
        driver.stop();
        th.join().unwrap();
        assert!(matches!(driver.write("x"), Err(DriverError::Closed(_))));
    }
}
