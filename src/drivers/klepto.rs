use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};

use crate::error::{Error, Result};

use super::Extractor;

pub const DEFAULT_CONFIG: &str = "klepto.toml";

/// Extractor shelling out to klepto, which reads the source database
/// and writes an anonymized SQL dump to stdout.
#[derive(Debug)]
pub struct KleptoExtractor {
    config: PathBuf,
}

impl KleptoExtractor {
    pub fn new(config: Option<PathBuf>) -> Result<Self> {
        let config = config.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
        validate_config(&config)?;
        Ok(KleptoExtractor { config })
    }
}

fn validate_config(config: &Path) -> Result<()> {
    if !config.exists() {
        return Err(Error::Configuration(format!(
            "klepto config '{}' was not found",
            config.display()
        )));
    }
    if !config.is_file() {
        return Err(Error::Configuration(format!(
            "klepto config '{}' needs to be a file",
            config.display()
        )));
    }
    Ok(())
}

impl Extractor for KleptoExtractor {
    fn extract(&self, source_uri: &str) -> Result<Box<dyn Read + Send>> {
        let mut child = Command::new("klepto")
            .arg("steal")
            .args(["--from", source_uri])
            .args(["--to", "os://stdout/"])
            .args(["--read-max-conns", "10"])
            .args(["--concurrency", "4"])
            .args(["--read-timeout", "20m"])
            .arg("--config")
            .arg(&self.config)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    Error::Configuration("klepto binary not found on PATH".into())
                } else {
                    Error::Extraction(e.to_string())
                }
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Extraction("klepto produced no stdout handle".into()))?;
        Ok(Box::new(ChildStream { child, stdout, finished: false }))
    }
}

/// Streams a child process's stdout; once the stream drains, waits for
/// the process and turns a non-zero exit into a read error carrying
/// stderr, so a failed extraction can never pass for an empty dump.
struct ChildStream {
    child: Child,
    stdout: ChildStdout,
    finished: bool,
}

impl Read for ChildStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.stdout.read(buf)?;
        if n == 0 && !self.finished {
            self.finished = true;
            let status = self.child.wait()?;
            if !status.success() {
                let mut stderr = String::new();
                if let Some(mut pipe) = self.child.stderr.take() {
                    let _ = pipe.read_to_string(&mut stderr);
                }
                let detail = stderr.lines().next().unwrap_or("no stderr output");
                return Err(io::Error::other(format!(
                    "klepto exited with {}: {}",
                    status, detail
                )));
            }
        }
        Ok(n)
    }
}

impl Drop for ChildStream {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_is_a_configuration_error() {
        let err = KleptoExtractor::new(Some(PathBuf::from("/no/such/klepto.toml"))).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn directory_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = KleptoExtractor::new(Some(dir.path().to_path_buf())).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn failing_child_surfaces_stderr_on_eof() {
        // Drive ChildStream with a shell stand-in instead of klepto.
        let mut child = Command::new("sh")
            .args(["-c", "echo data; echo 'error: boom' >&2; exit 3"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let stdout = child.stdout.take().unwrap();
        let mut stream = ChildStream { child, stdout, finished: false };
        let mut out = Vec::new();
        let err = stream.read_to_end(&mut out).unwrap_err();
        assert_eq!(out, b"data\n");
        assert!(err.to_string().contains("error: boom"));
    }

    #[test]
    fn successful_child_streams_to_clean_eof() {
        let mut child = Command::new("sh")
            .args(["-c", "printf 'abc'"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let stdout = child.stdout.take().unwrap();
        let mut stream = ChildStream { child, stdout, finished: false };
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"abc");
    }
}
