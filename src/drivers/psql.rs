use std::io::{self, Read, Write};
use std::process::{Command, Stdio};

use crate::error::{Error, Result};

use super::Loader;

const EMPTINESS_QUERY: &str = "select count(*) from information_schema.tables \
     where table_schema not in ('pg_catalog', 'information_schema')";

/// Loader piping a dump into `psql` on the target database.
pub struct PsqlLoader;

impl Loader for PsqlLoader {
    fn is_empty(&self, target_uri: &str) -> Result<bool> {
        let output = Command::new("psql")
            .args(["-X", "-A", "-t", "-c", EMPTINESS_QUERY, target_uri])
            .stdin(Stdio::null())
            .output()
            .map_err(|e| spawn_error("psql", e))?;
        if !output.status.success() {
            return Err(Error::Connectivity(format!(
                "could not inspect target database: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let count: u64 = stdout
            .trim()
            .parse()
            .map_err(|_| Error::Load(format!("unexpected table count output: '{}'", stdout.trim())))?;
        Ok(count == 0)
    }

    fn load(&self, target_uri: &str, dump: &mut dyn Read) -> Result<()> {
        let mut child = Command::new("psql")
            .args(["-X", "-q", "-v", "ON_ERROR_STOP=1", "-f", "-", target_uri])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error("psql", e))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Load("psql produced no stdin handle".into()))?;
        let copy_result = io::copy(dump, &mut stdin).and_then(|_| stdin.flush());
        drop(stdin);

        let output = child
            .wait_with_output()
            .map_err(|e| Error::Load(e.to_string()))?;
        if !output.status.success() {
            return Err(Error::Load(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        // A broken pipe with a zero exit would have been caught above;
        // any other copy failure is still a load failure.
        copy_result.map_err(|e| Error::Load(e.to_string()))?;
        Ok(())
    }
}

fn spawn_error(binary: &str, err: io::Error) -> Error {
    if err.kind() == io::ErrorKind::NotFound {
        Error::Configuration(format!("{} binary not found on PATH", binary))
    } else {
        Error::Load(err.to_string())
    }
}
