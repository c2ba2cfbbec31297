//! Conversion of staged MusicXML into MEI with the external tool.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use scoreconv_core::{defaults, Error, Result};

/// A document format converter.
#[async_trait]
pub trait DocumentConverter: Send + Sync {
    /// Convert `input`, returning the path the output was written to.
    ///
    /// Success is the tool's word for it; the output file is not checked.
    async fn convert(&self, input: &Path) -> Result<PathBuf>;

    /// Where [`convert`](Self::convert) writes its output for `input`.
    fn output_path(&self, input: &Path) -> PathBuf {
        input.with_extension(defaults::OUTPUT_EXTENSION)
    }

    /// Check whether the converter is usable.
    async fn health_check(&self) -> Result<String>;

    fn name(&self) -> &str;
}

/// Runs `verovio -a -f xml -t mei -o <output> <input>`.
#[derive(Debug, Clone)]
pub struct VerovioConverter {
    program: PathBuf,
    timeout: Option<Duration>,
}

impl Default for VerovioConverter {
    fn default() -> Self {
        Self::new(defaults::CONVERTER_BIN)
    }
}

impl VerovioConverter {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            timeout: Some(Duration::from_secs(defaults::CONVERT_TIMEOUT_SECS)),
        }
    }

    /// Kill the tool after `timeout`; `None` waits forever.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn command(&self, input: &Path, output: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-a")
            .arg("-f")
            .arg(defaults::CONVERTER_SOURCE_FORMAT)
            .arg("-t")
            .arg(defaults::CONVERTER_TARGET_FORMAT)
            .arg("-o")
            .arg(output)
            .arg(input)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl DocumentConverter for VerovioConverter {
    #[instrument(skip(self, input), fields(subsystem = "jobs", component = "converter", input = %input.display()))]
    async fn convert(&self, input: &Path) -> Result<PathBuf> {
        let output = self.output_path(input);
        let start = Instant::now();

        let mut child = self.command(input, &output).spawn().map_err(|e| {
            Error::Conversion(format!("Failed to start {}: {}", self.program.display(), e))
        })?;

        // Drain stderr on its own task so `wait()` can borrow the child.
        let stderr_task = tokio::spawn(collect_diagnostics(child.stderr.take()));

        let status = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    let _ = child.kill().await;
                    stderr_task.abort();
                    return Err(Error::Conversion(format!(
                        "Conversion timed out after {}s",
                        limit.as_secs()
                    )));
                }
            },
            None => child.wait().await,
        }
        .map_err(|e| Error::Conversion(format!("Failed to wait for {}: {}", self.program.display(), e)))?;

        let diagnostics = stderr_task.await.unwrap_or_default();
        let duration_ms = start.elapsed().as_millis() as u64;

        if status.success() {
            info!(duration_ms, output = %output.display(), "Conversion finished");
            return Ok(output);
        }

        let exit_code = status.code().unwrap_or(-1);
        warn!(exit_code, duration_ms, "Conversion tool failed");
        if diagnostics.is_empty() {
            return Err(Error::Conversion(format!(
                "{} exited with {}",
                self.program.display(),
                status
            )));
        }
        Err(Error::Conversion(diagnostics))
    }

    async fn health_check(&self) -> Result<String> {
        let probe = Command::new(&self.program)
            .arg("--version")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(Duration::from_secs(10), probe)
            .await
            .map_err(|_| Error::Conversion(format!("{} --version timed out", self.program.display())))?
            .map_err(|e| {
                Error::Conversion(format!("Failed to start {}: {}", self.program.display(), e))
            })?;

        if !output.status.success() {
            return Err(Error::Conversion(format!(
                "{} --version exited with {}",
                self.program.display(),
                output.status
            )));
        }

        // Some builds print the version on stderr.
        let text = if output.stdout.is_empty() {
            output.stderr
        } else {
            output.stdout
        };
        Ok(String::from_utf8_lossy(&text)
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .to_string())
    }

    fn name(&self) -> &str {
        "verovio"
    }
}

/// Read diagnostic output line by line, logging each line as it arrives.
///
/// Bytes that are not valid UTF-8 are replaced rather than rejected, and the
/// stream is drained to EOF even after the cap is reached so the tool never
/// blocks on a full pipe. Returns the capped text with trailing whitespace
/// removed.
async fn collect_diagnostics<R: AsyncRead + Unpin>(stream: Option<R>) -> String {
    let Some(stream) = stream else {
        return String::new();
    };

    let mut reader = BufReader::new(stream);
    let mut raw = Vec::new();
    let mut buffer = String::new();
    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&raw);
                let line = line.trim_end_matches(['\r', '\n']);
                debug!(line = %line, "verovio stderr");
                if buffer.len() + line.len() < defaults::MAX_DIAGNOSTIC_BYTES {
                    buffer.push_str(line);
                    buffer.push('\n');
                }
            }
            Err(e) => {
                debug!(error = %e, "Stopped reading verovio stderr");
                break;
            }
        }
    }
    buffer.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_path_replaces_extension() {
        let converter = VerovioConverter::default();
        assert_eq!(
            converter.output_path(Path::new("/work/123-sonata.xml")),
            PathBuf::from("/work/123-sonata.mei")
        );
        assert_eq!(
            converter.output_path(Path::new("/work/x.musicxml")),
            PathBuf::from("/work/x.mei")
        );
    }

    #[test]
    fn test_command_arguments() {
        let converter = VerovioConverter::new("verovio");
        let cmd = converter.command(Path::new("/in/a.xml"), Path::new("/in/a.mei"));
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args, ["-a", "-f", "xml", "-t", "mei", "-o", "/in/a.mei", "/in/a.xml"]);
    }

    #[tokio::test]
    async fn test_missing_tool_is_conversion_error() {
        let converter = VerovioConverter::new("/nonexistent/verovio-for-tests");
        let err = converter.convert(Path::new("/tmp/a.xml")).await.unwrap_err();
        assert!(matches!(err, Error::Conversion(ref m) if m.starts_with("Failed to start")));

        let err = converter.health_check().await.unwrap_err();
        assert!(matches!(err, Error::Conversion(_)));
    }

    #[tokio::test]
    async fn test_collect_diagnostics_joins_lines() {
        let input: &[u8] = b"warning: a\nerror: unexpected element\n\n";
        let text = collect_diagnostics(Some(input)).await;
        assert_eq!(text, "warning: a\nerror: unexpected element");

        assert_eq!(collect_diagnostics::<&[u8]>(None).await, "");
    }

    #[tokio::test]
    async fn test_collect_diagnostics_tolerates_invalid_utf8() {
        let input: &[u8] = b"Warning: bad char \xff\r\nunexpected element\n";
        let text = collect_diagnostics(Some(input)).await;
        assert_eq!(text, "Warning: bad char \u{FFFD}\nunexpected element");
    }

    #[tokio::test]
    async fn test_collect_diagnostics_caps_but_drains() {
        let line = "x".repeat(100);
        let total = defaults::MAX_DIAGNOSTIC_BYTES * 4 / line.len();
        let input = format!("{}\n", line).repeat(total).into_bytes();

        let text = collect_diagnostics(Some(input.as_slice())).await;
        assert!(!text.is_empty());
        assert!(text.len() < defaults::MAX_DIAGNOSTIC_BYTES);
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        fn script(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("fake-verovio");
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        #[tokio::test]
        async fn test_success_returns_output_path() {
            let tmp = tempfile::tempdir().unwrap();
            let tool = script(tmp.path(), r#"echo "<mei/>" > "$7""#);
            let input = tmp.path().join("score.xml");
            std::fs::write(&input, "<score-partwise/>").unwrap();

            let output = VerovioConverter::new(tool).convert(&input).await.unwrap();
            assert_eq!(output, tmp.path().join("score.mei"));
            assert!(output.exists());
        }

        #[tokio::test]
        async fn test_failure_carries_stderr() {
            let tmp = tempfile::tempdir().unwrap();
            let tool = script(tmp.path(), "echo 'unexpected element' >&2\nexit 1");
            let input = tmp.path().join("score.xml");

            let err = VerovioConverter::new(tool).convert(&input).await.unwrap_err();
            assert_eq!(err.job_message(), "unexpected element");
        }

        #[tokio::test]
        async fn test_failure_after_invalid_utf8_keeps_later_lines() {
            let tmp = tempfile::tempdir().unwrap();
            let tool = script(
                tmp.path(),
                "printf 'Warning: bad char \\377\\n' >&2\necho 'unexpected element' >&2\nexit 1",
            );

            let err = VerovioConverter::new(tool)
                .convert(&tmp.path().join("a.xml"))
                .await
                .unwrap_err();
            assert!(err.job_message().contains("unexpected element"));
        }

        #[tokio::test]
        async fn test_noisy_tool_with_invalid_utf8_still_succeeds() {
            let tmp = tempfile::tempdir().unwrap();
            let body = r#"printf 'Warning: bad char \377\n' >&2
i=0
while [ $i -lt 2000 ]; do
  echo "Warning: element $i ignored while reading the input file" >&2
  i=$((i + 1))
done
echo "<mei/>" > "$7""#;
            let tool = script(tmp.path(), body);
            let input = tmp.path().join("score.xml");
            std::fs::write(&input, "<score-partwise/>").unwrap();

            let output = VerovioConverter::new(tool).convert(&input).await.unwrap();
            assert_eq!(output, tmp.path().join("score.mei"));
        }

        #[tokio::test]
        async fn test_silent_failure_reports_exit_status() {
            let tmp = tempfile::tempdir().unwrap();
            let tool = script(tmp.path(), "exit 3");

            let err = VerovioConverter::new(tool)
                .convert(&tmp.path().join("a.xml"))
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Conversion(ref m) if m.contains("exited with")));
        }

        #[tokio::test]
        async fn test_timeout_kills_tool() {
            let tmp = tempfile::tempdir().unwrap();
            let tool = script(tmp.path(), "sleep 10");

            let err = VerovioConverter::new(tool)
                .with_timeout(Some(Duration::from_millis(200)))
                .convert(&tmp.path().join("a.xml"))
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Conversion(ref m) if m.contains("timed out")));
        }

        #[tokio::test]
        async fn test_health_check_reports_version() {
            let tmp = tempfile::tempdir().unwrap();
            let tool = script(tmp.path(), "echo 'Verovio 4.3.1'");

            let version = VerovioConverter::new(tool).health_check().await.unwrap();
            assert_eq!(version, "Verovio 4.3.1");
        }
    }
}
