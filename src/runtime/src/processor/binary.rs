//! External stream processors.
//!
//! A configured binary receives the encoded stream on stdin and writes the
//! decoded stream to stdout. The media type it is decoding is passed in
//! [`MEDIA_TYPE_ENV`]; when the caller supplied a payload for that media
//! type, its bytes are written to a scratch file named in [`PAYLOAD_ENV`].

use std::io::{self, Read, Write};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use a3s_diff_core::error::{DiffError, Result};
use a3s_diff_core::{ProcessorPayloads, StreamProcessorConfig};

use super::{Closer, ProcessorHandler, Stage};

/// Environment variable naming the media type being decoded.
pub const MEDIA_TYPE_ENV: &str = "STREAM_PROCESSOR_MEDIATYPE";

/// Environment variable naming the file holding the payload bytes.
pub const PAYLOAD_ENV: &str = "STREAM_PROCESSOR_PAYLOAD";

/// Maximum stderr retained for error reporting.
const STDERR_LIMIT: u64 = 64 * 1024;

/// Runs a configured binary as a decoding stage.
pub struct BinaryHandler {
    config: StreamProcessorConfig,
}

impl BinaryHandler {
    pub fn new(config: StreamProcessorConfig) -> Self {
        Self { config }
    }

    fn error(&self, message: impl Into<String>) -> DiffError {
        DiffError::ProcessorError {
            processor: self.config.id.clone(),
            message: message.into(),
        }
    }
}

impl ProcessorHandler for BinaryHandler {
    fn name(&self) -> &str {
        &self.config.id
    }

    fn accepts(&self, media_type: &str) -> bool {
        self.config.accepts.iter().any(|a| a == media_type)
    }

    fn open(
        &self,
        media_type: &str,
        mut input: Box<dyn Read + Send>,
        payloads: &ProcessorPayloads,
    ) -> Result<Stage> {
        let payload_file = match payloads.get(media_type) {
            Some(payload) => {
                let mut file = tempfile::NamedTempFile::new()?;
                file.write_all(&payload.value)?;
                file.flush()?;
                Some(file)
            }
            None => None,
        };

        let mut cmd = Command::new(&self.config.path);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .env(MEDIA_TYPE_ENV, media_type)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(file) = &payload_file {
            cmd.env(PAYLOAD_ENV, file.path());
        }

        let mut child = cmd.spawn().map_err(|e| {
            self.error(format!(
                "failed to start {}: {}",
                self.config.path.display(),
                e
            ))
        })?;

        let (Some(mut stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(self.error("child process pipes unavailable"));
        };

        let feeder = thread::spawn(move || {
            let copied = io::copy(&mut input, &mut stdin);
            drop(stdin);
            copied.map(|_| ())
        });
        let stderr_reader = thread::spawn(move || {
            let mut captured = Vec::new();
            let _ = stderr.take(STDERR_LIMIT).read_to_end(&mut captured);
            captured
        });

        tracing::debug!(
            processor = %self.config.id,
            pid = child.id(),
            media_type = %media_type,
            "Started stream processor"
        );

        let eof = Arc::new(AtomicBool::new(false));
        let output = ProcessOutput {
            stdout,
            eof: eof.clone(),
        };
        let running = RunningProcess {
            id: self.config.id.clone(),
            child,
            feeder,
            stderr_reader,
            eof,
            _payload_file: payload_file,
        };
        let closer: Closer = Box::new(move || running.finish());

        Ok(Stage::new(self.config.returns.clone(), Box::new(output)).with_closer(closer))
    }
}

/// Child stdout, remembering whether it was read to the end.
struct ProcessOutput {
    stdout: ChildStdout,
    eof: Arc<AtomicBool>,
}

impl Read for ProcessOutput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.stdout.read(buf)?;
        if n == 0 && !buf.is_empty() {
            self.eof.store(true, Ordering::Release);
        }
        Ok(n)
    }
}

struct RunningProcess {
    id: String,
    child: Child,
    feeder: JoinHandle<io::Result<()>>,
    stderr_reader: JoinHandle<Vec<u8>>,
    eof: Arc<AtomicBool>,
    _payload_file: Option<tempfile::NamedTempFile>,
}

impl RunningProcess {
    /// Reap the child. A child abandoned before its output was drained is
    /// killed and its exit status is not judged.
    fn finish(mut self) -> Result<()> {
        let drained = self.eof.load(Ordering::Acquire);
        if !drained {
            let _ = self.child.kill();
        }
        let status = self.child.wait()?;
        let fed = self.feeder.join();
        let stderr = self.stderr_reader.join().unwrap_or_default();

        tracing::debug!(processor = %self.id, %status, drained, "Stream processor exited");

        if !drained {
            return Ok(());
        }
        if !status.success() {
            return Err(DiffError::ProcessorError {
                processor: self.id,
                message: format!(
                    "exited with {}: {}",
                    status,
                    String::from_utf8_lossy(&stderr).trim()
                ),
            });
        }
        match fed {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
            Ok(Err(e)) => Err(DiffError::ProcessorError {
                processor: self.id,
                message: format!("failed to feed input: {}", e),
            }),
            Err(_) => Err(DiffError::ProcessorError {
                processor: self.id,
                message: "input feeder panicked".to_string(),
            }),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use a3s_diff_core::{media_types, ProcessorPayload};
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::path::PathBuf;

    fn shell(id: &str, script: &str) -> BinaryHandler {
        BinaryHandler::new(StreamProcessorConfig {
            id: id.to_string(),
            accepts: vec!["application/x-test".to_string()],
            returns: media_types::IMAGE_LAYER.to_string(),
            path: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            env: HashMap::new(),
        })
    }

    fn run(
        handler: &BinaryHandler,
        input: &[u8],
        payloads: &ProcessorPayloads,
    ) -> (Vec<u8>, Result<()>) {
        let stage = handler
            .open(
                "application/x-test",
                Box::new(Cursor::new(input.to_vec())),
                payloads,
            )
            .unwrap();
        let Stage {
            mut reader, closer, ..
        } = stage;

        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        drop(reader);
        (out, closer.unwrap()())
    }

    #[test]
    fn test_accepts_configured_media_types() {
        let handler = shell("cat", "cat");
        assert!(handler.accepts("application/x-test"));
        assert!(!handler.accepts(media_types::IMAGE_LAYER_GZIP));
    }

    #[test]
    fn test_pipes_stream_through_binary() {
        let handler = shell("cat", "cat");
        let (out, closed) = run(&handler, b"through the pipe", &HashMap::new());

        assert_eq!(out, b"through the pipe");
        closed.unwrap();
    }

    #[test]
    fn test_exposes_media_type_env() {
        let handler = shell("env", "cat >/dev/null; printf %s \"$STREAM_PROCESSOR_MEDIATYPE\"");
        let (out, closed) = run(&handler, b"ignored", &HashMap::new());

        assert_eq!(out, b"application/x-test");
        closed.unwrap();
    }

    #[test]
    fn test_payload_is_written_to_file() {
        let handler = shell("payload", "cat >/dev/null; cat \"$STREAM_PROCESSOR_PAYLOAD\"");
        let payloads = HashMap::from([(
            "application/x-test".to_string(),
            ProcessorPayload::new("keys.v1", b"secret-key".to_vec()),
        )]);
        let (out, closed) = run(&handler, b"", &payloads);

        assert_eq!(out, b"secret-key");
        closed.unwrap();
    }

    #[test]
    fn test_nonzero_exit_fails_close() {
        let handler = shell("fail", "echo broken >&2; exit 3");
        let (_out, closed) = run(&handler, b"data", &HashMap::new());

        let err = closed.unwrap_err();
        assert!(matches!(err, DiffError::ProcessorError { .. }));
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_missing_binary_fails_open() {
        let handler = BinaryHandler::new(StreamProcessorConfig {
            id: "missing".to_string(),
            accepts: vec!["application/x-test".to_string()],
            returns: media_types::IMAGE_LAYER.to_string(),
            path: PathBuf::from("/nonexistent/processor"),
            args: vec![],
            env: HashMap::new(),
        });

        let err = handler
            .open("application/x-test", Box::new(Cursor::new(Vec::new())), &HashMap::new())
            .err()
            .unwrap();
        assert!(err.to_string().contains("failed to start"));
    }

    #[test]
    fn test_abandoned_process_is_killed() {
        let handler = shell("sleepy", "cat; sleep 30");
        let stage = handler
            .open(
                "application/x-test",
                Box::new(Cursor::new(b"x".to_vec())),
                &HashMap::new(),
            )
            .unwrap();
        let Stage { reader, closer, .. } = stage;
        drop(reader);

        closer.unwrap()().unwrap();
    }
}
