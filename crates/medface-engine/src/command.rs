//! Extractor adapter that delegates to an external helper process.
//!
//! The helper receives the raw image bytes on stdin and prints
//! `{"faces": [{"descriptor": [...], "confidence": 0.99}, ...]}` on stdout.
//! A non-zero exit status means the image could not be evaluated.

use medface_core::{DetectedFace, Extractor, ExtractorError, FaceDescriptor};
use serde::Deserialize;
use std::io::{self, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// How often a running helper is polled while a deadline is set.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Deserialize)]
struct HelperOutput {
    faces: Vec<HelperFace>,
}

#[derive(Debug, Deserialize)]
struct HelperFace {
    descriptor: Vec<f32>,
    confidence: f32,
}

#[derive(Debug, Clone)]
pub struct CommandExtractor {
    program: String,
    args: Vec<String>,
    dimension: usize,
    model_version: String,
    timeout: Option<Duration>,
}

impl CommandExtractor {
    /// `command` is the helper program followed by its arguments.
    pub fn new(command: &[String], dimension: usize) -> Result<Self, ExtractorError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| ExtractorError::Unavailable("no extractor command configured".into()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            dimension,
            model_version: program.clone(),
            timeout: None,
        })
    }

    pub fn with_model_version(mut self, model_version: impl Into<String>) -> Self {
        self.model_version = model_version.into();
        self
    }

    /// Kill the helper and fail with [`ExtractorError::Unavailable`] if it
    /// runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn wait(&self, child: &mut Child) -> Result<ExitStatus, ExtractorError> {
        let Some(timeout) = self.timeout else {
            return Ok(child.wait()?);
        };
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                // Kill and reap; the pipe threads are left to finish on their own.
                let _ = child.kill();
                let _ = child.wait();
                tracing::warn!(
                    program = %self.program,
                    pid = child.id(),
                    ?timeout,
                    "extractor helper killed after deadline"
                );
                return Err(ExtractorError::Unavailable(format!(
                    "{} did not finish within {timeout:?}",
                    self.program
                )));
            }
            thread::sleep(WAIT_POLL_INTERVAL);
        }
    }
}

fn read_pipe(mut pipe: impl Read) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    pipe.read_to_end(&mut buf)?;
    Ok(buf)
}

fn join<T>(
    handle: thread::JoinHandle<io::Result<T>>,
    what: &str,
) -> Result<io::Result<T>, ExtractorError> {
    handle
        .join()
        .map_err(|_| ExtractorError::Unavailable(format!("{what} thread panicked")))
}

impl Extractor for CommandExtractor {
    fn extract(&self, image: &[u8]) -> Result<Vec<DetectedFace>, ExtractorError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                ExtractorError::Unavailable(format!("failed to start {}: {e}", self.program))
            })?;

        let unavailable =
            |pipe: &str| ExtractorError::Unavailable(format!("helper {pipe} unavailable"));
        let mut stdin = child.stdin.take().ok_or_else(|| unavailable("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| unavailable("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| unavailable("stderr"))?;

        // Each pipe gets its own thread so a chatty helper cannot deadlock
        // on a full buffer while we wait for it to exit.
        let payload = image.to_vec();
        let writer = thread::spawn(move || stdin.write_all(&payload));
        let stdout = thread::spawn(move || read_pipe(stdout));
        let stderr = thread::spawn(move || read_pipe(stderr));

        let status = self.wait(&mut child)?;
        let written = join(writer, "stdin writer")?;
        let stdout = join(stdout, "stdout reader")??;
        let stderr = join(stderr, "stderr reader")??;

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr);
            return Err(ExtractorError::Unavailable(format!(
                "{} exited with {}: {}",
                self.program,
                status,
                stderr.trim()
            )));
        }
        // A helper may answer without consuming the whole image.
        if let Err(e) = written {
            if e.kind() != io::ErrorKind::BrokenPipe {
                return Err(e.into());
            }
        }

        let parsed: HelperOutput = serde_json::from_slice(&stdout)
            .map_err(|e| ExtractorError::Malformed(e.to_string()))?;

        tracing::debug!(
            program = %self.program,
            faces = parsed.faces.len(),
            bytes = image.len(),
            "extractor helper finished"
        );

        Ok(parsed
            .faces
            .into_iter()
            .map(|f| DetectedFace {
                descriptor: FaceDescriptor::new(f.descriptor),
                confidence: f.confidence,
            })
            .collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_version(&self) -> &str {
        &self.model_version
    }
}
