//! External filter pipelines for compression and encryption.
//!
//! The wire format is produced by external processes (`lzop`, `gpg`)
//! connected by OS pipes, keeping CPU-heavy work out of this process and
//! the stored bytes identical to what those tools emit. Upload staging
//! writes the terminal filter output to a temporary file so the content
//! length is known before the blob PUT.

use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tempfile::NamedTempFile;

use crate::error::{ArchiveError, Result};

/// Grace period before an unresponsive filter is signaled.
const KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct FilterCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl FilterCommand {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn lzop_compress() -> Self {
        Self::new("lzop", &["--stdout"])
    }

    pub fn lzop_decompress() -> Self {
        Self::new("lzop", &["-d", "--stdout", "-"])
    }

    pub fn gpg_encrypt(key_id: &str) -> Self {
        Self::new("gpg", &["-e", "-z", "0", "-r", key_id])
    }

    pub fn gpg_decrypt() -> Self {
        Self::new("gpg", &["-d", "-q"])
    }
}

/// The configured filter programs for one archive context: a compressor
/// pair and an optional encryption key layered outside the compression.
#[derive(Debug, Clone)]
pub struct FilterSet {
    pub compress: FilterCommand,
    pub decompress: FilterCommand,
    pub gpg_key_id: Option<String>,
}

impl FilterSet {
    /// The production wire format: lzop, optionally wrapped in GPG.
    pub fn lzop(gpg_key_id: Option<String>) -> Self {
        Self {
            compress: FilterCommand::lzop_compress(),
            decompress: FilterCommand::lzop_decompress(),
            gpg_key_id,
        }
    }

    pub fn upload_chain(&self) -> FilterChain {
        let mut commands = vec![self.compress.clone()];
        if let Some(key) = &self.gpg_key_id {
            commands.push(FilterCommand::gpg_encrypt(key));
        }
        FilterChain { commands }
    }

    pub fn download_chain(&self) -> FilterChain {
        let mut commands = Vec::new();
        if self.gpg_key_id.is_some() {
            commands.push(FilterCommand::gpg_decrypt());
        }
        commands.push(self.decompress.clone());
        FilterChain { commands }
    }
}

/// An ordered chain of filters; the first filter reads the raw input.
#[derive(Debug, Clone)]
pub struct FilterChain {
    commands: Vec<FilterCommand>,
}

impl FilterChain {
    pub fn new(commands: Vec<FilterCommand>) -> Self {
        Self { commands }
    }

    /// Identity chain, for callers that need the staging behavior without
    /// any transformation.
    pub fn identity() -> Self {
        Self {
            commands: Vec::new(),
        }
    }

    /// Feed bytes written by `producer` through the filters into `output`,
    /// returning the number of bytes written to `output`.
    ///
    /// The producer runs on its own thread, writing into the head filter's
    /// stdin; a dead filter shows up there as a broken pipe, which defers
    /// to the filter's own exit status for the root cause.
    pub fn run(
        &self,
        producer: impl FnOnce(&mut dyn Write) -> Result<()> + Send,
        output: &mut dyn Write,
    ) -> Result<u64> {
        if self.commands.is_empty() {
            let mut counter = CountingWriter {
                inner: output,
                written: 0,
            };
            producer(&mut counter)?;
            return Ok(counter.written);
        }

        let (mut children, head_stdin, mut tail_stdout) = self.spawn()?;

        let (producer_result, read_result) = std::thread::scope(|scope| {
            let writer = scope.spawn(move || -> Result<()> {
                let mut stdin = head_stdin;
                producer(&mut stdin)?;
                // Dropping stdin closes the pipe and lets the head filter
                // finish its stream.
                Ok(())
            });
            let read_result = std::io::copy(&mut tail_stdout, output);
            let producer_result = writer
                .join()
                .unwrap_or_else(|_| Err(ArchiveError::Other("filter producer panicked".into())));
            (producer_result, read_result)
        });
        drop(tail_stdout);

        // Filter exit codes decide the outcome first: a dead filter
        // surfaces to the producer as a broken pipe and to the reader as a
        // short stream, neither of which is the root cause.
        self.finish(&mut children)?;

        match producer_result {
            Ok(()) => Ok(read_result?),
            Err(ArchiveError::Io(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                Err(ArchiveError::Integrity(
                    "filter pipeline closed its input before the stream ended".into(),
                ))
            }
            Err(e) => Err(e),
        }
    }

    /// Copy `input` through the filters into `output`.
    pub fn stream(
        &self,
        input: &mut (dyn Read + Send),
        output: &mut dyn Write,
    ) -> Result<u64> {
        self.run(
            move |w| {
                std::io::copy(input, w)?;
                Ok(())
            },
            output,
        )
    }

    /// Run `producer` through the filters into a temporary file in
    /// `tmp_dir` (created 0600) and return it with its final length.
    pub fn stage_from(
        &self,
        producer: impl FnOnce(&mut dyn Write) -> Result<()> + Send,
        tmp_dir: &Path,
    ) -> Result<StagedUpload> {
        let mut file = NamedTempFile::new_in(tmp_dir)?;
        let len = self.run(producer, file.as_file_mut())?;
        // The blob store is responsible for durability; the staged file is
        // throwaway and never fsynced.
        Ok(StagedUpload { file, len })
    }

    /// Stage a plain byte stream (the wal-push path).
    pub fn stage(&self, input: &mut (dyn Read + Send), tmp_dir: &Path) -> Result<StagedUpload> {
        self.stage_from(
            move |w| {
                std::io::copy(input, w)?;
                Ok(())
            },
            tmp_dir,
        )
    }

    fn spawn(&self) -> Result<(Vec<Child>, ChildStdin, ChildStdout)> {
        let mut children: Vec<Child> = Vec::with_capacity(self.commands.len());
        let mut head_stdin = None;
        let mut prev_stdout: Option<ChildStdout> = None;

        for command in &self.commands {
            let mut builder = Command::new(&command.program);
            builder.args(&command.args);
            match prev_stdout.take() {
                Some(upstream) => {
                    builder.stdin(Stdio::from(upstream));
                }
                None => {
                    builder.stdin(Stdio::piped());
                }
            }
            builder.stdout(Stdio::piped());

            let mut child = builder.spawn().map_err(|e| {
                ArchiveError::Config(format!(
                    "could not run filter '{}': {e} (is it installed?)",
                    command.program
                ))
            })?;
            if head_stdin.is_none() {
                head_stdin = child.stdin.take();
            }
            prev_stdout = child.stdout.take();
            children.push(child);
        }

        let head_stdin = head_stdin
            .ok_or_else(|| ArchiveError::Other("filter chain head has no stdin".into()))?;
        let tail_stdout = prev_stdout
            .ok_or_else(|| ArchiveError::Other("filter chain tail has no stdout".into()))?;
        Ok((children, head_stdin, tail_stdout))
    }

    /// Wait for every filter, escalating to SIGTERM then SIGKILL after the
    /// grace window, and fail on the first non-zero exit status.
    fn finish(&self, children: &mut [Child]) -> Result<()> {
        let mut first_failure = None;
        for (child, command) in children.iter_mut().zip(&self.commands) {
            let status = wait_with_escalation(child)?;
            if !status.success() && first_failure.is_none() {
                first_failure = Some(ArchiveError::FilterExit {
                    program: command.program.clone(),
                    status: status.code().unwrap_or(-1),
                });
            }
        }
        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Streaming read side of a filter chain, for the fetch direction: the
/// caller consumes filtered bytes (e.g. feeding a tar extractor) and then
/// calls [`finish`](FilterReader::finish) to collect filter exit statuses.
pub struct FilterReader {
    inner: FilterReaderInner,
}

enum FilterReaderInner {
    Direct(Box<dyn Read + Send>),
    Piped {
        chain: FilterChain,
        children: Vec<Child>,
        tail: Option<ChildStdout>,
        writer: Option<std::thread::JoinHandle<std::io::Result<u64>>>,
    },
}

impl FilterChain {
    /// Pull `input` through the filters, exposing the terminal output as a
    /// reader. The input copy runs on its own thread.
    pub fn reader(&self, input: Box<dyn Read + Send + 'static>) -> Result<FilterReader> {
        if self.commands.is_empty() {
            return Ok(FilterReader {
                inner: FilterReaderInner::Direct(input),
            });
        }
        let (children, head_stdin, tail_stdout) = self.spawn()?;
        let writer = std::thread::spawn(move || {
            let mut input = input;
            let mut stdin = head_stdin;
            std::io::copy(&mut input, &mut stdin)
        });
        Ok(FilterReader {
            inner: FilterReaderInner::Piped {
                chain: self.clone(),
                children,
                tail: Some(tail_stdout),
                writer: Some(writer),
            },
        })
    }
}

impl Read for FilterReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            FilterReaderInner::Direct(reader) => reader.read(buf),
            FilterReaderInner::Piped { tail: Some(tail), .. } => tail.read(buf),
            FilterReaderInner::Piped { tail: None, .. } => Ok(0),
        }
    }
}

impl FilterReader {
    /// Reap the filters and fail on the first non-zero exit status. Must be
    /// called after the stream has been consumed; a decompressor that died
    /// mid-stream is reported here rather than as a bare short read.
    pub fn finish(mut self) -> Result<()> {
        match &mut self.inner {
            FilterReaderInner::Direct(_) => Ok(()),
            FilterReaderInner::Piped {
                chain,
                children,
                tail,
                writer,
            } => {
                drop(tail.take());
                if let Some(handle) = writer.take() {
                    // Broken pipe here means a filter died; its exit status
                    // is the authoritative error.
                    let _ = handle.join();
                }
                let chain = chain.clone();
                chain.finish(children)
            }
        }
    }
}

struct CountingWriter<'a> {
    inner: &'a mut dyn Write,
    written: u64,
}

impl Write for CountingWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

fn wait_with_escalation(child: &mut Child) -> Result<std::process::ExitStatus> {
    if let Some(status) = poll_until(child, KILL_GRACE)? {
        return Ok(status);
    }
    let pid = Pid::from_raw(child.id() as i32);
    tracing::warn!("filter pid {pid} did not exit after pipe close, sending SIGTERM");
    let _ = signal::kill(pid, Signal::SIGTERM);
    if let Some(status) = poll_until(child, KILL_GRACE)? {
        return Ok(status);
    }
    tracing::warn!("filter pid {pid} ignored SIGTERM, sending SIGKILL");
    child.kill().ok();
    Ok(child.wait()?)
}

fn poll_until(child: &mut Child, window: Duration) -> Result<Option<std::process::ExitStatus>> {
    let deadline = Instant::now() + window;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// Compressed (and optionally encrypted) bytes staged for upload.
///
/// The backing temporary file is removed on drop, on every exit path.
pub struct StagedUpload {
    file: NamedTempFile,
    pub len: u64,
}

impl StagedUpload {
    /// Rewindable body handle for the blob PUT.
    pub fn body(&mut self) -> &mut std::fs::File {
        self.file.as_file_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn cat_chain(stages: usize) -> FilterChain {
        FilterChain::new(vec![FilterCommand::new("cat", &[]); stages])
    }

    #[test]
    fn single_filter_round_trip() {
        let mut input = Cursor::new(b"some WAL segment bytes".to_vec());
        let mut out = Vec::new();
        let n = cat_chain(1).stream(&mut input, &mut out).unwrap();
        assert_eq!(out, b"some WAL segment bytes");
        assert_eq!(n, out.len() as u64);
    }

    #[test]
    fn multi_stage_chain_round_trip() {
        let payload: Vec<u8> = (0u8..=255).cycle().take(512 * 1024).collect();
        let mut input = Cursor::new(payload.clone());
        let mut out = Vec::new();
        cat_chain(2).stream(&mut input, &mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn identity_chain_copies_directly() {
        let mut input = Cursor::new(b"plain".to_vec());
        let mut out = Vec::new();
        let n = FilterChain::identity().stream(&mut input, &mut out).unwrap();
        assert_eq!(out, b"plain");
        assert_eq!(n, 5);
    }

    #[test]
    fn producer_writes_through_chain() {
        let staged_dir = tempfile::tempdir().unwrap();
        let staged = cat_chain(1)
            .stage_from(
                |w| {
                    w.write_all(b"header")?;
                    w.write_all(b"body")?;
                    Ok(())
                },
                staged_dir.path(),
            )
            .unwrap();
        assert_eq!(staged.len, 10);
    }

    #[test]
    fn producer_error_propagates() {
        let err = cat_chain(1)
            .run(
                |w| {
                    w.write_all(b"partial")?;
                    Err(ArchiveError::MemberChanged("some/file".into()))
                },
                &mut Vec::new(),
            )
            .unwrap_err();
        assert!(matches!(err, ArchiveError::MemberChanged(_)), "got {err}");
    }

    #[test]
    fn stage_writes_temp_file_with_length() {
        let dir = tempfile::tempdir().unwrap();
        let mut input = Cursor::new(vec![7u8; 4096]);
        let staged = cat_chain(1).stage(&mut input, dir.path()).unwrap();
        assert_eq!(staged.len, 4096);
    }

    #[test]
    fn staged_file_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let mut input = Cursor::new(vec![1u8; 16]);
        let staged = cat_chain(1).stage(&mut input, dir.path()).unwrap();
        drop(staged);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn missing_filter_program_is_config_error() {
        let chain = FilterChain::new(vec![FilterCommand::new("walstash-no-such-filter", &[])]);
        let err = chain
            .stream(&mut Cursor::new(vec![0u8; 4]), &mut Vec::new())
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Config(_)), "got {err}");
    }

    #[test]
    fn failing_filter_surfaces_exit_status() {
        // `false` exits 1 without reading its input.
        let chain = FilterChain::new(vec![FilterCommand::new("false", &[])]);
        let err = chain
            .stream(&mut Cursor::new(vec![0u8; 64]), &mut Vec::new())
            .unwrap_err();
        match err {
            ArchiveError::FilterExit { program, status } => {
                assert_eq!(program, "false");
                assert_eq!(status, 1);
            }
            other => panic!("expected FilterExit, got {other}"),
        }
    }

    #[test]
    fn failing_tail_filter_beats_broken_pipe() {
        // Head keeps copying; tail exits non-zero immediately. The reported
        // error must be the tail's exit status, not the head's EPIPE.
        let chain = FilterChain::new(vec![
            FilterCommand::new("cat", &[]),
            FilterCommand::new("false", &[]),
        ]);
        let payload = vec![0u8; 1024 * 1024];
        let err = chain
            .stream(&mut Cursor::new(payload), &mut Vec::new())
            .unwrap_err();
        match err {
            ArchiveError::FilterExit { program, .. } => assert_eq!(program, "false"),
            other => panic!("expected FilterExit, got {other}"),
        }
    }
}
