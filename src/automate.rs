//! Scripted session automation.
//!
//! A [`Script`] is an ordered list of expect/send steps, loaded from JSON.
//! Running one drives a live session: block until the remote output
//! matches the step's pattern, write the step's response, move on. The
//! broker's init hook is a script run over a broker-served session opened
//! with the init flag set.

use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::io::AsFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::broker::InitHook;
use crate::client::pipe_pair;
use crate::expect::Expecter;
use crate::passfd::send_fds;
use crate::protocol::Request;
use crate::reader::TimeoutReader;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Pattern to wait for in the session output.
    pub expect: String,
    /// Bytes to send once it matches. Empty sends nothing.
    #[serde(default)]
    pub send: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Script {
    pub steps: Vec<Step>,
}

impl Script {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read script: {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parse script: {}", path.display()))
    }

    /// Drive `source`/`sink` through every step in order.
    ///
    /// A pattern that never appears surfaces as the source's timeout or
    /// end-of-stream error, tagged with the step that was waiting.
    pub fn run<R: Read, W: Write>(&self, source: R, sink: &mut W) -> Result<()> {
        let mut session = Expecter::new(source);
        for (i, step) in self.steps.iter().enumerate() {
            session
                .expect(&step.expect)
                .with_context(|| format!("step {}: waiting for {:?}", i + 1, step.expect))?;
            debug!("automation step {} matched {:?}", i + 1, step.expect);
            if !step.send.is_empty() {
                sink.write_all(step.send.as_bytes())
                    .and_then(|()| sink.flush())
                    .with_context(|| format!("step {}: send failed", i + 1))?;
            }
        }
        Ok(())
    }
}

/// Build the broker's init hook: connect back through the broker's own
/// socket with the init flag, run `script` over the session, hang up.
pub fn init_hook(socket_path: PathBuf, script: Script, step_timeout: Duration) -> InitHook {
    Box::new(move |host| {
        info!("[init] initializing {host}");
        run_init_session(&socket_path, &script, step_timeout)
    })
}

fn run_init_session(socket_path: &Path, script: &Script, step_timeout: Duration) -> Result<()> {
    let stream = UnixStream::connect(socket_path)
        .with_context(|| format!("connect to own socket at {}", socket_path.display()))?;

    // stdin and stdout of the init session are pipes this process holds
    // the far ends of; stderr is discarded.
    let (stdin_read, stdin_write) = pipe_pair().context("init stdin pipe")?;
    let (stdout_read, stdout_write) = pipe_pair().context("init stdout pipe")?;
    let devnull = std::fs::OpenOptions::new()
        .write(true)
        .open("/dev/null")
        .context("open /dev/null")?;

    let request = Request::connect("", true);
    send_fds(
        &stream,
        &request.encode()?,
        &[stdin_read.as_fd(), stdout_write.as_fd(), devnull.as_fd()],
    )
    .context("hand init session to broker")?;
    drop(stdin_read);
    drop(stdout_write);
    drop(devnull);

    info!("[init] running {} automation steps", script.steps.len());
    let source = TimeoutReader::new(stdout_read, step_timeout);
    let mut sink = File::from(stdin_write);
    script.run(source, &mut sink)?;
    info!("[init] automation complete");

    // Dropping the write end signals end-of-input; the broker tears the
    // session down and closes the socket.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn canned_transcript_drives_all_steps() {
        let script = Script {
            steps: vec![
                Step { expect: "login: ".into(), send: "deploy\n".into() },
                Step { expect: "[Pp]assword: ".into(), send: "hunter2\n".into() },
                Step { expect: "\\$ ".into(), send: String::new() },
            ],
        };
        let transcript = "Ubuntu 24.04\nlogin: Password: \nwelcome\ndeploy@host:~$ ";
        let mut sent = Vec::new();
        script.run(Cursor::new(transcript), &mut sent).unwrap();
        assert_eq!(sent, b"deploy\nhunter2\n");
    }

    #[test]
    fn missing_prompt_reports_the_step() {
        let script = Script {
            steps: vec![Step { expect: "never-appears".into(), send: "x".into() }],
        };
        let err = script.run(Cursor::new("some output"), &mut Vec::new()).unwrap_err();
        assert!(err.to_string().contains("step 1"), "unexpected: {err:#}");
    }

    #[test]
    fn interactive_responder_round_trip() {
        // A thread plays the remote side: emits a prompt, waits for the
        // scripted answer, emits the next prompt.
        let (out_read, out_write) = pipe_pair().unwrap();
        let (in_read, in_write) = pipe_pair().unwrap();

        let responder = std::thread::spawn(move || {
            let mut from_script = File::from(in_read);
            let mut to_script = File::from(out_write);
            to_script.write_all(b"name? ").unwrap();
            let mut buf = [0u8; 16];
            let n = from_script.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"alice\n");
            to_script.write_all(b"ok> ").unwrap();
        });

        let script = Script {
            steps: vec![
                Step { expect: "name\\? ".into(), send: "alice\n".into() },
                Step { expect: "ok> ".into(), send: String::new() },
            ],
        };
        let source = TimeoutReader::new(out_read, Duration::from_secs(5));
        let mut sink = File::from(in_write);
        script.run(source, &mut sink).unwrap();
        responder.join().unwrap();
    }

    #[test]
    fn loads_json_script() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("login.json");
        std::fs::write(
            &path,
            r#"{ "steps": [ { "expect": "> ", "send": "run\n" }, { "expect": "done" } ] }"#,
        )
        .unwrap();
        let script = Script::load(&path).unwrap();
        assert_eq!(script.steps.len(), 2);
        assert_eq!(script.steps[1].send, "");
    }
}
