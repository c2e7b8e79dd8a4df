use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use anyhow::{anyhow, bail, Context, Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::inference::models::model::ModelBase;
use crate::inference::task::synthesize::{SynthesisParams, SynthesizeHandler, Voice};

const BUNDLED_WORKER: &str = include_str!("../../../resources/coqui_worker.py");

/// How to launch the synthesis worker process.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl WorkerCommand {
    /// Runs `script` (or the bundled worker when empty) with `program`, loading `model`.
    pub fn coqui(program: &str, script: &str, model: &str, cache_dir: &str) -> Self {
        let mut args = vec!["-u".to_string()];
        if script.is_empty() {
            args.push("-c".to_string());
            args.push(BUNDLED_WORKER.to_string());
        } else {
            args.push(script.to_string());
        }
        args.push(model.to_string());

        let mut env = vec![("COQUI_TOS_AGREED".to_string(), "1".to_string())];
        if !cache_dir.is_empty() {
            env.push(("TTS_HOME".to_string(), cache_dir.to_string()));
        }
        Self {
            program: program.to_string(),
            args,
            env,
        }
    }
}

#[derive(Deserialize, Debug)]
struct Handshake {
    ready: bool,
    #[serde(default)]
    speakers: Vec<String>,
    #[serde(default)]
    languages: Vec<String>,
    multilingual: Option<bool>,
    device: Option<String>,
    error: Option<String>,
}

#[derive(Serialize, Debug)]
struct WorkerRequest<'a> {
    text: &'a str,
    language: Option<&'a str>,
    speaker_wav: Option<&'a str>,
    speaker: Option<&'a str>,
    speed: Option<f32>,
    out_path: &'a str,
}

#[derive(Deserialize, Debug)]
struct WorkerReply {
    ok: bool,
    error: Option<String>,
}

/// Coqui TTS model living in a worker process for the lifetime of the service.
pub struct CoquiModel {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    speakers: Vec<String>,
    languages: Vec<String>,
    multilingual: bool,
    device: String,
}

impl CoquiModel {
    /// Starts the worker and blocks until it reports the model as loaded.
    #[tracing::instrument(level = "info", skip(command), fields(program = %command.program))]
    pub fn new(base: &ModelBase, command: &WorkerCommand) -> Result<Self> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("Failed to start synthesis worker {}", command.program))?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            bail!("Synthesis worker has no stdio pipes")
        };
        let mut model = Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            speakers: vec![],
            languages: vec![],
            multilingual: false,
            device: "cpu".to_string(),
        };

        let handshake: Handshake = model.read_message()?;
        if !handshake.ready {
            bail!(
                "Synthesis worker failed to load {}: {}",
                base.name,
                handshake.error.unwrap_or_else(|| "unknown error".into())
            );
        }
        model.speakers = handshake.speakers;
        model.multilingual = handshake
            .multilingual
            .unwrap_or(!handshake.languages.is_empty());
        model.languages = handshake.languages;
        if let Some(device) = handshake.device {
            model.device = device;
        }
        info!(
            "Loaded {} on {} with {} speakers and {} languages",
            base.name,
            model.device,
            model.speakers.len(),
            model.languages.len()
        );

        Ok(model)
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Next protocol line that parses as `T`, skipping anything else the worker prints.
    fn read_message<T: DeserializeOwned>(&mut self) -> Result<T> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.stdout.read_line(&mut line)? == 0 {
                let status = self.child.try_wait()?;
                bail!("Synthesis worker exited unexpectedly (status: {status:?})");
            }
            let trimmed = line.trim();
            if trimmed.starts_with('{') {
                if let Ok(message) = serde_json::from_str(trimmed) {
                    return Ok(message);
                }
            }
            if !trimmed.is_empty() {
                debug!("worker: {trimmed}");
            }
        }
    }
}

impl SynthesizeHandler for CoquiModel {
    fn speakers(&self) -> &[String] {
        &self.speakers
    }

    fn is_multilingual(&self) -> bool {
        self.multilingual
    }

    #[tracing::instrument(level = "info", skip(self, params))]
    fn run_synthesize(&mut self, params: &SynthesisParams, output: &Path) -> Result<(), Error> {
        let out_path = output
            .to_str()
            .ok_or_else(|| anyhow!("Output path is not valid UTF-8"))?;
        let (speaker_wav, speaker) = match &params.voice {
            Voice::Clone(wav) => (Some(wav.as_str()), None),
            Voice::Preset(name) => (None, Some(name.as_str())),
            Voice::ModelDefault => (None, None),
        };
        let request = WorkerRequest {
            text: &params.text,
            language: params.language.as_deref(),
            speaker_wav,
            speaker,
            speed: params.speed,
            out_path,
        };

        let mut line = serde_json::to_string(&request)?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes())?;
        self.stdin.flush()?;

        let reply: WorkerReply = self.read_message()?;
        if !reply.ok {
            bail!(reply.error.unwrap_or_else(|| "unknown worker error".into()));
        }
        Ok(())
    }
}

impl Drop for CoquiModel {
    fn drop(&mut self) {
        if let Err(err) = self.child.kill() {
            warn!("Failed to stop synthesis worker: {err}");
        }
        let _ = self.child.wait();
    }
}
