//! Per-call recording: raw audio legs plus a JSON transcript.
//!
//! Each call gets its own directory under the configured root:
//! `user-audio.raw` and `agent-audio.raw` hold the wire bytes of each
//! leg, `transcript.json` the ordered turn array, and `thoughts.json`
//! (when present) any internal notes the agent produced.

use crate::error::{CallError, Result};
use crate::session::{CallId, ConversationTurn, SpeakerRole};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

const USER_AUDIO_FILE: &str = "user-audio.raw";
const AGENT_AUDIO_FILE: &str = "agent-audio.raw";
const TRANSCRIPT_FILE: &str = "transcript.json";
const THOUGHTS_FILE: &str = "thoughts.json";

/// One internal-note entry.
#[derive(Debug, Clone, Serialize)]
pub struct ThoughtEntry {
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Writer for one call's recording directory.
#[derive(Debug)]
pub struct CallRecorder {
    dir: PathBuf,
    user_audio: BufWriter<File>,
    agent_audio: BufWriter<File>,
    transcript: Vec<ConversationTurn>,
    thoughts: Vec<ThoughtEntry>,
}

impl CallRecorder {
    /// Create the recording directory for a call.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or audio files cannot be created.
    pub fn create(root: &Path, call: &CallId) -> Result<Self> {
        let dir = root.join(call.as_str());
        fs::create_dir_all(&dir)?;
        let user_audio = BufWriter::new(File::create(dir.join(USER_AUDIO_FILE))?);
        let agent_audio = BufWriter::new(File::create(dir.join(AGENT_AUDIO_FILE))?);
        info!("recording call {call} to {}", dir.display());
        Ok(Self {
            dir,
            user_audio,
            agent_audio,
            transcript: Vec::new(),
            thoughts: Vec::new(),
        })
    }

    pub fn append_user_audio(&mut self, audio: &[u8]) -> Result<()> {
        self.user_audio.write_all(audio)?;
        Ok(())
    }

    pub fn append_agent_audio(&mut self, audio: &[u8]) -> Result<()> {
        self.agent_audio.write_all(audio)?;
        Ok(())
    }

    pub fn record_transcript(&mut self, role: SpeakerRole, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        self.transcript.push(ConversationTurn {
            role,
            text: text.to_owned(),
            timestamp: Utc::now(),
        });
    }

    pub fn record_thought(&mut self, text: &str) {
        self.thoughts.push(ThoughtEntry {
            text: text.to_owned(),
            timestamp: Utc::now(),
        });
    }

    /// Flush audio and write the JSON artifacts. Returns the directory.
    ///
    /// # Errors
    ///
    /// Returns an error if any flush or write fails.
    pub fn finalize(mut self) -> Result<PathBuf> {
        self.user_audio.flush()?;
        self.agent_audio.flush()?;

        let transcript = serde_json::to_string_pretty(&self.transcript)
            .map_err(|e| CallError::Recording(format!("failed to serialize transcript: {e}")))?;
        fs::write(self.dir.join(TRANSCRIPT_FILE), transcript)?;

        if !self.thoughts.is_empty() {
            let thoughts = serde_json::to_string_pretty(&self.thoughts)
                .map_err(|e| CallError::Recording(format!("failed to serialize thoughts: {e}")))?;
            fs::write(self.dir.join(THOUGHTS_FILE), thoughts)?;
        }

        info!("finalized recording in {}", self.dir.display());
        Ok(self.dir)
    }
}
