//! In-process mock adapters and helpers for call-flow tests.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use voxcall::config::OrchestratorConfig;
use voxcall::error::{CallError, Result};
use voxcall::llm::{ChatMessage, ChatRole, GenerationOptions, LlmAdapter};
use voxcall::pipeline::filler::{CachedUtterance, FillerCache, FillerLibrary};
use voxcall::pipeline::messages::{SessionEvent, SttEvent, SttEventKind};
use voxcall::session::CallId;
use voxcall::stt::{SttAdapter, SttCapabilities, SttStream, TranscriptionResult};
use voxcall::telephony::TelephonyAdapter;
use voxcall::tts::{SynthesizedSpeech, TtsAdapter};
use voxcall::{AdapterSet, SessionCapabilities};

/// Telephony mock recording every outbound operation.
#[derive(Default)]
pub struct MockTelephony {
    pub sent: Mutex<Vec<Bytes>>,
    pub cleared: AtomicUsize,
}

impl MockTelephony {
    pub fn sent_chunks(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl TelephonyAdapter for MockTelephony {
    async fn make_call(&self, _phone: &str) -> Result<CallId> {
        Ok(CallId::generate())
    }

    async fn end_call(&self, _call: &CallId) -> Result<()> {
        Ok(())
    }

    async fn send_audio(&self, _call: &CallId, audio: Bytes) -> Result<()> {
        self.sent.lock().unwrap().push(audio);
        Ok(())
    }

    async fn clear_egress_buffer(&self, _call: &CallId) -> Result<()> {
        self.cleared.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Streaming STT mock; tests push partial/final events directly.
#[derive(Default)]
pub struct MockStt {
    events: Arc<Mutex<Option<mpsc::Sender<SttEvent>>>>,
}

impl MockStt {
    pub async fn send_partial(&self, text: &str) {
        self.send(SttEventKind::Partial(text.to_owned())).await;
    }

    pub async fn send_final(&self, text: &str) {
        self.send(SttEventKind::Final(text.to_owned())).await;
    }

    async fn send(&self, kind: SttEventKind) {
        let sender = self
            .events
            .lock()
            .unwrap()
            .clone()
            .expect("stream not started");
        sender
            .send(SttEvent {
                kind,
                at: Instant::now(),
            })
            .await
            .expect("stt channel open");
    }
}

/// Stream handle whose `finish` drops the event sender, ending the
/// session's transcript input like a real provider hangup would.
struct MockSttStream {
    events: Arc<Mutex<Option<mpsc::Sender<SttEvent>>>>,
}

#[async_trait]
impl SttStream for MockSttStream {
    async fn feed(&mut self, _audio: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        let _ = self.events.lock().unwrap().take();
        Ok(())
    }
}

#[async_trait]
impl SttAdapter for MockStt {
    fn capabilities(&self) -> SttCapabilities {
        SttCapabilities {
            streaming_partials: true,
        }
    }

    async fn transcribe(&self, _audio: &[u8]) -> Result<TranscriptionResult> {
        Ok(TranscriptionResult {
            text: String::new(),
            confidence: None,
        })
    }

    async fn start_stream(
        &self,
        _call: &CallId,
        events: mpsc::Sender<SttEvent>,
    ) -> Result<Box<dyn SttStream>> {
        *self.events.lock().unwrap() = Some(events);
        Ok(Box::new(MockSttStream {
            events: Arc::clone(&self.events),
        }))
    }
}

/// One scripted LLM response.
pub enum LlmScript {
    Tokens(Vec<&'static str>),
    Fail(&'static str),
}

/// Token-streaming LLM mock with a response script and call recording.
pub struct MockLlm {
    script: Mutex<VecDeque<LlmScript>>,
    pub calls: AtomicUsize,
    pub requests: Mutex<Vec<Vec<ChatMessage>>>,
    token_delay: Duration,
}

impl MockLlm {
    pub fn new(script: Vec<LlmScript>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            token_delay: Duration::from_millis(5),
        }
    }

    /// Slow down token emission so tests can interrupt mid-generation.
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// User-role contents of the most recent request.
    pub fn last_user_messages(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .last()
            .map(|msgs| {
                msgs.iter()
                    .filter(|m| m.role == ChatRole::User)
                    .map(|m| m.content.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl LlmAdapter for MockLlm {
    fn supports_streaming(&self) -> bool {
        true
    }

    async fn generate(
        &self,
        messages: &[ChatMessage],
        opts: &GenerationOptions,
    ) -> Result<String> {
        let (tx, mut rx) = mpsc::channel(64);
        self.generate_stream(messages, opts, tx).await?;
        let mut text = String::new();
        while let Ok(token) = rx.try_recv() {
            text.push_str(&token);
        }
        Ok(text)
    }

    async fn generate_stream(
        &self,
        messages: &[ChatMessage],
        _opts: &GenerationOptions,
        tokens: mpsc::Sender<String>,
    ) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(messages.to_vec());

        let script = self.script.lock().unwrap().pop_front();
        let token_list = match script {
            Some(LlmScript::Tokens(list)) => list,
            Some(LlmScript::Fail(reason)) => return Err(CallError::Llm(reason.to_owned())),
            None => vec!["Okay."],
        };
        for token in token_list {
            tokio::time::sleep(self.token_delay).await;
            if tokens.send(token.to_owned()).await.is_err() {
                return Ok(());
            }
        }
        Ok(())
    }
}

/// Batch TTS mock producing `bytes_per_char` of µ-law silence per input
/// character, so playback duration is proportional to text length.
pub struct MockTts {
    pub bytes_per_char: usize,
}

impl MockTts {
    pub fn new(bytes_per_char: usize) -> Self {
        Self { bytes_per_char }
    }
}

#[async_trait]
impl TtsAdapter for MockTts {
    async fn synthesize(&self, text: &str) -> Result<SynthesizedSpeech> {
        let len = text.chars().count() * self.bytes_per_char;
        Ok(SynthesizedSpeech {
            audio: Bytes::from(vec![0xFF_u8; len]),
            duration: Duration::from_secs_f64(len as f64 / 8_000.0),
        })
    }
}

/// Adapter bundle plus handles the tests drive directly.
pub struct Harness {
    pub adapters: AdapterSet,
    pub telephony: Arc<MockTelephony>,
    pub stt: Arc<MockStt>,
    pub llm: Arc<MockLlm>,
}

pub fn harness(llm: MockLlm, tts_bytes_per_char: usize) -> Harness {
    let telephony = Arc::new(MockTelephony::default());
    let stt = Arc::new(MockStt::default());
    let llm = Arc::new(llm);
    let adapters = AdapterSet {
        telephony: Arc::clone(&telephony) as _,
        stt: Arc::clone(&stt) as _,
        llm: Arc::clone(&llm) as _,
        tts: Arc::new(MockTts::new(tts_bytes_per_char)) as _,
    };
    Harness {
        adapters,
        telephony,
        stt,
        llm,
    }
}

/// Test config: short debounces, no greeting unless a test enables one.
pub fn test_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.aggregator.partial_debounce_ms = 50;
    config.aggregator.batch_debounce_ms = 100;
    config.greeting.text = String::new();
    config.greeting.personalized_text = None;
    config
}

/// Filler cache matching the built-in library, with tiny fake audio.
pub fn test_filler_cache() -> Arc<FillerCache> {
    let library = FillerLibrary::from_config(&Default::default());
    let utterance = |text: &str| CachedUtterance {
        text: text.to_owned(),
        audio: Bytes::from(vec![0xFF_u8; 400]),
        duration: Duration::from_millis(50),
    };
    let fillers = library
        .generic
        .iter()
        .chain(&library.transition)
        .chain(&library.clarification)
        .map(|t| utterance(t))
        .collect();
    Arc::new(FillerCache::from_parts(fillers, vec![utterance("Uh-huh.")]))
}

/// Await the first event matching `pred`, failing after `timeout`.
pub async fn wait_for_event(
    rx: &mut broadcast::Receiver<SessionEvent>,
    timeout: Duration,
    pred: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let event = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel open");
        if pred(&event) {
            return event;
        }
    }
}

/// Poll until `pred` holds, failing after `timeout`.
pub async fn wait_until(timeout: Duration, pred: impl Fn() -> bool) {
    let deadline = Instant::now() + timeout;
    while !pred() {
        assert!(Instant::now() < deadline, "timed out waiting for condition");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Unused-capability probe smoke check shared by a couple of tests.
pub fn assert_streaming_caps(caps: SessionCapabilities) {
    assert!(caps.stt_partials);
    assert!(caps.llm_streaming);
}
