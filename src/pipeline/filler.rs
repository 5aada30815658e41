//! Filler and acknowledgment scheduling.
//!
//! Fillers ("So, about pricing...") mask LLM latency: one is emitted
//! immediately after an utterance is accepted, in parallel with
//! generation. Acknowledgments ("Uh-huh.") are shorter still and fire only
//! on continuations, under a per-session cooldown. Both are synthesized
//! once at startup into an immutable cache so the hot path never waits on
//! TTS.

use crate::config::FillerConfig;
use crate::error::Result;
use crate::tts::TtsAdapter;
use bytes::Bytes;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Coarse position in the call, derived from completed user turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationStage {
    Opening,
    Discovery,
    Closing,
}

impl ConversationStage {
    pub fn from_turn_count(user_turns: usize) -> Self {
        match user_turns {
            0..=1 => Self::Opening,
            2..=7 => Self::Discovery,
            _ => Self::Closing,
        }
    }
}

/// Light keyword classification of the user utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtteranceIntent {
    Pricing,
    Scheduling,
    Objection,
    Clarification,
    Generic,
}

/// (intent, keywords) — first match wins, scanned in order.
const INTENT_TABLE: &[(UtteranceIntent, &[&str])] = &[
    (
        UtteranceIntent::Pricing,
        &["price", "pricing", "cost", "how much", "expensive", "dollar", "fee", "discount"],
    ),
    (
        UtteranceIntent::Scheduling,
        &["schedule", "appointment", "calendar", "meeting", "call back", "tomorrow", "next week", "what time"],
    ),
    (
        UtteranceIntent::Objection,
        &["not interested", "no thanks", "stop calling", "too busy", "already have", "don't need"],
    ),
    (
        UtteranceIntent::Clarification,
        &["what do you mean", "can you repeat", "didn't catch", "say that again", "don't understand", "confused"],
    ),
];

/// Classify a user utterance by keyword scan, falling back to generic.
pub fn classify_intent(text: &str) -> UtteranceIntent {
    let lower = text.to_lowercase();
    for (intent, keywords) in INTENT_TABLE {
        if keywords.iter().any(|k| lower.contains(k)) {
            return *intent;
        }
    }
    UtteranceIntent::Generic
}

/// The three fixed filler categories plus personalised templates.
#[derive(Debug, Clone)]
pub struct FillerLibrary {
    pub generic: Vec<String>,
    pub transition: Vec<String>,
    pub clarification: Vec<String>,
    /// Templates keyed by prospect name; `{name}` is the only placeholder.
    pub personalized: HashMap<String, Vec<String>>,
}

impl FillerLibrary {
    /// Built-in lists merged with config additions.
    pub fn from_config(config: &FillerConfig) -> Self {
        let mut generic = vec![
            "Let me see...".to_owned(),
            "One moment...".to_owned(),
            "Good question.".to_owned(),
            "Right, okay.".to_owned(),
        ];
        generic.extend(config.extra_generic.iter().cloned());

        Self {
            generic,
            transition: vec![
                "So, about that...".to_owned(),
                "About pricing, one second.".to_owned(),
                "Let me check the schedule for you.".to_owned(),
                "I hear you. Let me think.".to_owned(),
            ],
            clarification: vec![
                "Just to make sure I understand...".to_owned(),
                "Let me make sure I've got that right.".to_owned(),
            ],
            personalized: config.personalized.clone(),
        }
    }

    /// Every concrete text the cache must hold (templates expanded).
    fn all_texts(&self) -> Vec<String> {
        let mut texts: Vec<String> = Vec::new();
        texts.extend(self.generic.iter().cloned());
        texts.extend(self.transition.iter().cloned());
        texts.extend(self.clarification.iter().cloned());
        for (name, templates) in &self.personalized {
            for template in templates {
                texts.push(template.replace("{name}", name));
            }
        }
        texts.sort();
        texts.dedup();
        texts
    }
}

/// Acknowledgment texts. Short on purpose: they play under the caller's
/// ongoing speech.
const ACKNOWLEDGMENTS: &[&str] = &["Uh-huh.", "Right.", "Mm-hmm.", "Okay."];

/// One pre-synthesised utterance.
#[derive(Debug, Clone)]
pub struct CachedUtterance {
    pub text: String,
    pub audio: Bytes,
    pub duration: Duration,
}

/// Immutable cache of pre-synthesised fillers and acknowledgments.
///
/// Built once at process startup; shared read-only across sessions.
#[derive(Debug, Default)]
pub struct FillerCache {
    fillers: HashMap<String, CachedUtterance>,
    acks: Vec<CachedUtterance>,
}

impl FillerCache {
    /// Synthesize every library text through the TTS adapter's filler
    /// voice. Individual failures are logged and skipped; the scheduler
    /// simply has fewer choices.
    ///
    /// # Errors
    ///
    /// Returns an error only when *no* acknowledgment could be synthesized
    /// (the continuation path would be silent).
    pub async fn prewarm(library: &FillerLibrary, tts: &dyn TtsAdapter) -> Result<Self> {
        let mut fillers = HashMap::new();
        for text in library.all_texts() {
            match tts.synthesize_filler(&text).await {
                Ok(speech) => {
                    fillers.insert(
                        text.clone(),
                        CachedUtterance {
                            text,
                            audio: speech.audio,
                            duration: speech.duration,
                        },
                    );
                }
                Err(e) => warn!("filler prewarm failed for \"{text}\": {e}"),
            }
        }

        let mut acks = Vec::new();
        for text in ACKNOWLEDGMENTS {
            match tts.synthesize_filler(text).await {
                Ok(speech) => acks.push(CachedUtterance {
                    text: (*text).to_owned(),
                    audio: speech.audio,
                    duration: speech.duration,
                }),
                Err(e) => warn!("acknowledgment prewarm failed for \"{text}\": {e}"),
            }
        }
        if acks.is_empty() {
            return Err(crate::error::CallError::Tts(
                "no acknowledgment could be pre-synthesized".to_owned(),
            ));
        }

        info!(
            fillers = fillers.len(),
            acks = acks.len(),
            "filler cache warmed"
        );
        Ok(Self { fillers, acks })
    }

    /// Build a cache from already-synthesized utterances (tests, embedders
    /// with their own asset pipeline).
    pub fn from_parts(fillers: Vec<CachedUtterance>, acks: Vec<CachedUtterance>) -> Self {
        Self {
            fillers: fillers.into_iter().map(|u| (u.text.clone(), u)).collect(),
            acks,
        }
    }

    pub fn get(&self, text: &str) -> Option<&CachedUtterance> {
        self.fillers.get(text)
    }

    pub fn is_empty(&self) -> bool {
        self.fillers.is_empty() && self.acks.is_empty()
    }
}

/// Per-session filler/acknowledgment selection.
#[derive(Debug)]
pub struct FillerScheduler {
    cache: Arc<FillerCache>,
    library: FillerLibrary,
    enabled: bool,
    ack_cooldown: Duration,
    last_ack: Option<Instant>,
}

impl FillerScheduler {
    pub fn new(config: &FillerConfig, library: FillerLibrary, cache: Arc<FillerCache>) -> Self {
        Self {
            cache,
            library,
            enabled: config.enabled,
            ack_cooldown: Duration::from_millis(config.ack_cooldown_ms),
            last_ack: None,
        }
    }

    /// Choose a filler for an accepted utterance. Returns a cached clone;
    /// never synthesizes on the hot path.
    pub fn pick_filler(
        &self,
        stage: ConversationStage,
        user_text: &str,
        prospect_name: Option<&str>,
    ) -> Option<CachedUtterance> {
        if !self.enabled {
            return None;
        }
        let intent = classify_intent(user_text);

        // Intent-specific transition entries take priority.
        let keyword = match intent {
            UtteranceIntent::Pricing => Some("pricing"),
            UtteranceIntent::Scheduling => Some("schedule"),
            UtteranceIntent::Objection => Some("hear you"),
            UtteranceIntent::Clarification | UtteranceIntent::Generic => None,
        };
        if let Some(keyword) = keyword {
            let hit = self
                .library
                .transition
                .iter()
                .find(|t| t.to_lowercase().contains(keyword))
                .and_then(|t| self.cache.get(t));
            if let Some(utterance) = hit {
                return Some(utterance.clone());
            }
        }

        if intent == UtteranceIntent::Clarification {
            if let Some(utterance) = self.pick_from(&self.library.clarification) {
                return Some(utterance);
            }
        }

        // Personalised fillers when the prospect name has templates.
        if let Some(name) = prospect_name
            && let Some(templates) = self.library.personalized.get(name)
        {
            let expanded: Vec<String> =
                templates.iter().map(|t| t.replace("{name}", name)).collect();
            if let Some(utterance) = self.pick_from(&expanded) {
                return Some(utterance);
            }
        }

        let category = match stage {
            ConversationStage::Opening | ConversationStage::Closing => &self.library.generic,
            ConversationStage::Discovery => &self.library.transition,
        };
        self.pick_from(category)
            .or_else(|| self.pick_from(&self.library.generic))
    }

    /// Choose an acknowledgment, or `None` while the cooldown holds.
    pub fn pick_acknowledgment(&mut self, now: Instant) -> Option<CachedUtterance> {
        if !self.enabled {
            return None;
        }
        if let Some(last) = self.last_ack
            && now.saturating_duration_since(last) < self.ack_cooldown
        {
            return None;
        }
        let choice = self.cache.acks.choose(&mut rand::thread_rng())?.clone();
        self.last_ack = Some(now);
        Some(choice)
    }

    fn pick_from(&self, texts: &[String]) -> Option<CachedUtterance> {
        let cached: Vec<&CachedUtterance> =
            texts.iter().filter_map(|t| self.cache.get(t)).collect();
        cached.choose(&mut rand::thread_rng()).map(|u| (*u).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utterance(text: &str) -> CachedUtterance {
        CachedUtterance {
            text: text.to_owned(),
            audio: Bytes::from_static(&[0xFF; 160]),
            duration: Duration::from_millis(400),
        }
    }

    fn scheduler() -> FillerScheduler {
        let config = FillerConfig::default();
        let library = FillerLibrary::from_config(&config);
        let mut fillers: Vec<CachedUtterance> = Vec::new();
        for text in library
            .generic
            .iter()
            .chain(&library.transition)
            .chain(&library.clarification)
        {
            fillers.push(utterance(text));
        }
        let acks = vec![utterance("Uh-huh.")];
        FillerScheduler::new(
            &config,
            library,
            Arc::new(FillerCache::from_parts(fillers, acks)),
        )
    }

    #[test]
    fn intent_classification_hits_keywords() {
        assert_eq!(classify_intent("What's the price?"), UtteranceIntent::Pricing);
        assert_eq!(
            classify_intent("Can we schedule a meeting?"),
            UtteranceIntent::Scheduling
        );
        assert_eq!(
            classify_intent("I'm not interested, stop calling"),
            UtteranceIntent::Objection
        );
        assert_eq!(
            classify_intent("Sorry, I didn't catch that"),
            UtteranceIntent::Clarification
        );
        assert_eq!(classify_intent("Tell me about the weather"), UtteranceIntent::Generic);
    }

    #[test]
    fn stage_from_turn_count() {
        assert_eq!(ConversationStage::from_turn_count(0), ConversationStage::Opening);
        assert_eq!(ConversationStage::from_turn_count(3), ConversationStage::Discovery);
        assert_eq!(ConversationStage::from_turn_count(12), ConversationStage::Closing);
    }

    #[test]
    fn pricing_question_gets_pricing_filler() {
        let sched = scheduler();
        let filler = sched
            .pick_filler(ConversationStage::Discovery, "What's the price?", None)
            .expect("filler");
        assert!(filler.text.to_lowercase().contains("pricing"));
    }

    #[test]
    fn generic_fallback_always_available() {
        let sched = scheduler();
        let filler = sched
            .pick_filler(ConversationStage::Opening, "hello there", None)
            .expect("filler");
        assert!(!filler.text.is_empty());
    }

    #[test]
    fn ack_cooldown_limits_rate() {
        let mut sched = scheduler();
        let t0 = Instant::now();
        assert!(sched.pick_acknowledgment(t0).is_some());
        assert!(sched.pick_acknowledgment(t0 + Duration::from_secs(1)).is_none());
        assert!(sched.pick_acknowledgment(t0 + Duration::from_secs(4)).is_some());
    }

    #[test]
    fn disabled_scheduler_stays_silent() {
        let config = FillerConfig {
            enabled: false,
            ..Default::default()
        };
        let library = FillerLibrary::from_config(&config);
        let mut sched = FillerScheduler::new(
            &config,
            library,
            Arc::new(FillerCache::from_parts(vec![utterance("Hm.")], vec![utterance("Uh-huh.")])),
        );
        assert!(sched.pick_filler(ConversationStage::Opening, "hello", None).is_none());
        assert!(sched.pick_acknowledgment(Instant::now()).is_none());
    }

    #[test]
    fn personalized_templates_expand_name() {
        let mut config = FillerConfig::default();
        config
            .personalized
            .insert("Dana".to_owned(), vec!["Good point, {name}.".to_owned()]);
        let library = FillerLibrary::from_config(&config);
        let texts = library.all_texts();
        assert!(texts.contains(&"Good point, Dana.".to_owned()));

        let fillers = vec![utterance("Good point, Dana.")];
        let sched = FillerScheduler::new(
            &config,
            library,
            Arc::new(FillerCache::from_parts(fillers, vec![utterance("Uh-huh.")])),
        );
        let filler = sched
            .pick_filler(ConversationStage::Discovery, "tell me more", Some("Dana"))
            .expect("personalized filler");
        assert_eq!(filler.text, "Good point, Dana.");
    }
}
