//! Turn-taking: deciding when a block of user audio is complete.
//!
//! Automatic mode:
//!
//! ```text
//! listening -> detecting-speech -> speech-active <-> silence-timeout -> turn-complete -> listening
//!                    |
//!                    +-> listening (false start)
//! ```
//!
//! Manual mode:
//!
//! ```text
//! listening -> buffering -> committed -> listening
//! ```
//!
//! Timing is derived from frame durations, not the wall clock, so the
//! controller behaves identically under backpressure and in tests.

use std::collections::VecDeque;

use chorus_types::TurnMode;
use serde::{Deserialize, Serialize};

use crate::audio::AudioFrame;

/// Voice-activity parameters. Correct values are venue-dependent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TurnDetectionConfig {
    /// Activity level (0.0-1.0, see [`AudioFrame::activity_level`]) above
    /// which a frame counts as speech. Lower is more sensitive.
    pub threshold: f32,
    /// Audio retained from before speech onset so the first syllable is kept.
    pub prefix_padding_ms: u32,
    /// Trailing silence that ends a turn.
    pub silence_duration_ms: u32,
    /// Continuous speech required before onset is confirmed.
    pub min_speech_ms: u32,
}

impl Default for TurnDetectionConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
            min_speech_ms: 40,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Listening,
    DetectingSpeech,
    SpeechActive,
    SilenceTimeout,
    TurnComplete,
    Buffering,
    Committed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnEndReason {
    /// Trailing silence reached the configured duration.
    Silence,
    /// An explicit commit instruction.
    Commit,
}

/// Audio that makes up one complete turn, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedTurn {
    pub frames: Vec<AudioFrame>,
    pub reason: TurnEndReason,
}

impl CompletedTurn {
    /// All samples of the turn, concatenated.
    pub fn samples(&self) -> Vec<i16> {
        let total = self.frames.iter().map(|f| f.samples.len()).sum();
        let mut out = Vec::with_capacity(total);
        for frame in &self.frames {
            out.extend_from_slice(&frame.samples);
        }
        out
    }

    pub fn duration_ms(&self) -> u32 {
        self.frames.iter().map(AudioFrame::duration_ms).sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// Speech onset confirmed (automatic mode).
    SpeechStarted,
    /// A turn ended; its audio must be flushed to the speech model.
    TurnComplete(CompletedTurn),
}

/// Per-session turn detector. Single writer: owned by the session loop.
#[derive(Debug)]
pub struct TurnController {
    mode: TurnMode,
    config: TurnDetectionConfig,
    state: TurnState,
    padding: VecDeque<AudioFrame>,
    padding_ms: u32,
    buffer: Vec<AudioFrame>,
    voiced_ms: u32,
    silence_ms: u32,
}

impl TurnController {
    pub fn new(mode: TurnMode, config: TurnDetectionConfig) -> Self {
        Self {
            mode,
            config,
            state: TurnState::Listening,
            padding: VecDeque::new(),
            padding_ms: 0,
            buffer: Vec::new(),
            voiced_ms: 0,
            silence_ms: 0,
        }
    }

    pub fn mode(&self) -> TurnMode {
        self.mode
    }

    pub fn config(&self) -> &TurnDetectionConfig {
        &self.config
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    /// Milliseconds of audio held for the current (uncommitted) turn.
    pub fn buffered_ms(&self) -> u32 {
        self.buffer.iter().map(AudioFrame::duration_ms).sum()
    }

    /// Replaces the detection parameters. In-flight buffers are kept.
    pub fn set_config(&mut self, config: TurnDetectionConfig) {
        self.config = config;
        self.trim_padding();
    }

    /// Switches mode. Buffered audio is retained and belongs to the next
    /// turn in the new mode.
    pub fn set_mode(&mut self, mode: TurnMode) {
        if mode == self.mode {
            return;
        }
        self.mode = mode;
        self.voiced_ms = 0;
        self.silence_ms = 0;
        self.state = match (mode, self.buffer.is_empty()) {
            (_, true) => TurnState::Listening,
            (TurnMode::Manual, false) => TurnState::Buffering,
            (TurnMode::Automatic, false) => TurnState::SpeechActive,
        };
    }

    /// Feeds one frame of normalized input audio.
    pub fn push_frame(&mut self, frame: AudioFrame) -> Option<TurnEvent> {
        if matches!(self.state, TurnState::TurnComplete | TurnState::Committed) {
            self.state = TurnState::Listening;
        }
        match self.mode {
            TurnMode::Automatic => self.push_automatic(frame),
            TurnMode::Manual => {
                self.buffer.push(frame);
                self.state = TurnState::Buffering;
                None
            }
        }
    }

    /// Handles an explicit commit instruction.
    ///
    /// Returns the buffered turn, or `None` if nothing is buffered. In
    /// automatic mode this force-ends a turn that is in progress.
    pub fn commit(&mut self) -> Option<TurnEvent> {
        if self.buffer.is_empty() {
            return None;
        }
        let turn = self.take_turn(TurnEndReason::Commit);
        self.state = match self.mode {
            TurnMode::Manual => TurnState::Committed,
            TurnMode::Automatic => TurnState::TurnComplete,
        };
        Some(TurnEvent::TurnComplete(turn))
    }

    /// Removes any partial turn, e.g. on session teardown.
    pub fn take_buffered(&mut self) -> Vec<AudioFrame> {
        self.voiced_ms = 0;
        self.silence_ms = 0;
        self.state = TurnState::Listening;
        std::mem::take(&mut self.buffer)
    }

    fn push_automatic(&mut self, frame: AudioFrame) -> Option<TurnEvent> {
        let frame_ms = frame.duration_ms();
        let voiced = frame.activity_level() >= self.config.threshold;

        match self.state {
            TurnState::Listening => {
                if voiced {
                    self.buffer.extend(self.padding.drain(..));
                    self.padding_ms = 0;
                    self.buffer.push(frame);
                    self.voiced_ms = frame_ms;
                    self.state = TurnState::DetectingSpeech;
                    return self.confirm_onset();
                }
                self.padding.push_back(frame);
                self.padding_ms += frame_ms;
                self.trim_padding();
                None
            }
            TurnState::DetectingSpeech => {
                if voiced {
                    self.buffer.push(frame);
                    self.voiced_ms += frame_ms;
                    return self.confirm_onset();
                }
                // False start: the audio goes back to being leading padding.
                for f in self.buffer.drain(..) {
                    self.padding_ms += f.duration_ms();
                    self.padding.push_back(f);
                }
                self.padding_ms += frame_ms;
                self.padding.push_back(frame);
                self.trim_padding();
                self.voiced_ms = 0;
                self.state = TurnState::Listening;
                None
            }
            TurnState::SpeechActive | TurnState::SilenceTimeout => {
                self.buffer.push(frame);
                if voiced {
                    self.silence_ms = 0;
                    self.state = TurnState::SpeechActive;
                    return None;
                }
                self.silence_ms += frame_ms;
                self.state = TurnState::SilenceTimeout;
                if self.silence_ms >= self.config.silence_duration_ms {
                    let turn = self.take_turn(TurnEndReason::Silence);
                    self.state = TurnState::TurnComplete;
                    return Some(TurnEvent::TurnComplete(turn));
                }
                None
            }
            // Manual-only states; reached only if the mode changed mid-turn.
            TurnState::Buffering | TurnState::Committed | TurnState::TurnComplete => {
                self.state = TurnState::SpeechActive;
                self.push_automatic(frame)
            }
        }
    }

    fn confirm_onset(&mut self) -> Option<TurnEvent> {
        if self.voiced_ms >= self.config.min_speech_ms {
            self.state = TurnState::SpeechActive;
            self.silence_ms = 0;
            Some(TurnEvent::SpeechStarted)
        } else {
            None
        }
    }

    fn take_turn(&mut self, reason: TurnEndReason) -> CompletedTurn {
        self.voiced_ms = 0;
        self.silence_ms = 0;
        CompletedTurn {
            frames: std::mem::take(&mut self.buffer),
            reason,
        }
    }

    fn trim_padding(&mut self) {
        while self.padding_ms > self.config.prefix_padding_ms {
            match self.padding.pop_front() {
                Some(old) => self.padding_ms -= old.duration_ms(),
                None => {
                    self.padding_ms = 0;
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioFormat;

    const FMT: AudioFormat = AudioFormat::pcm16(24_000, 1);

    fn speech() -> AudioFrame {
        AudioFrame::new(vec![8_000; 480], FMT)
    }

    fn silence() -> AudioFrame {
        AudioFrame::new(vec![0; 480], FMT)
    }

    fn tagged(value: i16) -> AudioFrame {
        AudioFrame::new(vec![value; 480], FMT)
    }

    fn config(silence_duration_ms: u32) -> TurnDetectionConfig {
        TurnDetectionConfig {
            silence_duration_ms,
            ..TurnDetectionConfig::default()
        }
    }

    #[test]
    fn manual_commit_flushes_all_chunks_once_in_order() {
        let mut turns = TurnController::new(TurnMode::Manual, config(500));
        for value in [1, 2, 3] {
            assert_eq!(turns.push_frame(tagged(value)), None);
            assert_eq!(turns.state(), TurnState::Buffering);
        }

        let Some(TurnEvent::TurnComplete(turn)) = turns.commit() else {
            panic!("commit should flush the buffered turn");
        };
        assert_eq!(turn.reason, TurnEndReason::Commit);
        assert_eq!(turn.frames.len(), 3);
        let expected: Vec<i16> = [1, 2, 3].iter().flat_map(|&v| vec![v; 480]).collect();
        assert_eq!(turn.samples(), expected);
        assert_eq!(turns.state(), TurnState::Committed);

        assert_eq!(turns.commit(), None, "second commit has nothing to flush");
    }

    #[test]
    fn manual_mode_never_ends_a_turn_on_silence() {
        let mut turns = TurnController::new(TurnMode::Manual, config(100));
        turns.push_frame(speech());
        for _ in 0..100 {
            assert_eq!(turns.push_frame(silence()), None);
        }
        assert_eq!(turns.buffered_ms(), 101 * 20);
    }

    #[test]
    fn automatic_turn_completes_once_at_silence_mark() {
        let mut turns = TurnController::new(TurnMode::Automatic, config(500));
        let mut completions = Vec::new();
        let mut started = 0;

        // 2 s of speech.
        for _ in 0..100 {
            match turns.push_frame(speech()) {
                Some(TurnEvent::SpeechStarted) => started += 1,
                Some(TurnEvent::TurnComplete(_)) => panic!("turn ended during speech"),
                None => {}
            }
        }
        assert_eq!(started, 1);
        assert_eq!(turns.state(), TurnState::SpeechActive);

        // 600 ms of silence.
        for i in 0..30 {
            if let Some(TurnEvent::TurnComplete(turn)) = turns.push_frame(silence()) {
                completions.push(((i + 1) * 20, turn));
            }
        }

        assert_eq!(completions.len(), 1, "turn-complete must fire exactly once");
        let (silence_at, turn) = &completions[0];
        assert!(*silence_at >= 500, "fired after only {silence_at} ms of silence");
        assert_eq!(*silence_at, 500);
        assert_eq!(turn.reason, TurnEndReason::Silence);
        assert_eq!(turn.duration_ms(), 2_000 + 500);
        assert_eq!(turns.state(), TurnState::TurnComplete);
    }

    #[test]
    fn resumed_speech_resets_the_silence_timer() {
        let mut turns = TurnController::new(TurnMode::Automatic, config(200));
        for _ in 0..10 {
            turns.push_frame(speech());
        }
        for _ in 0..9 {
            assert!(turns.push_frame(silence()).is_none());
        }
        assert_eq!(turns.state(), TurnState::SilenceTimeout);
        turns.push_frame(speech());
        assert_eq!(turns.state(), TurnState::SpeechActive);
        for _ in 0..9 {
            assert!(turns.push_frame(silence()).is_none());
        }
        assert!(matches!(
            turns.push_frame(silence()),
            Some(TurnEvent::TurnComplete(_))
        ));
    }

    #[test]
    fn leading_padding_is_kept_and_bounded() {
        let cfg = TurnDetectionConfig {
            prefix_padding_ms: 60,
            silence_duration_ms: 40,
            ..TurnDetectionConfig::default()
        };
        let mut turns = TurnController::new(TurnMode::Automatic, cfg);
        for _ in 0..20 {
            turns.push_frame(AudioFrame::new(vec![1; 480], FMT));
        }
        for _ in 0..5 {
            turns.push_frame(speech());
        }
        turns.push_frame(silence());
        let Some(TurnEvent::TurnComplete(turn)) = turns.push_frame(silence()) else {
            panic!("turn should complete");
        };
        // 60 ms padding + 100 ms speech + 40 ms trailing silence.
        assert_eq!(turn.duration_ms(), 200);
        assert_eq!(turn.frames[0].samples[0], 1, "padding leads the turn");
    }

    #[test]
    fn false_start_returns_to_listening_without_flushing() {
        let cfg = TurnDetectionConfig {
            min_speech_ms: 60,
            ..TurnDetectionConfig::default()
        };
        let mut turns = TurnController::new(TurnMode::Automatic, cfg);
        assert_eq!(turns.push_frame(speech()), None);
        assert_eq!(turns.state(), TurnState::DetectingSpeech);
        assert_eq!(turns.push_frame(silence()), None);
        assert_eq!(turns.state(), TurnState::Listening);
        assert_eq!(turns.buffered_ms(), 0);
    }

    #[test]
    fn mode_switch_retains_partial_buffer() {
        let mut turns = TurnController::new(TurnMode::Manual, config(500));
        turns.push_frame(tagged(9));
        turns.set_mode(TurnMode::Automatic);
        assert_eq!(turns.state(), TurnState::SpeechActive);
        assert_eq!(turns.buffered_ms(), 20);
        let Some(TurnEvent::TurnComplete(turn)) = turns.commit() else {
            panic!("commit should flush retained audio");
        };
        assert_eq!(turn.frames[0].samples[0], 9);
    }
}
