//! The turn-taking event loop.
//!
//! One scheduler per session owns all session state and all component
//! handles. It is single-threaded cooperative: provider I/O and the VAD
//! detector run as sibling tasks that communicate with the scheduler
//! exclusively by events on one inbound queue. The scheduler suspends only
//! to await the next event, a bounded retrieval call, a bounded
//! cancellation confirmation, or a tool execution.
//!
//! STT/LLM/TTS events carry the turn generation they were issued for;
//! output from cancelled turns is dropped on arrival.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::agent::AgentSnapshot;
use crate::audio::{apply_fade_out, AudioFrame, FramePipeline, PreSpeechBuffer, FRAME_SAMPLES};
use crate::config::OrchestratorConfig;
use crate::errors::{error_is_transient, FaultKind};
use crate::providers::llm_openai::{tool_calls_message, tool_result_message};
use crate::providers::{
    cancel_pair, CancelHandle, LlmAdapter, LlmRequest, LlmTask, Retriever, SttAdapter, SttStream,
    ToolCallRequest, ToolExecutor, TtsAdapter, TtsStream,
};
use crate::session::accumulator::SentenceAccumulator;
use crate::session::events::{
    EventSink, LlmEvent, RawAudio, SessionEvent, SessionNotice, SttEvent, TtsEvent,
};
use crate::session::state::{is_legal_transition, SessionState};
use crate::session::turn::{ConversationHistory, Turn};
use crate::providers::retrieval::contexts_to_system_block;
use crate::vad::{VadEvent, VadHandle};

/// Adapters resolved from the registry at session creation.
pub struct ResolvedAdapters {
    pub stt: Arc<dyn SttAdapter>,
    pub llm: Arc<dyn LlmAdapter>,
    pub tts: Arc<dyn TtsAdapter>,
    pub retrieval: Option<Arc<dyn Retriever>>,
}

/// Everything the manager wires up for one session.
pub struct SchedulerContext {
    pub session_id: String,
    pub conversation_id: String,
    pub agent: AgentSnapshot,
    pub tuning: OrchestratorConfig,
    pub adapters: ResolvedAdapters,
    pub tools: Arc<dyn ToolExecutor>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    pub sink: EventSink,
    pub notices: broadcast::Sender<SessionNotice>,
    pub outbound: mpsc::Sender<AudioFrame>,
    pub vad: VadHandle,
}

pub struct SessionScheduler {
    // Wiring.
    session_id: String,
    conversation_id: String,
    agent: AgentSnapshot,
    tuning: OrchestratorConfig,
    adapters: ResolvedAdapters,
    tools: Arc<dyn ToolExecutor>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    notices: broadcast::Sender<SessionNotice>,
    outbound: mpsc::Sender<AudioFrame>,
    sink: EventSink,
    vad: Option<VadHandle>,

    // Session state.
    state: SessionState,
    history: ConversationHistory,
    in_pipeline: Option<FramePipeline>,
    preroll: PreSpeechBuffer,
    last_activity: Instant,

    // Outbound audio clock, monotonic across turns.
    out_pipeline: Option<FramePipeline>,
    out_clock: u64,
    last_out_frame: Option<AudioFrame>,

    // Per-turn state, reset by `reset_turn`.
    turn_gen: u64,
    turn_started: DateTime<Local>,
    user_text: Option<String>,
    language: Option<String>,
    assistant_text: String,
    accumulator: SentenceAccumulator,
    retrieval_failed: bool,
    llm_messages: Vec<serde_json::Value>,
    pending_tool_calls: Vec<ToolCallRequest>,
    tool_rounds: u32,
    llm_done: bool,
    fallback_active: bool,
    stt: Option<Box<dyn SttStream>>,
    stt_retry_used: bool,
    llm_task: Option<LlmTask>,
    llm_cancel: Option<CancelHandle>,
    llm_retry_used: bool,
    tts: Option<Box<dyn TtsStream>>,

    // Deadlines.
    stt_deadline: Option<Instant>,
    llm_deadline: Option<Instant>,
    tts_deadline: Option<Instant>,
}

enum Flow {
    Continue,
    Shutdown,
}

enum Wake {
    Event(Option<SessionEvent>),
    Deadline,
}

impl SessionScheduler {
    pub fn new(ctx: SchedulerContext) -> Self {
        let preroll_frames = PreSpeechBuffer::frames_for_ms(ctx.tuning.preroll_ms);
        let soft_flush = ctx.tuning.soft_flush_tokens;
        Self {
            session_id: ctx.session_id,
            conversation_id: ctx.conversation_id,
            agent: ctx.agent,
            adapters: ctx.adapters,
            tools: ctx.tools,
            events: ctx.events,
            notices: ctx.notices,
            outbound: ctx.outbound,
            sink: ctx.sink,
            vad: Some(ctx.vad),
            state: SessionState::Idle,
            history: ConversationHistory::new(),
            in_pipeline: None,
            preroll: PreSpeechBuffer::new(preroll_frames),
            last_activity: Instant::now(),
            out_pipeline: None,
            out_clock: 0,
            last_out_frame: None,
            turn_gen: 0,
            turn_started: Local::now(),
            user_text: None,
            language: None,
            assistant_text: String::new(),
            accumulator: SentenceAccumulator::new(soft_flush),
            retrieval_failed: false,
            llm_messages: Vec::new(),
            pending_tool_calls: Vec::new(),
            tool_rounds: 0,
            llm_done: false,
            fallback_active: false,
            stt: None,
            stt_retry_used: false,
            llm_task: None,
            llm_cancel: None,
            llm_retry_used: false,
            tts: None,
            stt_deadline: None,
            llm_deadline: None,
            tts_deadline: None,
            tuning: ctx.tuning,
        }
    }

    /// Run the loop until the session closes.
    pub async fn run(mut self) {
        info!(
            session = %self.session_id,
            conversation = %self.conversation_id,
            agent = %self.agent.id,
            "session started"
        );

        loop {
            // Resolve the wake reason first so the queue borrow ends before
            // any state mutation.
            let wake = {
                let deadline = self.next_deadline();
                tokio::select! {
                    ev = self.events.recv() => Wake::Event(ev),
                    _ = tokio::time::sleep_until(deadline) => Wake::Deadline,
                }
            };

            let flow = match wake {
                Wake::Event(Some(ev)) => {
                    self.last_activity = Instant::now();
                    self.handle_event(ev).await
                }
                Wake::Event(None) => Flow::Shutdown,
                Wake::Deadline => self.handle_deadline().await,
            };

            if matches!(flow, Flow::Shutdown) {
                break;
            }
        }

        self.teardown().await;
        info!(session = %self.session_id, "session closed");
    }

    // -----------------------------------------------------------------------
    // Event dispatch
    // -----------------------------------------------------------------------

    async fn handle_event(&mut self, event: SessionEvent) -> Flow {
        match event {
            SessionEvent::Frame(raw) => {
                self.on_frames(raw);
                Flow::Continue
            }
            SessionEvent::TransportDiscontinuity { lost_ms } => {
                self.publish(SessionNotice::Fault {
                    kind: FaultKind::TransportDiscontinuity,
                    detail: format!("{} ms of audio lost", lost_ms),
                });
                if let Some(pipeline) = self.in_pipeline.as_mut() {
                    let frames = pipeline.insert_silence(lost_ms);
                    self.dispatch_frames(frames);
                }
                Flow::Continue
            }
            SessionEvent::TransportClosed => {
                self.publish(SessionNotice::Fault {
                    kind: FaultKind::TransportClosed,
                    detail: "peer hung up".into(),
                });
                Flow::Shutdown
            }
            SessionEvent::Vad(ev) => self.on_vad(ev).await,
            SessionEvent::VadSaturated => {
                self.publish(SessionNotice::Fault {
                    kind: FaultKind::VadSaturated,
                    detail: "voice activity detector saturated".into(),
                });
                self.set_state(SessionState::Error);
                Flow::Shutdown
            }
            SessionEvent::Stt { turn, event } => {
                if turn != self.turn_gen {
                    debug!("dropping stale STT event from turn {}", turn);
                    return Flow::Continue;
                }
                self.on_stt(event).await
            }
            SessionEvent::Llm { turn, event } => {
                if turn != self.turn_gen {
                    debug!("dropping stale LLM event from turn {}", turn);
                    return Flow::Continue;
                }
                self.on_llm(event).await
            }
            SessionEvent::Tts { turn, event } => {
                if turn != self.turn_gen {
                    debug!("dropping stale TTS event from turn {}", turn);
                    return Flow::Continue;
                }
                self.on_tts(event).await
            }
            SessionEvent::UserText(text) => {
                if self.state != SessionState::Idle {
                    warn!("text input ignored while {}", self.state);
                    return Flow::Continue;
                }
                self.start_turn();
                self.publish(SessionNotice::FinalTranscript { text: text.clone() });
                self.begin_thinking(text).await;
                Flow::Continue
            }
            SessionEvent::Cancel => Flow::Shutdown,
        }
    }

    // -----------------------------------------------------------------------
    // Audio path
    // -----------------------------------------------------------------------

    fn on_frames(&mut self, raw: RawAudio) {
        if self
            .in_pipeline
            .as_ref()
            .map(|p| p.source_rate() != raw.sample_rate)
            .unwrap_or(true)
        {
            let start = self
                .in_pipeline
                .as_ref()
                .map(|p| p.next_timestamp())
                .unwrap_or(0);
            self.in_pipeline = Some(FramePipeline::with_start_timestamp(raw.sample_rate, start));
        }
        let frames = match self.in_pipeline.as_mut() {
            Some(p) => p.ingest(&raw.samples),
            None => Vec::new(),
        };
        self.dispatch_frames(frames);
    }

    /// Route canonical frames: detector always, live STT while listening,
    /// and the pre-speech ring unconditionally.
    fn dispatch_frames(&mut self, frames: Vec<AudioFrame>) {
        for frame in frames {
            if let Some(vad) = &self.vad {
                vad.push(frame.clone());
            }
            if self.state == SessionState::Listening {
                if let Some(stt) = &self.stt {
                    stt.push(&frame);
                }
            }
            self.preroll.push(frame);
        }
    }

    // -----------------------------------------------------------------------
    // VAD transitions
    // -----------------------------------------------------------------------

    async fn on_vad(&mut self, event: VadEvent) -> Flow {
        match event {
            VadEvent::SpeechStart { .. } => match self.state {
                SessionState::Idle => {
                    self.publish(SessionNotice::SpeechStarted);
                    self.start_turn();
                    self.open_listening().await;
                    Flow::Continue
                }
                SessionState::Speaking | SessionState::Thinking => {
                    self.publish(SessionNotice::SpeechStarted);
                    self.barge_in().await;
                    Flow::Continue
                }
                _ => Flow::Continue,
            },
            VadEvent::SpeechContinue { .. } => Flow::Continue,
            VadEvent::SpeechEnd { .. } => {
                if self.state == SessionState::Listening && self.stt.is_some() {
                    self.publish(SessionNotice::SpeechEnded);
                    if let Some(stt) = &self.stt {
                        stt.close_input();
                    }
                    self.stt_deadline = Some(
                        Instant::now() + Duration::from_millis(self.tuning.timeouts.stt_final_ms),
                    );
                }
                Flow::Continue
            }
        }
    }

    /// Open STT, replay the pre-speech buffer, and enter `Listening`.
    async fn open_listening(&mut self) {
        self.set_state(SessionState::Listening);
        if self.open_stt().await {
            return;
        }
        // First attempt failed; one retry with a fresh provider session.
        self.publish_fault(FaultKind::SttTransient, "open failed, retrying");
        if !self.open_stt().await {
            self.stt_fatal("provider session could not be opened").await;
        }
    }

    async fn open_stt(&mut self) -> bool {
        match self
            .adapters
            .stt
            .open(&self.agent.stt.options, self.turn_gen, self.sink.clone())
            .await
        {
            Ok(stream) => {
                // Seed the provider with the audio from before the trigger.
                for frame in self.preroll.drain() {
                    stream.push(&frame);
                }
                self.stt = Some(stream);
                true
            }
            Err(e) => {
                warn!("STT open failed: {:#}", e);
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // STT events
    // -----------------------------------------------------------------------

    async fn on_stt(&mut self, event: SttEvent) -> Flow {
        match event {
            SttEvent::Interim { text } => {
                if self.state == SessionState::Listening {
                    self.publish(SessionNotice::InterimTranscript { text });
                }
                Flow::Continue
            }
            SttEvent::Final { text, language } => {
                if self.state != SessionState::Listening {
                    debug!("final transcript outside listening, dropped");
                    return Flow::Continue;
                }
                self.stt_deadline = None;
                if let Some(stt) = self.stt.take() {
                    stt.abort();
                }

                let trimmed = text.trim();
                if trimmed.is_empty() {
                    debug!("empty final transcript, turn discarded");
                    self.reset_turn();
                    self.set_state(SessionState::Idle);
                    return Flow::Continue;
                }

                let text = trimmed.to_string();
                self.language = language;
                self.publish(SessionNotice::FinalTranscript { text: text.clone() });
                self.begin_thinking(text).await;
                Flow::Continue
            }
            SttEvent::Error(message) => {
                if self.stt.is_none() && self.stt_deadline.is_none() {
                    debug!("STT error after stream close, dropped: {}", message);
                    return Flow::Continue;
                }
                if error_is_transient(&message) && !self.stt_retry_used {
                    self.stt_retry_used = true;
                    self.publish_fault(FaultKind::SttTransient, &message);
                    if let Some(stt) = self.stt.take() {
                        stt.abort();
                    }
                    // Fresh provider session, reseeded from the ring.
                    if self.open_stt().await {
                        return Flow::Continue;
                    }
                }
                self.stt_fatal(&message).await;
                Flow::Continue
            }
        }
    }

    /// STT gave up: abort the turn and apologize audibly.
    async fn stt_fatal(&mut self, detail: &str) {
        self.publish_fault(FaultKind::SttFatal, detail);
        self.stt_deadline = None;
        if let Some(stt) = self.stt.take() {
            stt.abort();
        }
        self.speak_fallback().await;
    }

    // -----------------------------------------------------------------------
    // Thinking: retrieval + prompt + LLM
    // -----------------------------------------------------------------------

    async fn begin_thinking(&mut self, user_text: String) {
        self.set_state(SessionState::Thinking);
        self.user_text = Some(user_text.clone());

        let context_block = self.run_retrieval(&user_text).await;

        self.llm_messages = self.history.build_messages(
            &self.agent.system_prompt,
            context_block.as_deref(),
            &user_text,
            self.tuning.history_token_budget,
        );
        self.start_llm().await;
    }

    /// Bounded retrieval; failure or timeout degrades the turn to zero
    /// contexts and is never fatal.
    async fn run_retrieval(&mut self, query: &str) -> Option<String> {
        let (retriever, options) = match (&self.adapters.retrieval, &self.agent.retrieval) {
            (Some(r), Some(cap)) => (r.clone(), cap.options.clone()),
            _ => return None,
        };

        let budget = Duration::from_millis(self.tuning.timeouts.retrieval_ms);
        match tokio::time::timeout(budget, retriever.retrieve(query, &options)).await {
            Ok(Ok(contexts)) => {
                debug!("retrieval returned {} contexts", contexts.len());
                contexts_to_system_block(&contexts)
            }
            Ok(Err(e)) => {
                self.retrieval_failed = true;
                self.publish_fault(FaultKind::RetrievalFailed, &format!("{:#}", e));
                None
            }
            Err(_) => {
                self.retrieval_failed = true;
                self.publish_fault(FaultKind::RetrievalTimeout, "budget exceeded");
                None
            }
        }
    }

    /// Open the LLM stream, retrying transient open failures once, and
    /// falling back audibly on a fatal one.
    async fn start_llm(&mut self) {
        loop {
            match self.open_llm().await {
                Ok(()) => return,
                Err(message) => {
                    if error_is_transient(&message) && !self.llm_retry_used {
                        self.llm_retry_used = true;
                        self.publish_fault(FaultKind::LlmTransient, &message);
                        continue;
                    }
                    self.llm_fatal(&message).await;
                    return;
                }
            }
        }
    }

    async fn open_llm(&mut self) -> Result<(), String> {
        let (handle, token) = cancel_pair();
        let request = LlmRequest {
            messages: self.llm_messages.clone(),
            tools: self.agent.tools.clone(),
        };
        let task = self
            .adapters
            .llm
            .stream(
                &self.agent.llm.options,
                request,
                self.turn_gen,
                self.sink.clone(),
                token,
            )
            .await
            .map_err(|e| format!("{:#}", e))?;

        self.llm_task = Some(task);
        self.llm_cancel = Some(handle);
        self.llm_deadline =
            Some(Instant::now() + Duration::from_millis(self.tuning.timeouts.llm_first_token_ms));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // LLM events
    // -----------------------------------------------------------------------

    async fn on_llm(&mut self, event: LlmEvent) -> Flow {
        // Output from a stream this turn no longer owns (already failed
        // over or torn down) is dropped.
        if self.llm_task.is_none() && self.llm_cancel.is_none() {
            debug!("LLM event with no stream in flight, dropped");
            return Flow::Continue;
        }
        match event {
            LlmEvent::Delta(text) => {
                self.llm_deadline = None;
                self.assistant_text.push_str(&text);
                self.publish(SessionNotice::AssistantDelta { text: text.clone() });
                let sentences = self.accumulator.push(&text);
                for sentence in sentences {
                    self.speak(&sentence).await;
                }
                Flow::Continue
            }
            LlmEvent::ToolCall { id, name, arguments } => {
                self.pending_tool_calls.push(ToolCallRequest { id, name, arguments });
                Flow::Continue
            }
            LlmEvent::End { reason } => {
                self.llm_deadline = None;
                if let Some(task) = self.llm_task.take() {
                    task.forget();
                }
                self.llm_cancel = None;

                if !self.pending_tool_calls.is_empty()
                    && self.tool_rounds < self.tuning.max_tool_rounds
                {
                    self.tool_rounds += 1;
                    self.run_tool_round().await;
                    return Flow::Continue;
                }
                if !self.pending_tool_calls.is_empty() {
                    warn!("tool round limit reached, dropping pending calls");
                    self.pending_tool_calls.clear();
                }

                debug!("LLM stream finished: {}", reason);
                self.llm_done = true;
                if let Some(sentence) = self.accumulator.flush() {
                    self.speak(&sentence).await;
                }
                match &self.tts {
                    Some(tts) => tts.flush_and_close(),
                    None => {
                        // Nothing was ever synthesized (empty response).
                        self.complete_turn(false);
                    }
                }
                Flow::Continue
            }
            LlmEvent::Error(message) => {
                self.llm_deadline = None;
                if let Some(task) = self.llm_task.take() {
                    task.forget();
                }
                self.llm_cancel = None;

                if error_is_transient(&message) && !self.llm_retry_used {
                    self.llm_retry_used = true;
                    self.publish_fault(FaultKind::LlmTransient, &message);
                    self.start_llm().await;
                    return Flow::Continue;
                }
                self.llm_fatal(&message).await;
                Flow::Continue
            }
        }
    }

    /// Execute the requested tools and resume the model with the extended
    /// conversation.
    async fn run_tool_round(&mut self) {
        let calls = std::mem::take(&mut self.pending_tool_calls);
        info!("executing {} tool call(s)", calls.len());

        self.llm_messages.push(tool_calls_message("", &calls));
        for call in &calls {
            let result = match self.tools.execute(&call.name, &call.arguments).await {
                Ok(r) => r,
                Err(e) => format!("Error: {}", e),
            };
            self.llm_messages.push(tool_result_message(call, &result));
        }
        self.start_llm().await;
    }

    /// LLM gave up: preserve the partial response, then apologize audibly.
    async fn llm_fatal(&mut self, detail: &str) {
        self.publish_fault(FaultKind::LlmFatal, detail);

        if let Some(tts) = self.tts.take() {
            tts.abort();
        }
        self.tts_deadline = None;
        self.out_pipeline = None;

        // Partial response text is preserved, marked incomplete.
        if self.user_text.is_some() || !self.assistant_text.is_empty() {
            self.append_turn(true);
        }
        self.speak_fallback().await;
    }

    // -----------------------------------------------------------------------
    // TTS events and the speak path
    // -----------------------------------------------------------------------

    /// Push one sentence to TTS, opening the synthesis session lazily.
    async fn speak(&mut self, sentence: &str) {
        if self.tts.is_none() {
            match self
                .adapters
                .tts
                .open(&self.agent.tts.options, self.turn_gen, self.sink.clone())
                .await
            {
                Ok(stream) => {
                    self.tts = Some(stream);
                    self.tts_deadline = Some(
                        Instant::now()
                            + Duration::from_millis(self.tuning.timeouts.tts_first_audio_ms),
                    );
                    self.set_state(SessionState::Speaking);
                }
                Err(e) => {
                    self.tts_fatal(&format!("{:#}", e)).await;
                    return;
                }
            }
        }
        if let Some(tts) = &self.tts {
            tts.push_text(sentence);
        }
    }

    async fn on_tts(&mut self, event: TtsEvent) -> Flow {
        match event {
            TtsEvent::Audio { pcm, sample_rate, .. } => {
                if self.tts.is_none() {
                    debug!("TTS audio after close, dropped");
                    return Flow::Continue;
                }
                self.tts_deadline = None;
                self.forward_audio(&pcm, sample_rate);
                Flow::Continue
            }
            TtsEvent::End => {
                if self.tts.is_none() {
                    debug!("TTS end after close, dropped");
                    return Flow::Continue;
                }
                self.tts = None;
                self.tts_deadline = None;
                self.out_pipeline = None;

                if self.fallback_active {
                    // Spoken apology finished; the aborted turn was not
                    // recorded.
                    self.reset_turn();
                    self.set_state(SessionState::Idle);
                } else if self.llm_done {
                    self.complete_turn(false);
                } else {
                    warn!("TTS ended before the LLM finished");
                    self.tts_fatal("synthesis ended early").await;
                }
                Flow::Continue
            }
            TtsEvent::Error(message) => {
                if self.tts.is_none() {
                    debug!("TTS error after close, dropped: {}", message);
                    return Flow::Continue;
                }
                self.tts_fatal(&message).await;
                Flow::Continue
            }
        }
    }

    /// Resample provider audio chunkwise to the canonical rate and forward
    /// complete frames to the transport.
    fn forward_audio(&mut self, pcm: &[i16], sample_rate: u32) {
        if self
            .out_pipeline
            .as_ref()
            .map(|p| p.source_rate() != sample_rate)
            .unwrap_or(true)
        {
            self.out_pipeline = Some(FramePipeline::with_start_timestamp(
                sample_rate,
                self.out_clock,
            ));
        }
        let frames = match self.out_pipeline.as_mut() {
            Some(p) => p.ingest(pcm),
            None => Vec::new(),
        };
        for frame in frames {
            self.out_clock = frame.timestamp + FRAME_SAMPLES as u64;
            self.last_out_frame = Some(frame.clone());
            if self.outbound.try_send(frame).is_err() {
                debug!("outbound audio queue full, frame dropped");
            }
        }
    }

    /// TTS failed mid-stream: let emitted audio play out, no retry, record
    /// the turn as interrupted.
    async fn tts_fatal(&mut self, detail: &str) {
        self.publish_fault(FaultKind::TtsFatal, detail);
        if let Some(tts) = self.tts.take() {
            tts.abort();
        }
        self.tts_deadline = None;
        self.out_pipeline = None;

        if let Some(handle) = self.llm_cancel.take() {
            handle.cancel();
        }
        if let Some(task) = self.llm_task.take() {
            task.forget();
        }

        if self.fallback_active {
            self.reset_turn();
            self.set_state(SessionState::Idle);
            return;
        }
        self.append_turn(true);
        self.reset_turn();
        self.set_state(SessionState::Idle);
    }

    // -----------------------------------------------------------------------
    // Barge-in
    // -----------------------------------------------------------------------

    /// The user started speaking while the agent was thinking or speaking.
    ///
    /// Stop forwarding audio with a short fade-out, cancel the LLM and TTS
    /// with a hard confirmation deadline, record the interrupted turn, then
    /// re-enter the normal listening path for the new turn.
    async fn barge_in(&mut self) {
        info!(session = %self.session_id, "barge-in");
        self.publish(SessionNotice::BargeIn);

        // 1. Stop forwarding; fade the tail so the jitter buffer drains to
        //    silence instead of clicking.
        self.out_pipeline = None;
        if let Some(last) = self.last_out_frame.take() {
            let mut samples = last.samples;
            apply_fade_out(&mut samples);
            let fade = AudioFrame::new(samples, self.out_clock);
            self.out_clock += FRAME_SAMPLES as u64;
            let _ = self.outbound.try_send(fade);
        }

        // 2. Issue cancellations.
        if let Some(handle) = self.llm_cancel.take() {
            handle.cancel();
        }
        if let Some(tts) = self.tts.take() {
            tts.abort();
        }
        self.accumulator.clear();
        self.llm_deadline = None;
        self.tts_deadline = None;

        // 3. Await confirmation up to the hard deadline, then proceed
        //    regardless.
        if let Some(task) = self.llm_task.take() {
            let deadline = Duration::from_millis(self.tuning.timeouts.barge_in_cancel_ms);
            if !task.confirm_cancelled(deadline).await {
                warn!("LLM task missed the cancellation deadline, aborted");
            }
        }

        // 4. The interrupted agent turn goes into history as-is.
        if !self.fallback_active {
            self.append_turn(true);
        }

        // 5. New user turn, normal listening path.
        self.start_turn();
        self.open_listening().await;
    }

    // -----------------------------------------------------------------------
    // Fallback speech
    // -----------------------------------------------------------------------

    /// Speak the configured apology, in the language the transcript came
    /// in when one is known. The failed turn is not recorded; the session
    /// returns to idle when synthesis finishes.
    async fn speak_fallback(&mut self) {
        // Clear turn residue but keep the generation: the fallback TTS
        // stream is tagged with it.
        self.accumulator.clear();
        self.assistant_text.clear();
        self.llm_done = false;
        self.fallback_active = true;

        let text = self.fallback_text();
        self.speak(&text).await;
        match &self.tts {
            Some(tts) => tts.flush_and_close(),
            None => {
                // Fallback synthesis unavailable; give up quietly.
                self.reset_turn();
                self.set_state(SessionState::Idle);
            }
        }
    }

    /// The apology matching the turn's transcript language, or the
    /// configured default when the language is unknown or has no override.
    /// An STT failure before any final leaves the language unset.
    fn fallback_text(&self) -> String {
        self.language
            .as_deref()
            .and_then(|lang| self.tuning.fallback_replies.get(lang))
            .cloned()
            .unwrap_or_else(|| self.tuning.fallback_reply.clone())
    }

    // -----------------------------------------------------------------------
    // Turn lifecycle
    // -----------------------------------------------------------------------

    fn start_turn(&mut self) {
        self.reset_turn();
        self.turn_gen += 1;
        self.turn_started = Local::now();
    }

    fn reset_turn(&mut self) {
        self.user_text = None;
        self.language = None;
        self.assistant_text.clear();
        self.accumulator.clear();
        self.retrieval_failed = false;
        self.llm_messages.clear();
        self.pending_tool_calls.clear();
        self.tool_rounds = 0;
        self.llm_done = false;
        self.fallback_active = false;
        self.stt_retry_used = false;
        self.llm_retry_used = false;
        if let Some(stt) = self.stt.take() {
            stt.abort();
        }
        if let Some(handle) = self.llm_cancel.take() {
            handle.cancel();
        }
        if let Some(task) = self.llm_task.take() {
            task.forget();
        }
        if let Some(tts) = self.tts.take() {
            tts.abort();
        }
        self.stt_deadline = None;
        self.llm_deadline = None;
        self.tts_deadline = None;
    }

    /// Append the current turn to history and publish it.
    fn append_turn(&mut self, interrupted: bool) {
        let turn = Turn {
            user_text: self.user_text.clone().unwrap_or_default(),
            assistant_text: self.assistant_text.clone(),
            started_at: self.turn_started,
            finished_at: Local::now(),
            interrupted,
            retrieval_failed: self.retrieval_failed,
            language: self.language.clone(),
        };
        self.publish(SessionNotice::TurnCompleted { turn: turn.summary() });
        self.history.push(turn);
    }

    fn complete_turn(&mut self, interrupted: bool) {
        self.append_turn(interrupted);
        self.reset_turn();
        self.set_state(SessionState::Idle);
    }

    // -----------------------------------------------------------------------
    // Deadlines
    // -----------------------------------------------------------------------

    fn next_deadline(&self) -> Instant {
        let idle = self.last_activity + Duration::from_secs(self.tuning.timeouts.idle_secs);
        [self.stt_deadline, self.llm_deadline, self.tts_deadline]
            .into_iter()
            .flatten()
            .fold(idle, Instant::min)
    }

    async fn handle_deadline(&mut self) -> Flow {
        let now = Instant::now();

        if self.stt_deadline.map(|d| d <= now).unwrap_or(false) {
            self.stt_deadline = None;
            self.stt_fatal("no final transcript within the deadline").await;
            return Flow::Continue;
        }
        if self.llm_deadline.map(|d| d <= now).unwrap_or(false) {
            self.llm_deadline = None;
            if let Some(handle) = self.llm_cancel.take() {
                handle.cancel();
            }
            if let Some(task) = self.llm_task.take() {
                task.forget();
            }
            self.llm_fatal("no first token within the deadline").await;
            return Flow::Continue;
        }
        if self.tts_deadline.map(|d| d <= now).unwrap_or(false) {
            self.tts_deadline = None;
            self.tts_fatal("no first audio within the deadline").await;
            return Flow::Continue;
        }

        let idle = self.last_activity + Duration::from_secs(self.tuning.timeouts.idle_secs);
        if idle <= now {
            info!(session = %self.session_id, "idle timeout");
            return Flow::Shutdown;
        }
        Flow::Continue
    }

    // -----------------------------------------------------------------------
    // State + notices
    // -----------------------------------------------------------------------

    fn set_state(&mut self, to: SessionState) {
        if self.state == to {
            return;
        }
        let from = self.state;
        if !is_legal_transition(from, to) {
            debug_assert!(false, "illegal transition {} -> {}", from, to);
            warn!("illegal transition {} -> {}", from, to);
            return;
        }
        debug!(session = %self.session_id, "{} -> {}", from, to);
        self.state = to;
        self.publish(SessionNotice::StateChanged {
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        });
    }

    fn publish(&self, notice: SessionNotice) {
        let _ = self.notices.send(notice);
    }

    fn publish_fault(&self, kind: FaultKind, detail: &str) {
        warn!(session = %self.session_id, fault = %kind, "{}", detail);
        self.publish(SessionNotice::Fault { kind, detail: detail.to_string() });
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    async fn teardown(&mut self) {
        if let Some(handle) = self.llm_cancel.take() {
            handle.cancel();
        }
        if let Some(task) = self.llm_task.take() {
            let deadline = Duration::from_millis(self.tuning.timeouts.barge_in_cancel_ms);
            let _ = task.confirm_cancelled(deadline).await;
        }
        if let Some(stt) = self.stt.take() {
            stt.abort();
        }
        if let Some(tts) = self.tts.take() {
            tts.abort();
        }
        // Dropping the handle ends the detector thread.
        self.vad = None;

        if self.state != SessionState::Closed {
            self.set_state(SessionState::Closed);
        }
        self.publish(SessionNotice::Closed);
    }
}
