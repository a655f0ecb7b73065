pub mod backchannel;
pub mod cache;
pub mod chunker;
pub mod conversation;
pub mod delivery;
pub mod llm;
pub mod metrics;
pub mod session;
pub mod sim;
pub mod speculation;
pub mod transcript;
pub mod tts;

// Re-export commonly used types for convenience
pub use backchannel::{BackchannelConfig, BackchannelContext, BackchannelScheduler, PhraseCategory};
pub use cache::{AudioCache, CacheKey, CacheSettings};
pub use chunker::{ChunkerConfig, SentenceChunker};
pub use conversation::{ConversationTurn, Role};
pub use delivery::{
    AudioSegment, AudioSink, DeliveryQueue, DeliveryStatus, SegmentKind, SinkError,
};
pub use llm::{
    GenerationError, GenerationEvent, GenerationRequest, GenerationStream, ResponseGenerator,
};
pub use metrics::{CycleMetrics, CycleTracker, MetricsSummary};
pub use session::{RegistryError, SessionDeps, SessionError, SessionHandle, SessionRegistry};
pub use speculation::{
    AttemptId, AttemptStatus, CorrectionConfig, ReconcileDecision, SpeculationConfig,
    SpeculationEngine, SpeculationOutcome, reconcile, similarity,
};
pub use transcript::{CallId, TranscriptEvent};
pub use tts::{
    AudioRef, BreakerConfig, HttpProviderConfig, HttpSynthesisProvider, SpeechSynthesizer,
    SynthesisError, SynthesisProvider, SynthesisSettings, VoiceParams,
};
