//! End-to-end pipeline tests against simulated external services.

use std::sync::Arc;
use std::time::Duration;

use parley::core::sim::{SimGenerator, SimSink, SimSynthesisProvider};
use parley::{
    AudioCache, CacheSettings, CallId, PipelineConfig, SegmentKind, SessionDeps, SessionRegistry,
    SpeechSynthesizer, TranscriptEvent,
};

struct Harness {
    registry: SessionRegistry,
    generator: Arc<SimGenerator>,
    sink: Arc<SimSink>,
    provider: Arc<SimSynthesisProvider>,
}

fn harness(generator: SimGenerator, mut config: PipelineConfig) -> Harness {
    config.turn_drain_timeout = Duration::from_secs(5);
    let generator = Arc::new(generator);
    let sink = SimSink::new();
    let provider = Arc::new(SimSynthesisProvider::new("sim", Duration::from_millis(10)));
    let cache = Arc::new(AudioCache::new(CacheSettings {
        max_entries: 1024,
        max_size_bytes: None,
        ttl: None,
    }));
    let synthesizer = Arc::new(SpeechSynthesizer::new(
        vec![provider.clone()],
        cache,
        config.synthesis.clone(),
    ));
    let registry = SessionRegistry::new(SessionDeps {
        generator: generator.clone(),
        synthesizer,
        sink: sink.clone(),
        config: Arc::new(config),
    });
    Harness {
        registry,
        generator,
        sink,
        provider,
    }
}

/// The flagship scenario: a qualifying partial triggers speculation, the
/// final transcript confirms it with high overlap, the response comes from
/// the already-running stream with zero regeneration, and end-to-end latency
/// beats the non-speculative baseline for an equivalent utterance.
#[tokio::test]
async fn speculative_turn_beats_synchronous_baseline() {
    let reply = "Of course. I have moved your call to Friday morning. \
                 You will get a confirmation text in a minute.";

    // Speculative run: partial arrives well before the final
    let h = harness(
        SimGenerator::new(Duration::from_millis(300), Duration::from_millis(20))
            .with_script(move |_| reply.to_string()),
        PipelineConfig::default(),
    );
    let call = CallId::from("speculative");
    h.registry.on_call_start(call.clone()).unwrap();
    h.registry
        .transcript(&call, TranscriptEvent::partial(1, "I need to reschedule my call", 0.8))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(350)).await;
    h.registry
        .transcript(
            &call,
            TranscriptEvent::final_result(2, "I need to reschedule my call for Friday", 0.95),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    let speculative = h.registry.on_call_end(&call).await.expect("summary");

    // Confirmed speculation, and the generator ran exactly once
    assert_eq!(speculative.speculative_cycles, 1);
    assert_eq!(h.generator.generations_started(), 1);
    let speculative_latency = speculative.avg_end_to_end.expect("latency recorded");

    // Baseline run: same utterance, no partial ever arrives
    let h = harness(
        SimGenerator::new(Duration::from_millis(300), Duration::from_millis(20))
            .with_script(move |_| reply.to_string()),
        PipelineConfig::default(),
    );
    let call = CallId::from("baseline");
    h.registry.on_call_start(call.clone()).unwrap();
    h.registry
        .transcript(
            &call,
            TranscriptEvent::final_result(1, "I need to reschedule my call for Friday", 0.95),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    let baseline = h.registry.on_call_end(&call).await.expect("summary");

    assert_eq!(baseline.speculative_cycles, 0);
    let baseline_latency = baseline.avg_end_to_end.expect("latency recorded");

    assert!(
        speculative_latency < baseline_latency,
        "speculation ({speculative_latency:?}) should beat baseline ({baseline_latency:?})"
    );
}

/// Low overlap between the speculative source and the final transcript
/// discards the attempt: the delivered response reflects the final
/// utterance, as correction segments, with a second generation.
#[tokio::test]
async fn diverging_final_restarts_as_correction() {
    let h = harness(
        SimGenerator::new(Duration::from_millis(400), Duration::from_millis(10))
            .with_script(|user| format!("Answering: {user}.")),
        PipelineConfig::default(),
    );
    let call = CallId::from("call-1");
    h.registry.on_call_start(call.clone()).unwrap();

    h.registry
        .transcript(&call, TranscriptEvent::partial(1, "Can you schedule a meeting", 0.8))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.registry
        .transcript(
            &call,
            TranscriptEvent::final_result(2, "Can you delete my calendar", 0.95),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1_200)).await;

    // Two generations: the discarded speculation and the restart
    assert_eq!(h.generator.generations_started(), 2);

    let delivered = h.sink.delivered();
    assert!(!delivered.is_empty());
    let spoken: String = delivered
        .iter()
        .map(|s| s.source_text.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    assert!(
        spoken.contains("delete my calendar"),
        "delivered audio should reflect the final transcript, got: {spoken}"
    );
    assert!(
        delivered.iter().all(|s| s.kind != SegmentKind::Primary),
        "no speculative primary audio may survive the restart"
    );

    h.registry.on_call_end(&call).await;
}

/// When the response is slow, exactly one backchannel filler plays first;
/// when the response is fast, none ever does.
#[tokio::test]
async fn backchannel_fills_slow_turns_and_stays_out_of_fast_ones() {
    // Slow response: filler expected
    let mut config = PipelineConfig::default();
    config.backchannel.delay = Duration::from_millis(100);
    let h = harness(
        SimGenerator::new(Duration::from_millis(500), Duration::from_millis(10)),
        config,
    );
    let call = CallId::from("slow");
    h.registry.on_call_start(call.clone()).unwrap();
    h.registry
        .transcript(
            &call,
            TranscriptEvent::final_result(1, "please look up my last three orders", 0.9),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1_500)).await;

    let kinds = h.sink.delivered_kinds();
    let backchannels = kinds
        .iter()
        .filter(|k| **k == SegmentKind::Backchannel)
        .count();
    assert_eq!(backchannels, 1, "expected exactly one filler, got {kinds:?}");
    assert_eq!(kinds.first(), Some(&SegmentKind::Backchannel));
    assert!(kinds.contains(&SegmentKind::Primary));
    h.registry.on_call_end(&call).await;

    // Fast response: the filler timer is cancelled before it fires
    let mut config = PipelineConfig::default();
    config.backchannel.delay = Duration::from_millis(250);
    let h = harness(
        SimGenerator::new(Duration::ZERO, Duration::ZERO),
        config,
    );
    let call = CallId::from("fast");
    h.registry.on_call_start(call.clone()).unwrap();
    h.registry
        .transcript(
            &call,
            TranscriptEvent::final_result(1, "please look up my last three orders", 0.9),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;

    let kinds = h.sink.delivered_kinds();
    assert!(
        !kinds.contains(&SegmentKind::Backchannel),
        "fast turn must not play filler, got {kinds:?}"
    );
    h.registry.on_call_end(&call).await;
}

/// Sequence numbers at the sink are strictly increasing across the whole
/// call, fillers and corrections included.
#[tokio::test]
async fn sink_observes_strictly_increasing_sequences() {
    let h = harness(
        SimGenerator::new(Duration::from_millis(150), Duration::from_millis(5)),
        PipelineConfig::default(),
    );
    let call = CallId::from("call-1");
    h.registry.on_call_start(call.clone()).unwrap();

    for (i, utterance) in [
        "what time do you open tomorrow",
        "and can I bring my dog along",
        "great, book me in for noon",
    ]
    .iter()
    .enumerate()
    {
        h.registry
            .transcript(
                &call,
                TranscriptEvent::final_result(i as u64 + 1, *utterance, 0.9),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(700)).await;
    }

    let sequences = h.sink.delivered_sequences();
    assert!(sequences.len() >= 3);
    assert!(
        sequences.windows(2).all(|w| w[0] < w[1]),
        "sequences not strictly increasing: {sequences:?}"
    );
    h.registry.on_call_end(&call).await;
}

/// Identical utterances across turns hit the audio cache: the provider is
/// called once per distinct chunk.
#[tokio::test]
async fn repeated_utterances_are_served_from_cache() {
    let h = harness(
        SimGenerator::new(Duration::ZERO, Duration::ZERO)
            .with_script(|_| "Our hours are nine to five.".to_string()),
        PipelineConfig::default(),
    );
    let call = CallId::from("call-1");
    h.registry.on_call_start(call.clone()).unwrap();

    for sequence in 1..=3u64 {
        h.registry
            .transcript(
                &call,
                TranscriptEvent::final_result(sequence, "what are your opening hours", 0.9),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    // Same response chunk every turn: one provider call, then cache hits
    assert_eq!(h.provider.call_count(), 1);
    let delivered = h.sink.delivered();
    assert_eq!(
        delivered
            .iter()
            .filter(|s| s.kind == SegmentKind::Primary)
            .count(),
        3
    );
    h.registry.on_call_end(&call).await;
}

/// Call teardown is prompt even with a speculative generation in flight.
#[tokio::test]
async fn call_end_releases_state_with_speculation_in_flight() {
    let h = harness(
        SimGenerator::new(Duration::from_secs(10), Duration::from_millis(50)),
        PipelineConfig::default(),
    );
    let call = CallId::from("call-1");
    h.registry.on_call_start(call.clone()).unwrap();

    h.registry
        .transcript(
            &call,
            TranscriptEvent::partial(1, "I have a very long question about", 0.9),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = std::time::Instant::now();
    let summary = h.registry.on_call_end(&call).await;
    assert!(summary.is_some());
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "teardown took {:?}",
        started.elapsed()
    );
    assert_eq!(h.registry.active_calls(), 0);
}
