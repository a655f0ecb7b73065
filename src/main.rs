use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;

use parley::core::sim::{SimGenerator, SimSink, SimSynthesisProvider};
use parley::{
    AudioCache, CallId, HttpSynthesisProvider, PipelineConfig, ProviderPool, SessionDeps,
    SessionRegistry, SpeechSynthesizer, SynthesisProvider, TranscriptEvent,
};

/// Runs one scripted conversation through the full pipeline and prints the
/// cycle latency report. With no synthesis endpoints configured, simulated
/// providers stand in for the external services.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    // Load configuration
    let config = Arc::new(PipelineConfig::from_env().map_err(|e| anyhow!(e.to_string()))?);

    let cache = Arc::new(AudioCache::new(config.cache.clone()));

    let providers: Vec<Arc<dyn SynthesisProvider>> = if config.synthesis_endpoints.is_empty() {
        println!("No synthesis endpoints configured; using simulated providers");
        vec![Arc::new(SimSynthesisProvider::new(
            "sim-primary",
            Duration::from_millis(40),
        ))]
    } else {
        let pool = Arc::new(ProviderPool::new(config.pool.clone())?);
        config
            .synthesis_endpoints
            .iter()
            .map(|endpoint| {
                Arc::new(HttpSynthesisProvider::new(endpoint.clone(), pool.clone()))
                    as Arc<dyn SynthesisProvider>
            })
            .collect()
    };

    let synthesizer = Arc::new(SpeechSynthesizer::new(
        providers,
        cache,
        config.synthesis.clone(),
    ));
    let generator = Arc::new(SimGenerator::new(
        Duration::from_millis(250),
        Duration::from_millis(30),
    ));
    let sink = SimSink::new();

    let registry = SessionRegistry::new(SessionDeps {
        generator,
        synthesizer,
        sink: sink.clone(),
        config: config.clone(),
    });

    let call_id = CallId::from("demo-call");
    registry
        .on_call_start(call_id.clone())
        .map_err(|e| anyhow!(e.to_string()))?;

    // A caller who pauses mid-sentence: partials trigger speculation, the
    // final confirms it
    let script = [
        TranscriptEvent::partial(1, "I need to", 0.6),
        TranscriptEvent::partial(2, "I need to reschedule my", 0.8),
        TranscriptEvent::final_result(3, "I need to reschedule my call for Friday", 0.95),
    ];
    for event in script {
        registry
            .transcript(&call_id, event)
            .await
            .map_err(|e| anyhow!(e.to_string()))?;
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    // Give the turn time to finish delivering
    tokio::time::sleep(Duration::from_secs(2)).await;

    if let Some(summary) = registry.on_call_end(&call_id).await {
        println!("cycles: {}", summary.cycles);
        println!("speculative cycles: {}", summary.speculative_cycles);
        if let Some(latency) = summary.avg_end_to_end {
            println!("avg end-to-end latency: {latency:?}");
        }
    }

    println!("delivered segments:");
    for segment in sink.delivered() {
        println!("  #{} {:?} {:?}", segment.sequence, segment.kind, segment.source_text);
    }

    Ok(())
}
