//! `synapse` - demonstration CLI for the control-plane library.
//!
//! Loads a model registry (or falls back to a single in-process stub
//! model), starts the fleet, submits one query through the Query
//! Coordinator, and prints the streamed events plus the final transcript.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use synapse_core::cache::ResponseCache;
use synapse_core::cgrag::CgragEngine;
use synapse_core::client::{HttpModelClient, ModelClient, StubModelClient};
use synapse_core::config::ControlPlaneConfig;
use synapse_core::embed::DeterministicStubEmbedder;
use synapse_core::events::Frame;
use synapse_core::fleet::FleetManager;
use synapse_core::model::{ModelDescriptor, ModelRegistry, Quantization, RuntimeOverrides, Tier};
use synapse_core::request::{DialogueParams, Mode, QueryRequest};
use synapse_core::vector::VectorStore;
use synapse_core::{EventBus, QueryCoordinator};

mod cli;

use cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args = Cli::parse();

    let config = match &args.config {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            ControlPlaneConfig::from_toml_str(&content).with_context(|| "parsing control-plane config")?
        }
        None => ControlPlaneConfig::default(),
    };

    let fleet = Arc::new(FleetManager::new(config.clone()));
    let registry = load_or_default_registry(&args)?;
    for descriptor in &registry.models {
        let client: Arc<dyn ModelClient> = if descriptor.id == "demo" {
            Arc::new(StubModelClient::new(
                descriptor.id.clone(),
                "this is a demonstration response from the stub model",
            ))
        } else {
            let base_url = format!("http://127.0.0.1:{}", descriptor.port);
            Arc::new(HttpModelClient::new(descriptor.id.clone(), base_url)?)
        };
        fleet
            .register(descriptor.clone(), client)
            .with_context(|| format!("registering model {}", descriptor.id))?;
    }
    for descriptor in registry.models.iter().filter(|m| m.enabled) {
        if let Err(e) = fleet.start(&descriptor.id).await {
            tracing::warn!(model_id = %descriptor.id, error = %e, "model failed to start");
        }
    }

    let event_bus = EventBus::new(config.event_bus_subscriber_queue_size, config.telemetry_coalesce_hz);
    let _health_handle = fleet.spawn_health_loop(event_bus.clone());

    let cache = Arc::new(ResponseCache::new(
        config.cache_max_entries,
        Duration::from_secs(config.cache_ttl_secs),
    ));
    let vector_store = Arc::new(VectorStore::new(synapse_core::embed::EMBEDDING_DIM));
    let cgrag = Arc::new(CgragEngine::new(
        Arc::new(DeterministicStubEmbedder),
        vector_store,
        config.cgrag_min_relevance_default,
    ));

    let subscription = event_bus.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(frame) = subscription.recv().await {
            match frame {
                Frame::Event(event) => {
                    info!(kind = ?event.kind, seq = event.seq, payload = %event.payload, "event");
                }
                Frame::Lagged { count, .. } => {
                    tracing::warn!(count, "event stream lagged");
                }
            }
        }
    });

    let coordinator = QueryCoordinator::new(fleet, cache, Some(cgrag), event_bus, config);

    let request = QueryRequest {
        text: args.query.clone(),
        mode: parse_mode(&args.mode)?,
        use_context: args.use_context,
        pro_model_id: args.pro.clone(),
        con_model_id: args.con.clone(),
        dialogue: DialogueParams {
            moderator_model_id: args.moderator.clone(),
            ..DialogueParams::default()
        },
        ..QueryRequest::default()
    };

    let cancel = CancellationToken::new();
    let outcome = coordinator.execute(request, &cancel).await;

    // Give the event printer a moment to drain before exiting.
    tokio::time::sleep(Duration::from_millis(50)).await;
    printer.abort();

    match outcome {
        Ok(outcome) => {
            for turn in &outcome.turns {
                println!("[{}] {}: {}", turn.sequence, turn.persona, turn.content);
            }
            if let Some(analysis) = &outcome.post_hoc_analysis {
                println!("\n--- analysis ---\n{analysis}");
            }
            Ok(())
        }
        Err(e) => Err(anyhow::anyhow!("query failed: {e}")),
    }
}

fn parse_mode(raw: &str) -> Result<Mode> {
    match raw {
        "auto" => Ok(Mode::Auto),
        "standard" => Ok(Mode::Standard),
        "debate" => Ok(Mode::Debate),
        "council" => Ok(Mode::Council),
        other => anyhow::bail!("unknown mode '{other}', expected auto|standard|debate|council"),
    }
}

fn load_or_default_registry(args: &Cli) -> Result<ModelRegistry> {
    match &args.registry {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading registry file {}", path.display()))?;
            let registry: ModelRegistry = toml::from_str(&content).with_context(|| "parsing model registry")?;
            registry.validate().map_err(|e| anyhow::anyhow!(e))?;
            Ok(registry)
        }
        None => Ok(ModelRegistry {
            models: vec![ModelDescriptor {
                id: "demo".to_string(),
                display_name: "demo stub model".to_string(),
                file_path: "demo.gguf".to_string(),
                quantization: Quantization::Q4,
                param_count_billions: 1.0,
                tier: Tier::Fast,
                port: 0,
                enabled: true,
                overrides: RuntimeOverrides::default(),
            }],
            reserved_port_range: None,
        }),
    }
}
