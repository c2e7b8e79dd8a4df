use anyhow::Result;
use axum::Router;
use clap::{Parser, Subcommand};
use clap_serde_derive::ClapSerde;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::Config;
use crate::services::stt::SttState;
use crate::services::translation::TranslationState;
use crate::services::tts::TtsState;
use crate::telemetry::init_telemetry;

mod config;
mod error;
mod extractors;
mod inference;
mod language;
mod services;
mod telemetry;

#[cfg(unix)]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

const DEFAULT_CONFIG_FILE: &str = "VoiceServices.toml";

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env, default_value = DEFAULT_CONFIG_FILE)]
    config_file: String,

    /// Configuration options
    #[command(flatten)]
    pub opt_config: <Config as ClapSerde>::Opt,

    #[command(subcommand)]
    service: ServiceCommand,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum ServiceCommand {
    /// Speech-to-text with Whisper
    Stt {
        #[arg(short, long, env = "PORT", default_value_t = 5001)]
        port: u16,
    },
    /// Text-to-speech with Coqui XTTS
    Tts {
        #[arg(short, long, env = "PORT", default_value_t = 5002)]
        port: u16,
    },
    /// Text translation with MADLAD-400
    Translate {
        #[arg(short, long, env = "PORT", default_value_t = 5003)]
        port: u16,
    },
}

impl ServiceCommand {
    fn name(self) -> &'static str {
        match self {
            ServiceCommand::Stt { .. } => services::stt::SERVICE,
            ServiceCommand::Tts { .. } => services::tts::SERVICE,
            ServiceCommand::Translate { .. } => services::translation::SERVICE,
        }
    }

    fn port(self) -> u16 {
        match self {
            ServiceCommand::Stt { port }
            | ServiceCommand::Tts { port }
            | ServiceCommand::Translate { port } => port,
        }
    }

    /// Loads the model and builds the service router. Blocks until the model is ready.
    fn build_router(self, config: &Config) -> Router {
        match self {
            ServiceCommand::Stt { .. } => {
                services::stt::router(SttState::load(config), config.body_limit)
            }
            ServiceCommand::Tts { .. } => {
                services::tts::router(TtsState::load(config), config.body_limit)
            }
            ServiceCommand::Translate { .. } => {
                services::translation::router(TranslationState::load(config), config.body_limit)
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = Args::parse();
    let service = args.service;

    let config = match Config::from_toml(&args.config_file) {
        Ok(opt) => Config::from(opt).merge(&mut args.opt_config),
        Err(err) => {
            if args.config_file != DEFAULT_CONFIG_FILE {
                eprintln!(
                    "Failed to read configuration file {} with error: {err:#}",
                    args.config_file
                );
                std::process::exit(1);
            }
            Config::from(&mut args.opt_config)
        }
    };

    let endpoint = (!config.otlp_endpoint.is_empty()).then_some(config.otlp_endpoint.as_str());
    if let Err(err) = init_telemetry(service.name(), endpoint) {
        eprintln!("Failed to initialize telemetry: {err:#}");
        std::process::exit(1);
    }

    info!(
        "Supported features: avx: {}, neon: {}, simd128: {}, f16c: {}",
        candle_core::utils::with_avx(),
        candle_core::utils::with_neon(),
        candle_core::utils::with_simd128(),
        candle_core::utils::with_f16c()
    );
    info!("Loading model for {}...", service.name());

    let bind_address = format!("{}:{}", config.host, service.port());
    let router = tokio::task::spawn_blocking(move || service.build_router(&config)).await?;
    let router = router
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = match TcpListener::bind(&bind_address).await {
        Ok(listener) => listener,
        Err(err) => exit_err!(1, "Failed to bind to {}: {}", bind_address, err),
    };
    info!("Starting {} on {}", service.name(), listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutting down..."),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }
}

#[macro_export]
macro_rules! exit_err {
    ($code:expr, $fmt:expr $(, $arg:expr)*) => {
        {
            error!($fmt $(, $arg)*);
            std::process::exit($code);
        }
    };
}
