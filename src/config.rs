use anyhow::Result;
use clap_serde_derive::ClapSerde;

#[derive(ClapSerde, Debug)]
pub struct Config {
    /// The address the listener binds to
    #[default("0.0.0.0".to_string())]
    #[arg(long, env = "HOST")]
    pub(crate) host: String,

    /// OTLP collector endpoint, telemetry is only exported when set
    #[default(String::new())]
    #[arg(long, env)]
    pub(crate) otlp_endpoint: String,

    /// Maximum request body size in bytes
    #[default(10_000_000)]
    #[arg(long, env)]
    pub(crate) body_limit: usize,

    /// Hugging Face repository holding the Whisper weights
    #[default("lmz/candle-whisper".to_string())]
    #[arg(long, env)]
    pub(crate) whisper_repo: String,

    #[default("main".to_string())]
    #[arg(long, env)]
    pub(crate) whisper_revision: String,

    #[default("config-tiny.json".to_string())]
    #[arg(long, env)]
    pub(crate) whisper_config: String,

    #[default("tokenizer-tiny.json".to_string())]
    #[arg(long, env)]
    pub(crate) whisper_tokenizer: String,

    #[default("model-tiny-q4k.gguf".to_string())]
    #[arg(long, env)]
    pub(crate) whisper_weights: String,

    /// Local path of the mel filter bank matching the Whisper model
    #[default("melfilters.bytes".to_string())]
    #[arg(long, env)]
    pub(crate) mel_filters: String,

    /// Hugging Face repository holding the translation weights
    #[default("jbochi/madlad400-3b-mt".to_string())]
    #[arg(long, env)]
    pub(crate) translation_repo: String,

    #[default("main".to_string())]
    #[arg(long, env)]
    pub(crate) translation_revision: String,

    #[default("config.json".to_string())]
    #[arg(long, env)]
    pub(crate) translation_config: String,

    #[default("tokenizer.json".to_string())]
    #[arg(long, env)]
    pub(crate) translation_tokenizer: String,

    #[default("model-q4k.gguf".to_string())]
    #[arg(long, env)]
    pub(crate) translation_weights: String,

    /// Interpreter that runs the synthesis worker
    #[default("python3".to_string())]
    #[arg(long, env)]
    pub(crate) tts_program: String,

    /// Coqui model loaded by the synthesis worker
    #[default("tts_models/multilingual/multi-dataset/xtts_v2".to_string())]
    #[arg(long, env)]
    pub(crate) tts_model: String,

    /// Worker script path, the bundled worker is used when empty
    #[default(String::new())]
    #[arg(long, env)]
    pub(crate) tts_worker_script: String,

    /// Model cache directory handed to the worker as TTS_HOME
    #[default(String::new())]
    #[arg(long, env)]
    pub(crate) tts_cache_dir: String,
}

impl Config {
    pub fn from_toml(path: &str) -> Result<<Self as ClapSerde>::Opt> {
        let str = std::fs::read_to_string(path)?;
        let config = toml::from_str(&str)?;
        Ok(config)
    }
}
