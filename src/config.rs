use clap::Parser;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "docjson-server")]
#[command(about = "Two-stage document to structured JSON extraction server")]
#[command(version)]
pub struct Args {
    /// Host address to bind to
    #[arg(long, env = "DOCJSON_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port to listen on
    #[arg(long, env = "DOCJSON_PORT", default_value = "9393")]
    pub port: u16,

    /// Maximum upload size in bytes (default: 50MB)
    #[arg(long, env = "DOCJSON_MAX_FILE_SIZE", default_value = "52428800")]
    pub max_file_size: usize,

    /// OpenAI-compatible chat completions endpoint
    #[arg(
        long,
        env = "DOCJSON_MODEL_ENDPOINT",
        default_value = "https://api.openai.com/v1/chat/completions"
    )]
    pub model_endpoint: String,

    /// Vision-capable model name
    #[arg(long, env = "DOCJSON_MODEL", default_value = "gpt-4o-2024-08-06")]
    pub model: String,

    /// API key sent as a bearer token
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Per-call timeout for model requests, in milliseconds
    #[arg(long, env = "DOCJSON_MODEL_TIMEOUT_MS", default_value = "60000")]
    pub model_timeout_ms: u64,

    /// Total attempts per model call (first try included)
    #[arg(long, env = "DOCJSON_MAX_ATTEMPTS", default_value = "3")]
    pub max_attempts: u32,

    /// Base delay between attempts, doubled after each failure
    #[arg(long, env = "DOCJSON_RETRY_BACKOFF_MS", default_value = "500")]
    pub retry_backoff_ms: u64,

    /// Sampling temperature for every model call
    #[arg(long, env = "DOCJSON_TEMPERATURE", default_value = "0.1")]
    pub temperature: f32,

    /// Ask the model for a JSON object response (response_format=json_object)
    #[arg(long, env = "DOCJSON_JSON_MODE", default_value = "true", action = clap::ArgAction::Set)]
    pub json_mode: bool,

    /// Number of pages extracted concurrently within one request
    #[arg(long, env = "DOCJSON_PAGE_CONCURRENCY", default_value = "4")]
    pub page_concurrency: usize,

    /// Resolution used to render PDF pages
    #[arg(long, env = "DOCJSON_RENDER_DPI", default_value = "150")]
    pub render_dpi: u32,

    /// Longest edge, in pixels, of any page image sent to the model
    #[arg(long, env = "DOCJSON_MAX_IMAGE_EDGE", default_value = "2048")]
    pub max_image_edge: u32,

    /// libpdfium shared library (file or containing directory); the system
    /// library search path is used when unset
    #[arg(long, env = "PDFIUM_LIB_PATH")]
    pub pdfium_lib_path: Option<PathBuf>,

    /// File replacing the default extraction system prompt
    #[arg(long, env = "DOCJSON_EXTRACTION_PROMPT_FILE")]
    pub extraction_prompt_file: Option<PathBuf>,

    /// Directory of target schemas (*.json, keyed by file stem)
    #[arg(long, env = "DOCJSON_SCHEMA_DIR")]
    pub schema_dir: Option<PathBuf>,

    /// Catalog schema applied when a request names none
    #[arg(long, env = "DOCJSON_DEFAULT_SCHEMA")]
    pub default_schema: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,
}

/// Outbound model settings
#[derive(Clone)]
pub struct ModelConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    pub temperature: f32,
    pub json_mode: bool,
}

impl fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelConfig")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .field("max_attempts", &self.max_attempts)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("temperature", &self.temperature)
            .field("json_mode", &self.json_mode)
            .finish()
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-2024-08-06".to_string(),
            api_key: None,
            timeout: Duration::from_secs(60),
            max_attempts: 3,
            retry_backoff_ms: 500,
            temperature: 0.1,
            json_mode: true,
        }
    }
}

/// Page rendering settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOptions {
    pub dpi: u32,
    pub max_image_edge: u32,
    pub pdfium_library: Option<PathBuf>,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            dpi: 150,
            max_image_edge: 2048,
            pdfium_library: None,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub max_file_size: usize,
    pub model: ModelConfig,
    pub page_concurrency: usize,
    pub render: RenderOptions,
    pub extraction_prompt_file: Option<PathBuf>,
    pub schema_dir: Option<PathBuf>,
    pub default_schema: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9393,
            max_file_size: 52_428_800,
            model: ModelConfig::default(),
            page_concurrency: 4,
            render: RenderOptions::default(),
            extraction_prompt_file: None,
            schema_dir: None,
            default_schema: None,
        }
    }
}

impl Config {
    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.model.max_attempts == 0 {
            anyhow::bail!("max_attempts must be at least 1");
        }
        if self.page_concurrency == 0 {
            anyhow::bail!("page_concurrency must be at least 1");
        }
        if self.render.dpi == 0 {
            anyhow::bail!("render_dpi must be at least 1");
        }
        if self.render.max_image_edge < 64 {
            anyhow::bail!("max_image_edge must be at least 64 pixels");
        }
        if self.default_schema.is_some() && self.schema_dir.is_none() {
            anyhow::bail!("default_schema requires schema_dir");
        }
        Ok(())
    }
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Self {
            host: args.host,
            port: args.port,
            max_file_size: args.max_file_size,
            model: ModelConfig {
                endpoint: args.model_endpoint,
                model: args.model,
                api_key: args.api_key.filter(|key| !key.trim().is_empty()),
                timeout: Duration::from_millis(args.model_timeout_ms),
                max_attempts: args.max_attempts,
                retry_backoff_ms: args.retry_backoff_ms,
                temperature: args.temperature,
                json_mode: args.json_mode,
            },
            page_concurrency: args.page_concurrency,
            render: RenderOptions {
                dpi: args.render_dpi,
                max_image_edge: args.max_image_edge,
                pdfium_library: args.pdfium_lib_path,
            },
            extraction_prompt_file: args.extraction_prompt_file,
            schema_dir: args.schema_dir,
            default_schema: args.default_schema,
        }
    }
}
