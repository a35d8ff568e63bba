//! Process configuration and command-line interface
//!
//! All configuration is parsed once at startup into an immutable
//! [`ServerConfig`] handed to components by reference. Flag names keep the
//! launcher's snake_case surface (`--embedding_path`, `--model_name`, …).

use std::collections::BTreeMap;

use clap::Parser;

use crate::error::{Result, ServerError};

/// Weight / activation data types understood by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataType {
    /// 32-bit float
    Float32,
    /// 16-bit float
    #[default]
    Float16,
    /// 8-bit integer quantization
    Int8,
    /// 4-bit integer quantization (no zero point)
    Int4NoZero,
    /// 4-bit integer quantization (with zero point)
    Int4,
    /// Grouped 4-bit integer quantization
    Int4Group,
}

impl DataType {
    /// Parse a dtype string. `int4g<N>` selects grouped quantization with
    /// group count `N` (returned separately).
    pub fn parse(s: &str) -> Result<(Self, Option<usize>)> {
        if let Some(group) = s.strip_prefix("int4g") {
            if !group.is_empty() {
                let count = group.parse::<usize>().map_err(|_| {
                    ServerError::Startup(format!("Unsupport data type: {s}"))
                })?;
                return Ok((Self::Int4Group, Some(count)));
            }
            return Ok((Self::Int4Group, None));
        }
        let dtype = match s {
            "float32" => Self::Float32,
            "half" | "float16" => Self::Float16,
            "int8" => Self::Int8,
            "int4" => Self::Int4NoZero,
            "int4z" => Self::Int4,
            _ => return Err(ServerError::Startup(format!("Unsupport data type: {s}"))),
        };
        Ok((dtype, None))
    }
}

/// Parse a device map in either launcher format:
///
/// - comma-separated `dev:layers` pairs (`cuda:28,cpu:8`)
/// - Python-dict-like (`{'cuda':28,'cpu':8}` or `{"cuda":28}`)
/// - a bare device name (`cuda`), meaning one unit on that device
#[must_use]
pub fn parse_device_map(input: &str) -> BTreeMap<String, usize> {
    let mut map = BTreeMap::new();
    let mut s = input.trim().to_string();

    if s.starts_with('{') && s.ends_with('}') {
        s = s[1..s.len() - 1]
            .chars()
            .filter(|&c| c != '\'' && c != '"')
            .collect();
    }

    for item in s.split(',') {
        if let Some(pos) = item.rfind(':') {
            if pos > 0 {
                let dev = item[..pos].trim();
                if let Ok(layers) = item[pos + 1..].trim().parse::<usize>() {
                    if layers > 0 && !dev.is_empty() {
                        map.insert(dev.to_string(), layers);
                    }
                }
            }
        }
    }

    if map.is_empty() && !s.is_empty() {
        map.insert(s, 1);
    }
    map
}

/// Command-line flags
#[derive(Parser, Debug)]
#[command(name = "fastllm-server", version, about = "OpenAI-compatible API server for fastllm")]
pub struct Cli {
    /// Model file or directory path
    #[arg(short = 'p', long, default_value = "chatglm-6b-int4.bin")]
    pub path: String,

    /// Embedding model path, enables /v1/embeddings and /v1/rerank
    #[arg(long = "embedding_path")]
    pub embedding_path: Option<String>,

    /// Listen address
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Listen port
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// Engine thread count
    #[arg(short = 't', long, default_value_t = 4)]
    pub threads: usize,

    /// Weight data type (float32/half/float16/int8/int4/int4z/int4g<N>)
    #[arg(long, default_value = "float16")]
    pub dtype: String,

    /// Activation data type (float32/float16)
    #[arg(long, default_value = "float32")]
    pub atype: String,

    /// Maximum concurrent requests
    #[arg(long = "batch", alias = "max_batch", default_value_t = 256)]
    pub batch: usize,

    /// Token capacity limit (-1 = unlimited)
    #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
    pub tokens: i64,

    /// Chunked prefill size (-1 = automatic)
    #[arg(
        long = "chunk_size",
        alias = "chunked_prefill_size",
        default_value_t = -1,
        allow_hyphen_values = true
    )]
    pub chunk_size: i64,

    /// Model name reported through the OpenAI API
    #[arg(long = "model_name", default_value = "fastllm")]
    pub model_name: String,

    /// Device or device map (`cuda`, `cuda:28,cpu:8`, or `{'cuda':28}`)
    #[arg(long = "device", alias = "device_map")]
    pub device: Option<String>,

    /// MoE expert-layer device or device map
    #[arg(long = "moe_device", alias = "moe_device_map")]
    pub moe_device: Option<String>,

    /// Run embedding on CUDA
    #[arg(long = "cuda_embedding")]
    pub cuda_embedding: bool,

    /// Low-memory mode
    #[arg(short = 'l', long = "low")]
    pub low: bool,

    /// API key; when set, requests need `Authorization: Bearer <key>`
    #[arg(long = "api_key")]
    pub api_key: Option<String>,

    /// Enable dev endpoints (/v1/cancel, /v1/active_conversations)
    #[arg(long = "dev_mode")]
    pub dev_mode: bool,
}

/// Immutable process-wide configuration, constructed once at startup
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Model file path
    pub path: String,
    /// Embedding model file path
    pub embedding_path: Option<String>,
    /// Listen address
    pub host: String,
    /// Listen port
    pub port: u16,
    /// Engine thread count
    pub threads: usize,
    /// Weight data type
    pub dtype: DataType,
    /// Grouped-quantization group count from `int4g<N>`
    pub group_count: Option<usize>,
    /// Activation data type
    pub atype: DataType,
    /// Concurrent request cap for the request pool
    pub max_active: usize,
    /// Token capacity limit
    pub tokens_limit: Option<usize>,
    /// Chunked prefill size
    pub chunk_size: Option<usize>,
    /// Model name on the wire
    pub model_name: String,
    /// Device layer mapping
    pub devices: BTreeMap<String, usize>,
    /// MoE expert-layer device mapping
    pub moe_devices: BTreeMap<String, usize>,
    /// Run embedding on CUDA
    pub cuda_embedding: bool,
    /// Low-memory mode
    pub low_memory: bool,
    /// Optional API key
    pub api_key: Option<String>,
    /// Dev endpoints enabled
    pub dev_mode: bool,
}

impl ServerConfig {
    /// Validate and freeze CLI flags into the process configuration
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let (dtype, group_count) = DataType::parse(&cli.dtype)?;
        let (atype, _) = DataType::parse(&cli.atype)?;

        Ok(Self {
            path: cli.path,
            embedding_path: cli.embedding_path,
            host: cli.host,
            port: cli.port,
            threads: cli.threads,
            dtype,
            group_count,
            atype,
            max_active: cli.batch.clamp(1, 256),
            tokens_limit: usize::try_from(cli.tokens).ok().filter(|&t| t > 0),
            chunk_size: usize::try_from(cli.chunk_size).ok().filter(|&c| c > 0),
            model_name: cli.model_name,
            devices: cli.device.as_deref().map(parse_device_map).unwrap_or_default(),
            moe_devices: cli
                .moe_device
                .as_deref()
                .map(parse_device_map)
                .unwrap_or_default(),
            cuda_embedding: cli.cuda_embedding,
            low_memory: cli.low,
            api_key: cli.api_key,
            dev_mode: cli.dev_mode,
        })
    }

    /// Configuration for the in-process demo state used by tests
    #[must_use]
    pub fn demo() -> Self {
        Self {
            path: "demo".to_string(),
            embedding_path: None,
            host: "127.0.0.1".to_string(),
            port: 8080,
            threads: 4,
            dtype: DataType::Float16,
            group_count: None,
            atype: DataType::Float32,
            max_active: 256,
            tokens_limit: None,
            chunk_size: None,
            model_name: "fastllm".to_string(),
            devices: BTreeMap::new(),
            moe_devices: BTreeMap::new(),
            cuda_embedding: false,
            low_memory: false,
            api_key: None,
            dev_mode: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_parse_basic() {
        assert_eq!(DataType::parse("float32").unwrap(), (DataType::Float32, None));
        assert_eq!(DataType::parse("half").unwrap(), (DataType::Float16, None));
        assert_eq!(DataType::parse("float16").unwrap(), (DataType::Float16, None));
        assert_eq!(DataType::parse("int8").unwrap(), (DataType::Int8, None));
        assert_eq!(DataType::parse("int4").unwrap(), (DataType::Int4NoZero, None));
        assert_eq!(DataType::parse("int4z").unwrap(), (DataType::Int4, None));
    }

    #[test]
    fn test_dtype_parse_grouped() {
        assert_eq!(
            DataType::parse("int4g128").unwrap(),
            (DataType::Int4Group, Some(128))
        );
        assert_eq!(DataType::parse("int4g").unwrap(), (DataType::Int4Group, None));
        assert!(DataType::parse("int4gx").is_err());
    }

    #[test]
    fn test_dtype_parse_unknown() {
        let err = DataType::parse("bf16").unwrap_err();
        assert!(err.to_string().contains("Unsupport data type"));
    }

    #[test]
    fn test_device_map_pairs() {
        let map = parse_device_map("cuda:28,cpu:8");
        assert_eq!(map.get("cuda"), Some(&28));
        assert_eq!(map.get("cpu"), Some(&8));
    }

    #[test]
    fn test_device_map_python_dict() {
        let map = parse_device_map("{'cuda':1,'cpu':4}");
        assert_eq!(map.get("cuda"), Some(&1));
        assert_eq!(map.get("cpu"), Some(&4));

        let map = parse_device_map("{\"cuda\":2}");
        assert_eq!(map.get("cuda"), Some(&2));
    }

    #[test]
    fn test_device_map_bare_device() {
        let map = parse_device_map("cuda");
        assert_eq!(map.get("cuda"), Some(&1));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_device_map_multi_colon_uses_last() {
        // cuda:0:28 means device "cuda:0" with 28 layers
        let map = parse_device_map("cuda:0:28,cpu:4");
        assert_eq!(map.get("cuda:0"), Some(&28));
        assert_eq!(map.get("cpu"), Some(&4));
    }

    #[test]
    fn test_device_map_zero_layers_ignored() {
        let map = parse_device_map("cuda:0");
        // Zero layers is not a mapping; falls back to bare-name handling.
        assert_eq!(map.get("cuda:0"), Some(&1));
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["fastllm-server"]);
        let config = ServerConfig::from_cli(cli).unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8080);
        assert_eq!(config.model_name, "fastllm");
        assert_eq!(config.max_active, 256);
        assert_eq!(config.tokens_limit, None);
        assert!(!config.dev_mode);
    }

    #[test]
    fn test_cli_snake_case_flags() {
        let cli = Cli::parse_from([
            "fastllm-server",
            "--path",
            "model.bin",
            "--embedding_path",
            "embed.bin",
            "--model_name",
            "qwen3",
            "--api_key",
            "secret",
            "--dev_mode",
            "--max_batch",
            "16",
            "--device_map",
            "cuda:28,cpu:8",
        ]);
        let config = ServerConfig::from_cli(cli).unwrap();
        assert_eq!(config.path, "model.bin");
        assert_eq!(config.embedding_path.as_deref(), Some("embed.bin"));
        assert_eq!(config.model_name, "qwen3");
        assert_eq!(config.api_key.as_deref(), Some("secret"));
        assert!(config.dev_mode);
        assert_eq!(config.max_active, 16);
        assert_eq!(config.devices.get("cuda"), Some(&28));
    }

    #[test]
    fn test_batch_clamped() {
        let cli = Cli::parse_from(["fastllm-server", "--batch", "100000"]);
        assert_eq!(ServerConfig::from_cli(cli).unwrap().max_active, 256);

        let cli = Cli::parse_from(["fastllm-server", "--batch", "0"]);
        assert_eq!(ServerConfig::from_cli(cli).unwrap().max_active, 1);
    }

    #[test]
    fn test_short_flags() {
        let cli = Cli::parse_from(["fastllm-server", "-p", "m.bin", "-t", "8", "-l"]);
        let config = ServerConfig::from_cli(cli).unwrap();
        assert_eq!(config.path, "m.bin");
        assert_eq!(config.threads, 8);
        assert!(config.low_memory);
    }
}
