use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    #[serde(default = "default_target_label")]
    pub target_label: String,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    pub dino: DinoConfig,
    pub yolo: YoloConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

fn default_target_label() -> String {
    "cat".to_string()
}

impl Config {
    pub fn validate(&self) -> Result<(), String> {
        if self.target_label.trim().is_empty() {
            return Err("target_label must not be empty".to_string());
        }
        self.dino.validate()?;
        self.yolo.validate()?;
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionProvider {
    #[default]
    Cpu,
    Cuda,
    Tensorrt,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub execution_provider: ExecutionProvider,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetchConfig {
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Parent for per-request download directories. The system temp
    /// directory when unset.
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: None,
            user_agent: default_user_agent(),
            temp_dir: None,
        }
    }
}

fn default_user_agent() -> String {
    format!("cat_detection/{}", env!("CARGO_PKG_VERSION"))
}

/// Settings shared by anything loaded from a model directory.
pub trait Validatable {
    fn get_path(&self) -> PathBuf;

    fn validate_path(&self) -> Result<(), String> {
        let path = self.get_path();
        if !path.exists() {
            return Err(format!("File not found: {:?}", path));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DinoConfig {
    pub model_dir: PathBuf,
    pub onnx_file: String,
    pub tokenizer_file: String,
    #[serde(default = "default_text_prompt")]
    pub text_prompt: String,
    #[serde(default = "default_box_threshold")]
    pub box_threshold: f32,
    #[serde(default = "default_text_threshold")]
    pub text_threshold: f32,
    #[serde(default = "default_min_size")]
    pub min_size: u32,
    #[serde(default = "default_max_size")]
    pub max_size: u32,
    #[serde(default)]
    pub pixel_boxes: bool,
    #[serde(default = "default_model_instances")]
    pub num_instances: usize,
}

fn default_text_prompt() -> String {
    "cat.".to_string()
}

fn default_box_threshold() -> f32 {
    0.35
}

fn default_text_threshold() -> f32 {
    0.25
}

fn default_min_size() -> u32 {
    800
}

fn default_max_size() -> u32 {
    1333
}

fn default_model_instances() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .min(4)
}

impl Validatable for DinoConfig {
    fn get_path(&self) -> PathBuf {
        self.model_dir.join(&self.onnx_file)
    }
}

impl DinoConfig {
    pub fn get_tokenizer_path(&self) -> PathBuf {
        self.model_dir.join(&self.tokenizer_file)
    }

    pub fn validate(&self) -> Result<(), String> {
        self.validate_path()?;
        let tokenizer_path = self.get_tokenizer_path();
        if !tokenizer_path.exists() {
            return Err(format!("Tokenizer file not found: {:?}", tokenizer_path));
        }
        validate_threshold("dino.box_threshold", self.box_threshold)?;
        validate_threshold("dino.text_threshold", self.text_threshold)?;
        if self.text_prompt.trim().is_empty() {
            return Err("dino.text_prompt must not be empty".to_string());
        }
        if self.min_size == 0 || self.max_size < self.min_size {
            return Err(format!(
                "dino.min_size ({}) must be positive and not exceed dino.max_size ({})",
                self.min_size, self.max_size
            ));
        }
        validate_instances("dino.num_instances", self.num_instances)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct YoloConfig {
    pub model_dir: PathBuf,
    pub onnx_file: String,
    pub labels_file: String,
    #[serde(default = "default_input_size")]
    pub input_size: u32,
    #[serde(default = "default_min_probability")]
    pub min_probability: f32,
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,
    #[serde(default = "default_max_detections")]
    pub max_detections: usize,
    #[serde(default = "default_model_instances")]
    pub num_instances: usize,
}

fn default_input_size() -> u32 {
    640
}

fn default_min_probability() -> f32 {
    0.25
}

fn default_iou_threshold() -> f32 {
    0.7
}

fn default_max_detections() -> usize {
    300
}

impl Validatable for YoloConfig {
    fn get_path(&self) -> PathBuf {
        self.model_dir.join(&self.onnx_file)
    }
}

impl YoloConfig {
    pub fn get_labels_path(&self) -> PathBuf {
        self.model_dir.join(&self.labels_file)
    }

    pub fn validate(&self) -> Result<(), String> {
        self.validate_path()?;
        let labels_path = self.get_labels_path();
        if !labels_path.exists() {
            return Err(format!("Labels file not found: {:?}", labels_path));
        }
        validate_threshold("yolo.min_probability", self.min_probability)?;
        validate_threshold("yolo.iou_threshold", self.iou_threshold)?;
        if self.input_size == 0 {
            return Err("yolo.input_size must be positive".to_string());
        }
        if self.max_detections == 0 {
            return Err("yolo.max_detections must be positive".to_string());
        }
        validate_instances("yolo.num_instances", self.num_instances)
    }
}

fn validate_threshold(name: &str, value: f32) -> Result<(), String> {
    if !(0.0..=1.0).contains(&value) {
        return Err(format!("{} must be within [0, 1], got {}", name, value));
    }
    Ok(())
}

fn validate_instances(name: &str, value: usize) -> Result<(), String> {
    if value == 0 {
        return Err(format!("{} must be at least 1", name));
    }
    Ok(())
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

/// Loads `configuration/base.yaml`, the environment overlay, `APP_*`
/// variables and finally the bare `PORT` variable.
pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir()
        .map_err(|e| config::ConfigError::Message(format!("no current directory: {}", e)))?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(
            config::File::from(
                configuration_directory.join(format!("{}.yaml", environment.as_str())),
            )
            .required(false),
        )
        .add_source(
            config::Environment::with_prefix("APP")
                .prefix_separator("_")
                .separator("__"),
        )
        .set_override_option("server.port", std::env::var("PORT").ok())?
        .build()?;

    let config = config.try_deserialize::<Config>()?;
    if let Err(e) = config.validate() {
        tracing::error!("Configuration validation failed: {}", e);
        return Err(config::ConfigError::Message(e));
    }

    Ok(config)
}
