use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Subcommand)]
pub enum ProfileCommands {
    #[command(about = "List configured profiles and highlight the active profile")]
    List,
    #[command(about = "Show the active profile's resolved runtime settings")]
    Show,
}

#[derive(Debug, Subcommand)]
pub enum PlanCommands {
    #[command(about = "Validate a raw plan (JSON file or '-' for stdin) and print the normalized plan")]
    Validate {
        #[arg(long)]
        file: String,
        #[arg(long, value_enum, default_value_t = RegistryKind::Knowledge)]
        registry: RegistryKind,
    },
    #[command(about = "Validate and execute a raw plan, printing the step results")]
    Run {
        #[arg(long)]
        file: String,
        #[arg(long, value_enum, default_value_t = RegistryKind::Knowledge)]
        registry: RegistryKind,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RegistryKind {
    Knowledge,
    Detection,
}

impl RegistryKind {
    pub fn label(self) -> &'static str {
        match self {
            RegistryKind::Knowledge => "knowledge",
            RegistryKind::Detection => "detection",
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum ToolCommands {
    #[command(about = "List tools and functions in a registry")]
    List {
        #[arg(long, value_enum, default_value_t = RegistryKind::Knowledge)]
        registry: RegistryKind,
    },
}

#[derive(Debug, Subcommand)]
pub enum TelemetryCommands {
    #[command(about = "Summarize telemetry events from a JSONL stream")]
    Report {
        #[arg(long)]
        path: Option<String>,
        #[arg(long, default_value_t = 5000)]
        limit: usize,
    },
}

const CLI_EXAMPLES: &str = "Examples:\n\
  threatdesk serve --host 0.0.0.0 --port 8787\n\
  threatdesk ask \"What mitigations exist for T1059?\"\n\
  threatdesk ask --reasoning \"Is CVE-2021-44228 still exploited?\"\n\
  threatdesk plan validate --file plan.json\n\
  threatdesk plan run --file plan.json --registry detection\n\
  threatdesk tools list --registry knowledge\n\
  threatdesk --session-backend sqlite --session-db-url sqlite://.threatdesk/chats.db migrate\n\
  threatdesk --profile prod profiles show\n\
  threatdesk doctor\n\
  threatdesk telemetry report --limit 2000\n\
\n\
Model access:\n\
  - The model key is read from the env var named by --model-api-key-env (GROQ_API_KEY by default).\n\
  - URL and file scanning reads VIRUSTOTAL_API_KEY.";

#[derive(Debug, Parser)]
#[command(name = "threatdesk")]
#[command(about = "Conversational cybersecurity assistant with planned tool orchestration")]
#[command(after_long_help = CLI_EXAMPLES)]
pub struct Cli {
    #[arg(long, env = "THREATDESK_PROFILE", default_value = "default")]
    pub profile: String,

    #[arg(long, env = "THREATDESK_CONFIG", default_value = ".threatdesk/config.toml")]
    pub config_path: String,

    #[arg(long, env = "THREATDESK_MODEL_BASE_URL")]
    pub model_base_url: Option<String>,

    #[arg(long, env = "THREATDESK_MODEL_API_KEY_ENV")]
    pub model_api_key_env: Option<String>,

    #[arg(long, env = "THREATDESK_MODEL_TIMEOUT_SECS")]
    pub model_timeout_secs: Option<u64>,

    #[arg(long, env = "THREATDESK_CHAT_MODEL")]
    pub chat_model: Option<String>,

    #[arg(long, env = "THREATDESK_CASUAL_MODEL")]
    pub casual_model: Option<String>,

    #[arg(long, env = "THREATDESK_UTIL_MODEL")]
    pub util_model: Option<String>,

    #[arg(long, env = "THREATDESK_VISION_MODEL")]
    pub vision_model: Option<String>,

    #[arg(long, env = "THREATDESK_WEB_SEARCH_MODEL")]
    pub web_search_model: Option<String>,

    #[arg(long, env = "THREATDESK_LAW_CHAT_MODEL")]
    pub law_chat_model: Option<String>,

    #[arg(long, env = "THREATDESK_REASONING_EFFORT")]
    pub reasoning_effort: Option<String>,

    #[arg(long, env = "THREATDESK_CONFIDENCE_THRESHOLD")]
    pub confidence_threshold: Option<f64>,

    #[arg(long, env = "THREATDESK_TOOL_TIMEOUT_SECS")]
    pub tool_timeout_secs: Option<u64>,

    #[arg(long, env = "THREATDESK_MITRE_DATA_DIR")]
    pub mitre_data_dir: Option<String>,

    #[arg(long, env = "THREATDESK_LAW_TEXT_PATH")]
    pub law_text_path: Option<String>,

    #[arg(long, env = "THREATDESK_SIEM_LOGS_PATH")]
    pub siem_logs_path: Option<String>,

    #[arg(long, env = "THREATDESK_THREAT_INTEL_PATH")]
    pub threat_intel_path: Option<String>,

    #[arg(long, env = "THREATDESK_NVD_BASE_URL")]
    pub nvd_base_url: Option<String>,

    #[arg(long, env = "THREATDESK_UPLOAD_DIR")]
    pub upload_dir: Option<String>,

    #[arg(long, env = "THREATDESK_SESSION_BACKEND", value_enum)]
    pub session_backend: Option<SessionBackend>,

    #[arg(long, env = "THREATDESK_SESSION_DB_URL")]
    pub session_db_url: Option<String>,

    #[arg(long, env = "THREATDESK_SHOW_SENSITIVE_CONFIG", default_value_t = false)]
    pub show_sensitive_config: bool,

    #[arg(long, env = "THREATDESK_TELEMETRY_ENABLED", action = clap::ArgAction::Set)]
    pub telemetry_enabled: Option<bool>,

    #[arg(long, env = "THREATDESK_TELEMETRY_PATH")]
    pub telemetry_path: Option<String>,

    /// `token=user` pairs accepted as bearer tokens.
    #[arg(long, env = "THREATDESK_AUTH_TOKEN", value_delimiter = ',')]
    pub auth_token: Vec<String>,

    #[arg(long, env = "RUST_LOG", default_value = "error")]
    pub log_filter: String,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(about = "Run the chat server (WebSocket + chat history REST endpoints)")]
    Serve {
        #[arg(long, env = "THREATDESK_HOST")]
        host: Option<String>,
        #[arg(long, env = "THREATDESK_PORT")]
        port: Option<u16>,
    },
    #[command(about = "Answer one query through the full routing pipeline and print the answer")]
    Ask {
        #[arg(required = true)]
        query: Vec<String>,
        #[arg(long, default_value_t = false)]
        reasoning: bool,
        #[arg(long)]
        file_url: Option<String>,
        #[arg(long)]
        image_url: Option<String>,
    },
    #[command(about = "Validate or execute raw tool plans")]
    Plan {
        #[command(subcommand)]
        command: PlanCommands,
    },
    #[command(about = "Inspect tool registries")]
    Tools {
        #[command(subcommand)]
        command: ToolCommands,
    },
    #[command(about = "Validate model, tool data, and chat store configuration")]
    Doctor,
    #[command(about = "Run chat store migrations (sqlite only)")]
    Migrate,
    #[command(about = "Inspect profile configuration and active resolved profile state")]
    Profiles {
        #[command(subcommand)]
        command: ProfileCommands,
    },
    #[command(about = "Telemetry utilities and reporting")]
    Telemetry {
        #[command(subcommand)]
        command: TelemetryCommands,
    },
}

pub fn command_label(command: &Commands) -> String {
    match command {
        Commands::Serve { .. } => "serve".to_string(),
        Commands::Ask { .. } => "ask".to_string(),
        Commands::Plan { command } => match command {
            PlanCommands::Validate { .. } => "plan.validate".to_string(),
            PlanCommands::Run { .. } => "plan.run".to_string(),
        },
        Commands::Tools { command } => match command {
            ToolCommands::List { .. } => "tools.list".to_string(),
        },
        Commands::Doctor => "doctor".to_string(),
        Commands::Migrate => "migrate".to_string(),
        Commands::Profiles { command } => match command {
            ProfileCommands::List => "profiles.list".to_string(),
            ProfileCommands::Show => "profiles.show".to_string(),
        },
        Commands::Telemetry { command } => match command {
            TelemetryCommands::Report { .. } => "telemetry.report".to_string(),
        },
    }
}
