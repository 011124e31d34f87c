use anyhow::Result;
use clap::Parser;
use tracing::level_filters::LevelFilter;

use threatdesk::agents::TurnRequest;
use threatdesk::chat::run_ask;
use threatdesk::cli::{
    Cli, Commands, PlanCommands, ProfileCommands, TelemetryCommands, ToolCommands, command_label,
};
use threatdesk::config::{load_profiles, resolve_runtime_config};
use threatdesk::doctor::{run_doctor, run_migrate};
use threatdesk::error::{categorize_error, format_cli_error};
use threatdesk::plans::{run_plan_execute, run_plan_validate, run_tools_list};
use threatdesk::profiles::{run_profiles_list, run_profiles_show};
use threatdesk::server::run_server;
use threatdesk::telemetry::{TelemetrySink, run_telemetry_report};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let show_sensitive = cli.show_sensitive_config;
    if let Err(err) = run_cli(cli).await {
        eprintln!("{}", format_cli_error(&err, show_sensitive));
        tracing::error!(category = %categorize_error(&err).code(), "command failed");
        std::process::exit(1);
    }

    Ok(())
}

async fn run_cli(cli: Cli) -> Result<()> {
    init_tracing(&cli.log_filter)?;
    let profiles = load_profiles(&cli.config_path)?;
    let cfg = resolve_runtime_config(&cli, &profiles)?;

    let command = cli.command.unwrap_or(Commands::Serve {
        host: None,
        port: None,
    });
    let telemetry = TelemetrySink::new(&cfg, command_label(&command));
    telemetry.emit("command.started", serde_json::json!({}));

    let result = match command {
        Commands::Serve { host, port } => {
            let host = host.unwrap_or_else(|| cfg.server_host.clone());
            let port = port.unwrap_or(cfg.server_port);
            run_server(cfg.clone(), host, port, &telemetry).await
        }
        Commands::Ask {
            query,
            reasoning,
            file_url,
            image_url,
        } => {
            let turn = TurnRequest {
                query: query.join(" "),
                include_reasoning: reasoning,
                chat_id: None,
                file_url,
                image_url,
            };
            run_ask(&cfg, &telemetry, turn).await
        }
        Commands::Plan { command } => match command {
            PlanCommands::Validate { file, registry } => {
                run_plan_validate(&cfg, &file, registry, &telemetry)
            }
            PlanCommands::Run { file, registry } => {
                run_plan_execute(&cfg, &file, registry, &telemetry).await
            }
        },
        Commands::Tools { command } => match command {
            ToolCommands::List { registry } => run_tools_list(&cfg, registry),
        },
        Commands::Doctor => run_doctor(&cfg).await,
        Commands::Migrate => run_migrate(&cfg).await,
        Commands::Profiles { command } => match command {
            ProfileCommands::List => run_profiles_list(&profiles, &cfg),
            ProfileCommands::Show => run_profiles_show(&cfg),
        },
        Commands::Telemetry { command } => match command {
            TelemetryCommands::Report { path, limit } => {
                run_telemetry_report(&cfg, path, limit)
            }
        },
    };

    match &result {
        Ok(()) => telemetry.emit("command.completed", serde_json::json!({})),
        Err(err) => telemetry.emit(
            "command.failed",
            serde_json::json!({ "category": categorize_error(err).code() }),
        ),
    }
    telemetry.flush();
    result
}

fn init_tracing(log_filter: &str) -> Result<()> {
    let level = log_filter
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_env_filter(log_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing subscriber: {e}"))
}
