use std::path::Path;

use anyhow::Result;

use crate::cli::SessionBackend;
use crate::config::{RuntimeConfig, display_session_db_url};
use crate::session::SqliteChatStore;
use crate::tools::mitre::ATTACK_DOMAINS;

fn env_present(key: &str) -> bool {
    std::env::var(key)
        .map(|value| !value.trim().is_empty())
        .unwrap_or(false)
}

fn path_status(path: &Path) -> &'static str {
    if path.exists() { "found" } else { "missing" }
}

pub async fn run_doctor(cfg: &RuntimeConfig) -> Result<()> {
    println!(
        "Active profile: '{}' (config: {})",
        cfg.profile, cfg.config_path
    );

    let checks = [
        (cfg.model_api_key_env.as_str(), env_present(&cfg.model_api_key_env)),
        ("VIRUSTOTAL_API_KEY", env_present("VIRUSTOTAL_API_KEY")),
    ];
    println!("Environment check:");
    for (key, ok) in checks {
        let status = if ok { "set" } else { "missing" };
        println!("- {key}: {status}");
    }
    if !env_present(&cfg.model_api_key_env) {
        println!(
            "Tip: export {} before running serve or ask",
            cfg.model_api_key_env
        );
    }

    println!(
        "Models: endpoint={} chat={} casual={} util={} vision={} search={} law={} reasoning_effort={}",
        cfg.model_base_url,
        cfg.chat_model,
        cfg.casual_model,
        cfg.util_model,
        cfg.vision_model,
        cfg.web_search_model,
        cfg.law_chat_model,
        cfg.reasoning_effort.as_deref().unwrap_or("<model-default>")
    );
    println!(
        "Planning: tool_timeout_secs={} confidence_threshold={}",
        cfg.tool_timeout_secs, cfg.confidence_threshold
    );

    println!("Tool data:");
    for domain in ATTACK_DOMAINS {
        let path = Path::new(&cfg.mitre_data_dir).join(format!("{domain}.json"));
        println!("- MITRE {domain}: {} ({})", path_status(&path), path.display());
    }
    let law_path = Path::new(&cfg.law_text_path);
    println!("- Law text: {} ({})", path_status(law_path), law_path.display());
    match cfg.siem_logs_path.as_deref() {
        Some(path) => println!("- SIEM logs: {} ({path})", path_status(Path::new(path))),
        None => println!("- SIEM logs: built-in sample set"),
    }
    match cfg.threat_intel_path.as_deref() {
        Some(path) => println!("- Threat intel DB: {} ({path})", path_status(Path::new(path))),
        None => println!("- Threat intel DB: empty (no path configured)"),
    }
    let upload_dir = Path::new(&cfg.upload_dir);
    println!("- Upload dir: {} ({})", path_status(upload_dir), upload_dir.display());

    println!(
        "Chat store: backend={:?} auth_tokens={}",
        cfg.session_backend,
        cfg.auth_tokens.len()
    );
    println!(
        "Telemetry: enabled={} path={}",
        cfg.telemetry_enabled, cfg.telemetry_path
    );

    if matches!(cfg.session_backend, SessionBackend::Sqlite) {
        let store = SqliteChatStore::connect(&cfg.session_db_url).await?;
        store.migrate().await?;
        println!(
            "SQLite chat store check: ok ({} chats, {})",
            store.chat_count().await?,
            display_session_db_url(cfg)
        );
    }

    Ok(())
}

pub async fn run_migrate(cfg: &RuntimeConfig) -> Result<()> {
    match cfg.session_backend {
        SessionBackend::Memory => {
            println!("Session backend is memory; no migration required.");
        }
        SessionBackend::Sqlite => {
            let store = SqliteChatStore::connect(&cfg.session_db_url).await?;
            store.migrate().await?;
            println!(
                "SQLite migrations applied successfully: {}",
                display_session_db_url(cfg)
            );
        }
    }
    Ok(())
}
