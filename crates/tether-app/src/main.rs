mod auth;
mod config;
mod gateway;
mod protocol;
mod reaper;
mod server;
mod state;
mod tabs;
mod workspace;

use std::sync::Arc;

use clap::Parser;
use tether_pty::SessionRegistry;

use auth::TokenTable;
use config::Config;
use state::AppState;
use workspace::WorkspaceResolver;

fn fatal(msg: impl std::fmt::Display) -> ! {
    eprintln!("fatal: {msg}");
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::parse();
    if let Err(e) = config.validate() {
        fatal(e);
    }

    // Open (or create) the tab ledger, ~/.tether/tether.db by default.
    let Some(db_path) = config.resolved_db_path() else {
        fatal("could not determine home directory; pass --db");
    };
    if let Some(parent) = db_path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            fatal(format!("failed to create {}: {e}", parent.display()));
        }
    }
    let ledger = match tether_db::open(&db_path) {
        Ok(conn) => conn,
        Err(e) => fatal(format!("failed to open {}: {e}", db_path.display())),
    };
    log::info!("tab ledger at {}", db_path.display());

    let tokens = TokenTable::new(config.tokens.iter().cloned());
    log::info!("{} principal(s) configured", tokens.len());

    let workspace_root = match std::fs::canonicalize(&config.workspace_root) {
        Ok(root) => root,
        Err(e) => fatal(format!(
            "workspace root {} is unusable: {e}",
            config.workspace_root.display()
        )),
    };
    let workspaces = WorkspaceResolver::new(workspace_root);
    log::info!("workspaces under {}", workspaces.root().display());

    let state = AppState::new(
        SessionRegistry::new(config.session_config()),
        ledger,
        workspaces,
        Arc::new(tokens),
    );

    reaper::start_reaper(
        Arc::clone(&state.registry),
        config.reap_policy(),
        config.reap_interval(),
    );

    if let Err(e) = server::serve(config.bind, state).await {
        fatal(format!("server on {} failed: {e}", config.bind));
    }
}
