use anyhow::Result;
use novel2script::core::config::Config;
use novel2script::core::io::NativeStorage;
use novel2script::services::llm::create_client;
use novel2script::services::setup;
use novel2script::services::workflow::WorkflowManager;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let mut config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {:#}", e);
            eprintln!("Please ensure 'config.yml' exists with valid LLM settings.");
            return Err(e);
        }
    };

    config.ensure_directories()?;

    let mode = setup::run_setup(&mut config)?;
    let client = create_client(&config)?;

    let mut manager = WorkflowManager::new(config, client, Arc::new(NativeStorage::new()), mode);

    // Progress is persisted after every completed stage, so an interrupted
    // call only loses the batch in flight.
    tokio::select! {
        res = manager.run() => res,
        _ = tokio::signal::ctrl_c() => {
            println!("\nInterrupted. Progress up to the last completed batch is saved.");
            Ok(())
        }
    }
}
