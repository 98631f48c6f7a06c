use webai::create_app_router;
use webai::init::app_init;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("🚀 Starting WebAI server...");
    dotenv::dotenv().ok();
    let (config, state) = app_init().await?;
    log::info!("✅ Application state initialized");
    let store = state.bots.backend();
    let llm = state.llm.name();
    let app = create_app_router(state);

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    log::info!("");
    log::info!("🎉 Server started!");
    log::info!("📍 http://{}", addr);
    log::info!("🛠️  Generate: http://{}/api/bots/generate-code", addr);
    log::info!("💬 Chat: http://{}/api/chat/{{slug}}", addr);
    log::info!("🌐 Sites: http://{}/s/{{slug}}", addr);
    log::info!("❤️  Health: http://{}/health", addr);
    log::info!("");
    log::info!("💾 Store: {}", store);
    log::info!("🤖 LLM: {}", llm);
    log::info!("");

    axum::serve(listener, app).await?;

    Ok(())
}
