#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dockhand_agent::run_cli().await
}
