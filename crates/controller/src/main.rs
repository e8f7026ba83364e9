#[tokio::main]
async fn main() -> anyhow::Result<()> {
    controller::init_tracing();
    controller::run().await
}
