#[tokio::main]
async fn main() {
    bidhouse::start(std::env::args()).await;
}
