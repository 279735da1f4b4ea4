//! Newsletter Backend - server entry point
//! Delegates to the library for all app logic.

#[tokio::main]
async fn main() {
    newsletter_backend::run().await;
}
