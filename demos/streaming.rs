//! Timeout-guarded streaming endpoints.
//!
//! Run with:
//!   RUST_LOG=tardy=debug cargo run --example streaming
//!
//! Try:
//!   curl -N http://localhost:3000/ticks        # streams ten ticks, then ends
//!   curl -N http://localhost:3000/ticks?stall  # cut off after the third tick
//!   curl -i http://localhost:3000/slow         # 503 from the fallback

use std::time::Duration;

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use tardy::middleware::{timeout, TimeoutOptions};
use tardy::{ContentType, Error, Request, Server, Writer};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let options = TimeoutOptions::new()
        .initial(Duration::from_millis(500))
        .rolling(Duration::from_millis(300));

    Server::bind("0.0.0.0:3000")
        .serve(timeout(app, options))
        .await
        .expect("server error");
}

// tardy serves a single handler; dispatch on the path by hand.
async fn app(req: Request, w: Writer) -> Result<(), Error> {
    match req.path() {
        "/ticks" => ticks(req, w).await,
        "/slow" => slow(req, w).await,
        _ => not_found(w),
    }
}

// GET /ticks: one line every 100ms. With `?stall` the fourth tick waits a
// full second and the rolling timeout closes the connection.
async fn ticks(req: Request, mut w: Writer) -> Result<(), Error> {
    let stall = req.uri().query() == Some("stall");
    w.headers().insert(CONTENT_TYPE, ContentType::Text.header_value());

    for n in 0..10 {
        let pause = if stall && n == 3 { 1000 } else { 100 };
        tokio::time::sleep(Duration::from_millis(pause)).await;
        w.write(Bytes::from(format!("tick {n}\n"))).await?;
    }
    Ok(())
}

// GET /slow: never answers in time; the initial timeout hands the response
// to the default fallback and the context says why.
async fn slow(req: Request, mut w: Writer) -> Result<(), Error> {
    let cause = req.context().cancelled().await;
    tracing::info!(?cause, "slow handler gave up");
    w.write(Bytes::from_static(b"too late")).await
}

fn not_found(mut w: Writer) -> Result<(), Error> {
    w.write_header(http::StatusCode::NOT_FOUND)
}
