use admission_gate::config::Args;
use admission_gate::filter::AdmissionFilter;
use admission_gate::{app, init_tracing, metrics};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let mut filter = match AdmissionFilter::configure(&args.filter_config()) {
        Ok(filter) => filter.with_hook(metrics::record_decision),
        Err(e) => {
            tracing::error!(error = %e, "invalid rate limit configuration");
            return Err(e.into());
        }
    };
    filter.start_maintenance();

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    let settings = filter.settings();
    tracing::info!(
        port = args.port,
        request_limit = settings.request_limit.get(),
        window_seconds = settings.window_seconds.get(),
        "gateway running on http://localhost:{}",
        args.port
    );

    let router = app(Arc::new(filter));

    axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}
