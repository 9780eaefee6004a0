//! `genstream watch <channel>`: subscribe and print events until Ctrl-C.

use std::net::SocketAddr;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use comfy_table::presets::UTF8_FULL;
use comfy_table::{ContentArrangement, Table};
use console::style;
use genstream_client::{
    Channel, ClientConfig, ConnectionState, Envelope, EventHandler, Job, JobState, JobTracker,
    Stores, SubscribeOptions, TransportKind,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::WatchArgs;

pub async fn run(args: WatchArgs, config: ClientConfig) -> anyhow::Result<()> {
    let channel = Channel::new(args.channel.trim());
    if channel.is_empty() {
        anyhow::bail!("channel id must not be empty");
    }
    let kind = TransportKind::from(args.transport);
    let correlation_id = args
        .correlation_id
        .clone()
        .unwrap_or_else(genstream_protocol::new_id);

    let stores = Stores::new(&config)?;
    let store = stores.get(kind);

    if let Some(addr) = args.debug_addr {
        spawn_debug_server(addr, stores.clone()).await?;
    }

    let json = args.json;
    store.add_connection_handler(move |channel, status| {
        info!(
            component = "watch",
            event = "watch.connection.changed",
            channel = %channel,
            state = %status.state,
            attempts = status.attempts,
            "Connection state changed"
        );
        if json {
            return;
        }
        let label = match status.state {
            ConnectionState::Connected => style("connected").green(),
            ConnectionState::Connecting => style("connecting").yellow(),
            ConnectionState::Disconnected => style("disconnected").red(),
        };
        if status.max_attempts > 0 && status.attempts > 0 {
            eprintln!(
                "  {} {} (attempt {}/{})",
                style(channel).dim(),
                label,
                status.attempts,
                status.max_attempts
            );
        } else {
            eprintln!("  {} {}", style(channel).dim(), label);
        }
    });

    let tracker = JobTracker::new();
    let printer = EventHandler::from_fn(move |envelope| print_envelope(envelope, json));

    let subscription = stores.subscribe(
        kind,
        channel.clone(),
        vec![printer, tracker.handler()],
        SubscribeOptions::default().with_correlation_id(correlation_id.clone()),
    );

    info!(
        component = "watch",
        event = "watch.started",
        channel = %channel,
        transport = %kind,
        correlation_id = %correlation_id,
        "Watching channel"
    );
    if !json {
        eprintln!();
        eprintln!(
            "  Watching {} over {} (Ctrl-C to stop)",
            style(&channel).bold(),
            kind
        );
        eprintln!();
    }

    let mut status = subscription.watch_status();
    let gave_up = async {
        match status.as_mut() {
            Some(rx) => rx.wait_for(|s| s.is_exhausted()).await.is_ok(),
            None => std::future::pending().await,
        }
    };

    let exhausted = tokio::select! {
        _ = tokio::signal::ctrl_c() => false,
        exhausted = gave_up => exhausted,
    };

    let attempts = subscription.connection_attempts();
    subscription.disconnect();

    if !json {
        let jobs = tracker.snapshot();
        if !jobs.is_empty() {
            println!();
            println!("{}", render_jobs(&jobs));
        }
    }

    if exhausted {
        warn!(
            component = "watch",
            event = "watch.gave_up",
            channel = %channel,
            attempts,
            "Transport gave up"
        );
        if subscription.max_attempts() == 0 {
            anyhow::bail!("{kind} transport for {channel} ended and will not recover");
        }
        anyhow::bail!("gave up on {channel} after {attempts} reconnect attempts");
    }
    Ok(())
}

fn print_envelope(envelope: &Envelope, json: bool) {
    if json {
        match serde_json::to_string(envelope) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!(
                component = "watch",
                event = "watch.print_failed",
                error = %e,
                "Failed to serialize envelope"
            ),
        }
        return;
    }

    let key = envelope.job_key().unwrap_or("-");
    let detail = if let Some(p) = envelope.progress_percent() {
        format!("{p:.0}%")
    } else if let Some(error) = envelope.error_message() {
        style(error).red().to_string()
    } else if let Some(url) = &envelope.url {
        url.clone()
    } else {
        envelope.status.clone().unwrap_or_default()
    };
    println!(
        "  {:<12} {:<16} {}",
        style(&envelope.kind).cyan(),
        key,
        detail
    );
}

pub fn render_jobs(jobs: &[Job]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Job", "State", "Progress", "Result"]);
    for job in jobs {
        let (progress, result) = match &job.state {
            JobState::Pending => ("-".to_string(), String::new()),
            JobState::Running { progress } => (
                progress.map(|p| format!("{p:.0}%")).unwrap_or_else(|| "-".into()),
                String::new(),
            ),
            JobState::Completed { url } => ("100%".to_string(), url.clone().unwrap_or_default()),
            JobState::Failed { error } => ("-".to_string(), error.clone()),
        };
        table.add_row(vec![
            job.key.clone(),
            job.state.label().to_string(),
            progress,
            result,
        ]);
    }
    table
}

async fn spawn_debug_server(addr: SocketAddr, stores: Stores) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/debug", get(debug_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(stores);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    info!(
        component = "watch",
        event = "watch.debug.listening",
        addr = %local,
        "Debug endpoint listening"
    );
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!(
                component = "watch",
                event = "watch.debug.failed",
                error = %e,
                "Debug endpoint stopped"
            );
        }
    });
    Ok(())
}

async fn debug_handler(State(stores): State<Stores>) -> impl IntoResponse {
    Json(stores.debug_info())
}

async fn health_handler() -> impl IntoResponse {
    "OK"
}
