//! `genstream debug`: render a running watcher's connection stores.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, Color, ContentArrangement, Table};
use genstream_protocol::{ConnectionState, DebugInfo};

pub async fn run(addr: SocketAddr, json: bool) -> anyhow::Result<()> {
    let url = format!("http://{addr}/debug");
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?;
    let response = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("no watcher reachable at {url}"))?
        .error_for_status()?;
    let stores: Vec<DebugInfo> = response.json().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stores)?);
        return Ok(());
    }

    for info in &stores {
        println!();
        println!(
            "  {} store: {} handlers, {} live transports, {} opened total",
            info.transport, info.total_handlers, info.open_transports, info.transports_opened
        );
        if !info.channels.is_empty() {
            println!("{}", render_store(info));
        }
    }
    println!();
    Ok(())
}

fn render_store(info: &DebugInfo) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Channel", "Handlers", "Owners", "State", "Attempts", "Live"]);
    for row in &info.channels {
        let color = match row.status.state {
            ConnectionState::Connected => Color::Green,
            ConnectionState::Connecting => Color::Yellow,
            ConnectionState::Disconnected => Color::Red,
        };
        let attempts = if row.status.max_attempts > 0 {
            format!("{}/{}", row.status.attempts, row.status.max_attempts)
        } else {
            "-".to_string()
        };
        table.add_row(vec![
            Cell::new(row.channel.as_str()),
            Cell::new(row.handlers),
            Cell::new(row.owners),
            Cell::new(row.status.state).fg(color),
            Cell::new(attempts),
            Cell::new(if row.transport_live { "yes" } else { "no" }),
        ]);
    }
    table
}
