use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};

use tether_client::{ClientConfig, ClientSession, ConnectionState};
use tether_core::protocol::{Body, Envelope, ToolCallPayload};
use tether_settings::TetherSettings;
use tether_telemetry::{init_telemetry, TelemetryConfig};

use crate::ConnectArgs;

pub async fn run(settings: TetherSettings, args: ConnectArgs) -> anyhow::Result<()> {
    // Keep the terminal for the conversation.
    let _telemetry = init_telemetry(TelemetryConfig {
        log_level: "warn".into(),
        log_to_sqlite: false,
        metrics_enabled: false,
        ..TelemetryConfig::in_dir(settings.server.data_dir())
    });

    let session = ClientSession::websocket(ClientConfig::from(&settings.client));
    session.add_status_listener(|status| match &status.error {
        Some(error) => println!("[{}] {error}", status.state),
        None => println!("[{}]", status.state),
    });
    session.add_message_listener(print_envelope);

    session
        .connect(&args.url)
        .with_context(|| format!("cannot connect to {}", args.url))?;

    println!("Type a message and press enter. /status shows the connection, /quit exits.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let line = line.trim();

        match line {
            "" => continue,
            "/quit" | "/exit" => break,
            "/status" => {
                let status = session.status();
                let rtt = status
                    .rtt_ms
                    .map_or_else(|| "-".to_string(), |ms| format!("{ms} ms"));
                println!(
                    "state: {}  rtt: {rtt}  url: {}",
                    status.state,
                    status.url.as_deref().unwrap_or("-")
                );
            }
            text => {
                if session.state() != ConnectionState::Connected {
                    println!("(not connected, message not sent)");
                    continue;
                }
                if let Err(e) = session.send_user_input(text).await {
                    println!("(send failed: {e})");
                }
            }
        }
    }

    session.disconnect().await;
    Ok(())
}

fn print_envelope(envelope: &Envelope) {
    match &envelope.body {
        Body::Thinking(p) => println!("  ... {}", p.text),
        Body::ToolCall(p) => println!("  -> {}", describe_call(p)),
        Body::ToolResult(p) if p.success => println!("  <- {} ok", p.tool_name),
        Body::ToolResult(p) => println!(
            "  <- {} failed: {}",
            p.tool_name,
            p.error.as_deref().unwrap_or("unknown error")
        ),
        Body::LlmOutput(p) => println!("{}", p.text),
        Body::SystemStatus(p) => println!("[server] {}", p.message),
        _ => {}
    }
}

fn describe_call(call: &ToolCallPayload) -> String {
    let args = call
        .arguments
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("{}({args})", call.name)
}
