use colored::*;
use sse_client::{LifecycleEvent, LifecycleKind, MessageEvent};
use std::time::Duration;

pub fn print_event(event: &MessageEvent) {
    let id = if event.id.is_empty() { "-" } else { &event.id };
    println!(
        "{} {} {}",
        format!("[{}]", event.event).cyan().bold(),
        format!("#{}", id).dimmed(),
        event.data
    );
}

pub fn print_lifecycle(event: &LifecycleEvent) {
    let stream = event.stream_id.as_deref().unwrap_or("-");
    match event.kind {
        LifecycleKind::Open => println!(
            "{} Stream open ({} {}, id {})",
            "✓".green(),
            event.status,
            event.status_text,
            stream
        ),
        LifecycleKind::Error => println!(
            "{} Stream error: {}",
            "✗".red(),
            event
                .error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| event.status_text.clone())
        ),
        LifecycleKind::Close => {
            let side = if event.is_local { "locally" } else { "by server" };
            println!("{} Stream {} closed {}", "→".blue(), stream, side)
        }
    }
}

pub fn print_summary(received: usize, elapsed: Duration) {
    println!("\n{}", "=== SUMMARY ===".bright_white().bold());
    println!(
        "{} events received in {:.2}s",
        received.to_string().bright_white().bold(),
        elapsed.as_secs_f64()
    );
}
