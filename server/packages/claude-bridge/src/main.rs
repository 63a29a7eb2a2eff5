use claude_bridge::cli::run_claude_bridge;

fn main() {
    if let Err(err) = run_claude_bridge() {
        tracing::error!(error = %err, "claude-bridge failed");
        std::process::exit(1);
    }
}
