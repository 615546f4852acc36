use agent_dash::cli::run_agent_dash;

fn main() {
    if let Err(err) = run_agent_dash() {
        tracing::error!(error = %err, "agent-dash failed");
        std::process::exit(1);
    }
}
