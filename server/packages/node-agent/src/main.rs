fn main() {
    if let Err(err) = node_agent::cli::run_node_agent() {
        tracing::error!(error = %err, "node-agent failed");
        std::process::exit(1);
    }
}
