use cmdbot::core::terminal;

#[tokio::main]
async fn main() {
    if let Err(e) = cmdbot::cli::run_main().await {
        terminal::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}
