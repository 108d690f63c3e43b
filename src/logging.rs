/// Host logging initialization: tracing-subscriber fmt to stderr with
/// RUST_LOG-style filtering.
///
/// Called once at the start of `ChatApp::new()`, before anything else.
/// `try_init` keeps repeated construction (tests, multiple apps in one
/// process) from panicking on a second global subscriber.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vendora_chat=debug,info".into()),
        )
        .try_init();
}
