/// Integration tests start local mock upstreams; some sandboxes forbid binding a port.
pub fn should_skip_httpmock() -> bool {
    match std::net::TcpListener::bind(("127.0.0.1", 0)) {
        Ok(listener) => {
            drop(listener);
            false
        }
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            eprintln!("skipping mock upstream test: sandbox forbids binding to localhost");
            true
        }
        Err(err) => panic!("failed to bind localhost for mock upstream tests: {err}"),
    }
}

/// Redis URL for store tests; tests that need a live server return early without one.
pub fn redis_url() -> Option<String> {
    ["RELAY_REDIS_URL", "REDIS_URL"].iter().find_map(|key| {
        std::env::var(key)
            .ok()
            .filter(|value| !value.trim().is_empty())
    })
}
