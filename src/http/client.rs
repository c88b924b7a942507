use reqwest::Client;
use std::time::Duration;

pub fn create_client(
    max_workers: u32,
    timeout: Duration,
    connect_timeout: Duration,
    insecure: bool,
) -> Result<Client, reqwest::Error> {
    Client::builder()
        .connect_timeout(connect_timeout)
        .timeout(timeout)
        .tcp_nodelay(true)
        .gzip(true)
        .brotli(true)
        .user_agent(format!(
            "rampstage/{} (load-testing-tool)",
            env!("CARGO_PKG_VERSION")
        ))
        .danger_accept_invalid_certs(insecure)
        .pool_max_idle_per_host(max_workers.max(1) as usize)
        .pool_idle_timeout(Duration::from_secs(30))
        .tcp_keepalive(Duration::from_secs(60))
        .build()
}
