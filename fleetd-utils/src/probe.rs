use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::debug;

/// Checks if an HTTP URL is reachable and returns a success status code.
pub async fn check_http(url: &str) -> bool {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build();

    match client {
        Ok(client) => match client.get(url).send().await {
            Ok(res) => res.status().is_success(),
            Err(e) => {
                debug!("HTTP probe failed for {}: {}", url, e);
                false
            }
        },
        Err(e) => {
            debug!("Failed to build HTTP client: {}", e);
            false
        }
    }
}

/// Checks if anything answers HTTP on the URL at all.
///
/// Dev servers routinely answer 404 on `/` while perfectly healthy, so any
/// status below 500 counts as reachable.
pub async fn http_reachable(url: &str) -> bool {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build();

    match client {
        Ok(client) => match client.get(url).send().await {
            Ok(res) => res.status().as_u16() < 500,
            Err(e) => {
                debug!("HTTP probe failed for {}: {}", url, e);
                false
            }
        },
        Err(_) => false,
    }
}

/// Checks if a TCP port is open.
pub async fn check_tcp(addr: &str) -> bool {
    match TcpStream::connect(addr).await {
        Ok(_) => true,
        Err(e) => {
            debug!("TCP probe failed for {}: {}", addr, e);
            false
        }
    }
}

/// Polls `http://127.0.0.1:{port}/` with backoff until it answers or the
/// timeout elapses. Backoff starts at 100ms and doubles up to 1s.
pub async fn wait_http_ready(port: u16, timeout: Duration) -> bool {
    let url = format!("http://127.0.0.1:{port}/");
    let deadline = Instant::now() + timeout;
    let mut delay = Duration::from_millis(100);

    loop {
        if http_reachable(&url).await {
            return true;
        }
        if Instant::now() + delay >= deadline {
            return false;
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(Duration::from_secs(1));
    }
}
