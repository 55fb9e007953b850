//! Readiness probes
//!
//! Starting a container doesn't mean the service inside accepts requests.
//! Suites poll with `wait_until` before starting anything that depends on
//! it, typically with `tcp_accepts` or `http_ok` as the check.

use std::future::Future;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ProbeError;

const HTTP_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Polls `check` every `interval` until it returns true
///
/// Fails with `ProbeError::TimedOut` once `timeout` has passed, or with
/// `ProbeError::Cancelled` as soon as `cancel` fires.
pub async fn wait_until<F, Fut>(
    cancel: &CancellationToken,
    timeout: Duration,
    interval: Duration,
    mut check: F,
) -> Result<(), ProbeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        if check().await {
            debug!("Condition met after {} attempt(s)", attempts);
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(ProbeError::TimedOut(timeout));
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => return Err(ProbeError::Cancelled),
        }
    }
}

/// Whether a TCP connection to `addr` (`host:port`) is accepted
pub async fn tcp_accepts(addr: &str) -> bool {
    TcpStream::connect(addr).await.is_ok()
}

/// Whether a GET of `url` answers `200 OK`
pub async fn http_ok(url: &str) -> bool {
    let client = match reqwest::Client::builder()
        .timeout(HTTP_PROBE_TIMEOUT)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            debug!("Can't build HTTP client for probe: {}", e);
            return false;
        }
    };

    match client.get(url).send().await {
        Ok(response) => response.status() == reqwest::StatusCode::OK,
        Err(e) => {
            debug!("Probe of {} failed: {}", url, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_wait_until_succeeds_eventually() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = wait_until(
            &CancellationToken::new(),
            Duration::from_secs(5),
            Duration::from_millis(1),
            move || {
                let counter = counter.clone();
                async move { counter.fetch_add(1, Ordering::SeqCst) >= 2 }
            },
        )
        .await;

        assert_eq!(result, Ok(()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_wait_until_times_out() {
        let result = wait_until(
            &CancellationToken::new(),
            Duration::from_millis(20),
            Duration::from_millis(5),
            || async { false },
        )
        .await;

        assert_eq!(result, Err(ProbeError::TimedOut(Duration::from_millis(20))));
    }

    #[tokio::test]
    async fn test_wait_until_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = wait_until(
            &cancel,
            Duration::from_secs(60),
            Duration::from_secs(1),
            || async { false },
        )
        .await;

        assert_eq!(result, Err(ProbeError::Cancelled));
    }

    #[tokio::test]
    async fn test_tcp_accepts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        assert!(tcp_accepts(&addr).await);

        drop(listener);
        assert!(!tcp_accepts(&addr).await);
    }

    #[tokio::test]
    async fn test_http_ok() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let statuses = ["200 OK", "503 Service Unavailable"];
            for status in statuses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let response =
                    format!("HTTP/1.1 {status}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
                socket.write_all(response.as_bytes()).await.unwrap();
            }
        });

        let url = format!("http://{addr}/status");
        assert!(http_ok(&url).await);
        assert!(!http_ok(&url).await);
    }
}
