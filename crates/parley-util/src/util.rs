pub mod timeout {
    use std::time::Duration;
    use tokio::time::timeout;

    /// Runs `future` to completion or gives up after `duration`.
    pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Option<T>
    where
        F: std::future::Future<Output = T>,
    {
        timeout(duration, future).await.ok()
    }
}

pub mod token {
    const CHARS_PER_TOKEN: usize = 4;

    /// Rough token count used for model tier selection: bytes / 4.
    pub fn estimate(input: &str) -> usize {
        input.len() / CHARS_PER_TOKEN
    }

    pub fn estimate_all(parts: &[&str]) -> usize {
        parts.iter().map(|p| estimate(p)).sum()
    }
}
