//! Injectable delay for local storage operations.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// How long each local storage operation waits before touching the medium.
#[derive(Clone, Default)]
pub enum Latency {
    /// No delay; the operation still yields to the scheduler once
    #[default]
    None,
    /// A constant delay
    Fixed(Duration),
    /// A delay computed per operation
    Custom(Arc<dyn Fn() -> Duration + Send + Sync>),
}

impl Latency {
    /// `None` for a zero duration, `Fixed` otherwise.
    pub fn from_duration(delay: Duration) -> Self {
        if delay.is_zero() {
            Latency::None
        } else {
            Latency::Fixed(delay)
        }
    }

    /// Build a custom latency from a closure.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn() -> Duration + Send + Sync + 'static,
    {
        Latency::Custom(Arc::new(f))
    }

    pub async fn wait(&self) {
        match self {
            Latency::None => tokio::task::yield_now().await,
            Latency::Fixed(delay) => tokio::time::sleep(*delay).await,
            Latency::Custom(f) => tokio::time::sleep(f()).await,
        }
    }
}

impl fmt::Debug for Latency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Latency::None => write!(f, "None"),
            Latency::Fixed(delay) => f.debug_tuple("Fixed").field(delay).finish(),
            Latency::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn from_duration() {
        assert!(matches!(Latency::from_duration(Duration::ZERO), Latency::None));
        assert!(matches!(
            Latency::from_duration(Duration::from_millis(50)),
            Latency::Fixed(_)
        ));
    }

    #[tokio::test]
    async fn fixed_latency_sleeps() {
        let start = tokio::time::Instant::now();
        Latency::Fixed(Duration::from_millis(20)).wait().await;
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn custom_latency_is_called_per_wait() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let latency = Latency::custom(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Duration::ZERO
        });

        latency.wait().await;
        latency.wait().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
