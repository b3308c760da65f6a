use std::sync::LazyLock;
use std::time::{SystemTime, UNIX_EPOCH};

static PROCESS_START: LazyLock<f64> = LazyLock::new(now);

/// Current wall-clock time in floating-point seconds since the epoch.
///
/// Deadlines are epoch-anchored so that [`set_timeout`] can tell relative
/// values from absolute ones by comparing against the process start time.
///
/// [`set_timeout`]: crate::Handler::set_timeout
pub fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// The instant this process first consulted the clock.
pub fn process_start() -> f64 {
    *PROCESS_START
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_is_stamped_once() {
        let a = process_start();
        let b = process_start();
        assert_eq!(a, b);
        assert!(now() >= a);
    }
}
