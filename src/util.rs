use chrono::{DateTime, Utc};

pub fn now() -> DateTime<Utc> {
    Utc::now()
}

pub fn is_blank(s: &str) -> bool {
    s.trim().is_empty()
}

/// Jittered exponential backoff: base * factor^attempt, capped, with
/// +/-20% secure-random jitter, as used by the reconnect and
/// supervisor-restart policies.
pub fn backoff_with_jitter(
    attempt: u32,
    base: std::time::Duration,
    factor: f64,
    cap: std::time::Duration,
) -> std::time::Duration {
    use rand::Rng;

    let raw = base.as_secs_f64() * factor.powi(attempt as i32);
    let capped = raw.min(cap.as_secs_f64());
    let jitter = rand::thread_rng().gen_range(-0.2..=0.2);
    let jittered = (capped * (1.0 + jitter)).max(0.0);
    std::time::Duration::from_secs_f64(jittered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_capped() {
        let d = backoff_with_jitter(20, std::time::Duration::from_secs(1), 2.0, std::time::Duration::from_secs(60));
        assert!(d.as_secs_f64() <= 60.0 * 1.2);
    }

    #[test]
    fn is_blank_trims() {
        assert!(is_blank("   "));
        assert!(!is_blank(" a "));
    }
}
