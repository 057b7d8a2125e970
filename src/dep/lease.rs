//! Re-read scheduling for leased values.
//!
//! Non-blocking dependencies cannot long-poll; the next fetch is timed
//! from the lease the backend attached to the last response. The
//! schedule depends on the kind of secret:
//!
//! - renewable leases are re-checked well inside their half-life,
//! - rotating credentials are re-read just after their TTL expires,
//! - everything else is re-read shortly before the lease runs out,
//!
//! with randomized bands so a fleet of processes does not re-read in
//! lockstep.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::constants::DEFAULT_VAULT_LEASE;
use crate::dep::Lease;

/// How long a view should sleep before re-fetching a leased value.
pub(crate) fn lease_check_wait(lease: &Lease) -> Duration {
    let mut base = lease.duration.as_secs_f64();
    if base <= 0.0 {
        base = DEFAULT_VAULT_LEASE.as_secs_f64();
    }

    if lease.renewable {
        // Re-check inside the renewal half-life.
        let secs = rand::thread_rng().gen_range(base / 6.0..base / 3.0);
        return Duration::from_secs_f64(secs);
    }

    // Rotating credentials expose their rotation period and remaining
    // TTL; wake one second after the credential rotates.
    if let (Some(rotation_period), Some(ttl)) = (
        number_field(lease, "rotation_period"),
        number_field(lease, "ttl"),
    ) {
        let sleep = (ttl + 1.0).min(rotation_period);
        return Duration::from_secs_f64(sleep);
    }

    if lease.data.contains_key("secret_id") {
        let ttl = number_field(lease, "secret_id_ttl").unwrap_or(0.0);
        base = if ttl > 0.0 { ttl + 1.0 } else { base + 1.0 };
    } else if lease.data.contains_key("certificate") {
        // Certificates carry an absolute expiration; prefer the actual
        // remaining validity over the reported lease duration.
        if let Some(expiration) = number_field(lease, "expiration") {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or(Duration::ZERO)
                .as_secs_f64();
            let remaining = expiration - now;
            if remaining > 0.0 {
                base = remaining;
            }
        }
    }

    let secs = rand::thread_rng().gen_range(0.85 * base..=0.95 * base);
    Duration::from_secs_f64(secs)
}

/// Numeric fields arrive either as JSON numbers or as numeric strings.
fn number_field(lease: &Lease, key: &str) -> Option<f64> {
    match lease.data.get(key)? {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(pairs: &[(&str, serde_json::Value)]) -> serde_json::Map<String, serde_json::Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_renewable_within_half_life() {
        let lease = Lease {
            duration: Duration::from_secs(100),
            renewable: true,
            data: Default::default(),
        };
        for _ in 0..32 {
            let wait = lease_check_wait(&lease).as_secs_f64();
            assert!((16.0..34.0).contains(&wait), "unexpected wait {wait}");
        }
    }

    #[test]
    fn test_non_renewable_band() {
        let lease = Lease {
            duration: Duration::from_secs(100),
            renewable: false,
            data: Default::default(),
        };
        for _ in 0..32 {
            let wait = lease_check_wait(&lease).as_secs_f64();
            assert!((85.0..=95.0).contains(&wait), "unexpected wait {wait}");
        }
    }

    #[test]
    fn test_rotating_credential_cushion() {
        let lease = Lease {
            duration: Duration::from_secs(100),
            renewable: false,
            data: data(&[("rotation_period", json!(60)), ("ttl", json!(30))]),
        };
        assert_eq!(lease_check_wait(&lease), Duration::from_secs(31));
    }

    #[test]
    fn test_rotating_credential_capped_at_period() {
        let lease = Lease {
            duration: Duration::from_secs(100),
            renewable: false,
            data: data(&[("rotation_period", json!(30)), ("ttl", json!(5))]),
        };
        assert_eq!(lease_check_wait(&lease), Duration::from_secs(6));

        let tight = Lease {
            duration: Duration::from_secs(100),
            renewable: false,
            data: data(&[("rotation_period", json!(10)), ("ttl", json!(30))]),
        };
        assert_eq!(lease_check_wait(&tight), Duration::from_secs(10));
    }

    #[test]
    fn test_secret_id_ttl() {
        let lease = Lease {
            duration: Duration::from_secs(100),
            renewable: false,
            data: data(&[("secret_id", json!("abc")), ("secret_id_ttl", json!(60))]),
        };
        for _ in 0..32 {
            let wait = lease_check_wait(&lease).as_secs_f64();
            assert!(
                (0.85 * 61.0..=0.95 * 61.0).contains(&wait),
                "unexpected wait {wait}"
            );
        }
    }

    #[test]
    fn test_secret_id_ttl_zero_uses_lease_duration() {
        for ttl in [None, Some(json!(0))] {
            let mut fields = vec![("secret_id", json!("abc"))];
            if let Some(ttl) = ttl.clone() {
                fields.push(("secret_id_ttl", ttl));
            }
            let lease = Lease {
                duration: Duration::from_secs(1000),
                renewable: false,
                data: data(&fields),
            };
            let wait = lease_check_wait(&lease).as_secs_f64();
            assert!(
                (0.85 * 1001.0..=0.95 * 1001.0).contains(&wait),
                "unexpected wait {wait}"
            );
        }
    }

    #[test]
    fn test_certificate_uses_remaining_validity() {
        let expiration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
            + 100;
        let lease = Lease {
            duration: Duration::from_secs(100),
            renewable: false,
            data: data(&[
                ("certificate", json!("foobar")),
                ("expiration", json!(expiration.to_string())),
            ]),
        };
        let wait = lease_check_wait(&lease).as_secs_f64();
        assert!((84.0..=96.0).contains(&wait), "unexpected wait {wait}");
    }

    #[test]
    fn test_zero_duration_falls_back_to_default() {
        let lease = Lease {
            duration: Duration::ZERO,
            renewable: false,
            data: Default::default(),
        };
        let base = DEFAULT_VAULT_LEASE.as_secs_f64();
        let wait = lease_check_wait(&lease).as_secs_f64();
        assert!((0.85 * base..=0.95 * base).contains(&wait));
    }
}
