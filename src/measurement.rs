//! Measurement token and received-bytes verbose stat.
//!
//! Grounded in `NetworkStreamClient::Implementation::OnReadCompleted`'s
//! `StartMessageMeasurement()` call (taken at the instant the read
//! completion handler enters) and `GetReceivedVerbouseStat`.

use std::time::Instant;

/// An opaque per-read-completion timestamp carrier, passed to the decoder
/// so latency accounting measures from wire-arrival rather than from
/// whatever later point the decoder gets around to looking at the clock.
#[derive(Debug, Clone, Copy)]
pub struct MeasurementToken {
    taken_at: Instant,
}

impl MeasurementToken {
    pub fn now() -> MeasurementToken {
        MeasurementToken {
            taken_at: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> ::std::time::Duration {
        self.taken_at.elapsed()
    }
}

/// `{value, unit-name}` rendering of a byte count, in KiB/MiB/GiB
/// thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VerboseStat {
    pub value: f64,
    pub unit: &'static str,
}

impl VerboseStat {
    pub fn from_bytes(bytes: u64) -> VerboseStat {
        const KIB: f64 = 1024.0;
        const MIB: f64 = KIB * 1024.0;
        const GIB: f64 = MIB * 1024.0;
        let bytes = bytes as f64;
        if bytes > GIB {
            VerboseStat {
                value: bytes / GIB,
                unit: "gigabytes",
            }
        } else if bytes > MIB {
            VerboseStat {
                value: bytes / MIB,
                unit: "megabytes",
            }
        } else {
            VerboseStat {
                value: bytes / KIB,
                unit: "kilobytes",
            }
        }
    }
}

impl ::std::fmt::Display for VerboseStat {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        write!(f, "{:.02} {}", self.value, self.unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_counts_are_kilobytes() {
        let stat = VerboseStat::from_bytes(2048);
        assert_eq!(stat.unit, "kilobytes");
        assert!((stat.value - 2.0).abs() < 1e-9);
    }

    #[test]
    fn large_counts_are_gigabytes() {
        let stat = VerboseStat::from_bytes(3 * 1024 * 1024 * 1024);
        assert_eq!(stat.unit, "gigabytes");
        assert!((stat.value - 3.0).abs() < 1e-9);
    }

    #[test]
    fn megabyte_threshold() {
        let stat = VerboseStat::from_bytes(5 * 1024 * 1024);
        assert_eq!(stat.unit, "megabytes");
    }
}
