/// Point-in-time process memory usage in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MemoryUsage {
    pub resident: u64,
    pub virtual_size: u64,
}

impl MemoryUsage {
    pub fn max(self, other: MemoryUsage) -> MemoryUsage {
        MemoryUsage {
            resident: self.resident.max(other.resident),
            virtual_size: self.virtual_size.max(other.virtual_size),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.resident == 0 && self.virtual_size == 0
    }
}

/// Read the current resident-set and virtual-memory size of this process.
///
/// Returns zeros on platforms without /proc.
pub fn current_usage() -> MemoryUsage {
    read_proc_status().unwrap_or_default()
}

#[cfg(target_os = "linux")]
fn read_proc_status() -> Option<MemoryUsage> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let mut usage = MemoryUsage::default();

    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            usage.resident = parse_kb(rest)?;
        } else if let Some(rest) = line.strip_prefix("VmSize:") {
            usage.virtual_size = parse_kb(rest)?;
        }
    }

    Some(usage)
}

#[cfg(not(target_os = "linux"))]
fn read_proc_status() -> Option<MemoryUsage> {
    None
}

#[cfg(target_os = "linux")]
fn parse_kb(rest: &str) -> Option<u64> {
    let value: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
    Some(value * 1024)
}

/// Format a byte count for progress output
pub fn byte_size_to_string(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];

    let mut value = bytes as f64;
    let mut unit = 0;

    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_sizes_format_with_units() {
        assert_eq!(byte_size_to_string(512), "512 B");
        assert_eq!(byte_size_to_string(2048), "2.0 KiB");
        assert_eq!(byte_size_to_string(3 * 1024 * 1024), "3.0 MiB");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn current_usage_reads_something() {
        let usage = current_usage();
        assert!(usage.resident > 0);
        assert!(usage.virtual_size >= usage.resident);
    }
}
