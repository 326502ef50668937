//! CPU and memory utilisation estimates for the controller health reports.

use sysinfo::System;

/// CPU utilisation as a fraction of all logical cores, from the 15-minute
/// load average, clamped to 1.0.
pub fn cpu_utilization() -> f64 {
    let load = System::load_average().fifteen;
    if !load.is_finite() || load <= 0.0 {
        return 0.0;
    }
    let cores = num_cpus::get().max(1) as f64;
    (load / cores).min(1.0)
}

/// Fraction of physical memory in use (1 − available/total).
pub fn memory_utilization() -> f64 {
    let mut system = System::new();
    system.refresh_memory();

    let total = system.total_memory();
    if total == 0 {
        return 0.0;
    }
    1.0 - system.available_memory() as f64 / total as f64
}
