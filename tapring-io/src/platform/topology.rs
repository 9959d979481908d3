use log::{info, warn};

/// Host topology probe.
///
/// A capture box is sized by two numbers: how many cores can be dedicated
/// to consumers, and whether there is enough RAM to pin the stream windows
/// without starving the rest of the system.
pub struct SystemTopology {
    cores: Vec<usize>,
    page_size: usize,
    total_ram: u64,
    available_ram: u64,
}

impl SystemTopology {
    /// Probes core count, page size and memory via sysconf.
    pub fn probe() -> Self {
        // SAFETY: plain sysconf queries.
        let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let total_pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
        let av_pages = unsafe { libc::sysconf(libc::_SC_AVPHYS_PAGES) };

        let page_size = if page_size <= 0 { 4096 } else { page_size as usize };
        let num_cores = if count <= 0 {
            warn!("Failed to detect core count via libc; falling back to 1.");
            1
        } else {
            count as usize
        };
        let total_ram = total_pages.max(0) as u64 * page_size as u64;
        let available_ram = av_pages.max(0) as u64 * page_size as u64;

        info!(
            "Topology: {} core(s), {:#x}-byte pages, {:.2} GB RAM total ({:.2} GB available).",
            num_cores,
            page_size,
            total_ram as f64 / 1e9,
            available_ram as f64 / 1e9
        );

        Self {
            cores: (0..num_cores).collect(),
            page_size,
            total_ram,
            available_ram,
        }
    }

    pub fn cores(&self) -> &[usize] {
        &self.cores
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn total_ram(&self) -> u64 {
        self.total_ram
    }

    pub fn available_ram(&self) -> u64 {
        self.available_ram
    }

    /// Whether pinning `bytes` of stream windows would leave the host
    /// uncomfortably tight. Used for a startup warning, not a refusal.
    pub fn pinning_is_risky(&self, bytes: u64) -> bool {
        bytes > self.available_ram / 2
    }

    pub fn print_summary(&self) {
        info!(
            "Capture host: {} core(s), {:.2} GB available RAM.",
            self.cores.len(),
            self.available_ram as f64 / 1e9
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_reports_sane_values() {
        let topo = SystemTopology::probe();
        assert!(!topo.cores().is_empty());
        assert!(topo.page_size() >= 4096);
        assert!(topo.total_ram() > 0);
    }
}
