//! Hosts file entries for the tunnel source domains

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{error, info};

#[cfg(windows)]
pub const DEFAULT_HOSTS_PATH: &str = r"C:\Windows\System32\drivers\etc\hosts";

#[cfg(not(windows))]
pub const DEFAULT_HOSTS_PATH: &str = "/etc/hosts";

/// Host entry store
pub trait HostsStore: Send + Sync {
    fn add_or_update(&self, ip: &str, domain: &str) -> bool;
    fn remove(&self, domain: &str) -> bool;
}

/// Line-oriented editor for a hosts file
pub struct EtcHosts {
    path: PathBuf,
}

impl EtcHosts {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_lines(&self) -> io::Result<Vec<String>> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(content.lines().map(str::to_string).collect()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    fn write_lines(&self, lines: &[String]) -> io::Result<()> {
        let mut content = lines.join("\n");
        content.push('\n');
        fs::write(&self.path, content)
    }

    /// Whether an uncommented line maps `domain`
    fn maps_domain(line: &str, domain: &str) -> bool {
        let entry = line.split('#').next().unwrap_or_default();
        entry
            .split_whitespace()
            .skip(1)
            .any(|name| name.eq_ignore_ascii_case(domain))
    }

    fn try_add_or_update(&self, ip: &str, domain: &str) -> io::Result<bool> {
        let mut lines = self.read_lines()?;
        let before = lines.len();
        lines.retain(|line| !Self::maps_domain(line, domain));
        let updated = lines.len() != before;

        lines.push(format!("{}\t{}", ip, domain));
        self.write_lines(&lines)?;
        Ok(updated)
    }

    fn try_remove(&self, domain: &str) -> io::Result<usize> {
        let mut lines = self.read_lines()?;
        let before = lines.len();
        lines.retain(|line| !Self::maps_domain(line, domain));
        let removed = before - lines.len();
        if removed > 0 {
            self.write_lines(&lines)?;
        }
        Ok(removed)
    }
}

impl HostsStore for EtcHosts {
    fn add_or_update(&self, ip: &str, domain: &str) -> bool {
        match self.try_add_or_update(ip, domain) {
            Ok(true) => {
                info!(ip, domain, "Updated host entry");
                true
            }
            Ok(false) => {
                info!(ip, domain, "Added host entry");
                true
            }
            Err(e) => {
                error!(domain, path = %self.path.display(), "Failed to add or update host entry: {}", e);
                false
            }
        }
    }

    fn remove(&self, domain: &str) -> bool {
        match self.try_remove(domain) {
            Ok(0) => {
                info!(domain, "No host entry found to remove");
                true
            }
            Ok(_) => {
                info!(domain, "Removed host entry");
                true
            }
            Err(e) => {
                error!(domain, path = %self.path.display(), "Failed to remove host entry: {}", e);
                false
            }
        }
    }
}
