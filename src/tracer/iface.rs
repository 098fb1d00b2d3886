//! Network interface discovery via sysfs.

use std::path::Path;

use anyhow::{Context, Result};

const SYS_CLASS_NET: &str = "/sys/class/net";

/// A network interface as reported by sysfs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub name: String,
    pub index: u32,
    /// Kernel operstate (up, down, unknown, ...).
    pub state: String,
}

/// Whether a network interface with this name exists.
pub fn interface_exists(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && Path::new(SYS_CLASS_NET).join(name).exists()
}

/// List all network interfaces, sorted by index.
pub fn list_interfaces() -> Result<Vec<InterfaceInfo>> {
    list_interfaces_in(Path::new(SYS_CLASS_NET))
}

/// List interfaces under a sysfs-style root.
pub fn list_interfaces_in(root: &Path) -> Result<Vec<InterfaceInfo>> {
    let entries =
        std::fs::read_dir(root).with_context(|| format!("reading {}", root.display()))?;

    let mut out = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("reading entry in {}", root.display()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let dir = entry.path();

        let index = read_trimmed(&dir.join("ifindex"))
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let state = read_trimmed(&dir.join("operstate")).unwrap_or_else(|| "unknown".to_string());

        out.push(InterfaceInfo { name, index, state });
    }

    out.sort_by(|a, b| a.index.cmp(&b.index).then_with(|| a.name.cmp(&b.name)));
    Ok(out)
}

fn read_trimmed(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_sysfs(tag: &str) -> std::path::PathBuf {
        let root = std::env::temp_dir().join(format!(
            "xtrace-iface-{tag}-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&root);
        for (name, index, state) in [("eth0", "2", "up\n"), ("lo", "1", "unknown\n"), ("ib0", "3", "down\n")] {
            let dir = root.join(name);
            std::fs::create_dir_all(&dir).expect("create iface dir");
            std::fs::write(dir.join("ifindex"), index).expect("write ifindex");
            std::fs::write(dir.join("operstate"), state).expect("write operstate");
        }
        root
    }

    #[test]
    fn test_list_interfaces_sorted_by_index() {
        let root = fake_sysfs("sorted");
        let ifaces = list_interfaces_in(&root).expect("list");
        let names: Vec<&str> = ifaces.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["lo", "eth0", "ib0"]);
        assert_eq!(ifaces[1].state, "up");
        assert_eq!(ifaces[2].index, 3);
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn test_list_interfaces_missing_root() {
        let err = list_interfaces_in(Path::new("/nonexistent/xtrace/net")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/xtrace/net"));
    }

    #[test]
    fn test_interface_exists_rejects_bad_names() {
        assert!(!interface_exists(""));
        assert!(!interface_exists("../etc"));
        assert!(!interface_exists("xtrace-test-missing0"));
    }
}
