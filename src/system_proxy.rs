use std::path::PathBuf;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

const BACKUP_FILE_NAME: &str = "system_proxy_backup.json";

/// Snapshot of the OS proxy settings taken before we change them. It is
/// persisted beside the executable, so a crashed process can still restore
/// the user's settings on its next run.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ProxyBackup {
    pub os: String,
    #[serde(default)]
    pub entries: Vec<ProxyEntry>,
}

/// One captured setting: enough to re-run the inverse command on restore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyEntry {
    pub scope: String,
    pub value: String,
}

fn backup_path() -> PathBuf {
    let mut path = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("."));
    path.pop();
    path.push(BACKUP_FILE_NAME);
    path
}

/// Points the OS at the local listener and snapshots what was there before.
pub async fn apply(port: u16) {
    let backup = match capture_backup().await {
        Ok(backup) => backup,
        Err(e) => {
            warn!("Failed to back up system proxy settings: {}", e);
            ProxyBackup::default()
        }
    };

    if let Ok(json) = serde_json::to_vec_pretty(&backup) {
        if let Err(e) = tokio::fs::write(backup_path(), json).await {
            warn!("Failed to persist proxy backup: {}", e);
        }
    }

    if let Err(e) = apply_os(port).await {
        warn!("Failed to apply system proxy settings: {}", e);
    } else {
        info!("System proxy set to 127.0.0.1:{}", port);
    }
}

/// Restores the snapshotted settings and removes the backup file.
pub async fn restore() {
    let backup = match tokio::fs::read(backup_path()).await {
        Ok(bytes) => serde_json::from_slice::<ProxyBackup>(&bytes).unwrap_or_default(),
        Err(_) => {
            warn!("No system proxy backup found, skipping restore");
            return;
        }
    };

    if let Err(e) = restore_os(&backup).await {
        warn!("Failed to restore system proxy settings: {}", e);
    } else {
        info!("System proxy restored");
    }

    let _ = tokio::fs::remove_file(backup_path()).await;
}

async fn run(command: &mut Command) -> std::io::Result<String> {
    let output = command.output().await?;
    if !output.status.success() {
        return Err(std::io::Error::other(format!(
            "command failed ({}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(target_os = "linux")]
async fn capture_backup() -> std::io::Result<ProxyBackup> {
    let mut entries = Vec::new();
    for key in ["mode", "http host", "http port", "https host", "https port"] {
        let schema_key: Vec<&str> = key.split(' ').collect();
        let (schema, field) = if schema_key.len() == 2 {
            (
                format!("org.gnome.system.proxy.{}", schema_key[0]),
                schema_key[1].to_string(),
            )
        } else {
            ("org.gnome.system.proxy".to_string(), key.to_string())
        };
        let value = run(Command::new("gsettings").args(["get", &schema, &field]))
            .await?
            .trim()
            .to_string();
        entries.push(ProxyEntry {
            scope: format!("{} {}", schema, field),
            value,
        });
    }
    Ok(ProxyBackup {
        os: "linux".to_string(),
        entries,
    })
}

#[cfg(target_os = "linux")]
async fn apply_os(port: u16) -> std::io::Result<()> {
    let port = port.to_string();
    run(Command::new("gsettings").args(["set", "org.gnome.system.proxy", "mode", "manual"]))
        .await?;
    for schema in ["org.gnome.system.proxy.http", "org.gnome.system.proxy.https"] {
        run(Command::new("gsettings").args(["set", schema, "host", "127.0.0.1"])).await?;
        run(Command::new("gsettings").args(["set", schema, "port", &port])).await?;
    }
    Ok(())
}

#[cfg(target_os = "linux")]
async fn restore_os(backup: &ProxyBackup) -> std::io::Result<()> {
    for entry in &backup.entries {
        let Some((schema, field)) = entry.scope.rsplit_once(' ') else {
            continue;
        };
        run(Command::new("gsettings").args(["set", schema, field, &entry.value])).await?;
    }
    if backup.entries.is_empty() {
        run(Command::new("gsettings").args(["set", "org.gnome.system.proxy", "mode", "none"]))
            .await?;
    }
    Ok(())
}

#[cfg(target_os = "macos")]
const MACOS_SERVICES: [&str; 2] = ["Wi-Fi", "Ethernet"];

#[cfg(target_os = "macos")]
async fn capture_backup() -> std::io::Result<ProxyBackup> {
    let mut entries = Vec::new();
    for service in MACOS_SERVICES {
        for getter in ["-getwebproxy", "-getsecurewebproxy"] {
            if let Ok(value) = run(Command::new("networksetup").args([getter, service])).await {
                entries.push(ProxyEntry {
                    scope: format!("{} {}", getter, service),
                    value,
                });
            }
        }
    }
    Ok(ProxyBackup {
        os: "macos".to_string(),
        entries,
    })
}

#[cfg(target_os = "macos")]
async fn apply_os(port: u16) -> std::io::Result<()> {
    let port = port.to_string();
    for service in MACOS_SERVICES {
        for setter in ["-setwebproxy", "-setsecurewebproxy"] {
            if let Err(e) = run(Command::new("networksetup").args([
                setter,
                service,
                "127.0.0.1",
                &port,
            ]))
            .await
            {
                warn!("networksetup {} {} failed: {}", setter, service, e);
            }
        }
    }
    Ok(())
}

#[cfg(target_os = "macos")]
async fn restore_os(backup: &ProxyBackup) -> std::io::Result<()> {
    for entry in &backup.entries {
        // Settings whose snapshot shows the proxy was off are switched off;
        // anything else is left for the user, since reconstructing a custom
        // upstream proxy from the textual snapshot is not reliable.
        let enabled = entry.value.contains("Enabled: Yes");
        if !enabled {
            let Some((getter, service)) = entry.scope.split_once(' ') else {
                continue;
            };
            let setter = match getter {
                "-getwebproxy" => "-setwebproxystate",
                _ => "-setsecurewebproxystate",
            };
            let _ = run(Command::new("networksetup").args([setter, service, "off"])).await;
        }
    }
    Ok(())
}

#[cfg(target_os = "windows")]
async fn capture_backup() -> std::io::Result<ProxyBackup> {
    let mut entries = Vec::new();
    if let Ok(value) = run(Command::new("netsh").args(["winhttp", "show", "proxy"])).await {
        entries.push(ProxyEntry {
            scope: "winhttp".to_string(),
            value,
        });
    }
    for field in ["ProxyEnable", "ProxyServer"] {
        if let Ok(value) = run(Command::new("reg").args([
            "query",
            "HKCU\\Software\\Microsoft\\Windows\\CurrentVersion\\Internet Settings",
            "/v",
            field,
        ]))
        .await
        {
            entries.push(ProxyEntry {
                scope: format!("wininet {}", field),
                value,
            });
        }
    }
    Ok(ProxyBackup {
        os: "windows".to_string(),
        entries,
    })
}

#[cfg(target_os = "windows")]
async fn apply_os(port: u16) -> std::io::Result<()> {
    let server = format!("127.0.0.1:{}", port);
    run(Command::new("netsh").args(["winhttp", "set", "proxy", &server])).await?;
    run(Command::new("reg").args([
        "add",
        "HKCU\\Software\\Microsoft\\Windows\\CurrentVersion\\Internet Settings",
        "/v",
        "ProxyEnable",
        "/t",
        "REG_DWORD",
        "/d",
        "1",
        "/f",
    ]))
    .await?;
    run(Command::new("reg").args([
        "add",
        "HKCU\\Software\\Microsoft\\Windows\\CurrentVersion\\Internet Settings",
        "/v",
        "ProxyServer",
        "/t",
        "REG_SZ",
        "/d",
        &server,
        "/f",
    ]))
    .await?;
    Ok(())
}

#[cfg(target_os = "windows")]
async fn restore_os(_backup: &ProxyBackup) -> std::io::Result<()> {
    run(Command::new("netsh").args(["winhttp", "reset", "proxy"])).await?;
    run(Command::new("reg").args([
        "add",
        "HKCU\\Software\\Microsoft\\Windows\\CurrentVersion\\Internet Settings",
        "/v",
        "ProxyEnable",
        "/t",
        "REG_DWORD",
        "/d",
        "0",
        "/f",
    ]))
    .await?;
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
async fn capture_backup() -> std::io::Result<ProxyBackup> {
    Ok(ProxyBackup::default())
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
async fn apply_os(_port: u16) -> std::io::Result<()> {
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
async fn restore_os(_backup: &ProxyBackup) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_serialization_round_trip() {
        let backup = ProxyBackup {
            os: "linux".to_string(),
            entries: vec![ProxyEntry {
                scope: "org.gnome.system.proxy mode".to_string(),
                value: "'none'".to_string(),
            }],
        };
        let json = serde_json::to_string(&backup).unwrap();
        let parsed: ProxyBackup = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.os, "linux");
        assert_eq!(parsed.entries.len(), 1);
        assert_eq!(parsed.entries[0].value, "'none'");
    }
}
