use crate::remote::{can_run_ssh, Remote};
use anyhow::{anyhow, Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use stack_core::{Client, ModelEnv};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Well-known log locations on a Unix-like machine. Ordered roughly by the
/// time they appear during provisioning, so a partial copy still recovers
/// the earliest evidence.
pub const UNIX_LOG_PATHS: &[&str] = &[
    "/var/log/cloud-init*.log",
    "/var/log/juju/*.log",
    "/var/lib/juju/containers/juju-*-lxc-*/",
    "/var/log/lxd/juju-*",
    "/var/log/lxd/lxd.log",
    "/var/log/syslog",
    "/var/log/mongodb/mongodb.log",
    "/etc/network/interfaces",
    "/etc/environment",
];

const INTERFACE_STATE_LOG: &str = "/home/ubuntu/ifconfig.log";

const ARCHIVE_EXCLUDED_EXTENSIONS: &[&str] = &["gz"];

pub const COMMAND_TIMES_FILE: &str = "juju_command_times.json";

/// Harvest logs for one client into `directory`, best-effort throughout.
/// `runtime_config` optionally names a config artifact (legacy jenv or
/// controller cache) retained alongside the logs.
pub fn dump_env_logs_known_hosts(
    client: &mut dyn Client,
    directory: &Path,
    runtime_config: Option<&Path>,
    known_hosts: &BTreeMap<String, String>,
) -> Result<()> {
    if client.env().is_local() {
        info!("Retrieving logs for local environment");
        copy_local_logs(client.env(), directory);
    } else {
        let machines = get_remote_machines(client, known_hosts);
        for (machine_id, remote) in &machines {
            if !remote.is_windows() && !can_run_ssh() {
                info!("No ssh, skipping logs for machine-{machine_id} using {remote:?}");
                continue;
            }
            info!("Retrieving logs for machine-{machine_id} using {remote:?}");
            let machine_dir = directory.join(format!("machine-{machine_id}"));
            if let Err(err) = fs::create_dir_all(&machine_dir) {
                warn!("Could not create {}: {err}", machine_dir.display());
                continue;
            }
            copy_remote_logs(remote, &machine_dir);
        }
    }
    if let Some(config) = runtime_config {
        retain_config(config, directory);
    }
    archive_logs(directory)
}

/// Resolve the machine set to harvest from. Status addresses win; known
/// hosts fill the gaps, and stand in wholesale when status cannot be
/// queried at all.
pub fn get_remote_machines(
    client: &mut dyn Client,
    known_hosts: &BTreeMap<String, String>,
) -> BTreeMap<String, Remote> {
    match client.get_status() {
        Ok(status) => {
            let mut machines = BTreeMap::new();
            for (machine_id, machine) in &status.machines {
                let address = machine
                    .dns_name
                    .clone()
                    .or_else(|| known_hosts.get(machine_id).cloned());
                let Some(address) = address else {
                    debug!("No address for machine-{machine_id}, skipping");
                    continue;
                };
                machines.insert(
                    machine_id.clone(),
                    Remote {
                        address,
                        series: machine.series.clone(),
                        use_ssh: true,
                    },
                );
            }
            machines
        }
        Err(err) => {
            warn!("Could not get status to find machines: {err:?}");
            known_hosts
                .iter()
                .map(|(machine_id, address)| {
                    (machine_id.clone(), Remote::from_address(address.clone()))
                })
                .collect()
        }
    }
}

/// Copy logs from one machine. Permissions are relaxed first, then the
/// interface state is captured, then everything is bulk-copied; each step
/// tolerates failure so later steps still recover what they can.
pub fn copy_remote_logs(remote: &Remote, directory: &Path) {
    if remote.is_windows() {
        if let Err(err) = remote.copy_windows_logs(directory) {
            warn!("Could not retrieve some or all Windows logs:");
            warn!("{err:?}");
        }
        return;
    }
    let mut paths: Vec<&str> = UNIX_LOG_PATHS.to_vec();
    paths.push(INTERFACE_STATE_LOG);
    let chmod = format!("sudo chmod -Rf go+r {}", paths.join(" "));
    if let Err(err) = remote.run(&chmod) {
        warn!("Could not allow access to the juju logs:");
        warn!("{err:?}");
    }
    if let Err(err) = remote.run(&format!("ifconfig > {INTERFACE_STATE_LOG}")) {
        warn!("Could not capture ifconfig state:");
        warn!("{err:?}");
    }
    if let Err(err) = remote.copy_files(&paths, directory) {
        warn!("Could not retrieve some or all logs:");
        warn!("{err:?}");
    }
}

/// Local provider: agent logs live under the configuration home on this
/// host. Relax permissions, then copy; failure is a warning.
pub fn copy_local_logs(env: &ModelEnv, directory: &Path) {
    if let Err(err) = try_copy_local_logs(env, directory) {
        warn!("Could not retrieve local logs: {err}");
    }
}

fn try_copy_local_logs(env: &ModelEnv, directory: &Path) -> Result<()> {
    let home = &env.juju_home;
    let local_dir = home.join(&env.environment);
    let mut files = vec![
        local_dir.join("cloud-init-output.log"),
        local_dir.join("log").join("all-machines.log"),
    ];
    files.extend(container_template_logs(&home.join("templates")));
    let file_args: Vec<&Path> = files.iter().map(PathBuf::as_path).collect();
    run_local(
        "sudo",
        &[&["chmod".as_ref(), "go+r".as_ref()][..], &file_args[..]].concat(),
    )?;
    let mut cp_args: Vec<&Path> = file_args.clone();
    cp_args.push(directory);
    run_local("cp", &cp_args)?;
    Ok(())
}

fn container_template_logs(template_dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(template_dir) else {
        return Vec::new();
    };
    let mut logs: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().map_or(false, |ext| ext == "log"))
        .collect();
    logs.sort();
    logs
}

fn run_local(program: &str, args: &[&Path]) -> Result<()> {
    let output = Command::new(program)
        .args(args)
        .output()
        .with_context(|| format!("could not spawn {program}"))?;
    if !output.status.success() {
        return Err(anyhow!(
            "{program} exited with status {}",
            output.status.code().unwrap_or(-1)
        ));
    }
    Ok(())
}

/// Keep a copy of a config artifact next to the harvested logs. Best-effort.
pub fn retain_config(runtime_config: &Path, log_directory: &Path) -> bool {
    let Some(name) = runtime_config.file_name() else {
        return false;
    };
    match fs::copy(runtime_config, log_directory.join(name)) {
        Ok(_) => true,
        Err(err) => {
            warn!("Failed to copy file. Source: {} Destination: {} ({err})",
                runtime_config.display(),
                log_directory.display());
            false
        }
    }
}

/// Compress every plain file under `directory`, recursively, in one batch
/// pass. Files already carrying an excluded extension are left alone; an
/// absent or empty directory is a no-op.
pub fn archive_logs(directory: &Path) -> Result<()> {
    if !directory.is_dir() {
        return Ok(());
    }
    for entry in WalkDir::new(directory).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let excluded = path.extension().map_or(false, |ext| {
            ARCHIVE_EXCLUDED_EXTENSIONS.iter().any(|skip| ext == *skip)
        });
        if excluded {
            continue;
        }
        if let Err(err) = gzip_in_place(path) {
            warn!("Could not archive {}: {err}", path.display());
        }
    }
    Ok(())
}

fn gzip_in_place(path: &Path) -> Result<()> {
    let mut source = fs::File::open(path)?;
    let mut archived = path.as_os_str().to_os_string();
    archived.push(".gz");
    let target = fs::File::create(PathBuf::from(&archived))?;
    let mut encoder = GzEncoder::new(target, Compression::best());
    io::copy(&mut source, &mut encoder)?;
    encoder.finish()?;
    fs::remove_file(path)?;
    Ok(())
}

/// Dump the accumulated command-timing histogram for `client`.
pub fn dump_juju_timings(client: &dyn Client, log_directory: &Path) -> Result<()> {
    let timings = client.backend().timings();
    let path = log_directory.join(COMMAND_TIMES_FILE);
    fs::write(&path, serde_json::to_vec_pretty(&timings)?)
        .with_context(|| format!("could not write {}", path.display()))?;
    Ok(())
}

/// Bounded TCP reachability poll; used to wait for sshd on a pre-supplied
/// bootstrap host before touching it.
pub fn wait_for_port(host: &str, port: u16, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let addr = (host, port).to_socket_addrs().ok().and_then(|mut a| a.next());
        if let Some(addr) = addr {
            if TcpStream::connect_timeout(&addr, Duration::from_secs(5)).is_ok() {
                return Ok(());
            }
        }
        if Instant::now() >= deadline {
            return Err(anyhow!("port {port} on {host} unreachable after {timeout:?}"));
        }
        std::thread::sleep(Duration::from_secs(1));
    }
}

/// Best-effort status print for every reachable model, deadline-exempt and
/// never raising. Used when a failure has already been recorded and a status
/// snapshot is diagnostic gravy.
pub fn safe_print_status(client: &mut dyn Client) {
    let backend = client.backend();
    backend.ignore_soft_deadline(|| {
        let model_clients = match client.iter_model_clients() {
            Ok(clients) => clients,
            Err(err) => {
                warn!("Could not enumerate model clients for status: {err:?}");
                Vec::new()
            }
        };
        if model_clients.is_empty() {
            if let Err(err) = client.juju("show-status", &["--format", "yaml"]) {
                warn!("Could not print status: {err:?}");
            }
            return;
        }
        for mut model_client in model_clients {
            if let Err(err) = model_client.juju("show-status", &["--format", "yaml"]) {
                warn!("Could not print status: {err:?}");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    struct TempDirGuard {
        path: PathBuf,
    }

    impl TempDirGuard {
        fn new(prefix: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "{}_{}_{}",
                prefix,
                std::process::id(),
                chrono::Utc::now().timestamp_micros()
            ));
            fs::create_dir_all(&path).expect("temp dir");
            Self { path }
        }
    }

    impl Drop for TempDirGuard {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    fn read_gz(path: &Path) -> String {
        let file = fs::File::open(path).expect("open archive");
        let mut decoder = GzDecoder::new(file);
        let mut text = String::new();
        decoder.read_to_string(&mut text).expect("decode archive");
        text
    }

    #[test]
    fn archive_compresses_files_recursively() {
        let root = TempDirGuard::new("stack_logs_archive");
        fs::write(root.path.join("fake.log"), "log contents").expect("write log");
        let subdir = root.path.join("subdir");
        fs::create_dir_all(&subdir).expect("subdir");
        fs::write(subdir.join("syslog"), "syslog contents").expect("write syslog");

        archive_logs(&root.path).expect("archive");

        assert!(!root.path.join("fake.log").exists());
        assert_eq!(read_gz(&root.path.join("fake.log.gz")), "log contents");
        assert!(!subdir.join("syslog").exists());
        assert_eq!(read_gz(&subdir.join("syslog.gz")), "syslog contents");
    }

    #[test]
    fn archive_skips_already_compressed_files() {
        let root = TempDirGuard::new("stack_logs_archive_gz");
        fs::write(root.path.join("old.log.gz"), "pretend gzip").expect("write gz");
        archive_logs(&root.path).expect("archive");
        assert_eq!(
            fs::read_to_string(root.path.join("old.log.gz")).expect("read gz"),
            "pretend gzip"
        );
        assert!(!root.path.join("old.log.gz.gz").exists());
    }

    #[test]
    fn archive_is_a_noop_on_empty_or_absent_directories() {
        let root = TempDirGuard::new("stack_logs_archive_empty");
        archive_logs(&root.path).expect("empty dir");
        assert_eq!(
            fs::read_dir(&root.path).expect("read dir").count(),
            0,
            "no archive artifacts should appear"
        );
        archive_logs(&root.path.join("missing")).expect("absent dir");
    }

    #[test]
    fn retain_config_copies_next_to_logs() {
        let root = TempDirGuard::new("stack_logs_retain");
        let jenv = root.path.join("temp.jenv");
        fs::write(&jenv, "jenv data").expect("write jenv");
        let log_dir = root.path.join("logs");
        fs::create_dir_all(&log_dir).expect("log dir");
        assert!(retain_config(&jenv, &log_dir));
        assert_eq!(
            fs::read_to_string(log_dir.join("temp.jenv")).expect("read copy"),
            "jenv data"
        );
        assert!(!retain_config(&root.path.join("absent.jenv"), &log_dir));
    }

    #[test]
    fn container_template_logs_only_matches_log_files() {
        let root = TempDirGuard::new("stack_logs_templates");
        fs::write(root.path.join("container.log"), "").expect("write");
        fs::write(root.path.join("container.conf"), "").expect("write");
        let logs = container_template_logs(&root.path);
        assert_eq!(logs, vec![root.path.join("container.log")]);
        assert!(container_template_logs(&root.path.join("absent")).is_empty());
    }

    #[test]
    fn wait_for_port_succeeds_against_a_listener() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        wait_for_port("127.0.0.1", port, Duration::from_secs(5)).expect("reachable");
    }
}
