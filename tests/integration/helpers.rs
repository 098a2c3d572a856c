//! Shared helpers for integration tests.

use alex::BridgeConfig;
use std::path::{Path, PathBuf};

/// A loopback port that nothing listens on (bound once, then released).
pub(crate) fn dead_port() -> u16 {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).expect("bind probe listener");
    listener.local_addr().expect("local addr").port()
}

/// Writes an executable stand-in for the Python interpreter.
///
/// Every invocation appends its arguments to the returned log file. Commands
/// mentioning the essential requirements file exit with `essential_exit`;
/// everything else succeeds.
#[cfg(unix)]
pub(crate) fn fake_python(dir: &Path, essential_exit: i32) -> (PathBuf, PathBuf) {
    use std::os::unix::fs::PermissionsExt;

    let log = dir.join("python-calls.log");
    let script = dir.join("fake-python");
    let body = format!(
        "#!/bin/sh\n\
         echo \"$*\" >> '{log}'\n\
         case \"$*\" in\n\
         *essential_requirements_temp.txt*) echo 'ERROR: No matching distribution' >&2; exit {essential_exit} ;;\n\
         esac\n\
         exit 0\n",
        log = log.display(),
    );
    std::fs::write(&script, body).expect("write fake python");
    let mut perms = std::fs::metadata(&script).expect("stat fake python").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&script, perms).expect("chmod fake python");
    (script, log)
}

/// Lines logged by [`fake_python`], empty if it never ran.
pub(crate) fn python_calls(log: &Path) -> Vec<String> {
    std::fs::read_to_string(log)
        .map(|s| s.lines().map(str::to_owned).collect())
        .unwrap_or_default()
}

/// Config for a backend in `dir` whose interpreter is `sh` running
/// `script` as the worker. Dependencies count as installed.
pub(crate) fn shell_backend(dir: &Path, script: &str) -> BridgeConfig {
    let backend_dir = dir.join("backend");
    let site_packages = backend_dir.join("site-packages");
    std::fs::create_dir_all(&site_packages).expect("create backend");
    std::fs::write(backend_dir.join("main.py"), script).expect("write worker script");
    std::fs::write(site_packages.join(".dependencies_installed"), "").expect("write marker");

    let mut config = BridgeConfig::default();
    config.worker.backend_dir = backend_dir;
    config.worker.python = Some(PathBuf::from("/bin/sh"));
    config.readiness.poll_interval_ms = 50;
    config.readiness.timeout_secs = 10;
    config.control.host_port_file = Some(dir.join("host_port.txt"));
    config.shutdown.grace_delay_ms = 10;
    config.shutdown.notify_timeout_ms = 500;
    config.shutdown.exit_wait_ms = 200;
    config.shutdown.reclaim_ports = false;
    config
}
