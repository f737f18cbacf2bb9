//! Fake daemons for driving the supervisor in tests.
//!
//! Each fake is a small POSIX shell script that prints logfmt lines the way
//! the real daemon does and then `exec`s into `sleep`, so the pid stays the
//! same and SIGTERM ends it.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tunnel_supervisor::ProcessConfig;

pub const TS: &str = "t=2024-05-01T10:00:00+0000";

/// Install a fmt subscriber once so `RUST_LOG` works in tests.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Scratch directory holding fake daemon scripts.
pub struct FakeDaemons {
    dir: TempDir,
}

impl FakeDaemons {
    pub fn new() -> Self {
        init_tracing();
        Self {
            dir: TempDir::new().expect("create temp dir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write an executable `/bin/sh` script and return its path.
    pub fn script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod script");
        path
    }

    /// A daemon that logs `before` lines, announces its API on `addr`, logs
    /// `after` more lines and then idles.
    pub fn ready(&self, name: &str, addr: &str, before: usize, after: usize) -> PathBuf {
        self.script(
            name,
            &format!(
                r#"echo "{TS} lvl=info msg=\"booting\" pid=$$"
i=0
while [ $i -lt {before} ]; do
  echo "{TS} lvl=info msg=\"warming up\" n=$i"
  i=$((i+1))
done
echo "{TS} lvl=info msg=\"starting web service\" obj=web addr={addr}"
i=0
while [ $i -lt {after} ]; do
  echo "{TS} lvl=dbug msg=\"heartbeat\" n=$i"
  i=$((i+1))
done
exec sleep 60"#
            ),
        )
    }

    /// A daemon that reads `web_addr` from its `--config` file and reports a
    /// bind conflict if another fake already holds that address.
    pub fn binding(&self, name: &str) -> PathBuf {
        let locks = self.dir.path().join("locks");
        fs::create_dir_all(&locks).expect("create lock dir");
        self.script(
            name,
            &format!(
                r#"for arg in "$@"; do
  case "$arg" in --config=*) CONFIG="${{arg#--config=}}" ;; esac
done
ADDR=$(sed -n 's/^web_addr: *//p' "$CONFIG")
echo "{TS} lvl=info msg=\"open config file\" path=$CONFIG"
if mkdir "{locks}/$(echo "$ADDR" | tr ':.' '__')" 2>/dev/null; then
  echo "{TS} lvl=info msg=\"starting web service\" obj=web addr=$ADDR"
  exec sleep 60
fi
echo "{TS} lvl=eror msg=\"failed to start web service\" obj=web err=\"listen tcp $ADDR: bind: address already in use\""
exit 1"#,
                locks = locks.display()
            ),
        )
    }

    /// Write a daemon config file with the given API address.
    pub fn daemon_config(&self, name: &str, web_addr: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::write(&path, format!("version: 2\nweb_addr: {web_addr}\n")).expect("write config");
        path
    }
}

/// Config with a short startup timeout suitable for fakes.
pub fn config(binary: &Path) -> ProcessConfig {
    ProcessConfig::builder(binary)
        .startup_timeout(Duration::from_secs(10))
        .build()
        .expect("valid config")
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}
