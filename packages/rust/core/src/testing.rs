//! Test scaffolding: a scratch builds directory and a shell script that
//! stands in for the pipeline's build tool.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use annotate_shared::EngineConfig;

/// Invocation marker the fake build tool prints.
pub(crate) const LAUNCHER: &str = "fake-launch";

/// Behaves like the pipeline's build tool for the `@TEXT` and `export`
/// targets. Input containing `BROKEN` fails to parse; input containing
/// `NOISY` makes preprocessing write to stderr; input containing `CRASH`
/// makes the export exit with status 3. While a `slow` file exists in the
/// sandbox root the export stalls after its first tool. `pong PING` answers
/// a ping.
const FAKE_MAKE: &str = r#"#!/bin/sh
if [ "$1" = "pong" ]; then
  [ "$2" = "PING" ] && echo PONG
  exit 0
fi
target="$1"
dir="$3"
dry=""
for arg in "$@"; do
  [ "$arg" = "--dry-run" ] && dry=1
done
cd "$dir" || exit 2
case "$target" in
  @TEXT)
    for f in original/*.xml; do
      name=$(basename "$f" .xml)
      if grep -q NOISY "$f"; then
        echo "noise while parsing $name" >&2
      fi
      if grep -q BROKEN "$f"; then
        echo "1 | warning : could not parse $name" >> warnings.log
      else
        : > "annotations/$name.@TEXT"
      fi
    done
    ;;
  export)
    if [ -n "$dry" ]; then
      echo "fake-launch -m tools.segment --token --out x"
      echo "fake-launch -m tools.export out y"
      exit 0
    fi
    echo run >> runs.log
    echo "fake-launch -m tools.segment --token --out x"
    if [ -f ../../slow ]; then
      sleep 30
    fi
    for f in original/*.xml; do
      name=$(basename "$f" .xml)
      if grep -q CRASH "$f"; then
        echo "tool crashed on $name" >&2
        exit 3
      fi
      sed -e 's/<[^>]*>//g' "$f" | tr -s ' \n' '\n\n' | sed '/^$/d' > "annotations/$name.token.word"
      { echo "<corpus>"; cat "$f"; echo; echo "</corpus>"; } > "export.original/$name.xml"
    done
    echo "fake-launch -m tools.export out y"
    ;;
esac
exit 0
"#;

/// Written once per test process so no test executes a file another test
/// still has open for writing.
fn fake_make_path() -> &'static Path {
    static PATH: OnceLock<PathBuf> = OnceLock::new();
    PATH.get_or_init(|| {
        let dir = std::env::temp_dir().join(format!("annotate-fake-make-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("make");
        std::fs::write(&path, FAKE_MAKE).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    })
}

/// A scratch directory with an engine configuration pointing into it.
pub(crate) struct Sandbox {
    pub root: PathBuf,
    pub config: EngineConfig,
}

impl Sandbox {
    pub fn new() -> Self {
        let root = std::env::temp_dir().join(format!("annotate-sandbox-{}", uuid::Uuid::now_v7()));
        let builds_dir = root.join("builds");
        std::fs::create_dir_all(&builds_dir).unwrap();

        let config = EngineConfig {
            builds_dir,
            backend_url: "http://localhost:8801".into(),
            make_program: fake_make_path().display().to_string(),
            processes: 1,
            launcher: LAUNCHER.into(),
            models_dir: root.join("models"),
            makefiles_dir: root.join("makefiles"),
            idle_timeout: Duration::from_secs(7 * 24 * 60 * 60),
            secret_key: Some("s3cret".into()),
        };
        Self { root, config }
    }

    pub fn fake_make(&self) -> &'static Path {
        fake_make_path()
    }

    /// Make every following main run stall until this is switched off.
    pub fn set_slow(&self, slow: bool) {
        let flag = self.root.join("slow");
        if slow {
            std::fs::write(flag, "").unwrap();
        } else {
            let _ = std::fs::remove_file(flag);
        }
    }

    /// Number of main runs executed for a build directory.
    pub fn runs(&self, fingerprint: &str) -> usize {
        std::fs::read_to_string(self.config.builds_dir.join(fingerprint).join("runs.log"))
            .map(|log| log.lines().count())
            .unwrap_or(0)
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}
