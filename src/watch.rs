//! Reloading of the desired-state file.
//!
//! A background thread watches the directory holding the state file, so
//! editors that replace the file instead of writing it in place are noticed
//! too. Bursts of events are debounced into one reload notification.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use notify::{Event as NotifyEvent, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Minimal quiet period before a change is reported.
pub const MIN_DEBOUNCE: Duration = Duration::from_millis(50);

/// Spawns a thread that sends `()` on `tx` after the file at `path` changed.
///
/// The thread ends when `tx` is closed.
pub fn spawn_state_watcher(path: PathBuf, debounce: Duration, tx: mpsc::Sender<()>) {
    std::thread::spawn(move || {
        if let Err(err) = watch_file(&path, debounce, tx) {
            error!("Watcher for {} failed: {:#}.", path.display(), err);
        }
    });
}

fn watch_file(path: &Path, debounce: Duration, tx: mpsc::Sender<()>) -> Result<()> {
    let (dir, name) = split_path(path)?;

    let (raw_tx, raw_rx) = std::sync::mpsc::channel();
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = raw_tx.send(res);
        },
        notify::Config::default(),
    )
    .context("failed to create watcher")?;
    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch {}", dir.display()))?;
    debug!("Watching {}.", path.display());

    let debounce = debounce.max(MIN_DEBOUNCE);
    loop {
        let event = match raw_rx.recv() {
            Ok(res) => res,
            Err(_) => break,
        };
        if !is_relevant(&event, &name) {
            continue;
        }

        let mut last = Instant::now();
        loop {
            let elapsed = last.elapsed();
            if elapsed >= debounce {
                break;
            }
            match raw_rx.recv_timeout(debounce - elapsed) {
                Ok(res) => {
                    if is_relevant(&res, &name) {
                        last = Instant::now();
                    }
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => return Ok(()),
            }
        }

        if tx.blocking_send(()).is_err() {
            break;
        }
    }

    Ok(())
}

// Directory to watch and file name to match events against.
fn split_path(path: &Path) -> Result<(PathBuf, OsString)> {
    let name = path
        .file_name()
        .with_context(|| format!("{} is not a file path", path.display()))?
        .to_os_string();
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir().context("failed to resolve current dir")?,
    };
    Ok((dir, name))
}

// Watcher errors count as relevant, a reload is cheap.
fn is_relevant(event: &notify::Result<NotifyEvent>, name: &OsString) -> bool {
    let Ok(event) = event else {
        return true;
    };
    if event.kind.is_access() {
        return false;
    }
    event
        .paths
        .iter()
        .any(|path| path.file_name() == Some(name.as_os_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, EventKind, ModifyKind};

    fn event(kind: EventKind, path: &str) -> notify::Result<NotifyEvent> {
        Ok(NotifyEvent::new(kind).add_path(PathBuf::from(path)))
    }

    #[test]
    fn split_path_handles_bare_file_names() {
        let (dir, name) = split_path(Path::new("/etc/agents/state.toml")).unwrap();
        assert_eq!(dir, PathBuf::from("/etc/agents"));
        assert_eq!(name, OsString::from("state.toml"));

        let (dir, name) = split_path(Path::new("state.toml")).unwrap();
        assert_eq!(dir, std::env::current_dir().unwrap());
        assert_eq!(name, OsString::from("state.toml"));

        assert!(split_path(Path::new("/")).is_err());
    }

    #[test]
    fn only_state_file_events_are_relevant() {
        let name = OsString::from("state.toml");
        assert!(is_relevant(
            &event(EventKind::Modify(ModifyKind::Any), "/etc/agents/state.toml"),
            &name
        ));
        assert!(is_relevant(
            &event(EventKind::Create(CreateKind::File), "/etc/agents/state.toml"),
            &name
        ));
        assert!(!is_relevant(
            &event(EventKind::Modify(ModifyKind::Any), "/etc/agents/other.toml"),
            &name
        ));
        assert!(!is_relevant(
            &event(EventKind::Access(AccessKind::Any), "/etc/agents/state.toml"),
            &name
        ));
        assert!(is_relevant(&Err(notify::Error::generic("boom")), &name));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reports_debounced_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.toml");
        std::fs::write(&path, "").unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        spawn_state_watcher(path.clone(), Duration::from_millis(100), tx);
        // give the watcher time to register
        tokio::time::sleep(Duration::from_millis(300)).await;

        for i in 0..3 {
            std::fs::write(&path, format!("# {}\n", i)).unwrap();
        }
        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        assert_eq!(got.unwrap(), Some(()));
    }
}
