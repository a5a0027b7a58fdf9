//! SSH key synchronization.
//!
//! Mirrors `Minion.authorized_keys` into the local authorized_keys file.
//! Writes go to a temporary file in the same directory followed by a
//! rename, so readers always see a complete file.

use std::io;
use std::path::{Path, PathBuf};

use tokio::sync::watch;
use tracing::{info, warn};

use flotilla_db::{Conn, TableKind, TableSet};

/// The key sync loop: every Minion change and every 30 seconds.
pub async fn run(conn: Conn, path: PathBuf, mut shutdown: watch::Receiver<bool>) {
    let mut trigger = conn.trigger_tick(30, TableSet::of(&[TableKind::Minion]));
    loop {
        if let Err(err) = sync_once(&conn, &path) {
            warn!(path = %path.display(), error = %err, "failed to sync authorized keys");
        }

        tokio::select! {
            cause = trigger.recv() => {
                if cause.is_none() {
                    break;
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Write the authorized keys if they differ from what is on disk.
pub fn sync_once(conn: &Conn, path: &Path) -> io::Result<()> {
    let minion = match conn.minion_self() {
        Ok(minion) => minion,
        Err(_) => return Ok(()),
    };

    let current = match std::fs::read_to_string(path) {
        Ok(current) => current,
        Err(err) if err.kind() == io::ErrorKind::NotFound => String::new(),
        Err(err) => return Err(err),
    };
    if current == minion.authorized_keys {
        return Ok(());
    }

    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, &minion.authorized_keys)?;
    std::fs::rename(&tmp, path)?;
    info!(path = %path.display(), "authorized keys updated");
    Ok(())
}
